//! libvolfs: the concurrency and object-lifecycle core of a mounted-volume
//! driver. It owns request dispatch with bounded per-volume parallelism and
//! an overflow backlog, the hierarchical lock discipline, reference-counted
//! object lifetimes with cascading cleanup, delayed-close batching, and the
//! mount/dismount state machine that coordinates teardown with all of the
//! above. On-disk decoding, allocation, caching and byte-range lock
//! bookkeeping live behind the traits in [`store`].

pub mod close;
pub mod config;
pub mod delayed;
pub mod dispatch;
pub mod error;
pub mod hier;
pub mod object;
pub mod registry;
pub mod store;
pub mod volume;

pub use config::DriverParams;
pub use dispatch::{Completion, Operation, Submission};
pub use error::DriverError;
pub use registry::Registry;
pub use volume::{Volume, VolumeCondition};

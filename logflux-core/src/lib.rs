//! # logflux-core
//!
//! Message model of the logflux log pipeline: the interned name registry,
//! the packed name-value payload table, the log message entity with its
//! copy-on-write cloning and combined ref/ack accounting, and the versioned
//! serialization the disk queues persist.
//!
//! ## Architecture
//!
//! - **Registry**: process-wide name → 16-bit handle dictionary; handles
//!   never move, reads are cheap.
//! - **NVTable**: one contiguous arena per message holding direct values
//!   and indirect slices of other values.
//! - **LogMessage**: timestamps, priority, tags, structured-data index and
//!   the payload; shared through `Arc`, mutated copy-on-write.
//! - **Refcache**: per-thread batching of the atomic ACK|REF counter for
//!   the producer/consumer fast paths.
//! - **Serialization**: big-endian archive with readers for all historic
//!   wire versions.

pub mod addr;
pub mod error;
pub mod logmsg;
pub mod nvtable;
pub mod persist;
pub mod rcptid;
pub mod refcache;
pub mod registry;
pub mod serialize;
pub mod stamp;
pub mod stats;
pub mod tags;
pub mod verbosity;

pub use addr::SenderAddr;
pub use error::{CoreError, CoreResult};
pub use logmsg::{
    builtin, AckHandler, LogMessage, MessageHandle, MsgFormat, MsgFormatOptions, PathOptions,
};
pub use nvtable::NvTable;
pub use persist::PersistState;
pub use registry::{NvHandle, NvRegistry};
pub use serialize::{ArchiveReader, ArchiveWriter};
pub use stamp::Stamp;
pub use tags::{TagId, Tags};

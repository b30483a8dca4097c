//! # logflux-diskq
//!
//! Durable disk-backed queues buffering messages between pipe stages.
//!
//! The low level is `Qdisk`, a wrap-around ring file with a fixed 4 KiB
//! header and three cursors (write, read, backlog). On top of it sit two
//! queue flavours: the non-reliable one acknowledges messages once they are
//! queued and keeps its memory tiers only for throughput, the reliable one
//! keeps every popped record in an on-disk backlog until the consumer
//! confirms delivery and can rewind after transport failures. The driver
//! module binds queues to persistent names across restarts and reloads.

pub mod driver;
pub mod non_reliable;
pub mod options;
pub mod qdisk;
pub mod queue;
pub mod reliable;
pub mod vfs;

pub use driver::DiskQueueDriver;
pub use non_reliable::NonReliableQueue;
pub use options::DiskQueueOptions;
pub use qdisk::{Qdisk, QdiskError, QDISK_RESERVED_SPACE};
pub use queue::LogQueue;
pub use reliable::ReliableQueue;
pub use vfs::{FileSystem, MemFileSystem, QueueFile, StdFileSystem};

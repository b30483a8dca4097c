//! Queue abstraction shared by the reliable and non-reliable variants.

use crate::qdisk::{serialize_record, Qdisk, QdiskError, QdiskResult};
use crate::vfs::FileSystem;
use logflux_core::stats::{self, Counter};
use logflux_core::{ArchiveReader, LogMessage, PathOptions};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STATS_COMPONENT: &str = "disk_queue";

/// A disk-backed message queue between two pipe stages. One producer and
/// one consumer; the implementation serializes the rare overlapping calls
/// internally.
pub trait LogQueue: Send + Sync {
    /// Enqueue a message, consuming the caller's reference. Returns false
    /// when every tier is full and the message was dropped.
    fn push_tail(&self, msg: Arc<LogMessage>, path_options: &PathOptions) -> bool;

    /// Dequeue the next message, or None when the queue is empty.
    fn pop_head(&self) -> Option<(Arc<LogMessage>, PathOptions)>;

    /// Confirm delivery of the oldest `count` popped messages.
    fn ack_backlog(&self, count: u64);

    /// Replay the newest `count` popped-but-unacked messages. Only the
    /// reliable variant supports this.
    fn rewind_backlog(&self, count: u64) -> bool;

    /// Messages waiting to be popped, across every tier.
    fn len(&self) -> i64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filename(&self) -> Option<PathBuf>;

    fn persist_name(&self) -> String;

    /// Flush state to disk and close the file. Returns true when the queue
    /// kept its contents and is worth re-acquiring after a reload.
    fn stop(&self) -> bool;
}

pub(crate) struct QueueCounters {
    pub queued: Counter,
    pub memory_usage: Counter,
    pub disk_usage: Counter,
    pub disk_allocated: Counter,
    pub capacity: Counter,
    pub dropped: Counter,
    instance: String,
}

impl QueueCounters {
    pub fn register(instance: &str) -> QueueCounters {
        QueueCounters {
            queued: stats::register_counter(STATS_COMPONENT, instance, "queued"),
            memory_usage: stats::register_counter(STATS_COMPONENT, instance, "memory_usage"),
            disk_usage: stats::register_counter(STATS_COMPONENT, instance, "disk_usage"),
            disk_allocated: stats::register_counter(STATS_COMPONENT, instance, "disk_allocated"),
            capacity: stats::register_counter(STATS_COMPONENT, instance, "capacity_kb"),
            dropped: stats::register_counter(STATS_COMPONENT, instance, "dropped"),
            instance: instance.to_string(),
        }
    }

    pub fn update_disk(&self, qdisk: &Qdisk) {
        self.disk_usage.set(qdisk.used_bytes() as u64);
        self.disk_allocated.set(qdisk.file_size() as u64);
        self.capacity.set((qdisk.capacity() / 1024) as u64);
    }
}

impl Drop for QueueCounters {
    fn drop(&mut self) {
        stats::unregister_instance(STATS_COMPONENT, &self.instance);
    }
}

pub(crate) fn serialize_message(msg: &LogMessage) -> QdiskResult<Vec<u8>> {
    serialize_record(|writer| msg.serialize(writer))
}

pub(crate) fn deserialize_message(payload: &[u8]) -> QdiskResult<Arc<LogMessage>> {
    let mut reader = ArchiveReader::new(Cursor::new(payload));
    let msg = LogMessage::deserialize(&mut reader)
        .map_err(|e| QdiskError::Corrupted(format!("cannot deserialize message: {e}")))?;
    Ok(Arc::new(msg))
}

/// First unused `<filename>.corrupted[-N]` sibling.
fn corrupted_filename(fs: &dyn FileSystem, filename: &Path) -> PathBuf {
    let base = format!("{}.corrupted", filename.display());
    let mut candidate = PathBuf::from(&base);
    let mut suffix = 0;
    while fs.exists(&candidate) {
        suffix += 1;
        candidate = PathBuf::from(format!("{base}-{suffix}"));
    }
    candidate
}

/// Set aside a corrupted queue file and start a fresh one under the same
/// name. The in-memory tiers of the owning queue are untouched.
pub(crate) fn restart_corrupted(qdisk: &mut Qdisk, fs: &Arc<dyn FileSystem>) -> QdiskResult<()> {
    let filename = qdisk
        .filename()
        .map(Path::to_path_buf)
        .ok_or_else(|| QdiskError::Init("corrupted queue has no filename".into()))?;

    qdisk.stop()?;
    let set_aside = corrupted_filename(fs.as_ref(), &filename);
    fs.rename(&filename, &set_aside)?;
    tracing::error!(
        filename = %filename.display(),
        set_aside = %set_aside.display(),
        "disk-queue file corrupted, set aside and restarted empty"
    );
    qdisk.start(&filename)?;
    Ok(())
}

//! Reliable disk queue.
//!
//! Every message is written to the ring before it is acknowledged upstream;
//! the durability of the file is the delivery guarantee. Popped records
//! stay in the on-disk backlog until the consumer confirms them with
//! `ack_backlog`, and `rewind_backlog` replays them after a transport
//! failure. The front cache only mirrors the undelivered disk prefix so a
//! pop can skip the deserialization of a record that is still in memory.

use crate::options::DiskQueueOptions;
use crate::qdisk::{Qdisk, QdiskError};
use crate::queue::{
    deserialize_message, restart_corrupted, serialize_message, LogQueue, QueueCounters,
};
use crate::vfs::FileSystem;
use logflux_core::{LogMessage, MessageHandle, PathOptions};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RELIABLE_FILE_ID: [u8; 4] = *b"LFRQ";

pub struct ReliableQueue {
    inner: Mutex<Inner>,
    persist_name: String,
    counters: QueueCounters,
    fs: Arc<dyn FileSystem>,
}

struct Inner {
    qdisk: Qdisk,
    front_cache: VecDeque<(Arc<LogMessage>, PathOptions)>,
    /// Serialized records waiting for ring space, with their senders'
    /// path options.
    flow_control_window: VecDeque<(Arc<LogMessage>, PathOptions, Vec<u8>)>,
    window_bytes: i64,
    front_cache_size: usize,
    flow_control_window_bytes: i64,
}

impl ReliableQueue {
    pub fn start(
        fs: Arc<dyn FileSystem>,
        options: DiskQueueOptions,
        filename: &Path,
        persist_name: &str,
    ) -> Result<Arc<ReliableQueue>, QdiskError> {
        assert!(options.reliable);
        let front_cache_size = options.front_cache_size;
        let flow_control_window_bytes = options.flow_control_window_bytes;
        let resolved = options.resolve();
        let mut qdisk = Qdisk::new(Arc::clone(&fs), resolved, RELIABLE_FILE_ID);
        qdisk.start(filename)?;

        let counters = QueueCounters::register(&filename.display().to_string());
        let queue = ReliableQueue {
            inner: Mutex::new(Inner {
                qdisk,
                front_cache: VecDeque::new(),
                flow_control_window: VecDeque::new(),
                window_bytes: 0,
                front_cache_size,
                flow_control_window_bytes,
            }),
            persist_name: persist_name.to_string(),
            counters,
            fs,
        };
        {
            let inner = queue.inner.lock();
            queue.counters.queued.set(inner.qdisk.length() as u64);
            queue.counters.update_disk(&inner.qdisk);
        }
        Ok(Arc::new(queue))
    }

    fn handle_corruption(&self, inner: &mut Inner, error: &QdiskError) {
        tracing::error!(error = %error, "reliable disk-queue corrupted, restarting");
        if let Err(e) = restart_corrupted(&mut inner.qdisk, &self.fs) {
            tracing::error!(error = %e, "could not restart the corrupted disk-queue");
        }
        // cached entries describe the old file
        Self::clear_front_cache(inner, &self.counters);
        self.counters
            .queued
            .set((inner.qdisk.length() + inner.flow_control_window.len() as i64) as u64);
        self.counters.update_disk(&inner.qdisk);
    }

    fn clear_front_cache(inner: &mut Inner, counters: &QueueCounters) {
        while let Some((msg, _)) = inner.front_cache.pop_front() {
            counters.memory_usage.sub(msg.estimated_size() as u64);
            msg.release();
        }
    }

    /// Move waiting flow-controlled messages to disk while there is room.
    fn flush_flow_control_window(&self, inner: &mut Inner) {
        while !inner.flow_control_window.is_empty() {
            let record = inner
                .flow_control_window
                .front()
                .map(|(_, _, record)| record.clone())
                .expect("window is not empty");
            match inner.qdisk.push_tail(&record) {
                Ok(true) => {
                    let (msg, path_options, _) =
                        inner.flow_control_window.pop_front().expect("entry exists");
                    inner.window_bytes -= record.len() as i64;
                    self.counters.memory_usage.sub(msg.estimated_size() as u64);
                    msg.ack(&path_options);
                    msg.release();
                }
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(error = %e, "error writing disk-queue file");
                    break;
                }
            }
        }
    }
}

impl LogQueue for ReliableQueue {
    fn push_tail(&self, msg: Arc<LogMessage>, path_options: &PathOptions) -> bool {
        let mut inner = self.inner.lock();

        let record = match serialize_message(&msg) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "cannot serialize message, dropping it");
                drop(inner);
                self.counters.dropped.inc();
                msg.discard(path_options);
                return false;
            }
        };

        match inner.qdisk.push_tail(&record) {
            Ok(true) => {
                // the record is durable, mirror it in the front cache when
                // the cache still tracks the whole undelivered prefix
                if inner.front_cache.len() as i64 == inner.qdisk.length() - 1
                    && inner.front_cache.len() < inner.front_cache_size
                {
                    let cached = msg.acquire();
                    self.counters
                        .memory_usage
                        .add(cached.estimated_size() as u64);
                    inner.front_cache.push_back((cached, PathOptions::new()));
                }
                self.counters.queued.inc();
                self.counters.update_disk(&inner.qdisk);
                drop(inner);
                msg.ack(path_options);
                msg.release();
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "error writing disk-queue file, message stays in memory");
            }
        }

        // the ring is full; flow-controlled senders may wait in memory
        if path_options.ack_needed
            && inner.window_bytes + (record.len() as i64) <= inner.flow_control_window_bytes
        {
            inner.window_bytes += record.len() as i64;
            let size = msg.estimated_size() as u64;
            inner
                .flow_control_window
                .push_back((msg, *path_options, record));
            self.counters.queued.inc();
            self.counters.memory_usage.add(size);
            return true;
        }

        drop(inner);
        self.counters.dropped.inc();
        msg.discard(path_options);
        false
    }

    fn pop_head(&self) -> Option<(Arc<LogMessage>, PathOptions)> {
        let mut inner = self.inner.lock();

        if let Some((msg, path_options)) = inner.front_cache.pop_front() {
            if let Err(e) = inner.qdisk.remove_head() {
                self.handle_corruption(&mut inner, &e);
                return None;
            }
            self.counters.queued.sub(1);
            self.counters.memory_usage.sub(msg.estimated_size() as u64);
            self.counters.update_disk(&inner.qdisk);
            return Some((msg, path_options));
        }

        match inner.qdisk.pop_head() {
            Ok(Some(payload)) => match deserialize_message(&payload) {
                Ok(msg) => {
                    self.counters.queued.sub(1);
                    self.counters.update_disk(&inner.qdisk);
                    return Some((msg, PathOptions::new()));
                }
                Err(e) => {
                    self.handle_corruption(&mut inner, &e);
                }
            },
            Ok(None) => {}
            Err(e) => {
                self.handle_corruption(&mut inner, &e);
            }
        }

        // nothing durable left; hand out messages still waiting for space
        if let Some((msg, path_options, record)) = inner.flow_control_window.pop_front() {
            inner.window_bytes -= record.len() as i64;
            self.counters.queued.sub(1);
            self.counters.memory_usage.sub(msg.estimated_size() as u64);
            return Some((msg, path_options));
        }
        None
    }

    fn ack_backlog(&self, count: u64) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.qdisk.ack_backlog(count) {
            self.handle_corruption(&mut inner, &e);
            return;
        }
        // acknowledged space may let waiting messages reach the disk
        self.flush_flow_control_window(&mut inner);
        self.counters.update_disk(&inner.qdisk);
    }

    fn rewind_backlog(&self, count: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.qdisk.rewind_backlog(count) {
            Ok(done) => {
                if done {
                    // the cache no longer mirrors the read head
                    Self::clear_front_cache(&mut inner, &self.counters);
                    self.counters.queued.add(count);
                    self.counters.update_disk(&inner.qdisk);
                }
                done
            }
            Err(e) => {
                self.handle_corruption(&mut inner, &e);
                false
            }
        }
    }

    fn len(&self) -> i64 {
        let inner = self.inner.lock();
        inner.qdisk.length() + inner.flow_control_window.len() as i64
    }

    fn filename(&self) -> Option<PathBuf> {
        self.inner.lock().qdisk.filename().map(Path::to_path_buf)
    }

    fn persist_name(&self) -> String {
        self.persist_name.clone()
    }

    fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        // last chance to land waiting messages on disk
        self.flush_flow_control_window(&mut inner);
        let lost = inner.flow_control_window.len();
        if lost > 0 {
            tracing::warn!(
                lost,
                "reliable disk-queue is full at shutdown, waiting messages are lost"
            );
            while let Some((msg, path_options, record)) = inner.flow_control_window.pop_front() {
                inner.window_bytes -= record.len() as i64;
                self.counters.dropped.inc();
                msg.discard(&path_options);
            }
        }
        Self::clear_front_cache(&mut inner, &self.counters);

        let mut persistent = true;
        if let Err(e) = inner.qdisk.save_state(&[], &[], &[]) {
            tracing::error!(error = %e, "error saving disk-queue state");
            persistent = false;
        }
        if let Err(e) = inner.qdisk.stop() {
            tracing::error!(error = %e, "error closing disk-queue file");
            persistent = false;
        }
        persistent
    }
}

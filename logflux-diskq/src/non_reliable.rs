//! Non-reliable disk queue.
//!
//! Messages are acknowledged as soon as they are safely queued: a push to
//! disk acks immediately, in-memory tiers keep the pending path options
//! until the message is popped. The front cache admits messages only while
//! the ring is empty so the pop order stays FIFO; when the ring fills up,
//! flow-controlled messages wait in the flow-control window and plain ones
//! in the overflow tier. On shutdown all three tiers are flushed to the
//! file tail and restored on the next start.

use crate::options::DiskQueueOptions;
use crate::qdisk::{Qdisk, QdiskError, TailSections};
use crate::queue::{
    deserialize_message, restart_corrupted, serialize_message, LogQueue, QueueCounters,
};
use crate::vfs::FileSystem;
use logflux_core::{LogMessage, PathOptions};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const NON_RELIABLE_FILE_ID: [u8; 4] = *b"LFQF";

type Entry = (Arc<LogMessage>, PathOptions);

pub struct NonReliableQueue {
    inner: Mutex<Inner>,
    persist_name: String,
    counters: QueueCounters,
    fs: Arc<dyn FileSystem>,
}

struct Inner {
    qdisk: Qdisk,
    front_cache: VecDeque<Entry>,
    flow_control_window: VecDeque<Entry>,
    overflow: VecDeque<Entry>,
    front_cache_size: usize,
    flow_control_window_size: usize,
}

impl NonReliableQueue {
    pub fn start(
        fs: Arc<dyn FileSystem>,
        options: DiskQueueOptions,
        filename: &Path,
        persist_name: &str,
    ) -> Result<Arc<NonReliableQueue>, QdiskError> {
        assert!(!options.reliable);
        let front_cache_size = options.front_cache_size;
        let flow_control_window_size = options.flow_control_window_size;
        let resolved = options.resolve();
        let mut qdisk = Qdisk::new(Arc::clone(&fs), resolved, NON_RELIABLE_FILE_ID);
        let tails = qdisk.start(filename)?;

        let counters = QueueCounters::register(&filename.display().to_string());
        let queue = NonReliableQueue {
            inner: Mutex::new(Inner {
                qdisk,
                front_cache: VecDeque::new(),
                flow_control_window: VecDeque::new(),
                overflow: VecDeque::new(),
                front_cache_size,
                flow_control_window_size,
            }),
            persist_name: persist_name.to_string(),
            counters,
            fs,
        };
        queue.restore_tails(tails);
        queue.refresh_counters();
        Ok(Arc::new(queue))
    }

    fn restore_tails(&self, tails: TailSections) {
        let mut inner = self.inner.lock();
        // restored entries come back without their ack obligations
        let restore = |records: Vec<Vec<u8>>, target: &mut VecDeque<Entry>| {
            for payload in records {
                match deserialize_message(&payload) {
                    Ok(msg) => target.push_back((msg, PathOptions::new())),
                    Err(e) => {
                        tracing::error!(error = %e, "cannot restore saved queue entry, skipping");
                    }
                }
            }
        };
        restore(tails.qout, &mut inner.front_cache);
        restore(tails.qbacklog, &mut inner.flow_control_window);
        restore(tails.qoverflow, &mut inner.overflow);
    }

    fn refresh_counters(&self) {
        let inner = self.inner.lock();
        self.counters.queued.set(Self::total_len(&inner) as u64);
        self.counters.memory_usage.set(
            inner
                .front_cache
                .iter()
                .chain(inner.flow_control_window.iter())
                .chain(inner.overflow.iter())
                .map(|(msg, _)| msg.estimated_size() as u64)
                .sum(),
        );
        self.counters.update_disk(&inner.qdisk);
    }

    fn total_len(inner: &Inner) -> i64 {
        inner.qdisk.length()
            + inner.front_cache.len() as i64
            + inner.flow_control_window.len() as i64
            + inner.overflow.len() as i64
    }

    fn handle_corruption(&self, inner: &mut Inner, error: &QdiskError) {
        tracing::error!(error = %error, "non-reliable disk-queue corrupted, restarting");
        if let Err(e) = restart_corrupted(&mut inner.qdisk, &self.fs) {
            tracing::error!(error = %e, "could not restart the corrupted disk-queue");
        }
        self.counters.queued.set(Self::total_len(inner) as u64);
        self.counters.update_disk(&inner.qdisk);
    }
}

impl LogQueue for NonReliableQueue {
    fn push_tail(&self, msg: Arc<LogMessage>, path_options: &PathOptions) -> bool {
        let mut inner = self.inner.lock();

        // the front cache stays FIFO-consistent with the ring: it only
        // admits while nothing is queued on disk
        if inner.qdisk.length() == 0 && inner.front_cache.len() < inner.front_cache_size {
            let size = msg.estimated_size() as u64;
            inner.front_cache.push_back((msg, *path_options));
            self.counters.queued.inc();
            self.counters.memory_usage.add(size);
            return true;
        }

        match serialize_message(&msg).and_then(|record| inner.qdisk.push_tail(&record)) {
            Ok(true) => {
                drop(inner);
                msg.ack(path_options);
                msg.release();
                self.counters.queued.inc();
                let inner = self.inner.lock();
                self.counters.update_disk(&inner.qdisk);
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "error writing disk-queue file");
            }
        }

        let window_size = inner.flow_control_window_size;
        let window = if path_options.ack_needed {
            &mut inner.flow_control_window
        } else {
            &mut inner.overflow
        };
        if window.len() < window_size {
            let size = msg.estimated_size() as u64;
            window.push_back((msg, *path_options));
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
            self.counters.queued.sub(1);
            self.counters.memory_usage.sub(msg.estimated_size() as u64);
            return Some((msg, path_options));
        }

        match inner.qdisk.pop_head() {
            Ok(Some(payload)) => match deserialize_message(&payload) {
                Ok(msg) => {
                    self.counters.queued.sub(1);
                    self.counters.update_disk(&inner.qdisk);
                    // disk records were acked when they were pushed
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

        let entry = inner
            .flow_control_window
            .pop_front()
            .or_else(|| inner.overflow.pop_front());
        if let Some((msg, path_options)) = entry {
            self.counters.queued.sub(1);
            self.counters.memory_usage.sub(msg.estimated_size() as u64);
            return Some((msg, path_options));
        }
        None
    }

    fn ack_backlog(&self, _count: u64) {
        // non-reliable pops acknowledge immediately, nothing to do
    }

    fn rewind_backlog(&self, _count: u64) -> bool {
        false
    }

    fn len(&self) -> i64 {
        Self::total_len(&self.inner.lock())
    }

    fn filename(&self) -> Option<PathBuf> {
        self.inner.lock().qdisk.filename().map(Path::to_path_buf)
    }

    fn persist_name(&self) -> String {
        self.persist_name.clone()
    }

    fn stop(&self) -> bool {
        let mut inner = self.inner.lock();

        let drain = |tier: &mut VecDeque<Entry>| -> Vec<Vec<u8>> {
            let mut records = Vec::with_capacity(tier.len());
            while let Some((msg, path_options)) = tier.pop_front() {
                match serialize_message(&msg) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::error!(error = %e, "cannot save queue entry, message lost");
                    }
                }
                // saving to disk settles any pending flow control
                msg.ack(&path_options);
                msg.release();
            }
            records
        };

        let qout = drain(&mut inner.front_cache);
        let qbacklog = drain(&mut inner.flow_control_window);
        let qoverflow = drain(&mut inner.overflow);

        let mut persistent = true;
        if let Err(e) = inner.qdisk.save_state(&qout, &qbacklog, &qoverflow) {
            tracing::error!(error = %e, "error saving disk-queue state");
            persistent = false;
        }
        if let Err(e) = inner.qdisk.stop() {
            tracing::error!(error = %e, "error closing disk-queue file");
            persistent = false;
        }
        self.counters.memory_usage.set(0);
        persistent
    }
}

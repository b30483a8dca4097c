//! Binding between a destination driver and its named disk queue.
//!
//! A queue is acquired under a persist name; the generated file name is
//! written back to the persist state on release so the next start reopens
//! the same file. Released queues are parked in a process-wide holding
//! area, letting a configuration reload re-adopt them without replaying
//! the disk.

use crate::non_reliable::NonReliableQueue;
use crate::options::DiskQueueOptions;
use crate::qdisk::QdiskError;
use crate::queue::LogQueue;
use crate::reliable::ReliableQueue;
use crate::vfs::FileSystem;
use logflux_core::PersistState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

pub const DIRLOCK_FILE: &str = "logflux-disk-buffer.dirlock";

const QUEUE_FILENAME_ATTEMPTS: u32 = 100_000;

fn reload_store() -> &'static Mutex<HashMap<String, Arc<dyn LogQueue>>> {
    static STORE: OnceLock<Mutex<HashMap<String, Arc<dyn LogQueue>>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct DiskQueueDriver {
    options: DiskQueueOptions,
    fs: Arc<dyn FileSystem>,
    _dirlock: Box<dyn crate::vfs::QueueFile>,
}

impl DiskQueueDriver {
    /// Prepare the queue directory, taking the per-directory lock that
    /// keeps two daemons from sharing it.
    pub fn new(options: DiskQueueOptions, fs: Arc<dyn FileSystem>) -> Result<DiskQueueDriver, QdiskError> {
        fs.create_dir_all(&options.dir)?;
        let dirlock_path = options.dir.join(DIRLOCK_FILE);
        let dirlock = fs.open(&dirlock_path, true, true)?;
        dirlock.try_lock_exclusive().map_err(|_| {
            QdiskError::Init(format!(
                "disk-buffer directory {} is locked by another process",
                options.dir.display()
            ))
        })?;
        Ok(DiskQueueDriver {
            options,
            fs,
            _dirlock: dirlock,
        })
    }

    fn queue_extension(&self) -> &'static str {
        if self.options.reliable {
            "rqf"
        } else {
            "qf"
        }
    }

    fn next_filename(&self) -> Result<PathBuf, QdiskError> {
        for i in 0..QUEUE_FILENAME_ATTEMPTS {
            let candidate = self
                .options
                .dir
                .join(format!("logflux-{i:05}.{}", self.queue_extension()));
            if !self.fs.exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(QdiskError::Init(
            "error generating unique queue filename, not using disk queue".into(),
        ))
    }

    fn start_queue(
        &self,
        filename: &Path,
        persist_name: &str,
    ) -> Result<Arc<dyn LogQueue>, QdiskError> {
        if self.options.reliable {
            Ok(ReliableQueue::start(
                Arc::clone(&self.fs),
                self.options.clone(),
                filename,
                persist_name,
            )?)
        } else {
            Ok(NonReliableQueue::start(
                Arc::clone(&self.fs),
                self.options.clone(),
                filename,
                persist_name,
            )?)
        }
    }

    /// Acquire the queue registered under `persist_name`, reopening the
    /// file of a previous run when possible.
    pub fn acquire_queue(
        &self,
        persist: &PersistState,
        persist_name: &str,
    ) -> Result<Arc<dyn LogQueue>, QdiskError> {
        // a queue parked across a reload has flushed its state; dropping it
        // here releases the old instance before the file is reopened
        drop(reload_store().lock().remove(persist_name));

        if let Some(previous) = persist.lookup(persist_name) {
            let filename = PathBuf::from(&previous);
            if filename.parent() != Some(self.options.dir.as_path()) {
                tracing::warn!(
                    qfile = %filename.display(),
                    dir = %self.options.dir.display(),
                    "the disk buffer directory has changed in the configuration, but the queue file cannot be moved"
                );
            }
            match self.start_queue(&filename, persist_name) {
                Ok(queue) => {
                    self.record_filename(persist, persist_name, &queue);
                    return Ok(queue);
                }
                Err(e) => {
                    tracing::error!(
                        old_filename = %filename.display(),
                        error = %e,
                        "error opening disk-queue file, a new one will be started"
                    );
                }
            }
        }

        let filename = self.next_filename()?;
        let queue = self.start_queue(&filename, persist_name)?;
        self.record_filename(persist, persist_name, &queue);
        Ok(queue)
    }

    fn record_filename(&self, persist: &PersistState, persist_name: &str, queue: &Arc<dyn LogQueue>) {
        if let Some(filename) = queue.filename() {
            if let Err(e) = persist.store(persist_name, &filename.display().to_string()) {
                tracing::error!(error = %e, "cannot record the queue filename in the persist state");
            }
        }
    }

    /// Flush and park a queue so a configuration reload can pick it up.
    pub fn release_queue(&self, persist: &PersistState, queue: Arc<dyn LogQueue>) {
        let persist_name = queue.persist_name();
        if let Some(filename) = queue.filename() {
            if let Err(e) = persist.store(&persist_name, &filename.display().to_string()) {
                tracing::error!(error = %e, "cannot record the queue filename in the persist state");
            }
        }
        let persistent = queue.stop();
        if persistent {
            reload_store().lock().insert(persist_name, queue);
        }
    }

    pub fn options(&self) -> &DiskQueueOptions {
        &self.options
    }
}

/// Drop every parked queue; used between tests and at final shutdown.
pub fn clear_reload_store() {
    reload_store().lock().clear();
}

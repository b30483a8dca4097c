use logflux_core::logmsg::{builtin, LogMessage, PathOptions};
use logflux_core::PersistState;
use logflux_diskq::driver::{clear_reload_store, DiskQueueDriver, DIRLOCK_FILE};
use logflux_diskq::options::{DiskQueueOptions, MIN_CAPACITY_BYTES};
use logflux_diskq::queue::LogQueue;
use logflux_diskq::vfs::{FileSystem, StdFileSystem};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn fs() -> Arc<dyn FileSystem> {
    Arc::new(StdFileSystem)
}

fn message(payload: &[u8]) -> Arc<LogMessage> {
    let mut msg = LogMessage::new_empty();
    msg.set_value(builtin::MESSAGE, payload);
    Arc::new(msg)
}

fn options(dir: &Path, reliable: bool) -> DiskQueueOptions {
    DiskQueueOptions {
        capacity_bytes: MIN_CAPACITY_BYTES,
        front_cache_size: 0,
        reliable,
        dir: dir.to_path_buf(),
        ..Default::default()
    }
}

#[test]
fn acquire_generates_and_persists_the_filename() {
    let dir = TempDir::new().unwrap();
    clear_reload_store();
    let persist = PersistState::open(dir.path().join("logflux.persist")).unwrap();
    let driver = DiskQueueDriver::new(options(dir.path(), true), fs()).unwrap();

    let queue = driver.acquire_queue(&persist, "d_remote#0").unwrap();
    let filename = queue.filename().unwrap();
    assert_eq!(
        filename.file_name().unwrap().to_str().unwrap(),
        "logflux-00000.rqf"
    );
    assert_eq!(
        persist.lookup("d_remote#0").unwrap(),
        filename.display().to_string()
    );

    // a second driver name gets the next free index
    let other = driver.acquire_queue(&persist, "d_remote#1").unwrap();
    assert_eq!(
        other.filename().unwrap().file_name().unwrap().to_str().unwrap(),
        "logflux-00001.rqf"
    );

    driver.release_queue(&persist, queue);
    driver.release_queue(&persist, other);
    clear_reload_store();
}

#[test]
fn reacquire_reopens_the_same_file_with_contents() {
    let dir = TempDir::new().unwrap();
    clear_reload_store();
    let persist = PersistState::open(dir.path().join("logflux.persist")).unwrap();
    let driver = DiskQueueDriver::new(options(dir.path(), true), fs()).unwrap();

    let queue = driver.acquire_queue(&persist, "d_file#0").unwrap();
    let filename = queue.filename().unwrap();
    assert!(queue.push_tail(message(b"kept across restarts"), &PathOptions::new()));
    driver.release_queue(&persist, queue);

    let queue = driver.acquire_queue(&persist, "d_file#0").unwrap();
    assert_eq!(queue.filename().unwrap(), filename);
    assert_eq!(queue.len(), 1);
    let (msg, _) = queue.pop_head().unwrap();
    assert_eq!(msg.get_value(builtin::MESSAGE), b"kept across restarts");
    msg.release();
    driver.release_queue(&persist, queue);
    clear_reload_store();
}

#[test]
fn missing_persisted_file_falls_back_to_a_new_one() {
    let dir = TempDir::new().unwrap();
    clear_reload_store();
    let persist = PersistState::open(dir.path().join("logflux.persist")).unwrap();
    persist
        .store("d_gone#0", &dir.path().join("logflux-09999.rqf").display().to_string())
        .unwrap();

    let driver = DiskQueueDriver::new(options(dir.path(), true), fs()).unwrap();
    // the referenced file does not exist; a fresh one is created under the
    // recorded name
    let queue = driver.acquire_queue(&persist, "d_gone#0").unwrap();
    assert!(queue.filename().is_some());
    assert_eq!(queue.len(), 0);
    driver.release_queue(&persist, queue);
    clear_reload_store();
}

#[test]
fn dirlock_is_created() {
    let dir = TempDir::new().unwrap();
    clear_reload_store();
    let _driver = DiskQueueDriver::new(options(dir.path(), false), fs()).unwrap();
    assert!(dir.path().join(DIRLOCK_FILE).exists());
}

use logflux_diskq::options::DiskQueueOptions;
use logflux_diskq::options::ResolvedOptions;
use logflux_diskq::qdisk::{Qdisk, QDISK_RESERVED_SPACE};
use logflux_diskq::vfs::{FileSystem, StdFileSystem};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const FILE_ID: [u8; 4] = *b"LFRQ";

fn resolved(capacity: i64, reliable: bool, dir: &Path) -> ResolvedOptions {
    ResolvedOptions {
        options: DiskQueueOptions {
            capacity_bytes: capacity,
            reliable,
            dir: dir.to_path_buf(),
            ..Default::default()
        },
        prealloc: false,
        truncate_size_ratio: 1.0,
    }
}

fn new_qdisk(dir: &Path, capacity: i64, reliable: bool) -> Qdisk {
    let fs: Arc<dyn FileSystem> = Arc::new(StdFileSystem);
    Qdisk::new(fs, resolved(capacity, reliable, dir), FILE_ID)
}

fn record(payload: &[u8]) -> Vec<u8> {
    let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(payload);
    framed
}

#[test]
fn push_pop_roundtrip_in_fifo_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fifo.rqf");
    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();

    let payloads: Vec<Vec<u8>> = (0..10u8)
        .map(|i| vec![i; 100 + i as usize * 10])
        .collect();
    for (i, payload) in payloads.iter().enumerate() {
        assert!(qdisk.push_tail(&record(payload)).unwrap());
        assert_eq!(qdisk.length(), i as i64 + 1);
    }

    for payload in &payloads {
        let popped = qdisk.pop_head().unwrap().unwrap();
        assert_eq!(&popped, payload);
    }
    assert!(qdisk.pop_head().unwrap().is_none());
    assert_eq!(qdisk.length(), 0);
    assert_eq!(qdisk.backlog_len(), 10);
}

#[test]
fn state_survives_stop_and_start() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("persist.rqf");

    {
        let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
        qdisk.start(&path).unwrap();
        qdisk.push_tail(&record(b"alpha")).unwrap();
        qdisk.push_tail(&record(b"beta")).unwrap();
        qdisk.stop().unwrap();
    }

    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();
    assert_eq!(qdisk.length(), 2);
    assert_eq!(qdisk.pop_head().unwrap().unwrap(), b"alpha");
    assert_eq!(qdisk.pop_head().unwrap().unwrap(), b"beta");
}

#[test]
fn rewind_backlog_replays_popped_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rewind.rqf");
    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();

    let payloads: Vec<Vec<u8>> = (0..10u8).map(|i| vec![b'a' + i; 64]).collect();
    for payload in &payloads {
        qdisk.push_tail(&record(payload)).unwrap();
    }
    for _ in 0..8 {
        qdisk.pop_head().unwrap().unwrap();
    }
    assert_eq!(qdisk.backlog_len(), 8);
    assert_eq!(qdisk.length(), 2);

    assert!(qdisk.rewind_backlog(5).unwrap());
    assert_eq!(qdisk.backlog_len(), 3);
    assert_eq!(qdisk.length(), 7);

    // the next pop replays the 4th record pushed
    assert_eq!(qdisk.pop_head().unwrap().unwrap(), payloads[3]);

    assert!(!qdisk.rewind_backlog(100).unwrap());
}

#[test]
fn full_rewind_restores_the_pre_pop_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rewind-all.rqf");
    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();

    let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 48]).collect();
    for payload in &payloads {
        qdisk.push_tail(&record(payload)).unwrap();
    }
    let read_head_before = qdisk.read_head();

    for payload in &payloads {
        assert_eq!(&qdisk.pop_head().unwrap().unwrap(), payload);
    }
    assert!(qdisk.rewind_backlog(5).unwrap());
    assert_eq!(qdisk.read_head(), read_head_before);
    assert_eq!(qdisk.length(), 5);

    for payload in &payloads {
        assert_eq!(&qdisk.pop_head().unwrap().unwrap(), payload);
    }
}

#[test]
fn ack_backlog_walks_records_forward() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ack.rqf");
    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();

    for i in 0..6u8 {
        qdisk.push_tail(&record(&[i; 32])).unwrap();
    }
    for _ in 0..6 {
        qdisk.pop_head().unwrap().unwrap();
    }
    qdisk.ack_backlog(4).unwrap();
    assert_eq!(qdisk.backlog_len(), 2);
    qdisk.ack_backlog(10).unwrap();
    assert_eq!(qdisk.backlog_len(), 0);
    assert_eq!(qdisk.backlog_head(), qdisk.read_head());
}

#[test]
fn boundary_record_just_fits_after_wrap() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("boundary.rqf");
    let slot = 1000i64;
    let capacity = QDISK_RESERVED_SPACE + slot;
    let mut qdisk = new_qdisk(dir.path(), capacity, true);
    qdisk.start(&path).unwrap();

    // fill to the capacity so the write head parks at the end
    let filler = vec![b'f'; slot as usize - 4];
    assert!(qdisk.push_tail(&record(&filler)).unwrap());
    assert_eq!(qdisk.write_head(), capacity);

    qdisk.pop_head().unwrap().unwrap();
    qdisk.ack_backlog(1).unwrap();

    // after the wrap the free range is [reserved, backlog_head) minus the
    // one byte keeping "equal heads" meaning empty
    let fits = vec![b'x'; (slot - 4 - 1) as usize];
    assert!(qdisk.push_tail(&record(&fits)).unwrap());
    assert_eq!(qdisk.read_head(), QDISK_RESERVED_SPACE + slot);
    assert_eq!(qdisk.pop_head().unwrap().unwrap(), fits);

    // one byte more would catch the backlog head
    let mut qdisk2 = new_qdisk(dir.path(), capacity, true);
    let path2 = dir.path().join("boundary2.rqf");
    qdisk2.start(&path2).unwrap();
    assert!(qdisk2.push_tail(&record(&filler)).unwrap());
    qdisk2.pop_head().unwrap().unwrap();
    qdisk2.ack_backlog(1).unwrap();
    let too_big = vec![b'x'; (slot - 4) as usize];
    assert!(!qdisk2.push_tail(&record(&too_big)).unwrap());
}

#[test]
fn ring_stays_bounded_across_many_cycles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ring.rqf");
    let capacity = QDISK_RESERVED_SPACE + 8192;
    let mut qdisk = new_qdisk(dir.path(), capacity, true);
    qdisk.start(&path).unwrap();

    let payload = vec![b'r'; 512];
    for _ in 0..200 {
        assert!(qdisk.push_tail(&record(&payload)).unwrap());
        assert_eq!(qdisk.pop_head().unwrap().unwrap(), payload);
        qdisk.ack_backlog(1).unwrap();
        // one record may straddle the capacity boundary
        assert!(qdisk.file_size() <= capacity + payload.len() as i64 + 4);
    }
    assert_eq!(qdisk.length(), 0);
}

#[test]
fn empty_and_oversized_record_lengths_are_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corrupt.rqf");
    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();
    qdisk.push_tail(&record(b"victim")).unwrap();
    qdisk.stop().unwrap();

    // overwrite the stored record length with zero
    let file = StdFileSystem.open(&path, true, false).unwrap();
    file.write_all_at(&0u32.to_be_bytes(), QDISK_RESERVED_SPACE as u64)
        .unwrap();
    drop(file);

    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();
    assert!(qdisk.pop_head().is_err());
}

#[test]
fn mismatched_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("magic.rqf");
    let mut qdisk = new_qdisk(dir.path(), 1024 * 1024, true);
    qdisk.start(&path).unwrap();
    qdisk.stop().unwrap();

    let fs: Arc<dyn FileSystem> = Arc::new(StdFileSystem);
    let mut other = Qdisk::new(fs, resolved(1024 * 1024, false, dir.path()), *b"LFQF");
    assert!(other.start(&path).is_err());
}

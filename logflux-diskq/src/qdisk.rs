//! Append-structured ring file with a fixed header and wrap-around
//! write/read/backlog heads.
//!
//! The first 4 KiB hold the header; records follow as `u32be length +
//! payload`. The write head appends, the read head consumes, and the
//! backlog head trails behind the read head until records are
//! acknowledged. A record that would not fit before `capacity_bytes` wraps
//! back to the reserved boundary, which also means the file may transiently
//! exceed the configured capacity by most of one record.
//!
//! Header cursor updates are ordered after the record write they describe,
//! so a crash between the two replays the old cursors and never exposes a
//! half-written record.

use crate::options::ResolvedOptions;
use crate::vfs::{FileSystem, QueueFile};
use logflux_core::{ArchiveWriter, CoreResult};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const QDISK_RESERVED_SPACE: i64 = 4096;

/// Record lengths above this are treated as corruption.
pub const MAX_RECORD_LENGTH: u32 = 100 * 1024 * 1024;

const HDR_VERSION_CURRENT: u8 = 3;

/// Bytes of the reserved space actually carrying fields.
const HDR_USED: usize = 104;

pub type QdiskResult<T> = Result<T, QdiskError>;

#[derive(Debug, Error)]
pub enum QdiskError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("disk-queue file corrupted: {0}")]
    Corrupted(String),
    #[error("cannot initialize disk-queue: {0}")]
    Init(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] logflux_core::CoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePosition {
    pub ofs: i64,
    pub len: u32,
    pub count: u32,
}

#[derive(Debug, Clone)]
struct QdiskHeader {
    version: u8,
    big_endian: bool,
    read_head: i64,
    write_head: i64,
    length: i64,
    qout_pos: QueuePosition,
    qbacklog_pos: QueuePosition,
    qoverflow_pos: QueuePosition,
    backlog_head: i64,
    backlog_len: i64,
    use_v1_wrap_condition: bool,
    capacity: i64,
}

impl Default for QdiskHeader {
    fn default() -> Self {
        QdiskHeader {
            version: HDR_VERSION_CURRENT,
            big_endian: false,
            read_head: QDISK_RESERVED_SPACE,
            write_head: QDISK_RESERVED_SPACE,
            length: 0,
            qout_pos: QueuePosition::default(),
            qbacklog_pos: QueuePosition::default(),
            qoverflow_pos: QueuePosition::default(),
            backlog_head: QDISK_RESERVED_SPACE,
            backlog_len: 0,
            use_v1_wrap_condition: false,
            capacity: -1,
        }
    }
}

/// Messages restored from the non-reliable tail sections.
#[derive(Debug, Default)]
pub struct TailSections {
    pub qout: Vec<Vec<u8>>,
    pub qbacklog: Vec<Vec<u8>>,
    pub qoverflow: Vec<Vec<u8>>,
}

pub struct Qdisk {
    fs: Arc<dyn FileSystem>,
    file: Option<Box<dyn QueueFile>>,
    filename: Option<PathBuf>,
    file_size: i64,
    hdr: QdiskHeader,
    resolved: ResolvedOptions,
    file_id: [u8; 4],
}

fn get_i64(buf: &[u8], at: usize, big_endian: bool) -> i64 {
    let bytes: [u8; 8] = buf[at..at + 8].try_into().unwrap();
    if big_endian {
        i64::from_be_bytes(bytes)
    } else {
        i64::from_le_bytes(bytes)
    }
}

fn get_u32(buf: &[u8], at: usize, big_endian: bool) -> u32 {
    let bytes: [u8; 4] = buf[at..at + 4].try_into().unwrap();
    if big_endian {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    }
}

fn put_i64(buf: &mut [u8], at: usize, value: i64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_position(buf: &[u8], at: usize, big_endian: bool) -> QueuePosition {
    QueuePosition {
        ofs: get_i64(buf, at, big_endian),
        len: get_u32(buf, at + 8, big_endian),
        count: get_u32(buf, at + 12, big_endian),
    }
}

fn put_position(buf: &mut [u8], at: usize, pos: &QueuePosition) {
    put_i64(buf, at, pos.ofs);
    put_u32(buf, at + 8, pos.len);
    put_u32(buf, at + 12, pos.count);
}

impl Qdisk {
    pub fn new(fs: Arc<dyn FileSystem>, resolved: ResolvedOptions, file_id: [u8; 4]) -> Qdisk {
        Qdisk {
            fs,
            file: None,
            filename: None,
            file_size: 0,
            hdr: QdiskHeader::default(),
            resolved,
            file_id,
        }
    }

    pub fn started(&self) -> bool {
        self.file.is_some()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn length(&self) -> i64 {
        self.hdr.length
    }

    pub fn backlog_len(&self) -> i64 {
        self.hdr.backlog_len
    }

    pub fn capacity(&self) -> i64 {
        self.hdr.capacity
    }

    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    pub fn write_head(&self) -> i64 {
        self.hdr.write_head
    }

    pub fn read_head(&self) -> i64 {
        self.hdr.read_head
    }

    pub fn backlog_head(&self) -> i64 {
        self.hdr.backlog_head
    }

    pub fn is_file_empty(&self) -> bool {
        self.hdr.length == 0 && self.hdr.backlog_len == 0
    }

    /// Bytes of the ring currently occupied by unacked records.
    pub fn used_bytes(&self) -> i64 {
        if self.hdr.write_head >= self.hdr.backlog_head {
            self.hdr.write_head - self.hdr.backlog_head
        } else {
            (self.hdr.capacity - self.hdr.backlog_head)
                + (self.hdr.write_head - QDISK_RESERVED_SPACE)
        }
    }

    pub fn empty_space(&self) -> i64 {
        let write = self.hdr.write_head;
        let backlog = self.hdr.backlog_head;
        if write > backlog {
            (self.hdr.capacity - write) + (backlog - QDISK_RESERVED_SPACE)
        } else {
            backlog - write
        }
    }

    fn file(&self) -> &dyn QueueFile {
        self.file.as_deref().expect("qdisk is started")
    }

    // --- header ---

    fn encode_header(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HDR_USED];
        buf[0..4].copy_from_slice(&self.file_id);
        buf[4] = self.hdr.version;
        buf[5] = 0; // stored little-endian after normalization
        put_i64(&mut buf, 7, self.hdr.read_head);
        put_i64(&mut buf, 15, self.hdr.write_head);
        put_i64(&mut buf, 23, self.hdr.length);
        put_position(&mut buf, 31, &self.hdr.qout_pos);
        put_position(&mut buf, 47, &self.hdr.qbacklog_pos);
        put_position(&mut buf, 63, &self.hdr.qoverflow_pos);
        put_i64(&mut buf, 79, self.hdr.backlog_head);
        put_i64(&mut buf, 87, self.hdr.backlog_len);
        buf[95] = self.hdr.use_v1_wrap_condition as u8;
        put_i64(&mut buf, 96, self.hdr.capacity);
        buf
    }

    fn write_header(&self) -> QdiskResult<()> {
        let buf = self.encode_header();
        self.file().write_all_at(&buf, 0)?;
        Ok(())
    }

    fn decode_header(&mut self, buf: &[u8]) -> QdiskResult<()> {
        if buf[0..4] != self.file_id {
            return Err(QdiskError::Corrupted("invalid magic".into()));
        }
        let big_endian = buf[5] != 0;
        self.hdr = QdiskHeader {
            version: buf[4],
            big_endian: false,
            read_head: get_i64(buf, 7, big_endian),
            write_head: get_i64(buf, 15, big_endian),
            length: get_i64(buf, 23, big_endian),
            qout_pos: get_position(buf, 31, big_endian),
            qbacklog_pos: get_position(buf, 47, big_endian),
            qoverflow_pos: get_position(buf, 63, big_endian),
            backlog_head: get_i64(buf, 79, big_endian),
            backlog_len: get_i64(buf, 87, big_endian),
            use_v1_wrap_condition: buf[95] != 0,
            capacity: get_i64(buf, 96, big_endian),
        };
        Ok(())
    }

    fn upgrade_header(&mut self) -> QdiskResult<()> {
        if self.hdr.version == 0 {
            self.empty_backlog();
        }
        if self.hdr.version < 2 {
            // pre-v2 files wrapped at the physical end of file; detect
            // whether this file ever grew past its configured size
            let file_was_overgrown = self.file_size > self.resolved.options.capacity_bytes;
            self.hdr.use_v1_wrap_condition = file_was_overgrown;
        }
        if self.hdr.version < 3 {
            self.hdr.capacity = self.resolved.options.capacity_bytes;
        }
        self.hdr.version = HDR_VERSION_CURRENT;
        Ok(())
    }

    fn header_is_inconsistent(&self) -> bool {
        self.hdr.read_head < QDISK_RESERVED_SPACE
            || self.hdr.write_head < QDISK_RESERVED_SPACE
            || (self.hdr.read_head == self.hdr.write_head && self.hdr.length != 0)
    }

    // --- start / stop ---

    pub fn start(&mut self, filename: &Path) -> QdiskResult<TailSections> {
        assert!(!self.started(), "qdisk is already started");

        if self.fs.exists(filename) {
            self.load_file(filename)
        } else {
            self.create_file(filename)?;
            Ok(TailSections::default())
        }
    }

    fn create_file(&mut self, filename: &Path) -> QdiskResult<()> {
        if self.resolved.options.capacity_bytes <= 0 {
            return Err(QdiskError::Init(
                "capacity for new disk-queue files must be set".into(),
            ));
        }
        if let Some(parent) = filename.parent() {
            self.fs.create_dir_all(parent)?;
        }
        let file = self.fs.open(filename, true, true)?;
        self.file = Some(file);
        self.filename = Some(filename.to_path_buf());

        self.hdr = QdiskHeader {
            capacity: self.resolved.options.capacity_bytes,
            ..QdiskHeader::default()
        };
        // reserve the full header block up front
        self.file().write_all_at(&[0u8; 4096], 0)?;
        self.file_size = QDISK_RESERVED_SPACE;

        if self.resolved.prealloc {
            tracing::debug!(filename = %filename.display(), size = self.hdr.capacity, "preallocating queue file");
            self.file().allocate(self.hdr.capacity as u64)?;
            self.file_size = self.hdr.capacity;
        }

        self.write_header()?;
        Ok(())
    }

    fn load_file(&mut self, filename: &Path) -> QdiskResult<TailSections> {
        let file = self.fs.open(filename, !self.resolved.options.read_only, false)?;
        let size = file.len()? as i64;
        if size < QDISK_RESERVED_SPACE {
            return Err(QdiskError::Corrupted("file is shorter than the header".into()));
        }
        self.file = Some(file);
        self.filename = Some(filename.to_path_buf());
        self.file_size = size;

        let mut buf = vec![0u8; HDR_USED];
        self.file().read_exact_at(&mut buf, 0)?;
        self.decode_header(&buf)?;

        if self.hdr.version != HDR_VERSION_CURRENT {
            if self.hdr.version > HDR_VERSION_CURRENT {
                return Err(QdiskError::Corrupted(format!(
                    "unsupported header version {}",
                    self.hdr.version
                )));
            }
            self.upgrade_header()?;
        }

        if self.header_is_inconsistent() {
            return Err(QdiskError::Corrupted(format!(
                "inconsistent header data, read_head={} write_head={} length={}",
                self.hdr.read_head, self.hdr.write_head, self.hdr.length
            )));
        }

        self.ensure_capacity()?;

        let tails = if !self.resolved.options.reliable {
            let tails = self.load_tail_sections()?;
            self.hdr.qout_pos = QueuePosition::default();
            self.hdr.qbacklog_pos = QueuePosition::default();
            self.hdr.qoverflow_pos = QueuePosition::default();
            if !self.resolved.options.read_only {
                self.truncate_to_minimal()?;
                self.write_header()?;
            }
            tracing::info!(
                filename = %filename.display(),
                qdisk_length = self.hdr.length,
                restored = tails.qout.len() + tails.qbacklog.len() + tails.qoverflow.len(),
                "disk-buffer state loaded"
            );
            tails
        } else {
            tracing::info!(
                filename = %filename.display(),
                queue_length = self.hdr.length,
                backlog_len = self.hdr.backlog_len,
                "reliable disk-buffer state loaded"
            );
            TailSections::default()
        };

        Ok(tails)
    }

    fn ensure_capacity(&mut self) -> QdiskResult<()> {
        if self.hdr.capacity == -1 {
            self.autodetect_capacity()?;
        }
        if self.resolved.options.capacity_bytes > 0
            && self.hdr.capacity != self.resolved.options.capacity_bytes
        {
            tracing::warn!(
                active_capacity = self.hdr.capacity,
                ignored_capacity = self.resolved.options.capacity_bytes,
                "the capacity of an existing disk-queue cannot change, continuing with the old one"
            );
        }
        Ok(())
    }

    fn autodetect_capacity(&mut self) -> QdiskResult<()> {
        if self.is_file_empty() {
            self.hdr.capacity = self.file_size.max(crate::options::MIN_CAPACITY_BYTES);
            return Ok(());
        }
        if self.hdr.write_head > self.hdr.backlog_head.max(self.hdr.read_head) {
            self.hdr.capacity = self.file_size;
            return Ok(());
        }
        Err(QdiskError::Corrupted(
            "cannot autodetect the capacity of a wrapped disk-queue file".into(),
        ))
    }

    pub fn stop(&mut self) -> QdiskResult<()> {
        if self.started() && !self.resolved.options.read_only {
            self.write_header()?;
            self.file().sync_data()?;
        }
        self.file = None;
        self.filename = None;
        Ok(())
    }

    // --- cursor arithmetic ---

    fn position_reached_capacity(&self, position: i64) -> bool {
        position >= self.hdr.capacity
    }

    fn correct_position_if_capacity_reached(&mut self, position: i64) -> i64 {
        if self.hdr.use_v1_wrap_condition {
            if position >= self.file_size {
                self.hdr.use_v1_wrap_condition = false;
                return QDISK_RESERVED_SPACE;
            }
            return position;
        }
        if self.position_reached_capacity(position) {
            return QDISK_RESERVED_SPACE;
        }
        position
    }

    fn backlog_precedes_write_head(&self) -> bool {
        self.hdr.backlog_head <= self.hdr.write_head
    }

    fn can_wrap_write_head(&self) -> bool {
        self.hdr.backlog_head != QDISK_RESERVED_SPACE
    }

    fn could_not_wrap_last_push_but_now_can(&self) -> bool {
        self.position_reached_capacity(self.hdr.write_head) && self.can_wrap_write_head()
    }

    pub fn is_space_avail(&self, at_least: i64) -> bool {
        if self.backlog_precedes_write_head() {
            if self.hdr.write_head < self.hdr.capacity {
                // appending past the capacity is allowed for the record
                // that straddles the boundary
                return true;
            }
            return self.can_wrap_write_head()
                && QDISK_RESERVED_SPACE + at_least < self.hdr.backlog_head;
        }
        // one byte of slack keeps write_head == backlog_head meaning empty
        self.hdr.write_head + at_least < self.hdr.backlog_head
    }

    // --- truncation ---

    fn maybe_truncate_file(&mut self, expected_size: i64) -> QdiskResult<()> {
        let reduces = expected_size < self.file_size;
        let reduction = self.file_size - expected_size;
        let threshold = (self.hdr.capacity as f64 * self.resolved.truncate_size_ratio) as i64;
        if reduces && reduction < threshold && !self.hdr.use_v1_wrap_condition {
            return Ok(());
        }

        tracing::debug!(
            filename = ?self.filename,
            new_size = expected_size,
            "truncating queue file"
        );
        match self.file().set_len(expected_size as u64) {
            Ok(()) => {
                self.file_size = expected_size;
                Ok(())
            }
            Err(e) => {
                self.file_size = self.file().len()? as i64;
                tracing::error!(
                    error = %e,
                    filename = ?self.filename,
                    expected_size,
                    file_size = self.file_size,
                    "error truncating disk-queue file"
                );
                Ok(())
            }
        }
    }

    fn lowest_used_tail_offset(&self) -> i64 {
        let mut lowest = i64::MAX;
        for pos in [
            &self.hdr.qout_pos,
            &self.hdr.qbacklog_pos,
            &self.hdr.qoverflow_pos,
        ] {
            if pos.ofs > 0 {
                lowest = lowest.min(pos.ofs);
            }
        }
        if lowest == i64::MAX {
            0
        } else {
            lowest
        }
    }

    fn truncate_to_minimal(&mut self) -> QdiskResult<()> {
        if self.is_file_empty() {
            self.hdr.read_head = QDISK_RESERVED_SPACE;
            self.hdr.write_head = QDISK_RESERVED_SPACE;
            self.hdr.backlog_head = QDISK_RESERVED_SPACE;
            return self.truncate_file(QDISK_RESERVED_SPACE);
        }
        let tail_start = self.lowest_used_tail_offset();
        if tail_start <= QDISK_RESERVED_SPACE {
            return Ok(());
        }
        if tail_start < self.file_size {
            self.truncate_file(tail_start)?;
        }
        Ok(())
    }

    fn truncate_file(&mut self, size: i64) -> QdiskResult<()> {
        if size >= self.file_size {
            return Ok(());
        }
        self.file().set_len(size as u64)?;
        self.file_size = size;
        Ok(())
    }

    pub fn reset_file_if_empty(&mut self) -> QdiskResult<()> {
        if !self.is_file_empty() {
            return Ok(());
        }
        self.hdr.read_head = QDISK_RESERVED_SPACE;
        self.hdr.write_head = QDISK_RESERVED_SPACE;
        self.hdr.backlog_head = QDISK_RESERVED_SPACE;
        self.maybe_truncate_file(QDISK_RESERVED_SPACE)
    }

    // --- push / pop ---

    /// Append one framed record. Returns false when the ring has no room.
    pub fn push_tail(&mut self, record: &[u8]) -> QdiskResult<bool> {
        if !self.started() {
            return Ok(false);
        }

        if self.could_not_wrap_last_push_but_now_can() {
            // move first, then re-check the space against the new head
            self.hdr.write_head = QDISK_RESERVED_SPACE;
        }

        if !self.is_space_avail(record.len() as i64) {
            return Ok(false);
        }

        self.file().write_all_at(record, self.hdr.write_head as u64)?;
        self.hdr.write_head += record.len() as i64;

        assert!(
            self.hdr.write_head != self.hdr.backlog_head,
            "the write head may never catch the backlog head"
        );

        if self.hdr.write_head > self.hdr.backlog_head.max(self.hdr.read_head) {
            if self.file_size > self.hdr.write_head {
                self.maybe_truncate_file(self.hdr.write_head)?;
            } else {
                self.file_size = self.hdr.write_head;
            }

            if self.position_reached_capacity(self.hdr.write_head) && self.can_wrap_write_head() {
                // only a part of a single record may live past the
                // configured capacity
                self.hdr.write_head = QDISK_RESERVED_SPACE;
            }
        }
        self.hdr.length += 1;
        self.write_header()?;
        Ok(true)
    }

    fn read_record_length(&self, position: i64) -> QdiskResult<u32> {
        let mut buf = [0u8; 4];
        self.file()
            .read_exact_at(&mut buf, position as u64)
            .map_err(|e| {
                QdiskError::Corrupted(format!(
                    "cannot read record length at offset {position}: {e}"
                ))
            })?;
        let record_length = u32::from_be_bytes(buf);
        if record_length == 0 {
            return Err(QdiskError::Corrupted(format!(
                "empty record at offset {position}"
            )));
        }
        if record_length > MAX_RECORD_LENGTH {
            return Err(QdiskError::Corrupted(format!(
                "implausible record length {record_length} at offset {position}"
            )));
        }
        Ok(record_length)
    }

    fn update_position_after_read(&mut self, record_length: u32, position: i64) -> i64 {
        let new_position = position + record_length as i64 + 4;
        if new_position > self.hdr.write_head {
            return self.correct_position_if_capacity_reached(new_position);
        }
        new_position
    }

    /// Read and consume the record under the read head.
    pub fn pop_head(&mut self) -> QdiskResult<Option<Vec<u8>>> {
        if self.hdr.read_head == self.hdr.write_head {
            return Ok(None);
        }

        if self.hdr.read_head > self.hdr.write_head {
            self.hdr.read_head = self.correct_position_if_capacity_reached(self.hdr.read_head);
        }

        let record_length = self.read_record_length(self.hdr.read_head)?;
        let mut payload = vec![0u8; record_length as usize];
        self.file()
            .read_exact_at(&mut payload, self.hdr.read_head as u64 + 4)
            .map_err(|e| {
                QdiskError::Corrupted(format!(
                    "short read at offset {}: {e}",
                    self.hdr.read_head
                ))
            })?;

        self.hdr.read_head = self.update_position_after_read(record_length, self.hdr.read_head);
        self.hdr.length -= 1;
        self.hdr.backlog_len += 1;

        self.apply_non_reliable_corrections()?;
        self.write_header()?;
        Ok(Some(payload))
    }

    fn apply_non_reliable_corrections(&mut self) -> QdiskResult<()> {
        if self.resolved.options.reliable {
            return Ok(());
        }
        self.empty_backlog();
        if !self.resolved.options.read_only {
            self.reset_file_if_empty()?;
        }
        Ok(())
    }

    fn skip_record(&mut self, position: i64) -> QdiskResult<i64> {
        if position == self.hdr.write_head {
            return Err(QdiskError::Corrupted(
                "attempt to skip past the write head".into(),
            ));
        }
        let mut position = position;
        if position > self.hdr.write_head {
            position = self.correct_position_if_capacity_reached(position);
        }
        let record_length = self.read_record_length(position)?;
        Ok(self.update_position_after_read(record_length, position))
    }

    /// Consume the record under the read head without reading its payload.
    pub fn remove_head(&mut self) -> QdiskResult<()> {
        self.hdr.read_head = self.skip_record(self.hdr.read_head)?;
        self.hdr.length -= 1;
        self.hdr.backlog_len += 1;
        self.apply_non_reliable_corrections()?;
        self.write_header()?;
        Ok(())
    }

    /// Move the backlog head past `count` acknowledged records.
    pub fn ack_backlog(&mut self, count: u64) -> QdiskResult<()> {
        for _ in 0..count {
            if self.hdr.backlog_len == 0 {
                break;
            }
            self.hdr.backlog_head = self.skip_record(self.hdr.backlog_head)?;
            self.hdr.backlog_len -= 1;
        }
        self.write_header()?;
        Ok(())
    }

    /// Reposition the read head back into the backlog so the last
    /// `rewind_count` popped-but-unacked records replay.
    pub fn rewind_backlog(&mut self, rewind_count: u64) -> QdiskResult<bool> {
        if rewind_count as i64 > self.hdr.backlog_len {
            return Ok(false);
        }

        let staying_in_backlog = self.hdr.backlog_len - rewind_count as i64;
        let mut new_read_head = self.hdr.backlog_head;
        for _ in 0..staying_in_backlog {
            new_read_head = self.skip_record(new_read_head)?;
        }

        self.hdr.backlog_len = staying_in_backlog;
        self.hdr.read_head = new_read_head;
        self.hdr.length += rewind_count as i64;
        self.write_header()?;
        Ok(true)
    }

    pub fn empty_backlog(&mut self) {
        self.hdr.backlog_head = self.hdr.read_head;
        self.hdr.backlog_len = 0;
    }

    // --- non-reliable tail sections ---

    fn save_tail_section(&mut self, records: &[Vec<u8>]) -> QdiskResult<QueuePosition> {
        if records.is_empty() {
            return Ok(QueuePosition::default());
        }
        let start = self.file().len()?;
        let mut at = start;
        for record in records {
            self.file().write_all_at(record, at)?;
            at += record.len() as u64;
        }
        self.file_size = at as i64;
        Ok(QueuePosition {
            ofs: start as i64,
            len: (at - start) as u32,
            count: records.len() as u32,
        })
    }

    /// Persist the in-memory queues past the ring body and record their
    /// positions in the header.
    pub fn save_state(
        &mut self,
        qout: &[Vec<u8>],
        qbacklog: &[Vec<u8>],
        qoverflow: &[Vec<u8>],
    ) -> QdiskResult<()> {
        if !self.resolved.options.reliable {
            self.hdr.qout_pos = self.save_tail_section(qout)?;
            self.hdr.qbacklog_pos = self.save_tail_section(qbacklog)?;
            self.hdr.qoverflow_pos = self.save_tail_section(qoverflow)?;
            tracing::info!(
                filename = ?self.filename,
                qout_length = self.hdr.qout_pos.count,
                qbacklog_length = self.hdr.qbacklog_pos.count,
                qoverflow_length = self.hdr.qoverflow_pos.count,
                qdisk_length = self.hdr.length,
                "disk-buffer state saved"
            );
        } else {
            tracing::info!(
                filename = ?self.filename,
                qdisk_length = self.hdr.length,
                "reliable disk-buffer state saved"
            );
        }
        self.write_header()?;
        Ok(())
    }

    fn load_tail_section(&mut self, pos: QueuePosition, what: &str) -> QdiskResult<Vec<Vec<u8>>> {
        if pos.ofs == 0 {
            return Ok(Vec::new());
        }
        if pos.ofs < self.hdr.write_head {
            tracing::error!(
                filename = ?self.filename,
                what,
                ofs = pos.ofs,
                write_head = self.hdr.write_head,
                "inconsistent header data in disk-queue file, ignoring queue"
            );
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(pos.count as usize);
        let mut at = pos.ofs;
        for index in 0..pos.count {
            let record_length = match self.read_record_length(at) {
                Ok(len) => len,
                Err(e) => {
                    tracing::error!(
                        filename = ?self.filename,
                        what,
                        invalid_index = index,
                        lost_messages = pos.count - index,
                        error = %e,
                        "error reading in-memory queue section, some messages will be lost"
                    );
                    break;
                }
            };
            let mut payload = vec![0u8; record_length as usize];
            if self
                .file()
                .read_exact_at(&mut payload, at as u64 + 4)
                .is_err()
            {
                tracing::error!(
                    filename = ?self.filename,
                    what,
                    invalid_index = index,
                    lost_messages = pos.count - index,
                    "short read in in-memory queue section, some messages will be lost"
                );
                break;
            }
            records.push(payload);
            at += 4 + record_length as i64;
        }
        Ok(records)
    }

    fn load_tail_sections(&mut self) -> QdiskResult<TailSections> {
        Ok(TailSections {
            qout: self.load_tail_section(self.hdr.qout_pos, "qout")?,
            qbacklog: self.load_tail_section(self.hdr.qbacklog_pos, "qbacklog")?,
            qoverflow: self.load_tail_section(self.hdr.qoverflow_pos, "qoverflow")?,
        })
    }
}

/// Build a framed record: a placeholder length is written first and patched
/// once the payload writer ran.
pub fn serialize_record<F>(write_payload: F) -> QdiskResult<Vec<u8>>
where
    F: FnOnce(&mut ArchiveWriter<Vec<u8>>) -> CoreResult<()>,
{
    let mut writer = ArchiveWriter::new(Vec::new());
    writer.write_u32(0)?;
    write_payload(&mut writer)?;
    let mut record = writer.into_inner();
    let payload_len = record.len() as u32 - 4;
    if payload_len == 0 {
        return Err(QdiskError::Corrupted("serialized record is empty".into()));
    }
    record[0..4].copy_from_slice(&payload_len.to_be_bytes());
    Ok(record)
}

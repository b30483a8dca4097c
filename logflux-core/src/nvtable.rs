//! Compact name-value store backing one log message's payload.
//!
//! The table is one contiguous byte arena. The static offset array (one u16
//! per builtin handle) sits at the front, followed by the sorted dynamic
//! `(handle << 16) | offset` array; entry payloads grow downward from the
//! top. Offsets are stored in 4-byte units counted from the top of the
//! arena, so a 16-bit offset addresses 256 KiB. The two regions meet in the
//! middle when the table is full, which is the caller's signal to realloc.
//!
//! Entries are either direct (name and value copied in line, both NUL
//! terminated) or indirect (a `(handle, offset, length)` slice of another
//! direct value, used for match groups that are substrings of MESSAGE).

use crate::error::{CoreError, CoreResult};
use crate::registry::{NvHandle, NvRegistry, NV_HANDLE_NONE};
use crate::serialize::{ArchiveReader, ArchiveWriter};
use std::io::{Read, Write};
use thiserror::Error;

/// Offsets are stored in units of 4 bytes.
const SCALE: usize = 2;

/// Fixed part of a direct entry: flags, name_len, alloc_len, value_len.
pub const NV_ENTRY_DIRECT_HDR: usize = 8;

/// Fixed part of an indirect entry: flags, name_len, alloc_len, ref handle,
/// slice offset, slice length, type tag, padding.
pub const NV_ENTRY_INDIRECT_HDR: usize = 12;

/// Values longer than this are silently truncated.
pub const NV_VALUE_MAX: usize = 255 * 1024;

/// Largest table a 16-bit unit offset can address.
const MAX_TABLE_BYTES: usize = u16::MAX as usize * 4;

const MIN_TABLE_BYTES: usize = 256;

const FLAG_INDIRECT: u8 = 0x01;
const FLAG_REFERENCED: u8 = 0x02;

#[inline]
fn bound(len: usize) -> usize {
    (len + 3) & !3
}

fn dyn_slot_handle(slot: u32) -> NvHandle {
    (slot >> 16) as NvHandle
}

fn dyn_slot_ofs(slot: u32) -> u16 {
    (slot & 0xFFFF) as u16
}

#[derive(Debug, Error)]
#[error("name-value table is full")]
pub struct NvTableFull;

#[derive(Clone)]
pub struct NvTable {
    buf: Vec<u8>,
    /// 4-byte units consumed by entries, counted down from the top.
    used: u16,
    num_dyn: u16,
    num_static: u8,
}

impl NvTable {
    pub fn new(num_static: u8) -> Self {
        Self::with_capacity(num_static, 16, 256)
    }

    pub fn with_capacity(num_static: u8, num_dyn_hint: usize, payload_hint: usize) -> Self {
        let mut size = bound(payload_hint)
            + bound(num_static as usize * 2 + num_dyn_hint * 4);
        if size < MIN_TABLE_BYTES {
            size = MIN_TABLE_BYTES;
        }
        if size > MAX_TABLE_BYTES {
            size = MAX_TABLE_BYTES;
        }
        NvTable {
            buf: vec![0; size],
            used: 0,
            num_dyn: 0,
            num_static,
        }
    }

    pub fn num_static(&self) -> u8 {
        self.num_static
    }

    pub fn num_dyn_entries(&self) -> u16 {
        self.num_dyn
    }

    /// Total size of the arena in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes consumed by entry payloads.
    pub fn used_bytes(&self) -> usize {
        self.used as usize * 4
    }

    pub fn clear(&mut self) {
        self.used = 0;
        self.num_dyn = 0;
        let static_end = self.num_static as usize * 2;
        self.buf[..static_end].fill(0);
    }

    fn ofs_table_top(&self) -> usize {
        self.num_static as usize * 2 + self.num_dyn as usize * 4
    }

    fn payload_bottom(&self) -> usize {
        self.buf.len() - self.used as usize * 4
    }

    /// Free bytes between the offset tables and the entry payloads.
    pub fn free_space(&self) -> usize {
        self.payload_bottom() - self.ofs_table_top()
    }

    fn static_ofs(&self, index: usize) -> u16 {
        let at = index * 2;
        u16::from_le_bytes([self.buf[at], self.buf[at + 1]])
    }

    fn set_static_ofs(&mut self, index: usize, ofs: u16) {
        let at = index * 2;
        self.buf[at..at + 2].copy_from_slice(&ofs.to_le_bytes());
    }

    fn dyn_slot(&self, index: usize) -> u32 {
        let at = self.num_static as usize * 2 + index * 4;
        u32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ])
    }

    fn set_dyn_slot(&mut self, index: usize, slot: u32) {
        let at = self.num_static as usize * 2 + index * 4;
        self.buf[at..at + 4].copy_from_slice(&slot.to_le_bytes());
    }

    /// Byte index of the entry stored at `ofs` units from the top.
    fn entry_at(&self, ofs: u16) -> usize {
        self.buf.len() - (ofs as usize) * 4
    }

    fn entry_flags(&self, idx: usize) -> u8 {
        self.buf[idx]
    }

    fn entry_is_indirect(&self, idx: usize) -> bool {
        self.entry_flags(idx) & FLAG_INDIRECT != 0
    }

    fn entry_is_referenced(&self, idx: usize) -> bool {
        self.entry_flags(idx) & FLAG_REFERENCED != 0
    }

    fn entry_name_len(&self, idx: usize) -> usize {
        self.buf[idx + 1] as usize
    }

    fn entry_alloc_len(&self, idx: usize) -> usize {
        u16::from_le_bytes([self.buf[idx + 2], self.buf[idx + 3]]) as usize
    }

    fn entry_value_len(&self, idx: usize) -> usize {
        u32::from_le_bytes([
            self.buf[idx + 4],
            self.buf[idx + 5],
            self.buf[idx + 6],
            self.buf[idx + 7],
        ]) as usize
    }

    fn entry_ref_handle(&self, idx: usize) -> NvHandle {
        u16::from_le_bytes([self.buf[idx + 4], self.buf[idx + 5]])
    }

    fn entry_ref_ofs(&self, idx: usize) -> u16 {
        u16::from_le_bytes([self.buf[idx + 6], self.buf[idx + 7]])
    }

    fn entry_ref_len(&self, idx: usize) -> u16 {
        u16::from_le_bytes([self.buf[idx + 8], self.buf[idx + 9]])
    }

    fn entry_ref_type(&self, idx: usize) -> u8 {
        self.buf[idx + 10]
    }

    /// Name bytes of the entry; empty for builtins, which do not store it.
    fn entry_name(&self, idx: usize) -> &[u8] {
        let name_len = self.entry_name_len(idx);
        let start = if self.entry_is_indirect(idx) {
            idx + NV_ENTRY_INDIRECT_HDR
        } else {
            idx + NV_ENTRY_DIRECT_HDR
        };
        &self.buf[start..start + name_len]
    }

    fn entry_direct_value(&self, idx: usize) -> &[u8] {
        let name_len = self.entry_name_len(idx);
        let value_len = self.entry_value_len(idx);
        let start = idx + NV_ENTRY_DIRECT_HDR + name_len + 1;
        &self.buf[start..start + value_len]
    }

    /// Find the offset of the entry for `handle`, plus the index of its
    /// dynamic slot when it has one.
    fn find_entry(&self, handle: NvHandle) -> (u16, Option<usize>) {
        if handle == NV_HANDLE_NONE {
            return (0, None);
        }
        if handle as usize <= self.num_static as usize {
            return (self.static_ofs(handle as usize - 1), None);
        }
        // binary search the dynamic slot array
        let mut lo = 0i32;
        let mut hi = self.num_dyn as i32 - 1;
        while lo <= hi {
            let mid = ((lo + hi) >> 1) as usize;
            let slot = self.dyn_slot(mid);
            let mid_handle = dyn_slot_handle(slot);
            if mid_handle == handle {
                return (dyn_slot_ofs(slot), Some(mid));
            } else if mid_handle > handle {
                hi = mid as i32 - 1;
            } else {
                lo = mid as i32 + 1;
            }
        }
        (0, None)
    }

    /// Look up a value, following at most one indirection. Missing handles
    /// resolve to the empty value.
    pub fn get_value(&self, handle: NvHandle) -> &[u8] {
        let (ofs, _) = self.find_entry(handle);
        if ofs == 0 {
            return b"";
        }
        let idx = self.entry_at(ofs);
        if !self.entry_is_indirect(idx) {
            return self.entry_direct_value(idx);
        }
        self.resolve_indirect(idx)
    }

    pub fn has_value(&self, handle: NvHandle) -> bool {
        self.find_entry(handle).0 != 0
    }

    fn resolve_indirect(&self, idx: usize) -> &[u8] {
        let ref_handle = self.entry_ref_handle(idx);
        let slice_ofs = self.entry_ref_ofs(idx) as usize;
        let slice_len = self.entry_ref_len(idx) as usize;

        let (ref_ofs, _) = self.find_entry(ref_handle);
        if ref_ofs == 0 {
            return b"";
        }
        let ref_idx = self.entry_at(ref_ofs);
        if self.entry_is_indirect(ref_idx) {
            // only single indirection is supported
            return b"";
        }
        let referenced = self.entry_direct_value(ref_idx);
        if slice_ofs > referenced.len() {
            return b"";
        }
        let end = (slice_ofs + slice_len).min(referenced.len());
        &referenced[slice_ofs..end]
    }

    /// Allocate `size` bytes for a new entry at the downward pointer and
    /// return its offset in units. The header bytes are zeroed.
    fn alloc_entry(&mut self, size: usize) -> Option<u16> {
        let size = bound(size);
        if self.payload_bottom() < self.ofs_table_top() + size {
            return None;
        }
        self.used += (size >> SCALE) as u16;
        let ofs = self.used;
        let idx = self.entry_at(ofs);
        self.buf[idx..idx + size].fill(0);
        self.buf[idx + 2..idx + 4].copy_from_slice(&(((size >> SCALE) as u16).to_le_bytes()));
        Some(ofs)
    }

    /// Make sure a dynamic handle has a slot reserved in the sorted slot
    /// array; the offset is left zero until the entry is written.
    fn reserve_table_slot(&mut self, handle: NvHandle) -> Result<Option<usize>, NvTableFull> {
        if handle as usize <= self.num_static as usize {
            return Ok(None);
        }
        let (_, existing) = self.find_entry(handle);
        if let Some(slot_index) = existing {
            return Ok(Some(slot_index));
        }

        if self.free_space() < 4 {
            return Err(NvTableFull);
        }

        // find the sorted insert position
        let mut insert_at = self.num_dyn as usize;
        for i in 0..self.num_dyn as usize {
            if dyn_slot_handle(self.dyn_slot(i)) > handle {
                insert_at = i;
                break;
            }
        }

        let start = self.num_static as usize * 2 + insert_at * 4;
        let end = self.num_static as usize * 2 + self.num_dyn as usize * 4;
        self.buf.copy_within(start..end, start + 4);
        self.num_dyn += 1;
        self.set_dyn_slot(insert_at, (handle as u32) << 16);
        Ok(Some(insert_at))
    }

    fn set_table_entry(&mut self, handle: NvHandle, ofs: u16, slot_index: Option<usize>) {
        if handle as usize <= self.num_static as usize {
            self.set_static_ofs(handle as usize - 1, ofs);
        } else {
            let slot_index = slot_index.expect("dynamic handle without a reserved slot");
            self.set_dyn_slot(slot_index, ((handle as u32) << 16) | ofs as u32);
        }
    }

    /// Convert every indirect entry referencing `ref_handle` into its own
    /// direct copy. Required before the referenced value may be overwritten
    /// in place.
    fn make_referencing_entries_direct(&mut self, ref_handle: NvHandle) -> Result<(), NvTableFull> {
        let mut conversions: Vec<(NvHandle, Vec<u8>, Vec<u8>)> = Vec::new();
        self.for_each_entry(|handle, idx, table| {
            if table.entry_is_indirect(idx) && table.entry_ref_handle(idx) == ref_handle {
                let name = table.entry_name(idx).to_vec();
                let value = table.resolve_indirect(idx).to_vec();
                conversions.push((handle, name, value));
            }
            false
        });
        for (handle, name, value) in conversions {
            self.add_value_internal(handle, &name, &value, false)?;
        }
        Ok(())
    }

    /// Store a direct value. Returns whether a brand new entry was created.
    pub fn add_value(
        &mut self,
        handle: NvHandle,
        name: &[u8],
        value: &[u8],
    ) -> Result<bool, NvTableFull> {
        self.add_value_internal(handle, name, value, true)
    }

    fn add_value_internal(
        &mut self,
        handle: NvHandle,
        name: &[u8],
        value: &[u8],
        track_new: bool,
    ) -> Result<bool, NvTableFull> {
        let value = &value[..value.len().min(NV_VALUE_MAX)];
        let (ofs, slot_index) = self.find_entry(handle);

        if ofs == 0 && !track_new && value.is_empty() {
            // zero length values are not worth a slot unless the caller
            // needs to know whether the entry existed before
            return Ok(false);
        }

        if ofs != 0 {
            let idx = self.entry_at(ofs);
            if !self.entry_is_indirect(idx) && self.entry_is_referenced(idx) {
                self.make_referencing_entries_direct(handle)?;
            }
        }

        // the conversion above never moves this entry, only adds others
        let stored_name_len = if handle as usize <= self.num_static as usize {
            0
        } else {
            name.len()
        };

        if ofs != 0 {
            let idx = self.entry_at(ofs);
            let alloc = self.entry_alloc_len(idx) << SCALE;
            if alloc >= NV_ENTRY_DIRECT_HDR + stored_name_len + value.len() + 2 {
                let was_indirect = self.entry_is_indirect(idx);
                self.buf[idx] &= !FLAG_INDIRECT;
                self.buf[idx + 4..idx + 8].copy_from_slice(&(value.len() as u32).to_le_bytes());
                if was_indirect {
                    self.buf[idx + 1] = stored_name_len as u8;
                    let at = idx + NV_ENTRY_DIRECT_HDR;
                    self.buf[at..at + stored_name_len].copy_from_slice(&name[..stored_name_len]);
                    self.buf[at + stored_name_len] = 0;
                }
                let name_len = self.entry_name_len(idx);
                let at = idx + NV_ENTRY_DIRECT_HDR + name_len + 1;
                self.buf[at..at + value.len()].copy_from_slice(value);
                self.buf[at + value.len()] = 0;
                return Ok(false);
            }
        }

        let new_entry = ofs == 0;
        let slot_index = match self.reserve_table_slot(handle) {
            Ok(slot) => slot.or(slot_index),
            Err(full) => return Err(full),
        };
        let entry_ofs = self
            .alloc_entry(NV_ENTRY_DIRECT_HDR + stored_name_len + value.len() + 2)
            .ok_or(NvTableFull)?;

        let idx = self.entry_at(entry_ofs);
        self.buf[idx] = 0;
        self.buf[idx + 1] = stored_name_len as u8;
        self.buf[idx + 4..idx + 8].copy_from_slice(&(value.len() as u32).to_le_bytes());
        let at = idx + NV_ENTRY_DIRECT_HDR;
        self.buf[at..at + stored_name_len].copy_from_slice(&name[..stored_name_len]);
        self.buf[at + stored_name_len] = 0;
        let at = at + stored_name_len + 1;
        self.buf[at..at + value.len()].copy_from_slice(value);
        self.buf[at + value.len()] = 0;

        self.set_table_entry(handle, entry_ofs, slot_index);
        Ok(new_entry)
    }

    /// Store a reference to a slice of another value instead of copying it.
    /// When the referenced entry is itself indirect, the call degrades to a
    /// direct copy of the resolved slice.
    pub fn add_value_indirect(
        &mut self,
        handle: NvHandle,
        name: &[u8],
        ref_handle: NvHandle,
        ref_type: u8,
        slice_ofs: u16,
        slice_len: u16,
    ) -> Result<bool, NvTableFull> {
        let (ref_ofs, _) = self.find_entry(ref_handle);
        if ref_ofs == 0 {
            return self.add_value_internal(handle, name, b"", true);
        }
        let ref_idx = self.entry_at(ref_ofs);
        if self.entry_is_indirect(ref_idx) {
            let resolved = self.resolve_indirect(ref_idx);
            let start = (slice_ofs as usize).min(resolved.len());
            let end = (slice_ofs as usize + slice_len as usize).min(resolved.len());
            let copy = resolved[start..end].to_vec();
            return self.add_value_internal(handle, name, &copy, true);
        }

        let (ofs, slot_index) = self.find_entry(handle);
        if ofs != 0 {
            let idx = self.entry_at(ofs);
            if !self.entry_is_indirect(idx) && self.entry_is_referenced(idx) {
                self.make_referencing_entries_direct(handle)?;
            }
        }

        let stored_name_len = if handle as usize <= self.num_static as usize {
            0
        } else {
            name.len()
        };

        if ofs != 0 {
            let idx = self.entry_at(ofs);
            let alloc = self.entry_alloc_len(idx) << SCALE;
            if alloc >= NV_ENTRY_INDIRECT_HDR + stored_name_len + 1 {
                let was_direct = !self.entry_is_indirect(idx);
                self.buf[idx] |= FLAG_INDIRECT;
                self.write_indirect_fields(idx, ref_handle, ref_type, slice_ofs, slice_len);
                if was_direct {
                    self.buf[idx + 1] = stored_name_len as u8;
                    let at = idx + NV_ENTRY_INDIRECT_HDR;
                    self.buf[at..at + stored_name_len].copy_from_slice(&name[..stored_name_len]);
                    self.buf[at + stored_name_len] = 0;
                }
                let ref_idx = self.entry_at(self.find_entry(ref_handle).0);
                self.buf[ref_idx] |= FLAG_REFERENCED;
                return Ok(false);
            }
        }

        let new_entry = ofs == 0;
        let slot_index = match self.reserve_table_slot(handle) {
            Ok(slot) => slot.or(slot_index),
            Err(full) => return Err(full),
        };
        let entry_ofs = self
            .alloc_entry(NV_ENTRY_INDIRECT_HDR + stored_name_len + 1)
            .ok_or(NvTableFull)?;

        let idx = self.entry_at(entry_ofs);
        self.buf[idx] = FLAG_INDIRECT;
        self.buf[idx + 1] = stored_name_len as u8;
        self.write_indirect_fields(idx, ref_handle, ref_type, slice_ofs, slice_len);
        let at = idx + NV_ENTRY_INDIRECT_HDR;
        self.buf[at..at + stored_name_len].copy_from_slice(&name[..stored_name_len]);
        self.buf[at + stored_name_len] = 0;

        let ref_idx = self.entry_at(self.find_entry(ref_handle).0);
        self.buf[ref_idx] |= FLAG_REFERENCED;

        self.set_table_entry(handle, entry_ofs, slot_index);
        Ok(new_entry)
    }

    fn write_indirect_fields(
        &mut self,
        idx: usize,
        ref_handle: NvHandle,
        ref_type: u8,
        slice_ofs: u16,
        slice_len: u16,
    ) {
        self.buf[idx + 4..idx + 6].copy_from_slice(&ref_handle.to_le_bytes());
        self.buf[idx + 6..idx + 8].copy_from_slice(&slice_ofs.to_le_bytes());
        self.buf[idx + 8..idx + 10].copy_from_slice(&slice_len.to_le_bytes());
        self.buf[idx + 10] = ref_type;
        self.buf[idx + 11] = 0;
    }

    /// Visit every stored entry, builtins first in handle order, then
    /// dynamic handles in handle order. The visitor returns true to stop.
    fn for_each_entry<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(NvHandle, usize, &NvTable) -> bool,
    {
        for i in 0..self.num_static as usize {
            let ofs = self.static_ofs(i);
            if ofs == 0 {
                continue;
            }
            if visit((i + 1) as NvHandle, self.entry_at(ofs), self) {
                return true;
            }
        }
        for i in 0..self.num_dyn as usize {
            let slot = self.dyn_slot(i);
            let ofs = dyn_slot_ofs(slot);
            if ofs == 0 {
                continue;
            }
            if visit(dyn_slot_handle(slot), self.entry_at(ofs), self) {
                return true;
            }
        }
        false
    }

    /// Visit every value with its resolved name and contents.
    pub fn for_each<F>(&self, registry: &NvRegistry, mut visit: F) -> bool
    where
        F: FnMut(NvHandle, &str, &[u8]) -> bool,
    {
        self.for_each_entry(|handle, idx, table| {
            let value = if table.entry_is_indirect(idx) {
                table.resolve_indirect(idx)
            } else {
                table.entry_direct_value(idx)
            };
            let name = registry.get_handle_name(handle);
            visit(handle, &name, value)
        })
    }

    /// Clone the table, growing it when `additional_space` would not fit in
    /// the current free area.
    pub fn clone_with_space(&self, additional_space: usize) -> NvTable {
        let mut new_len = self.buf.len();
        if self.free_space() < additional_space {
            new_len = bound(self.buf.len() + additional_space - self.free_space());
        }
        if new_len > MAX_TABLE_BYTES {
            new_len = MAX_TABLE_BYTES;
        }
        let mut new = NvTable {
            buf: vec![0; new_len],
            used: self.used,
            num_dyn: self.num_dyn,
            num_static: self.num_static,
        };
        let head = self.ofs_table_top();
        new.buf[..head].copy_from_slice(&self.buf[..head]);
        let used_bytes = self.used as usize * 4;
        let src = self.buf.len() - used_bytes;
        let dst = new.buf.len() - used_bytes;
        new.buf[dst..].copy_from_slice(&self.buf[src..]);
        new
    }

    /// Double the arena, up to the 16-bit offset addressing limit.
    pub fn realloc(&mut self) -> Result<(), NvTableFull> {
        if self.buf.len() >= MAX_TABLE_BYTES {
            return Err(NvTableFull);
        }
        let new_len = (self.buf.len() * 2).min(MAX_TABLE_BYTES);
        let mut new_buf = vec![0; new_len];
        let head = self.ofs_table_top();
        new_buf[..head].copy_from_slice(&self.buf[..head]);
        let used_bytes = self.used as usize * 4;
        let src = self.buf.len() - used_bytes;
        let dst = new_len - used_bytes;
        new_buf[dst..].copy_from_slice(&self.buf[src..]);
        self.buf = new_buf;
        Ok(())
    }

    /// Remap the dynamic handles stored in the table into the current
    /// process registry after deserialization. Names travel with the
    /// entries, so each dynamic slot is resolved by name and indirect
    /// references are rewritten through the same mapping. Returns the
    /// `(stored, current)` handle pairs so callers can remap their own
    /// indices.
    pub fn update_ids(&mut self, registry: &NvRegistry) -> Vec<(NvHandle, NvHandle)> {
        if self.num_dyn == 0 {
            return Vec::new();
        }

        let mut mapping: Vec<(NvHandle, NvHandle)> = Vec::with_capacity(self.num_dyn as usize);
        let mut slots: Vec<(NvHandle, u16)> = Vec::with_capacity(self.num_dyn as usize);

        for i in 0..self.num_dyn as usize {
            let slot = self.dyn_slot(i);
            let old_handle = dyn_slot_handle(slot);
            let ofs = dyn_slot_ofs(slot);
            let new_handle = if ofs != 0 {
                let idx = self.entry_at(ofs);
                let name = self.entry_name(idx).to_vec();
                match std::str::from_utf8(&name) {
                    Ok(name) => registry.alloc_handle(name),
                    Err(_) => NV_HANDLE_NONE,
                }
            } else {
                old_handle
            };
            mapping.push((old_handle, new_handle));
            slots.push((new_handle, ofs));
        }

        slots.sort_by_key(|(handle, _)| *handle);
        for (i, (handle, ofs)) in slots.iter().enumerate() {
            self.set_dyn_slot(i, ((*handle as u32) << 16) | *ofs as u32);
        }

        // rewrite indirect references through the old -> new mapping
        let mut fixups: Vec<(usize, NvHandle)> = Vec::new();
        self.for_each_entry(|_, idx, table| {
            if table.entry_is_indirect(idx) {
                let old_ref = table.entry_ref_handle(idx);
                if old_ref as usize > table.num_static as usize {
                    if let Some((_, new_ref)) = mapping.iter().find(|(old, _)| *old == old_ref) {
                        fixups.push((idx, *new_ref));
                    }
                }
            }
            false
        });
        for (idx, new_ref) in fixups {
            self.buf[idx + 4..idx + 6].copy_from_slice(&new_ref.to_le_bytes());
        }
        mapping
    }

    pub fn serialize<W: Write>(&self, archive: &mut ArchiveWriter<W>) -> CoreResult<()> {
        archive.write_u8(0)?; // little-endian entry encoding
        archive.write_u8(self.num_static)?;
        archive.write_u16(self.num_dyn)?;
        archive.write_u16((self.buf.len() >> SCALE) as u16)?;
        archive.write_u16(self.used)?;
        for i in 0..self.num_static as usize {
            archive.write_u16(self.static_ofs(i))?;
        }
        for i in 0..self.num_dyn as usize {
            archive.write_u32(self.dyn_slot(i))?;
        }
        let used_bytes = self.used as usize * 4;
        archive.write_blob(&self.buf[self.buf.len() - used_bytes..])?;
        Ok(())
    }

    pub fn deserialize<R: Read>(archive: &mut ArchiveReader<R>) -> CoreResult<NvTable> {
        let big_endian = archive.read_u8()? != 0;
        let num_static = archive.read_u8()?;
        let num_dyn = archive.read_u16()?;
        let size_units = archive.read_u16()?;
        let used = archive.read_u16()?;

        let size = (size_units as usize) << SCALE;
        if used > size_units {
            return Err(CoreError::Malformed("implausible table geometry"));
        }
        let head = num_static as usize * 2 + num_dyn as usize * 4;
        let used_bytes = used as usize * 4;
        if head + used_bytes > size {
            return Err(CoreError::Malformed("offset tables overlap the payload"));
        }

        // the smallest real entry is 12 bytes; anything tighter would let
        // the byte-order fixup read outside the arena
        let offset_plausible = |ofs: u16| {
            ofs == 0 || ((ofs as usize) * 4 >= 12 && (ofs as usize) * 4 <= used_bytes)
        };

        let mut table = NvTable {
            buf: vec![0; size],
            used,
            num_dyn,
            num_static,
        };
        for i in 0..num_static as usize {
            let ofs = archive.read_u16()?;
            if !offset_plausible(ofs) {
                return Err(CoreError::Malformed("entry offset outside the arena"));
            }
            table.set_static_ofs(i, ofs);
        }
        for i in 0..num_dyn as usize {
            let slot = archive.read_u32()?;
            if !offset_plausible(dyn_slot_ofs(slot)) {
                return Err(CoreError::Malformed("entry offset outside the arena"));
            }
            table.set_dyn_slot(i, slot);
        }
        let at = size - used_bytes;
        archive.read_blob(&mut table.buf[at..])?;

        if big_endian {
            table.swap_byte_order();
        }
        table.verify()?;
        Ok(table)
    }

    /// Byte-swap every multi-byte entry field of a table stored with the
    /// opposite byte order. The offset arrays were transported by the
    /// archive and are already native.
    fn swap_byte_order(&mut self) {
        let mut entries: Vec<usize> = Vec::new();
        self.for_each_entry(|_, idx, _| {
            entries.push(idx);
            false
        });
        for idx in entries {
            let alloc = u16::from_be_bytes([self.buf[idx + 2], self.buf[idx + 3]]);
            self.buf[idx + 2..idx + 4].copy_from_slice(&alloc.to_le_bytes());
            if self.entry_is_indirect(idx) {
                for field in 0..3 {
                    let at = idx + 4 + field * 2;
                    let v = u16::from_be_bytes([self.buf[at], self.buf[at + 1]]);
                    self.buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
                }
            } else {
                let v = u32::from_be_bytes([
                    self.buf[idx + 4],
                    self.buf[idx + 5],
                    self.buf[idx + 6],
                    self.buf[idx + 7],
                ]);
                self.buf[idx + 4..idx + 8].copy_from_slice(&v.to_le_bytes());
            }
        }
    }

    /// Walk every offset and entry and reject anything that points outside
    /// the arena; a deserialized table must never panic later.
    fn verify(&self) -> CoreResult<()> {
        let used_bottom = self.payload_bottom();
        let mut ok = true;
        let mut check = |ofs: u16, table: &NvTable| {
            if ofs == 0 {
                return;
            }
            let idx_start = table.buf.len() as i64 - (ofs as i64) * 4;
            if idx_start < used_bottom as i64 {
                ok = false;
                return;
            }
            let idx = idx_start as usize;
            let alloc = table.entry_alloc_len(idx) << SCALE;
            let hdr = if table.entry_is_indirect(idx) {
                NV_ENTRY_INDIRECT_HDR
            } else {
                NV_ENTRY_DIRECT_HDR
            };
            if alloc < hdr || idx + alloc > table.buf.len() {
                ok = false;
                return;
            }
            let name_len = table.entry_name_len(idx);
            if table.entry_is_indirect(idx) {
                if hdr + name_len + 1 > alloc {
                    ok = false;
                }
            } else if hdr + name_len + table.entry_value_len(idx) + 2 > alloc {
                ok = false;
            }
        };
        for i in 0..self.num_static as usize {
            check(self.static_ofs(i), self);
        }
        let mut prev_handle = 0u16;
        for i in 0..self.num_dyn as usize {
            let slot = self.dyn_slot(i);
            if dyn_slot_handle(slot) < prev_handle {
                return Err(CoreError::Malformed("dynamic handle array is not sorted"));
            }
            prev_handle = dyn_slot_handle(slot);
            check(dyn_slot_ofs(slot), self);
        }
        if ok {
            Ok(())
        } else {
            Err(CoreError::Malformed("entry offset outside the arena"))
        }
    }

    /// Indirect slice metadata for an entry, when it is indirect.
    pub fn get_indirect_info(&self, handle: NvHandle) -> Option<(NvHandle, u8, u16, u16)> {
        let (ofs, _) = self.find_entry(handle);
        if ofs == 0 {
            return None;
        }
        let idx = self.entry_at(ofs);
        if !self.entry_is_indirect(idx) {
            return None;
        }
        Some((
            self.entry_ref_handle(idx),
            self.entry_ref_type(idx),
            self.entry_ref_ofs(idx),
            self.entry_ref_len(idx),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUM_STATIC: u8 = 8;

    #[test]
    fn missing_values_resolve_to_empty() {
        let table = NvTable::new(NUM_STATIC);
        assert_eq!(table.get_value(1), b"");
        assert_eq!(table.get_value(1000), b"");
        assert_eq!(table.get_value(NV_HANDLE_NONE), b"");
    }

    #[test]
    fn builtin_store_and_overwrite_in_place() {
        let mut table = NvTable::new(NUM_STATIC);
        assert!(table.add_value(3, b"MESSAGE", b"hello").unwrap());
        assert_eq!(table.get_value(3), b"hello");

        let used = table.used_bytes();
        assert!(!table.add_value(3, b"MESSAGE", b"hi").unwrap());
        assert_eq!(table.get_value(3), b"hi");
        assert_eq!(table.used_bytes(), used);
    }

    #[test]
    fn dynamic_handles_stay_sorted() {
        let mut table = NvTable::new(NUM_STATIC);
        for handle in [40u16, 20, 30, 10, 25] {
            table
                .add_value(handle, format!("name{handle}").as_bytes(), b"v")
                .unwrap();
        }
        let mut prev = 0;
        for i in 0..table.num_dyn_entries() as usize {
            let slot = table.dyn_slot(i);
            assert!(dyn_slot_handle(slot) > prev);
            prev = dyn_slot_handle(slot);
        }
        assert_eq!(table.get_value(25), b"v");
    }

    #[test]
    fn indirect_resolves_and_clips() {
        let mut table = NvTable::new(NUM_STATIC);
        table.add_value(3, b"MESSAGE", b"error: disk on fire").unwrap();
        table
            .add_value_indirect(100, b"match1", 3, 0, 7, 4)
            .unwrap();
        assert_eq!(table.get_value(100), b"disk");

        // clipped against the referenced value
        table
            .add_value_indirect(101, b"match2", 3, 0, 15, 100)
            .unwrap();
        assert_eq!(table.get_value(101), b"fire");

        // offset past the end resolves to empty
        table
            .add_value_indirect(102, b"match3", 3, 0, 200, 5)
            .unwrap();
        assert_eq!(table.get_value(102), b"");
    }

    #[test]
    fn overwriting_a_referenced_value_preserves_indirect_contents() {
        let mut table = NvTable::new(NUM_STATIC);
        table.add_value(3, b"MESSAGE", b"hello world").unwrap();
        table
            .add_value_indirect(100, b"match1", 3, 0, 6, 5)
            .unwrap();
        assert_eq!(table.get_value(100), b"world");

        table.add_value(3, b"MESSAGE", b"rewritten").unwrap();
        assert_eq!(table.get_value(3), b"rewritten");
        assert_eq!(table.get_value(100), b"world");
    }

    #[test]
    fn indirect_of_indirect_degrades_to_direct() {
        let mut table = NvTable::new(NUM_STATIC);
        table.add_value(3, b"MESSAGE", b"abcdefgh").unwrap();
        table
            .add_value_indirect(100, b"first", 3, 0, 2, 4)
            .unwrap();
        table
            .add_value_indirect(101, b"second", 100, 0, 1, 2)
            .unwrap();
        assert_eq!(table.get_value(101), b"de");
        assert!(table.get_indirect_info(101).is_none());
    }

    #[test]
    fn value_is_truncated_at_the_cap() {
        let mut table = NvTable::with_capacity(NUM_STATIC, 4, MAX_TABLE_BYTES);
        let oversized = vec![b'a'; NV_VALUE_MAX + 1];
        table.add_value(3, b"MESSAGE", &oversized).unwrap();
        assert_eq!(table.get_value(3).len(), NV_VALUE_MAX);
    }

    #[test]
    fn full_table_reports_and_realloc_recovers() {
        let mut table = NvTable::with_capacity(NUM_STATIC, 4, 4096);
        let big = vec![b'x'; 1024];
        let mut stored = 0u16;
        loop {
            match table.add_value(100 + stored, b"somename", &big) {
                Ok(_) => stored += 1,
                Err(NvTableFull) => break,
            }
        }
        assert!(stored > 0);

        while table.add_value(100 + stored, b"somename", &big).is_err() {
            table.realloc().unwrap();
        }
        assert_eq!(table.get_value(100 + stored), &big[..]);
        for i in 0..stored {
            assert_eq!(table.get_value(100 + i), &big[..]);
        }
    }

    #[test]
    fn clone_leaves_source_untouched() {
        let mut table = NvTable::new(NUM_STATIC);
        table.add_value(3, b"MESSAGE", b"original").unwrap();
        let snapshot = table.buf.clone();

        let mut cloned = table.clone_with_space(0);
        cloned.add_value(3, b"MESSAGE", b"changed-to-something-longer").unwrap();

        assert_eq!(table.buf, snapshot);
        assert_eq!(table.get_value(3), b"original");
        assert_eq!(cloned.get_value(3), b"changed-to-something-longer");
    }

    #[test]
    fn foreach_orders_builtins_then_dynamics() {
        let mut table = NvTable::new(NUM_STATIC);
        let registry = NvRegistry::new(&[
            "HOST",
            "HOST_FROM",
            "MESSAGE",
            "PROGRAM",
            "PID",
            "MSGID",
            "SOURCE",
            "LEGACY_MSGHDR",
        ]);
        let dyn1 = registry.alloc_handle("dyn.one");
        let dyn2 = registry.alloc_handle("dyn.two");
        table.add_value(dyn2, b"dyn.two", b"2").unwrap();
        table.add_value(3, b"MESSAGE", b"msg").unwrap();
        table.add_value(dyn1, b"dyn.one", b"1").unwrap();

        let mut seen = Vec::new();
        table.for_each(&registry, |handle, _, _| {
            seen.push(handle);
            false
        });
        assert_eq!(seen, vec![3, dyn1, dyn2]);
    }
}

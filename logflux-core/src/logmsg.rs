//! The log message entity.
//!
//! A message owns its timestamps, priority, tag bitmap, structured-data
//! index and name-value payload. Messages are passed between threads inside
//! an `Arc`; the combined ACK|REF protocol counter (see `refcache`) decides
//! when the ack callback runs, while memory itself unwinds with the last
//! `Arc`. Mutation goes through `&mut self`: a shared message must first be
//! made writable, which clones copy-on-write.

use crate::addr::SenderAddr;
use crate::error::{CoreError, CoreResult};
use crate::nvtable::NvTable;
use crate::refcache;
use crate::registry::{NvHandle, NvRegistry, NVF_MACRO, NVF_MATCH, NVF_SDATA, NV_HANDLE_NONE};
use crate::serialize::{ArchiveReader, ArchiveWriter};
use crate::stamp::{Stamp, TS_MAX, TS_RECVD, TS_STAMP};
use crate::tags::{self, TagId, Tags};
use smallvec::SmallVec;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Builtin value handles; these match the registry's allocation order.
pub mod builtin {
    use crate::registry::NvHandle;

    pub const HOST: NvHandle = 1;
    pub const HOST_FROM: NvHandle = 2;
    pub const MESSAGE: NvHandle = 3;
    pub const PROGRAM: NvHandle = 4;
    pub const PID: NvHandle = 5;
    pub const MSGID: NvHandle = 6;
    pub const SOURCE: NvHandle = 7;
    pub const LEGACY_MSGHDR: NvHandle = 8;

    /// Number of builtin handles, which is also the static entry count of
    /// every message payload table.
    pub const MAX: NvHandle = 8;
}

const BUILTIN_NAMES: [&str; 8] = [
    "HOST",
    "HOST_FROM",
    "MESSAGE",
    "PROGRAM",
    "PID",
    "MSGID",
    "SOURCE",
    "LEGACY_MSGHDR",
];

pub mod flags {
    /// Message payload is known to be valid UTF-8.
    pub const UTF8: u32 = 0x0001;
    /// Message was generated inside the daemon.
    pub const INTERNAL: u32 = 0x0002;
    /// Message was received on a local transport.
    pub const LOCAL: u32 = 0x0004;
    /// Periodic MARK message.
    pub const MARK: u32 = 0x0008;

    pub const STATE_OWN_PAYLOAD: u32 = 0x0010;
    pub const STATE_OWN_SADDR: u32 = 0x0020;
    pub const STATE_OWN_TAGS: u32 = 0x0040;
    pub const STATE_OWN_SDATA: u32 = 0x0080;
    pub const STATE_REFERENCED: u32 = 0x0100;

    pub const STATE_OWN_MASK: u32 = 0x00F0;
    /// Runtime-only bits, masked out of the serialized form.
    pub const STATE_MASK: u32 = 0xFFF0;

    pub const CHAINED_HOSTNAME: u32 = 0x0001_0000;
    /// The RFC3164 header was saved intact in $LEGACY_MSGHDR.
    pub const LEGACY_MSGHDR: u32 = 0x0002_0000;
}

pub const RE_MAX_MATCHES: usize = 256;

pub const SD_PREFIX: &str = ".SDATA.";

const SD_ELEMENTS_MAX: usize = 255;

/// Current serialization version.
const SERIALIZE_VERSION: u8 = 23;

struct GlobalRegistry {
    nv: NvRegistry,
    match_handles: [NvHandle; RE_MAX_MATCHES],
}

fn globals() -> &'static GlobalRegistry {
    static GLOBALS: OnceLock<GlobalRegistry> = OnceLock::new();
    GLOBALS.get_or_init(|| {
        let nv = NvRegistry::new(&BUILTIN_NAMES);
        nv.add_alias(builtin::MESSAGE, "MSG");
        nv.add_alias(builtin::MESSAGE, "MSGONLY");
        nv.add_alias(builtin::HOST, "FULLHOST");
        nv.add_alias(builtin::HOST_FROM, "FULLHOST_FROM");

        let mut match_handles = [NV_HANDLE_NONE; RE_MAX_MATCHES];
        for (i, slot) in match_handles.iter_mut().enumerate() {
            let handle = nv.alloc_handle(&i.to_string());
            nv.set_handle_flags(handle, NVF_MATCH);
            *slot = handle;
        }
        GlobalRegistry { nv, match_handles }
    })
}

/// The process-wide message value registry.
pub fn registry() -> &'static NvRegistry {
    &globals().nv
}

/// Look up or allocate the handle for a value name. Names under the
/// `.SDATA.` prefix are flagged as structured-data parameters.
pub fn get_value_handle(name: &str) -> NvHandle {
    let registry = registry();
    let handle = registry.alloc_handle(name);
    if name.len() > SD_PREFIX.len() && name.starts_with(SD_PREFIX) {
        let flags = registry.get_handle_flags(handle);
        if flags & NVF_SDATA == 0 {
            registry.set_handle_flags(handle, flags | NVF_SDATA);
        }
    }
    handle
}

pub fn get_value_name(handle: NvHandle) -> String {
    registry().get_handle_name(handle)
}

pub fn is_handle_sdata(handle: NvHandle) -> bool {
    registry().get_handle_flags(handle) & NVF_SDATA != 0
}

pub fn is_handle_macro(handle: NvHandle) -> bool {
    registry().get_handle_flags(handle) & NVF_MACRO != 0
}

pub fn is_handle_match(handle: NvHandle) -> bool {
    let match_handles = &globals().match_handles;
    match_handles[0] <= handle && handle <= match_handles[RE_MAX_MATCHES - 1]
}

pub fn match_handle(index: usize) -> NvHandle {
    globals().match_handles[index]
}

/// Per-path delivery options carried along with a message through a pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathOptions {
    /// The destination participates in flow control and will ack.
    pub ack_needed: bool,
    pub flow_control_requested: bool,
}

impl PathOptions {
    pub const fn new() -> Self {
        PathOptions {
            ack_needed: false,
            flow_control_requested: false,
        }
    }

    pub const fn flow_controlled() -> Self {
        PathOptions {
            ack_needed: true,
            flow_control_requested: true,
        }
    }
}

pub enum AckHandler {
    None,
    /// Installed on clones: acking the clone acks the original.
    ForwardToOriginal,
    Custom(Box<dyn Fn(&LogMessage) + Send + Sync>),
}

/// Parser seam; the real format modules live outside the core.
pub trait MsgFormat: Send + Sync {
    fn parse(&self, options: &MsgFormatOptions, data: &[u8], msg: &mut LogMessage);
}

#[derive(Default, Clone)]
pub struct MsgFormatOptions {
    pub format: Option<Arc<dyn MsgFormat>>,
}

pub struct LogMessage {
    /// ACK count in the upper 16 bits, REF count in the lower 16.
    ack_and_ref: AtomicU32,
    ack_handler: AckHandler,
    original: Option<Arc<LogMessage>>,

    pub timestamps: [Stamp; TS_MAX],
    tags: Tags,
    sdata: SmallVec<[NvHandle; 8]>,
    saddr: Option<SenderAddr>,
    payload: Arc<NvTable>,

    flags: u32,
    pub pri: u16,
    pub rcptid: u64,
    pub initial_parse: bool,
    num_matches: u8,
}

const REF_MASK: u32 = 0x0000_FFFF;
const ACK_SHIFT: u32 = 16;

pub(crate) fn ref_of(value: u32) -> u32 {
    value & REF_MASK
}

pub(crate) fn ack_of(value: u32) -> u32 {
    value >> ACK_SHIFT
}

fn pack(ack: u32, refs: u32) -> u32 {
    (ack << ACK_SHIFT) | (refs & REF_MASK)
}

impl LogMessage {
    fn alloc(payload_hint: usize) -> LogMessage {
        let mut msg = LogMessage {
            ack_and_ref: AtomicU32::new(pack(0, 1)),
            ack_handler: AckHandler::None,
            original: None,
            timestamps: [Stamp::UNSET; TS_MAX],
            tags: Tags::new(),
            sdata: SmallVec::new(),
            saddr: None,
            payload: Arc::new(NvTable::with_capacity(builtin::MAX as u8, 16, payload_hint)),
            flags: flags::STATE_OWN_MASK,
            pri: 0,
            rcptid: 0,
            initial_parse: false,
            num_matches: 0,
        };
        msg.timestamps[TS_RECVD] = Stamp::now();
        msg
    }

    pub fn new_empty() -> LogMessage {
        Self::alloc(256)
    }

    /// Allocate and parse a new message. Without a format handler the raw
    /// bytes land in MESSAGE untouched.
    pub fn new(raw: &[u8], saddr: Option<SenderAddr>, options: &MsgFormatOptions) -> LogMessage {
        let hint = if raw.is_empty() { 256 } else { raw.len() * 2 };
        let mut msg = Self::alloc(hint);
        msg.saddr = saddr;
        match &options.format {
            Some(format) => format.parse(options, raw, &mut msg),
            None => {
                tracing::error!("no message format handler, storing the raw message");
                msg.set_value(builtin::MESSAGE, raw);
            }
        }
        msg
    }

    pub fn new_internal(pri: u16, text: &str) -> LogMessage {
        let mut msg = Self::new_empty();
        msg.set_value(builtin::PROGRAM, b"logflux");
        msg.set_value(builtin::PID, std::process::id().to_string().as_bytes());
        msg.set_value(builtin::MESSAGE, text.as_bytes());
        msg.pri = pri;
        msg.flags |= flags::INTERNAL | flags::LOCAL;
        msg
    }

    pub fn new_mark() -> LogMessage {
        let mut msg = Self::new_empty();
        msg.set_value(builtin::MESSAGE, b"-- MARK --");
        msg.pri = (5 << 3) | 6; // syslog facility, info severity
        msg.flags |= flags::LOCAL | flags::MARK | flags::INTERNAL;
        msg
    }

    /// Reset the message to the freshly-allocated state, reusing the
    /// payload allocation when it is ours.
    pub fn clear(&mut self) {
        if self.flags & flags::STATE_OWN_PAYLOAD != 0 {
            if let Some(table) = Arc::get_mut(&mut self.payload) {
                table.clear();
            } else {
                self.payload = Arc::new(NvTable::new(builtin::MAX as u8));
            }
        } else {
            self.payload = Arc::new(NvTable::new(builtin::MAX as u8));
        }
        self.tags.clear_all();
        self.num_matches = 0;
        self.sdata.clear();
        self.saddr = None;
        if let Some(original) = self.original.take() {
            original.release();
        }
        self.flags |= flags::STATE_OWN_MASK;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn saddr(&self) -> Option<&SenderAddr> {
        self.saddr.as_ref()
    }

    pub fn set_saddr(&mut self, saddr: Option<SenderAddr>) {
        self.saddr = saddr;
    }

    pub fn num_matches(&self) -> u8 {
        self.num_matches
    }

    pub fn sdata_handles(&self) -> &[NvHandle] {
        &self.sdata
    }

    /// Rough memory footprint for queue accounting.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<LogMessage>()
            + self.payload.size()
            + self.sdata.len() * std::mem::size_of::<NvHandle>()
            + match &self.tags {
                Tags::Inline(_) => 0,
                Tags::Spilled(words) => words.len() * 8,
            }
    }

    // --- values ---

    pub fn get_value(&self, handle: NvHandle) -> &[u8] {
        if registry().get_handle_flags(handle) & NVF_MACRO != 0 {
            // the template engine is outside the core
            return b"";
        }
        self.payload.get_value(handle)
    }

    pub fn get_value_by_name(&self, name: &str) -> &[u8] {
        self.get_value(get_value_handle(name))
    }

    fn make_payload_writable(&mut self, additional_space: usize) {
        if self.flags & flags::STATE_OWN_PAYLOAD == 0 {
            self.payload = Arc::new(self.payload.clone_with_space(additional_space));
            self.flags |= flags::STATE_OWN_PAYLOAD;
        }
    }

    pub fn set_value(&mut self, handle: NvHandle, value: &[u8]) {
        if handle == NV_HANDLE_NONE {
            return;
        }
        let name = get_value_name(handle);
        self.make_payload_writable(name.len() + value.len() + 2);

        let mut new_entry = false;
        loop {
            let table = Arc::make_mut(&mut self.payload);
            match table.add_value(handle, name.as_bytes(), value) {
                Ok(is_new) => {
                    new_entry = is_new;
                    break;
                }
                Err(_) => {
                    if table.realloc().is_err() {
                        tracing::info!(
                            name,
                            "cannot store value for this log message, maximum size has been reached"
                        );
                        break;
                    }
                }
            }
        }

        if new_entry {
            self.update_sdata(handle, &name);
        }
        if handle == builtin::PROGRAM {
            self.flags &= !flags::LEGACY_MSGHDR;
        }
    }

    pub fn set_value_indirect(
        &mut self,
        handle: NvHandle,
        ref_handle: NvHandle,
        ref_type: u8,
        ofs: u16,
        len: u16,
    ) {
        if handle == NV_HANDLE_NONE {
            return;
        }
        assert!(
            handle > builtin::MAX,
            "builtin values cannot be set indirectly"
        );
        let name = get_value_name(handle);
        self.make_payload_writable(name.len() + 1);

        let mut new_entry = false;
        loop {
            let table = Arc::make_mut(&mut self.payload);
            match table.add_value_indirect(handle, name.as_bytes(), ref_handle, ref_type, ofs, len)
            {
                Ok(is_new) => {
                    new_entry = is_new;
                    break;
                }
                Err(_) => {
                    if table.realloc().is_err() {
                        tracing::info!(
                            name,
                            "cannot store referenced value for this log message, maximum size has been reached"
                        );
                        break;
                    }
                }
            }
        }

        if new_entry {
            self.update_sdata(handle, &name);
        }
    }

    pub fn set_match(&mut self, index: usize, value: &[u8]) {
        assert!(index < RE_MAX_MATCHES);
        if index >= self.num_matches as usize {
            self.num_matches = index as u8 + 1;
        }
        self.set_value(match_handle(index), value);
    }

    pub fn set_match_indirect(
        &mut self,
        index: usize,
        ref_handle: NvHandle,
        ref_type: u8,
        ofs: u16,
        len: u16,
    ) {
        assert!(index < RE_MAX_MATCHES);
        if index >= self.num_matches as usize {
            self.num_matches = index as u8 + 1;
        }
        self.set_value_indirect(match_handle(index), ref_handle, ref_type, ofs, len);
    }

    pub fn get_match(&self, index: usize) -> &[u8] {
        self.get_value(match_handle(index))
    }

    pub fn clear_matches(&mut self) {
        for i in 0..self.num_matches as usize {
            self.set_value(match_handle(i), b"");
        }
        self.num_matches = 0;
    }

    // --- structured data index ---

    /// Keep the sdata handle array grouped by SD element: new parameters of
    /// an element already present are inserted next to it, everything else
    /// is appended.
    fn update_sdata(&mut self, handle: NvHandle, name: &str) {
        if registry().get_handle_flags(handle) & NVF_SDATA == 0 {
            return;
        }
        if self.sdata.len() == SD_ELEMENTS_MAX {
            tracing::error!("only 255 SD elements are supported per message");
            return;
        }

        let mut insert_at = None;
        if !self.initial_parse {
            if let Some(dot) = name.rfind('.') {
                let prefix = &name.as_bytes()[..dot];
                for i in (0..self.sdata.len()).rev() {
                    let existing = get_value_name(self.sdata[i]);
                    if existing.len() > prefix.len()
                        && &existing.as_bytes()[..prefix.len()] == prefix
                    {
                        insert_at = Some(i);
                        break;
                    }
                }
            }
        }

        match insert_at {
            Some(i) => self.sdata.insert(i, handle),
            None => self.sdata.push(handle),
        }
    }

    fn sdata_append_escaped(result: &mut String, value: &[u8]) {
        let mut escaped = Vec::with_capacity(value.len());
        for &byte in value {
            if byte == b'"' || byte == b'\\' || byte == b']' {
                escaped.push(b'\\');
            }
            escaped.push(byte);
        }
        result.push_str(&String::from_utf8_lossy(&escaped));
    }

    /// Emit the RFC 5424 bracketed structured-data form. When `seq_num` is
    /// non-zero and no `sequenceId` is stored, one is inserted into the
    /// `meta` block, or a synthetic `[meta sequenceId="…"]` is appended.
    pub fn append_format_sdata(&self, result: &mut String, seq_num: u32) {
        let registry = registry();
        let meta_seqid = get_value_handle(".SDATA.meta.sequenceId");
        let mut has_seq_num = !self.get_value(meta_seqid).is_empty();

        let mut cur_elem: Option<String> = None;
        for &handle in &self.sdata {
            let name = get_value_name(handle);
            let handle_flags = registry.get_handle_flags(handle);
            debug_assert!(handle_flags & NVF_SDATA != 0);
            debug_assert!(name.len() > SD_PREFIX.len() - 1);

            let elem_and_param = &name[SD_PREFIX.len()..];
            let sd_id_len = (handle_flags >> 8) as usize;

            let dot = if sd_id_len > 0 {
                if sd_id_len >= elem_and_param.len() {
                    // standalone element, no parameter part
                    None
                } else {
                    Some(sd_id_len)
                }
            } else {
                elem_and_param.rfind('.')
            };

            let (elem, param) = match dot {
                Some(d) => (&elem_and_param[..d], &elem_and_param[d + 1..]),
                None => {
                    let elem = if elem_and_param.is_empty() {
                        "none"
                    } else {
                        elem_and_param
                    };
                    (elem, "")
                }
            };

            if cur_elem.as_deref() != Some(elem) {
                if cur_elem.is_some() {
                    result.push(']');
                }
                result.push('[');
                result.push_str(elem);
                cur_elem = Some(elem.to_string());
            }

            if !has_seq_num && seq_num != 0 && elem == "meta" && dot.is_some() {
                result.push_str(" sequenceId=\"");
                result.push_str(&seq_num.to_string());
                result.push('"');
                has_seq_num = true;
            }

            if !param.is_empty() {
                result.push(' ');
                result.push_str(param);
                result.push_str("=\"");
                Self::sdata_append_escaped(result, self.get_value(handle));
                result.push('"');
            }
        }
        if cur_elem.is_some() {
            result.push(']');
        }

        if !has_seq_num && seq_num != 0 {
            result.push_str("[meta sequenceId=\"");
            result.push_str(&seq_num.to_string());
            result.push_str("\"]");
        }
    }

    pub fn format_sdata(&self, result: &mut String, seq_num: u32) {
        result.clear();
        self.append_format_sdata(result, seq_num);
    }

    // --- tags ---

    pub fn set_tag_by_id(&mut self, id: TagId) {
        self.flags |= flags::STATE_OWN_TAGS;
        self.tags.set(id, true);
    }

    pub fn set_tag_by_name(&mut self, name: &str) {
        self.set_tag_by_id(tags::get_tag_by_name(name));
    }

    pub fn clear_tag_by_id(&mut self, id: TagId) {
        self.flags |= flags::STATE_OWN_TAGS;
        self.tags.set(id, false);
    }

    pub fn clear_tag_by_name(&mut self, name: &str) {
        self.clear_tag_by_id(tags::get_tag_by_name(name));
    }

    pub fn is_tag_by_id(&self, id: TagId) -> bool {
        self.tags.is_set(id)
    }

    pub fn is_tag_by_name(&self, name: &str) -> bool {
        self.is_tag_by_id(tags::get_tag_by_name(name))
    }

    pub fn tags_foreach<F: FnMut(TagId)>(&self, visit: F) {
        self.tags.for_each(visit);
    }

    /// Append the comma separated tag names.
    pub fn print_tags(&self, result: &mut String) {
        let original_len = result.len();
        self.tags.for_each(|id| {
            if result.len() > original_len {
                result.push(',');
            }
            if let Some(name) = tags::get_tag_name(id) {
                result.push_str(&name);
            }
        });
    }

    // --- ref / ack protocol ---

    pub(crate) fn update_ack_and_ref(&self, add_ref: i32, add_ack: i32) -> u32 {
        loop {
            let old = self.ack_and_ref.load(Ordering::SeqCst);
            let refs = ref_of(old) as i32 + add_ref;
            let acks = ack_of(old) as i32 + add_ack;
            assert!(refs >= 0, "message reference count underflow");
            assert!(acks >= 0, "message ack count underflow");
            let new = pack(acks as u32, refs as u32);
            if self
                .ack_and_ref
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return old;
            }
        }
    }

    pub(crate) fn load_ack_and_ref(&self) -> u32 {
        self.ack_and_ref.load(Ordering::SeqCst)
    }

    /// Snapshot of the protocol counters as `(ack, ref)`.
    pub fn ack_and_ref_counts(&self) -> (u32, u32) {
        let value = self.load_ack_and_ref();
        (ack_of(value), ref_of(value))
    }

    /// Producer-mode bias. The message is not yet visible to any other
    /// thread, so plain stores suffice.
    pub(crate) fn apply_refcache_bias(&self, bias: u32) {
        let old = self.ack_and_ref.load(Ordering::Relaxed);
        self.ack_and_ref.store(
            pack(ack_of(old) + bias, ref_of(old) + bias),
            Ordering::Relaxed,
        );
    }

    pub(crate) fn fire_ack(&self) {
        match &self.ack_handler {
            AckHandler::None => {}
            AckHandler::ForwardToOriginal => {
                if let Some(original) = &self.original {
                    original.ack(&PathOptions {
                        ack_needed: true,
                        flow_control_requested: false,
                    });
                }
            }
            AckHandler::Custom(handler) => handler(self),
        }
    }

    pub fn set_ack_handler(&mut self, handler: AckHandler) {
        self.ack_handler = handler;
    }

    /// Give up a protocol reference; the allocation unwinds with the last
    /// handle.
    pub fn release(self: Arc<Self>) {
        if refcache::cache_unref(&self) {
            return;
        }
        let old = self.update_ack_and_ref(-1, 0);
        assert!(ref_of(old) >= 1);
    }

    /// Register one more expected acknowledgment on a flow-controlled path.
    pub fn add_ack(&self, path_options: &PathOptions) {
        if !path_options.ack_needed {
            return;
        }
        if refcache::cache_add_ack(self) {
            return;
        }
        self.update_ack_and_ref(0, 1);
    }

    /// Confirm delivery on a flow-controlled path; the ack callback fires
    /// when the last expected ack arrives.
    pub fn ack(&self, path_options: &PathOptions) {
        if !path_options.ack_needed {
            return;
        }
        if refcache::cache_ack(self) {
            return;
        }
        let old = self.update_ack_and_ref(0, -1);
        if ack_of(old) == 1 {
            self.fire_ack();
        }
    }

    /// Ack and release in one step; used by destinations dropping a message
    /// they cannot process.
    pub fn discard(self: Arc<Self>, path_options: &PathOptions) {
        self.ack(path_options);
        self.release();
    }

    /// Break out of an acknowledgment chain: ack the incoming reference and
    /// return path options for the downstream hops.
    pub fn break_ack(&self, path_options: &PathOptions) -> PathOptions {
        assert!(!path_options.flow_control_requested);
        self.ack(path_options);
        PathOptions {
            ack_needed: false,
            ..*path_options
        }
    }

    // --- copy-on-write cloning ---

    /// Obtain a mutable message, cloning copy-on-write when the handle is
    /// shared.
    pub fn make_writable<'a>(
        msg: &'a mut Arc<LogMessage>,
        path_options: &PathOptions,
    ) -> &'a mut LogMessage {
        if Arc::get_mut(msg).is_none() {
            let clone = msg.clone_cow(path_options);
            let old = std::mem::replace(msg, Arc::new(clone));
            old.release();
        }
        Arc::get_mut(msg).expect("writable message is uniquely held")
    }

    pub fn original(&self) -> Option<&Arc<LogMessage>> {
        self.original.as_ref()
    }

    // --- serialization ---

    pub fn serialize<W: Write>(&self, archive: &mut ArchiveWriter<W>) -> CoreResult<()> {
        archive.write_u8(SERIALIZE_VERSION)?;
        archive.write_u64(self.rcptid)?;
        archive.write_u32(self.flags & !flags::STATE_MASK)?;
        archive.write_u16(self.pri)?;
        SenderAddr::serialize(&self.saddr, archive)?;
        write_stamp(archive, &self.timestamps[TS_STAMP])?;
        write_stamp(archive, &self.timestamps[TS_RECVD])?;
        self.write_tags(archive)?;
        archive.write_u8(self.initial_parse as u8)?;
        archive.write_u8(self.num_matches)?;
        archive.write_u8(self.sdata.len() as u8)?;
        archive.write_u8(alloc_sdata_for(self.sdata.len()))?;
        for &handle in &self.sdata {
            archive.write_u16(handle)?;
        }
        self.payload.serialize(archive)?;
        Ok(())
    }

    fn write_tags<W: Write>(&self, archive: &mut ArchiveWriter<W>) -> CoreResult<()> {
        let mut error = None;
        self.tags.for_each(|id| {
            if error.is_some() {
                return;
            }
            if let Some(name) = tags::get_tag_name(id) {
                if let Err(e) = archive.write_cstring(name.as_bytes()) {
                    error = Some(e);
                }
            }
        });
        if let Some(e) = error {
            return Err(e);
        }
        archive.write_cstring(b"")?;
        Ok(())
    }

    pub fn deserialize<R: Read>(archive: &mut ArchiveReader<R>) -> CoreResult<LogMessage> {
        let version = archive.read_u8()?;
        if (version > 1 && version < 10) || version > SERIALIZE_VERSION {
            tracing::error!(version, "error deserializing log message, unsupported version");
            return Err(CoreError::UnsupportedVersion(version));
        }
        let mut msg = LogMessage::new_empty();
        if version < 10 {
            read_version_0_1(&mut msg, archive, version)?;
        } else if version < 20 {
            read_version_1x(&mut msg, archive, version)?;
        } else {
            read_version_2x(&mut msg, archive, version)?;
        }
        Ok(msg)
    }
}

/// Operations needing both the message and its shared handle.
pub trait MessageHandle {
    /// Take a protocol reference and a new handle to the message.
    fn acquire(&self) -> Arc<LogMessage>;

    /// Copy-on-write clone. The clone shares payload, tags, sdata and
    /// sender address with the original until either side mutates; acks on
    /// the clone are forwarded to the original.
    fn clone_cow(&self, path_options: &PathOptions) -> LogMessage;
}

impl MessageHandle for Arc<LogMessage> {
    fn acquire(&self) -> Arc<LogMessage> {
        if !refcache::cache_ref(self) {
            let old = self.update_ack_and_ref(1, 0);
            assert!(ref_of(old) >= 1);
        }
        Arc::clone(self)
    }

    fn clone_cow(&self, path_options: &PathOptions) -> LogMessage {
        // a clone of a zero-own clone redirects to the root original to
        // keep chains one level deep
        let source = if (self.flags & flags::STATE_OWN_MASK == 0
            || (self.flags & flags::STATE_OWN_MASK == flags::STATE_OWN_TAGS
                && matches!(self.tags, Tags::Inline(_))))
            && self.original.is_some()
        {
            self.original.as_ref().unwrap()
        } else {
            self
        };

        let mut clone = LogMessage {
            ack_and_ref: AtomicU32::new(pack(0, 1)),
            ack_handler: if path_options.ack_needed {
                AckHandler::ForwardToOriginal
            } else {
                AckHandler::None
            },
            original: Some(source.acquire()),
            timestamps: source.timestamps,
            tags: source.tags.clone(),
            sdata: source.sdata.clone(),
            saddr: source.saddr.clone(),
            payload: Arc::clone(&source.payload),
            flags: source.flags & !flags::STATE_MASK,
            pri: source.pri,
            rcptid: source.rcptid,
            initial_parse: source.initial_parse,
            num_matches: source.num_matches,
        };
        clone.add_ack(path_options);
        if matches!(clone.tags, Tags::Inline(_)) {
            clone.flags |= flags::STATE_OWN_TAGS;
        }
        clone
    }
}

impl Drop for LogMessage {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            original.release();
        }
    }
}

fn alloc_sdata_for(len: usize) -> u8 {
    ((len + 7) & !7).min(SD_ELEMENTS_MAX) as u8
}

fn write_stamp<W: Write>(archive: &mut ArchiveWriter<W>, stamp: &Stamp) -> CoreResult<()> {
    archive.write_u64(stamp.sec as u64)?;
    archive.write_u32(stamp.usec)?;
    archive.write_u32(stamp.zone_offset as u32)?;
    Ok(())
}

fn read_stamp<R: Read>(
    archive: &mut ArchiveReader<R>,
    wide: bool,
) -> CoreResult<Stamp> {
    let sec = if wide {
        archive.read_u64()? as i64
    } else {
        archive.read_u32()? as i32 as i64
    };
    let usec = archive.read_u32()?;
    let zone_offset = archive.read_u32()? as i32;
    Ok(Stamp {
        sec,
        usec,
        zone_offset,
    })
}

fn read_tags<R: Read>(msg: &mut LogMessage, archive: &mut ArchiveReader<R>) -> CoreResult<()> {
    loop {
        let name = archive.read_cstring()?;
        if name.is_empty() {
            break;
        }
        let name = String::from_utf8_lossy(&name).into_owned();
        msg.set_tag_by_name(&name);
    }
    msg.flags |= flags::STATE_OWN_TAGS;
    Ok(())
}

/// HOST, HOST_FROM, PROGRAM and MESSAGE, shared by every version below 20.
fn read_common_values<R: Read>(
    msg: &mut LogMessage,
    archive: &mut ArchiveReader<R>,
) -> CoreResult<()> {
    for handle in [
        builtin::HOST,
        builtin::HOST_FROM,
        builtin::PROGRAM,
        builtin::MESSAGE,
    ] {
        let value = archive.read_cstring()?;
        msg.set_value(handle, &value);
    }
    Ok(())
}

fn read_matches_details<R: Read>(
    msg: &mut LogMessage,
    archive: &mut ArchiveReader<R>,
) -> CoreResult<()> {
    for i in 0..msg.num_matches as usize {
        let stored_flags = archive.read_u8()?;
        if stored_flags & 0x01 != 0 {
            let ref_type = archive.read_u8()?;
            let builtin_value = archive.read_u8()?;
            if builtin_value as u16 >= builtin::MAX {
                return Err(CoreError::Malformed("match references unknown builtin"));
            }
            let ofs = archive.read_u16()?;
            let len = archive.read_u16()?;
            msg.set_match_indirect(i, builtin_value as NvHandle, ref_type, ofs, len);
        } else {
            let value = archive.read_cstring()?;
            msg.set_match(i, &value);
        }
    }
    Ok(())
}

fn read_values<R: Read>(msg: &mut LogMessage, archive: &mut ArchiveReader<R>) -> CoreResult<()> {
    loop {
        let name = archive.read_cstring()?;
        let value = archive.read_cstring()?;
        if name.is_empty() {
            break;
        }
        let name = String::from_utf8_lossy(&name).into_owned();
        msg.set_value(get_value_handle(&name), &value);
    }
    Ok(())
}

fn read_sd_data<R: Read>(msg: &mut LogMessage, archive: &mut ArchiveReader<R>) -> CoreResult<()> {
    loop {
        let sd_id = archive.read_cstring()?;
        if sd_id.is_empty() {
            break;
        }
        let element_root = format!("{}{}.", SD_PREFIX, String::from_utf8_lossy(&sd_id));
        loop {
            let name = archive.read_cstring()?;
            let value = archive.read_cstring()?;
            if name.is_empty() || value.is_empty() {
                break;
            }
            let full_name = format!("{}{}", element_root, String::from_utf8_lossy(&name));
            msg.set_value(get_value_handle(&full_name), &value);
        }
    }
    Ok(())
}

/// Split `prog[pid]: ` off the front of a legacy 3164 payload.
fn read_legacy_program_name(msg: &mut LogMessage) {
    let message = msg.get_value(builtin::MESSAGE).to_vec();
    let mut at = 0;
    while at < message.len()
        && message[at] != b' '
        && message[at] != b'['
        && message[at] != b':'
    {
        at += 1;
    }
    msg.set_value(builtin::PROGRAM, &message[..at]);
    if at < message.len() && message[at] == b'[' {
        let pid_start = at + 1;
        while at < message.len()
            && message[at] != b' '
            && message[at] != b']'
            && message[at] != b':'
        {
            at += 1;
        }
        if at < message.len() {
            msg.set_value(builtin::PID, &message[pid_start..at]);
        }
        if at < message.len() && message[at] == b']' {
            at += 1;
        }
    }
    if at < message.len() && message[at] == b':' {
        at += 1;
    }
    if at < message.len() && message[at] == b' ' {
        at += 1;
    }
    msg.set_value(builtin::MESSAGE, &message[at..]);
}

fn read_version_0_1<R: Read>(
    msg: &mut LogMessage,
    archive: &mut ArchiveReader<R>,
    version: u8,
) -> CoreResult<()> {
    const OLD_UNPARSED: u32 = 0x0001;

    let stored_flags = archive.read_u8()?;
    msg.flags = (stored_flags as u32 & !OLD_UNPARSED) | flags::STATE_MASK;
    msg.pri = archive.read_u8()? as u16;
    let source = archive.read_cstring()?;
    msg.set_value(builtin::SOURCE, &source);
    msg.saddr = SenderAddr::deserialize(archive)?;
    msg.timestamps[TS_STAMP] = read_stamp(archive, false)?;
    msg.timestamps[TS_RECVD] = read_stamp(archive, false)?;
    if version < 1 {
        // version 0 stored a preformatted date here
        archive.read_cstring()?;
    }
    read_common_values(msg, archive)?;
    read_legacy_program_name(msg);
    msg.set_value(builtin::PID, b"");
    msg.set_value(builtin::MSGID, b"");

    msg.num_matches = archive.read_u8()?;
    for i in 0..msg.num_matches as usize {
        let value = archive.read_cstring()?;
        msg.set_match(i, &value);
    }
    read_matches_details(msg, archive)?;
    Ok(())
}

fn read_version_1x<R: Read>(
    msg: &mut LogMessage,
    archive: &mut ArchiveReader<R>,
    version: u8,
) -> CoreResult<()> {
    if version == 10 {
        msg.flags = archive.read_u16()? as u32;
    } else {
        msg.flags = archive.read_u32()?;
    }
    msg.flags |= flags::STATE_MASK;
    msg.pri = archive.read_u16()?;
    let source = archive.read_cstring()?;
    msg.set_value(builtin::SOURCE, &source);
    msg.saddr = SenderAddr::deserialize(archive)?;
    msg.timestamps[TS_STAMP] = read_stamp(archive, true)?;
    msg.timestamps[TS_RECVD] = read_stamp(archive, true)?;
    if version == 12 {
        read_tags(msg, archive)?;
    }
    read_common_values(msg, archive)?;
    let pid = archive.read_cstring()?;
    msg.set_value(builtin::PID, &pid);
    let msgid = archive.read_cstring()?;
    msg.set_value(builtin::MSGID, &msgid);
    msg.num_matches = archive.read_u8()?;
    read_matches_details(msg, archive)?;
    read_values(msg, archive)?;
    read_sd_data(msg, archive)?;
    Ok(())
}

fn read_version_2x<R: Read>(
    msg: &mut LogMessage,
    archive: &mut ArchiveReader<R>,
    version: u8,
) -> CoreResult<()> {
    if version > 22 {
        msg.rcptid = archive.read_u64()?;
    }
    msg.flags = archive.read_u32()? | flags::STATE_MASK;
    msg.pri = archive.read_u16()?;
    msg.saddr = SenderAddr::deserialize(archive)?;
    msg.timestamps[TS_STAMP] = read_stamp(archive, true)?;
    msg.timestamps[TS_RECVD] = read_stamp(archive, true)?;
    read_tags(msg, archive)?;
    msg.initial_parse = archive.read_u8()? != 0;
    msg.num_matches = archive.read_u8()?;
    let num_sdata = archive.read_u8()?;
    let _alloc_sdata = archive.read_u8()?;

    let mut stored_sdata: Vec<NvHandle> = Vec::with_capacity(num_sdata as usize);
    if version > 20 {
        for _ in 0..num_sdata {
            stored_sdata.push(archive.read_u16()?);
        }
    }

    let mut table = NvTable::deserialize(archive)?;
    if table.num_static() != builtin::MAX as u8 {
        return Err(CoreError::Malformed("builtin value count mismatch"));
    }
    let mapping = table.update_ids(registry());

    // the stored sdata handles were issued by the writer's registry
    msg.sdata = stored_sdata
        .iter()
        .map(|old| {
            mapping
                .iter()
                .find(|(from, _)| from == old)
                .map(|(_, to)| *to)
                .unwrap_or(*old)
        })
        .collect();

    upgrade_sd_entries(&table);
    msg.payload = Arc::new(table);
    msg.flags |= flags::STATE_OWN_PAYLOAD;
    Ok(())
}

/// Recompute the sdata flag and element length metadata for every
/// structured-data name found in a freshly loaded payload.
fn upgrade_sd_entries(table: &NvTable) {
    let registry = registry();
    table.for_each(registry, |handle, name, _| {
        if name.len() > SD_PREFIX.len() && name.starts_with(SD_PREFIX) {
            let id_len = match name.rfind('.') {
                Some(dot) if dot > SD_PREFIX.len() => dot - SD_PREFIX.len(),
                _ => name.len() - SD_PREFIX.len(),
            };
            registry.set_handle_flags(handle, ((id_len as u16) << 8) | NVF_SDATA);
        }
        false
    });
}

//! Thread-local batching of ref/ack updates.
//!
//! A thread usually works on one message at a time: the reader parses one,
//! pushes it, picks up the next; the writer pops one, delivers it, acks it.
//! Between `start_*` and `stop` the thread counts ref/ack *differences* in
//! plain thread-local integers and folds them into the message's atomic
//! counter with a single CAS at `stop`.
//!
//! The producer does not know how many references consumers will take and
//! drop before it flushes, so `start_producer` adds a large bias to both
//! halves of the atomic counter first. Consumers running ahead can then
//! never drive either counter to zero under the producer's feet; the bias
//! is part of the producer's cached difference and disappears at `stop`.

use crate::logmsg::{ack_of, ref_of, LogMessage, PathOptions};
use std::cell::RefCell;
use std::sync::Arc;

/// Bias added to both counters in producer mode.
pub const BIAS: i32 = 0x4000;

struct CacheState {
    msg: Arc<LogMessage>,
    cached_refs: i32,
    cached_acks: i32,
    ack_needed: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<CacheState>> = const { RefCell::new(None) };
}

/// Begin caching on the message this thread just created. The thread must
/// be the only one holding the message.
pub fn start_producer(msg: &Arc<LogMessage>) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        assert!(
            current.is_none(),
            "a thread caches ref/ack updates for one message at a time"
        );
        msg.apply_refcache_bias(BIAS as u32);
        *current = Some(CacheState {
            msg: Arc::clone(msg),
            cached_refs: -BIAS,
            cached_acks: -BIAS,
            ack_needed: true,
        });
    });
}

/// Begin caching on a message this thread is consuming.
pub fn start_consumer(msg: &Arc<LogMessage>, path_options: &PathOptions) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        assert!(
            current.is_none(),
            "a thread caches ref/ack updates for one message at a time"
        );
        *current = Some(CacheState {
            msg: Arc::clone(msg),
            cached_refs: 0,
            cached_acks: 0,
            ack_needed: path_options.ack_needed,
        });
    });
}

fn with_current<F: FnOnce(&mut CacheState)>(msg: &LogMessage, apply: F) -> bool {
    // try_with: messages may be dropped while thread-local storage is
    // already tearing down
    CURRENT
        .try_with(|current| {
            let mut current = current.borrow_mut();
            match current.as_mut() {
                Some(state) if Arc::as_ptr(&state.msg) == msg as *const LogMessage => {
                    apply(state);
                    true
                }
                _ => false,
            }
        })
        .unwrap_or(false)
}

pub(crate) fn cache_ref(msg: &LogMessage) -> bool {
    with_current(msg, |state| state.cached_refs += 1)
}

pub(crate) fn cache_unref(msg: &LogMessage) -> bool {
    with_current(msg, |state| state.cached_refs -= 1)
}

pub(crate) fn cache_add_ack(msg: &LogMessage) -> bool {
    with_current(msg, |state| state.cached_acks += 1)
}

pub(crate) fn cache_ack(msg: &LogMessage) -> bool {
    with_current(msg, |state| state.cached_acks -= 1)
}

/// Flush the cached differences with one CAS and close the window.
///
/// If the flushed pre-image shows the ack counter reached zero on an
/// ack-needing path, the ack callback runs here; any ref differences the
/// callback itself cached are folded in with a second CAS afterwards.
pub fn stop() {
    let (msg, flushed_refs, flushed_acks, ack_needed) = CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let state = current
            .as_mut()
            .expect("refcache stop called without a start");
        assert!(state.cached_acks >= -BIAS && state.cached_acks < BIAS - 1);
        assert!(state.cached_refs >= -BIAS && state.cached_refs < BIAS - 1);
        let refs = std::mem::take(&mut state.cached_refs);
        let acks = std::mem::take(&mut state.cached_acks);
        (Arc::clone(&state.msg), refs, acks, state.ack_needed)
    });

    let old = msg.update_ack_and_ref(flushed_refs, flushed_acks);

    if ack_of(old) as i32 == -flushed_acks && ack_needed {
        msg.fire_ack();
    }

    // the ack handler may have run ref/unref on the still-current message
    let leftover_refs = CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let state = current.as_mut().expect("refcache window disappeared");
        std::mem::take(&mut state.cached_refs)
    });

    if ref_of(old) as i32 == -flushed_refs {
        // the flush dropped the last protocol reference; the handler may
        // not have taken new ones
        assert!(leftover_refs == 0);
    } else if leftover_refs != 0 {
        msg.update_ack_and_ref(leftover_refs, 0);
    }

    CURRENT.with(|current| {
        *current.borrow_mut() = None;
    });
}

/// Whether this thread currently caches for `msg`; test support.
pub fn is_current(msg: &LogMessage) -> bool {
    CURRENT
        .try_with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|state| Arc::as_ptr(&state.msg) == msg as *const LogMessage)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

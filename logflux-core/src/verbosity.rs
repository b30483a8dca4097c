//! Runtime verbosity flags toggled over the control channel.

use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);
static VERBOSE: AtomicBool = AtomicBool::new(false);
static TRACE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Debug,
    Verbose,
    Trace,
}

fn cell(flag: Flag) -> &'static AtomicBool {
    match flag {
        Flag::Debug => &DEBUG,
        Flag::Verbose => &VERBOSE,
        Flag::Trace => &TRACE,
    }
}

pub fn get(flag: Flag) -> bool {
    cell(flag).load(Ordering::Relaxed)
}

/// Returns the previous value.
pub fn set(flag: Flag, on: bool) -> bool {
    cell(flag).swap(on, Ordering::Relaxed)
}

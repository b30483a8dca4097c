//! Receipt-id generator.
//!
//! Every message can be stamped with a unique 48-bit receipt id; the next
//! id survives restarts through the persist state.

use crate::error::CoreResult;
use crate::persist::PersistState;
use parking_lot::Mutex;
use std::sync::Arc;

const PERSIST_KEY: &str = "next.rcptid";
const RCPTID_MASK: u64 = 0xFFFF_FFFF_FFFF;

pub struct RcptidGenerator {
    state: Arc<PersistState>,
    next: Mutex<u64>,
}

impl RcptidGenerator {
    pub fn new(state: Arc<PersistState>) -> CoreResult<RcptidGenerator> {
        let next = state
            .lookup(PERSIST_KEY)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(1);
        Ok(RcptidGenerator {
            state,
            next: Mutex::new(next),
        })
    }

    /// Hand out the next id, wrapping inside 48 bits and skipping zero.
    pub fn next(&self) -> CoreResult<u64> {
        let mut next = self.next.lock();
        let id = *next;
        let mut following = (*next + 1) & RCPTID_MASK;
        if following == 0 {
            following = 1;
        }
        *next = following;
        self.state.store(PERSIST_KEY, &following.to_string())?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ids_are_sequential_and_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist");

        let state = Arc::new(PersistState::open(&path).unwrap());
        let generator = RcptidGenerator::new(state).unwrap();
        assert_eq!(generator.next().unwrap(), 1);
        assert_eq!(generator.next().unwrap(), 2);
        drop(generator);

        let state = Arc::new(PersistState::open(&path).unwrap());
        let generator = RcptidGenerator::new(state).unwrap();
        assert_eq!(generator.next().unwrap(), 3);
    }
}

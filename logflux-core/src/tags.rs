//! Message tags: a process-wide name registry and the per-message bitmap.
//!
//! Up to 64 tag ids live inline in a single word; the first id past that
//! spills the bitmap to a heap allocation. Tag ids are capped at 8159.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;

pub type TagId = u16;

/// Highest tag id a message can carry.
pub const TAG_ID_MAX: TagId = 8159;

const WORD_BITS: usize = 64;

struct TagRegistry {
    names: RwLock<Vec<String>>,
    by_name: RwLock<HashMap<String, TagId>>,
}

fn registry() -> &'static TagRegistry {
    static REGISTRY: OnceLock<TagRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| TagRegistry {
        names: RwLock::new(Vec::new()),
        by_name: RwLock::new(HashMap::new()),
    })
}

/// Look up or allocate the id for a tag name.
pub fn get_tag_by_name(name: &str) -> TagId {
    let reg = registry();
    if let Some(id) = reg.by_name.read().get(name) {
        return *id;
    }
    let mut by_name = reg.by_name.write();
    if let Some(id) = by_name.get(name) {
        return *id;
    }
    let mut names = reg.names.write();
    let id = names.len() as TagId;
    names.push(name.to_string());
    by_name.insert(name.to_string(), id);
    id
}

pub fn get_tag_name(id: TagId) -> Option<String> {
    registry().names.read().get(id as usize).cloned()
}

/// Bitmap of tag ids carried by one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tags {
    Inline(u64),
    Spilled(Box<[u64]>),
}

impl Default for Tags {
    fn default() -> Self {
        Tags::Inline(0)
    }
}

impl Tags {
    pub fn new() -> Self {
        Tags::default()
    }

    pub fn set(&mut self, id: TagId, on: bool) {
        if id > TAG_ID_MAX {
            tracing::error!(id, "maximum number of tags reached");
            return;
        }
        match self {
            Tags::Inline(word) if (id as usize) < WORD_BITS => {
                if on {
                    *word |= 1 << id;
                } else {
                    *word &= !(1 << id);
                }
            }
            Tags::Inline(word) => {
                let num_words = id as usize / WORD_BITS + 1;
                let mut words = vec![0u64; num_words];
                words[0] = *word;
                set_bit(&mut words, id as usize, on);
                *self = Tags::Spilled(words.into_boxed_slice());
            }
            Tags::Spilled(words) => {
                let needed = id as usize / WORD_BITS + 1;
                if needed > words.len() {
                    let mut grown = words.to_vec();
                    grown.resize(needed, 0);
                    set_bit(&mut grown, id as usize, on);
                    *self = Tags::Spilled(grown.into_boxed_slice());
                } else {
                    set_bit(words, id as usize, on);
                }
            }
        }
    }

    pub fn is_set(&self, id: TagId) -> bool {
        if id > TAG_ID_MAX {
            tracing::error!(id, "invalid tag");
            return false;
        }
        let (words, inline): (&[u64], u64);
        match self {
            Tags::Inline(word) => {
                inline = *word;
                words = std::slice::from_ref(&inline);
            }
            Tags::Spilled(spilled) => words = spilled,
        }
        let word = id as usize / WORD_BITS;
        if word >= words.len() {
            return false;
        }
        words[word] & (1 << (id as usize % WORD_BITS)) != 0
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Tags::Inline(word) => *word == 0,
            Tags::Spilled(words) => words.iter().all(|w| *w == 0),
        }
    }

    pub fn clear_all(&mut self) {
        *self = Tags::Inline(0);
    }

    /// Visit every set tag id in ascending order.
    pub fn for_each<F: FnMut(TagId)>(&self, mut visit: F) {
        let visit_word = |base: usize, mut word: u64, visit: &mut F| {
            let mut bit = 0;
            while word != 0 {
                let skip = word.trailing_zeros() as usize;
                bit += skip;
                visit((base + bit) as TagId);
                word >>= skip;
                word >>= 1;
                bit += 1;
            }
        };
        match self {
            Tags::Inline(word) => visit_word(0, *word, &mut visit),
            Tags::Spilled(words) => {
                for (i, word) in words.iter().enumerate() {
                    visit_word(i * WORD_BITS, *word, &mut visit);
                }
            }
        }
    }
}

fn set_bit(words: &mut [u64], index: usize, on: bool) {
    let mask = 1u64 << (index % WORD_BITS);
    if on {
        words[index / WORD_BITS] |= mask;
    } else {
        words[index / WORD_BITS] &= !mask;
    }
}

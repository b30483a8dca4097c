//! Process-wide interned dictionary mapping value names to small integer
//! handles.
//!
//! Handles are issued once and never move; readers hold a short shared lock
//! while the writer side (allocation, aliasing) is serialized by the write
//! half of the same lock. Entry storage is append-only, so a handle obtained
//! from any thread stays a valid index for the lifetime of the process.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Small integer alias for a value name. 0 is the none sentinel.
pub type NvHandle = u16;

pub const NV_HANDLE_NONE: NvHandle = 0;

/// Maximum number of distinct handles per process.
pub const NV_HANDLE_MAX: usize = 65_535;

/// Maximum length of a value name in bytes.
pub const NV_NAME_MAX: usize = 255;

/// Per-handle flag bits.
pub const NVF_SDATA: u16 = 0x0001;
pub const NVF_MATCH: u16 = 0x0002;
pub const NVF_MACRO: u16 = 0x0004;

struct HandleDesc {
    name: Box<str>,
    flags: u16,
}

struct Inner {
    names: Vec<HandleDesc>,
    name_map: HashMap<Box<str>, NvHandle>,
}

pub struct NvRegistry {
    inner: RwLock<Inner>,
    exhausted_logged: AtomicBool,
}

impl NvRegistry {
    pub fn new(static_names: &[&str]) -> Self {
        let registry = NvRegistry {
            inner: RwLock::new(Inner {
                names: Vec::with_capacity(64),
                name_map: HashMap::with_capacity(64),
            }),
            exhausted_logged: AtomicBool::new(false),
        };
        for name in static_names {
            registry.alloc_handle(name);
        }
        registry
    }

    /// Look up an existing handle; 0 when the name is unknown.
    pub fn get_handle(&self, name: &str) -> NvHandle {
        let inner = self.inner.read();
        inner.name_map.get(name).copied().unwrap_or(NV_HANDLE_NONE)
    }

    /// Look up or allocate a handle for `name`. Returns 0 for an invalid
    /// name or when the handle space is exhausted.
    pub fn alloc_handle(&self, name: &str) -> NvHandle {
        let mut inner = self.inner.write();
        if let Some(handle) = inner.name_map.get(name) {
            return *handle;
        }

        if name.is_empty() {
            tracing::error!("name-value pairs cannot have a zero-length name");
            return NV_HANDLE_NONE;
        }
        if name.len() > NV_NAME_MAX {
            tracing::error!(
                name,
                "value names cannot be longer than 255 characters, this value will always expand to the empty string"
            );
            return NV_HANDLE_NONE;
        }
        if inner.names.len() >= NV_HANDLE_MAX {
            if !self.exhausted_logged.swap(true, Ordering::Relaxed) {
                tracing::error!(
                    "hard wired limit of 65535 name-value pairs has been reached, all further name-value pairs will expand to nothing"
                );
            }
            return NV_HANDLE_NONE;
        }

        let stored: Box<str> = name.into();
        inner.names.push(HandleDesc {
            name: stored.clone(),
            flags: 0,
        });
        let handle = inner.names.len() as NvHandle;
        inner.name_map.insert(stored, handle);
        handle
    }

    /// Register an additional name resolving to an existing handle.
    pub fn add_alias(&self, handle: NvHandle, alias: &str) {
        let mut inner = self.inner.write();
        inner.name_map.insert(alias.into(), handle);
    }

    pub fn set_handle_flags(&self, handle: NvHandle, flags: u16) {
        if handle == NV_HANDLE_NONE {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(desc) = inner.names.get_mut(handle as usize - 1) {
            desc.flags = flags;
        }
    }

    pub fn get_handle_flags(&self, handle: NvHandle) -> u16 {
        if handle == NV_HANDLE_NONE {
            return 0;
        }
        let inner = self.inner.read();
        inner
            .names
            .get(handle as usize - 1)
            .map(|desc| desc.flags)
            .unwrap_or(0)
    }

    /// Resolve a handle back to its name. Handle 0 maps to the sentinel
    /// name "None".
    pub fn get_handle_name(&self, handle: NvHandle) -> String {
        if handle == NV_HANDLE_NONE {
            return "None".to_string();
        }
        let inner = self.inner.read();
        inner
            .names
            .get(handle as usize - 1)
            .map(|desc| desc.name.to_string())
            .unwrap_or_else(|| "None".to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_idempotent() {
        let registry = NvRegistry::new(&["HOST", "MESSAGE"]);
        assert_eq!(registry.get_handle("HOST"), 1);
        assert_eq!(registry.get_handle("MESSAGE"), 2);

        let h = registry.alloc_handle("CUSTOM");
        assert_eq!(registry.alloc_handle("CUSTOM"), h);
        assert_eq!(registry.get_handle_name(h), "CUSTOM");
    }

    #[test]
    fn invalid_names_map_to_none() {
        let registry = NvRegistry::new(&[]);
        assert_eq!(registry.alloc_handle(""), NV_HANDLE_NONE);
        let long = "x".repeat(256);
        assert_eq!(registry.alloc_handle(&long), NV_HANDLE_NONE);
        assert_eq!(registry.get_handle_name(NV_HANDLE_NONE), "None");
    }

    #[test]
    fn aliases_resolve_to_the_original_handle() {
        let registry = NvRegistry::new(&["MESSAGE"]);
        registry.add_alias(1, "MSG");
        assert_eq!(registry.get_handle("MSG"), 1);
        assert_eq!(registry.get_handle_name(1), "MESSAGE");
    }

    #[test]
    fn flags_roundtrip() {
        let registry = NvRegistry::new(&[]);
        let h = registry.alloc_handle(".SDATA.meta.sequenceId");
        registry.set_handle_flags(h, NVF_SDATA | (4 << 8));
        assert_eq!(registry.get_handle_flags(h), NVF_SDATA | (4 << 8));
    }
}

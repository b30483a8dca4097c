//! Keyed string store surviving process restarts.
//!
//! One entry per key, saved as a small length-prefixed binary file through
//! the write-temp-then-rename idiom so a crash mid-save never clobbers the
//! previous generation.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"LFPS";
const VERSION: u8 = 1;

pub struct PersistState {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl PersistState {
    /// Open the store at `path`, loading the previous generation when one
    /// exists.
    pub fn open(path: impl Into<PathBuf>) -> CoreResult<PersistState> {
        let path = path.into();
        let entries = match fs::File::open(&path) {
            Ok(mut file) => Self::load(&mut file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(PersistState {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn load(file: &mut fs::File) -> CoreResult<HashMap<String, String>> {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CoreError::Persist("bad persist file magic".into()));
        }
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != VERSION {
            return Err(CoreError::Persist(format!(
                "unsupported persist file version {}",
                version[0]
            )));
        }
        let mut count_buf = [0u8; 4];
        file.read_exact(&mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);

        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let key = Self::read_string(file)?;
            let value = Self::read_string(file)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn read_string(file: &mut fs::File) -> CoreResult<String> {
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);
        if len > 1024 * 1024 {
            return Err(CoreError::Persist("implausible entry length".into()));
        }
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        String::from_utf8(data).map_err(|_| CoreError::Persist("entry is not UTF-8".into()))
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn store(&self, key: &str, value: &str) -> CoreResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        self.save()
    }

    pub fn remove(&self, key: &str) -> CoreResult<()> {
        self.entries.lock().remove(key);
        self.save()
    }

    fn save(&self) -> CoreResult<()> {
        let entries = self.entries.lock();
        let mut body = Vec::with_capacity(64 + entries.len() * 64);
        body.extend_from_slice(MAGIC);
        body.push(VERSION);
        body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (key, value) in entries.iter() {
            body.extend_from_slice(&(key.len() as u32).to_be_bytes());
            body.extend_from_slice(key.as_bytes());
            body.extend_from_slice(&(value.len() as u32).to_be_bytes());
            body.extend_from_slice(value.as_bytes());
        }
        drop(entries);

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&body)?;
        tmp.sync_data()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logflux.persist");

        let state = PersistState::open(&path).unwrap();
        state.store("dest.q", "logflux-00000.rqf").unwrap();
        state.store("other.q", "logflux-00001.qf").unwrap();
        drop(state);

        let state = PersistState::open(&path).unwrap();
        assert_eq!(state.lookup("dest.q").unwrap(), "logflux-00000.rqf");
        assert_eq!(state.lookup("other.q").unwrap(), "logflux-00001.qf");
        assert!(state.lookup("missing").is_none());

        state.remove("dest.q").unwrap();
        drop(state);
        let state = PersistState::open(&path).unwrap();
        assert!(state.lookup("dest.q").is_none());
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logflux.persist");
        fs::write(&path, b"XXXX").unwrap();
        assert!(PersistState::open(&path).is_err());
    }
}

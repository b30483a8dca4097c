//! Filesystem seam for the queue files.
//!
//! The ring file is random access, so handles expose positioned reads and
//! writes instead of a seek cursor. `StdFileSystem` is the production
//! implementation; `MemFileSystem` backs tests that want to run without
//! touching disk.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

pub trait QueueFile: Send + Debug {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn set_len(&self, size: u64) -> io::Result<()>;
    fn sync_data(&self) -> io::Result<()>;
    /// Reserve backing store up to `size` bytes.
    fn allocate(&self, size: u64) -> io::Result<()>;
    fn try_lock_exclusive(&self) -> io::Result<()>;
}

pub trait FileSystem: Send + Sync + Debug {
    fn exists(&self, path: &Path) -> bool;
    fn open(&self, path: &Path, write: bool, create: bool) -> io::Result<Box<dyn QueueFile>>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

#[derive(Clone, Copy, Default)]
pub struct StdFileSystem;

impl Debug for StdFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StdFileSystem")
    }
}

impl FileSystem for StdFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open(&self, path: &Path, write: bool, create: bool) -> io::Result<Box<dyn QueueFile>> {
        let mut options = OpenOptions::new();
        options.read(true).write(write);
        if create {
            options.create(true).mode(0o600);
        }
        let file = options.open(path)?;
        Ok(Box::new(file))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect())
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }
}

impl QueueFile for File {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        FileExt::write_all_at(self, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        File::set_len(self, size)
    }

    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn allocate(&self, size: u64) -> io::Result<()> {
        fs2::FileExt::allocate(self, size)
    }

    fn try_lock_exclusive(&self) -> io::Result<()> {
        fs2::FileExt::try_lock_exclusive(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemFileSystem {
    files: Arc<RwLock<HashMap<PathBuf, Arc<RwLock<Vec<u8>>>>>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystem for MemFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn open(&self, path: &Path, _write: bool, create: bool) -> io::Result<Box<dyn QueueFile>> {
        let mut files = self.files.write();
        let data = match files.get(path) {
            Some(data) => Arc::clone(data),
            None if create => {
                let data = Arc::new(RwLock::new(Vec::new()));
                files.insert(path.to_path_buf(), Arc::clone(&data));
                data
            }
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "file not found")),
        };
        Ok(Box::new(MemFile { data }))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.files.write();
        match files.remove(from) {
            Some(data) => {
                files.insert(to.to_path_buf(), data);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "file not found")),
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file not found"))
    }

    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|candidate| candidate.parent() == Some(path))
            .cloned()
            .collect())
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        self.files
            .read()
            .get(path)
            .map(|data| data.read().len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file not found"))
    }
}

#[derive(Debug)]
struct MemFile {
    data: Arc<RwLock<Vec<u8>>>,
}

impl QueueFile for MemFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of file",
            ));
        }
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.write();
        let end = offset as usize + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        self.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()> {
        Ok(())
    }

    fn allocate(&self, size: u64) -> io::Result<()> {
        let mut data = self.data.write();
        if (data.len() as u64) < size {
            data.resize(size as usize, 0);
        }
        Ok(())
    }

    fn try_lock_exclusive(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_fs_positioned_io() {
        let fs = MemFileSystem::new();
        let path = Path::new("/queue/test.qf");
        let file = fs.open(path, true, true).unwrap();

        file.write_all_at(b"hello", 10).unwrap();
        assert_eq!(file.len().unwrap(), 15);

        let mut buf = [0u8; 5];
        file.read_exact_at(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(file.read_exact_at(&mut buf, 12).is_err());

        // a second handle sees the same bytes
        let other = fs.open(path, false, false).unwrap();
        other.read_exact_at(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
    }
}

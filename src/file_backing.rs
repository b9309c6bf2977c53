//! Output file backing (spec.md §4.4). A single shared file descriptor;
//! workers write at disjoint offsets via positional (pwrite-style) writes,
//! which is safe without additional locking because the OS guarantees a
//! single `write_at` call is atomic with respect to its own byte range.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::Result;

pub struct FileBacking {
    file: File,
}

impl FileBacking {
    /// Open (creating if absent) the output file read-write. When `total_size`
    /// is known and the file did not previously exist, preallocate it to the
    /// full size (sparse on filesystems that support it) so any worker can
    /// safely write into any offset from the first step.
    pub fn open(path: &Path, total_size: Option<u64>) -> Result<FileBacking> {
        let existed = path.exists();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !existed {
            if let Some(size) = total_size {
                file.set_len(size)?;
            }
        }

        Ok(FileBacking { file })
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

//! On-disk resume record (spec.md §4.5, §6). Bound to the output file by
//! the convention `<output>.st`. Fixed little-endian layout:
//!
//! ```text
//! magic   "AXST"   (4 bytes)
//! version u16 = 1  (2 bytes)
//! total_size  i64  (8 bytes, -1 = unknown)
//! conn_count  u32  (4 bytes)
//! current_byte[conn_count]  u64 each
//! last_byte[conn_count]     u64 each
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

const MAGIC: &[u8; 4] = b"AXST";
const VERSION: u16 = 1;
const UNKNOWN_SIZE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub current_byte: u64,
    pub last_byte: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    /// `None` means the total size is unknown (identity-length stream).
    pub total_size: Option<u64>,
    pub connections: Vec<ConnectionRecord>,
}

impl StateFile {
    pub fn path_for(output: &Path) -> PathBuf {
        let mut p = output.as_os_str().to_os_string();
        p.push(".st");
        PathBuf::from(p)
    }

    fn tmp_path_for(output: &Path) -> PathBuf {
        let mut p = output.as_os_str().to_os_string();
        p.push(".st.tmp");
        PathBuf::from(p)
    }

    pub fn encode(&self) -> Vec<u8> {
        let n = self.connections.len();
        let mut buf = Vec::with_capacity(4 + 2 + 8 + 4 + 16 * n);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        let total = self.total_size.map(|t| t as i64).unwrap_or(UNKNOWN_SIZE);
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&(n as u32).to_le_bytes());
        for c in &self.connections {
            buf.extend_from_slice(&c.current_byte.to_le_bytes());
        }
        for c in &self.connections {
            buf.extend_from_slice(&c.last_byte.to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<StateFile> {
        if buf.len() < 18 {
            return Err(EngineError::FileIo(io::Error::new(
                io::ErrorKind::InvalidData,
                "state file truncated",
            )));
        }
        if &buf[0..4] != MAGIC {
            return Err(EngineError::FileIo(io::Error::new(
                io::ErrorKind::InvalidData,
                "state file magic mismatch",
            )));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(EngineError::FileIo(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("state file version mismatch: {version}"),
            )));
        }
        let total_raw = i64::from_le_bytes(buf[6..14].try_into().unwrap());
        let total_size = if total_raw == UNKNOWN_SIZE {
            None
        } else if total_raw < 0 {
            return Err(EngineError::FileIo(io::Error::new(
                io::ErrorKind::InvalidData,
                "state file has a negative, non-sentinel total size",
            )));
        } else {
            Some(total_raw as u64)
        };
        let n = u32::from_le_bytes(buf[14..18].try_into().unwrap()) as usize;

        let expected_len = 18 + 16 * n;
        if buf.len() < expected_len {
            return Err(EngineError::FileIo(io::Error::new(
                io::ErrorKind::InvalidData,
                "state file truncated for declared connection count",
            )));
        }

        let mut current = Vec::with_capacity(n);
        let mut offset = 18;
        for _ in 0..n {
            current.push(u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap()));
            offset += 8;
        }
        let mut connections = Vec::with_capacity(n);
        for cb in current {
            let lb = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
            offset += 8;
            if cb > lb {
                return Err(EngineError::FileIo(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "state file has current_byte > last_byte",
                )));
            }
            connections.push(ConnectionRecord {
                current_byte: cb,
                last_byte: lb,
            });
        }

        Ok(StateFile {
            total_size,
            connections,
        })
    }

    /// Read `<output>.st` if present. `Ok(None)` means the file does not exist.
    pub fn load(output: &Path) -> Result<Option<StateFile>> {
        let path = Self::path_for(output);
        match std::fs::read(&path) {
            Ok(bytes) => Self::decode(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::FileIo(e)),
        }
    }

    /// Atomically write `<output>.st`: write to `.st.tmp`, fsync, rename over.
    pub fn checkpoint(&self, output: &Path) -> Result<()> {
        let tmp = Self::tmp_path_for(output);
        let final_path = Self::path_for(output);
        {
            let file = std::fs::File::create(&tmp)?;
            use std::io::Write;
            let mut w = std::io::BufWriter::new(&file);
            w.write_all(&self.encode())?;
            w.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &final_path)?;
        Ok(())
    }

    /// Remove `<output>.st`, if present. Idempotent.
    pub fn delete(output: &Path) -> Result<()> {
        let path = Self::path_for(output);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::FileIo(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> StateFile {
        StateFile {
            total_size: Some(1_048_576),
            connections: vec![
                ConnectionRecord {
                    current_byte: 100,
                    last_byte: 262_144,
                },
                ConnectionRecord {
                    current_byte: 262_144,
                    last_byte: 524_288,
                },
            ],
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let s = sample();
        let decoded = StateFile::decode(&s.encode()).unwrap();
        assert_eq!(s, decoded);
    }

    #[test]
    fn unknown_size_sentinel_roundtrips() {
        let s = StateFile {
            total_size: None,
            connections: vec![ConnectionRecord {
                current_byte: 5,
                last_byte: u64::MAX,
            }],
        };
        let decoded = StateFile::decode(&s.encode()).unwrap();
        assert_eq!(decoded.total_size, None);
    }

    #[test]
    fn checkpoint_then_load_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("file.bin");
        let s = sample();
        s.checkpoint(&output).unwrap();

        let loaded = StateFile::load(&output).unwrap().unwrap();
        assert_eq!(loaded, s);

        // Checkpoint again; on-disk bytes must be identical.
        let bytes_before = std::fs::read(StateFile::path_for(&output)).unwrap();
        s.checkpoint(&output).unwrap();
        let bytes_after = std::fs::read(StateFile::path_for(&output)).unwrap();
        assert_eq!(bytes_before, bytes_after);
    }

    #[test]
    fn load_missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("missing.bin");
        assert!(StateFile::load(&output).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(StateFile::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_current_greater_than_last() {
        let s = StateFile {
            total_size: Some(10),
            connections: vec![ConnectionRecord {
                current_byte: 9,
                last_byte: 5,
            }],
        };
        assert!(StateFile::decode(&s.encode()).is_err());
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("file.bin");
        sample().checkpoint(&output).unwrap();
        StateFile::delete(&output).unwrap();
        assert!(!StateFile::path_for(&output).exists());
        StateFile::delete(&output).unwrap();
    }
}

//! Rendezvous lock files.
//!
//! A client announces itself by exclusively creating `slot-<id>.lock`. The
//! body is 24 little-endian bytes: pid (u32), reserved (u32), nonce (u64),
//! created wall-clock ns (u64).

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use rand::Rng;

use crate::clock;
use crate::security;

pub const LOCK_RECORD_LEN: usize = 24;

/// Parsed body of a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub pid: u32,
    pub nonce: u64,
    pub created_ns: u64,
}

impl LockRecord {
    /// A record for the current process with a fresh random nonce.
    pub fn for_current_process() -> Self {
        Self {
            pid: std::process::id(),
            nonce: random_nonce(),
            created_ns: clock::wall_ns(),
        }
    }

    pub fn encode(&self) -> [u8; LOCK_RECORD_LEN] {
        let mut out = [0u8; LOCK_RECORD_LEN];
        out[0..4].copy_from_slice(&self.pid.to_le_bytes());
        out[8..16].copy_from_slice(&self.nonce.to_le_bytes());
        out[16..24].copy_from_slice(&self.created_ns.to_le_bytes());
        out
    }

    /// `None` if `bytes` is not a complete record (for instance, still being written).
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != LOCK_RECORD_LEN {
            return None;
        }
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let record = Self {
            pid: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            nonce: u64_at(8),
            created_ns: u64_at(16),
        };
        (record.nonce != 0 && record.pid != 0).then_some(record)
    }

    /// Age relative to the wall clock; zero if the record is from the future.
    pub fn age(&self) -> Duration {
        Duration::from_nanos(clock::wall_ns().saturating_sub(self.created_ns))
    }
}

/// Exclusively create the lock at `path` and write `record` into it.
///
/// Fails with `AlreadyExists` when another party holds the lock.
pub fn create(path: &Path, record: &LockRecord) -> io::Result<()> {
    let mut file = security::create_private_file(path)?;
    if let Err(e) = file.write_all(&record.encode()).and_then(|_| file.sync_data()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

/// Read and parse the lock at `path`. `Ok(None)` if it is incomplete.
pub fn read(path: &Path) -> io::Result<Option<LockRecord>> {
    let bytes = fs::read(path)?;
    Ok(LockRecord::decode(&bytes))
}

/// Remove the lock at `path`; a missing file is not an error.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove the lock only if it still carries `nonce`.
pub fn remove_if_owned(path: &Path, nonce: u64) -> io::Result<bool> {
    match read(path) {
        Ok(Some(record)) if record.nonce == nonce => remove(path).map(|_| true),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Parse `slot-<id>.lock`.
pub fn parse_lock_name(name: &str) -> Option<u32> {
    name.strip_prefix("slot-")?
        .strip_suffix(".lock")?
        .parse()
        .ok()
}

/// Non-zero random nonce from the thread-local CSPRNG.
pub fn random_nonce() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("shmlane_lock_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        security::ensure_private_dir(&dir).unwrap();
        dir
    }

    #[test]
    fn record_layout() {
        let record = LockRecord {
            pid: 0x0102_0304,
            nonce: 0xAABB,
            created_ns: 5,
        };
        let bytes = record.encode();
        assert_eq!(&bytes[0..4], &[4, 3, 2, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(LockRecord::decode(&bytes), Some(record));
        assert_eq!(LockRecord::decode(&bytes[..10]), None);
        assert_eq!(LockRecord::decode(&[0u8; 24]), None);
    }

    #[test]
    fn exclusive_create() {
        let dir = scratch("exclusive");
        let path = dir.join("slot-3.lock");
        let record = LockRecord::for_current_process();
        create(&path, &record).unwrap();
        assert_eq!(
            create(&path, &LockRecord::for_current_process())
                .unwrap_err()
                .kind(),
            io::ErrorKind::AlreadyExists
        );
        assert_eq!(read(&path).unwrap(), Some(record));

        assert!(!remove_if_owned(&path, record.nonce + 1).unwrap());
        assert!(remove_if_owned(&path, record.nonce).unwrap());
        remove(&path).unwrap();
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn names_and_nonces() {
        assert_eq!(parse_lock_name("slot-12.lock"), Some(12));
        assert_eq!(parse_lock_name("slot-x.lock"), None);
        assert_eq!(parse_lock_name("slot-1.seg"), None);
        assert_ne!(random_nonce(), 0);
        assert_ne!(random_nonce(), random_nonce());
    }
}

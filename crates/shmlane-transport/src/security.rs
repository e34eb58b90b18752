//! Ownership and permission checks for every path the transport touches.
//!
//! Directories are created `0700` and files `0600`, with permissions set
//! explicitly right after creation so the process umask cannot widen them,
//! and before any byte is written. Every existing path is validated against
//! the effective uid before use; a mismatch is a [`SecurityError::Tamper`].

use std::fmt;
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const DIR_MODE: u32 = 0o700;
pub const FILE_MODE: u32 = 0o600;

/// Why a path failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TamperKind {
    /// Owned by another user.
    Owner { expected: u32, found: u32 },
    /// Group or other permission bits are set.
    Permissions { mode: u32 },
    /// Path is a symlink.
    Symlink,
    /// Expected a directory and found something else, or vice versa.
    FileType,
}

impl fmt::Display for TamperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner { expected, found } => {
                write!(f, "owned by uid {found}, expected uid {expected}")
            }
            Self::Permissions { mode } => write!(f, "mode {mode:o} grants group/other access"),
            Self::Symlink => write!(f, "is a symlink"),
            Self::FileType => write!(f, "has an unexpected file type"),
        }
    }
}

/// Security failures. `Tamper` is fatal for the path involved.
#[derive(Debug)]
pub enum SecurityError {
    Tamper { path: PathBuf, kind: TamperKind },
    InvalidSession(String),
    Io { path: PathBuf, source: io::Error },
}

impl SecurityError {
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::Tamper { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tamper { path, kind } => {
                write!(f, "refusing to use {}: {kind}", path.display())
            }
            Self::InvalidSession(name) => write!(
                f,
                "invalid session name {name:?}: use 1-64 characters from [A-Za-z0-9_-]"
            ),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for SecurityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() }
}

/// Whether a process with `pid` exists. `EPERM` still means it exists.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Check `path` is owned by us with no group/other access and is not a symlink.
pub fn validate_owned(path: &Path) -> Result<Metadata, SecurityError> {
    let meta = fs::symlink_metadata(path).map_err(|e| SecurityError::io(path, e))?;
    let tamper = |kind| {
        tracing::error!(path = %path.display(), %kind, "security violation");
        Err(SecurityError::Tamper {
            path: path.to_path_buf(),
            kind,
        })
    };

    if meta.file_type().is_symlink() {
        return tamper(TamperKind::Symlink);
    }
    let euid = effective_uid();
    if meta.uid() != euid {
        return tamper(TamperKind::Owner {
            expected: euid,
            found: meta.uid(),
        });
    }
    let mode = meta.mode() & 0o777;
    if mode & 0o077 != 0 {
        return tamper(TamperKind::Permissions { mode });
    }
    Ok(meta)
}

/// Create a `0700` directory, or validate an existing one.
pub fn ensure_private_dir(path: &Path) -> Result<(), SecurityError> {
    match DirBuilder::new().mode(DIR_MODE).create(path) {
        Ok(()) => {
            fs::set_permissions(path, Permissions::from_mode(DIR_MODE))
                .map_err(|e| SecurityError::io(path, e))?;
            tracing::debug!(path = %path.display(), "created private directory");
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(SecurityError::io(path, e)),
    }
    let meta = validate_owned(path)?;
    if !meta.is_dir() {
        return Err(SecurityError::Tamper {
            path: path.to_path_buf(),
            kind: TamperKind::FileType,
        });
    }
    Ok(())
}

/// Exclusively create a `0600` file. Fails with `AlreadyExists` if present.
pub fn create_private_file(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(FILE_MODE)
        .open(path)?;
    file.set_permissions(Permissions::from_mode(FILE_MODE))?;
    Ok(file)
}

/// Open an existing file read/write after validating its ownership.
pub fn open_private_file(path: &Path) -> Result<File, SecurityError> {
    let meta = validate_owned(path)?;
    if !meta.is_file() {
        return Err(SecurityError::Tamper {
            path: path.to_path_buf(),
            kind: TamperKind::FileType,
        });
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| SecurityError::io(path, e))
}

/// Session names become path components, so keep them boring.
pub fn validate_session(name: &str) -> Result<(), SecurityError> {
    let ok = (1..=64).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(SecurityError::InvalidSession(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "shmlane_security_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn private_dir_and_file_modes() {
        let dir = scratch("modes");
        ensure_private_dir(&dir).unwrap();
        assert_eq!(fs::metadata(&dir).unwrap().mode() & 0o777, DIR_MODE);
        // Idempotent on an existing, valid directory.
        ensure_private_dir(&dir).unwrap();

        let file_path = dir.join("f");
        create_private_file(&file_path).unwrap();
        assert_eq!(fs::metadata(&file_path).unwrap().mode() & 0o777, FILE_MODE);
        assert_eq!(
            create_private_file(&file_path).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
        open_private_file(&file_path).unwrap();

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn loose_permissions_are_tamper() {
        let dir = scratch("loose");
        ensure_private_dir(&dir).unwrap();
        let file_path = dir.join("f");
        create_private_file(&file_path).unwrap();
        fs::set_permissions(&file_path, Permissions::from_mode(0o644)).unwrap();

        let err = validate_owned(&file_path).unwrap_err();
        assert!(err.is_tamper());
        assert!(matches!(
            err,
            SecurityError::Tamper {
                kind: TamperKind::Permissions { mode: 0o644 },
                ..
            }
        ));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn symlinks_are_tamper() {
        let dir = scratch("symlink");
        ensure_private_dir(&dir).unwrap();
        let target = dir.join("target");
        create_private_file(&target).unwrap();
        let link = dir.join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(matches!(
            validate_owned(&link),
            Err(SecurityError::Tamper {
                kind: TamperKind::Symlink,
                ..
            })
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn session_names() {
        validate_session("editor-1_a").unwrap();
        assert!(validate_session("").is_err());
        assert!(validate_session("../etc").is_err());
        assert!(validate_session(&"x".repeat(65)).is_err());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }
}

//! Per-user, per-boot addressing.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::security::{self, SecurityError};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const FALLBACK_BOOT: &str = "00000000";

/// Where a listener lives: a session name, optionally with a simulated
/// identity.
///
/// The user id and boot id default to the real effective uid and kernel
/// boot id. Overrides exist so tests can simulate other users or reboots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    session: String,
    uid: Option<u32>,
    boot_id: Option<String>,
}

impl Address {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            uid: None,
            boot_id: None,
        }
    }

    pub fn with_user(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_boot(mut self, boot_id: impl Into<String>) -> Self {
        self.boot_id = Some(boot_id.into());
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

/// Resolved directory layout for one address.
#[derive(Debug, Clone)]
pub struct Namespace {
    base: PathBuf,
    root: PathBuf,
    locks: PathBuf,
    segments: PathBuf,
    uid: u32,
    boot: String,
    session: String,
}

impl Namespace {
    /// Compute paths for `address` under the configured base path. Touches nothing.
    pub fn resolve(address: &Address, config: &TransportConfig) -> Result<Self, TransportError> {
        security::validate_session(&address.session)?;
        let uid = address.uid.unwrap_or_else(security::effective_uid);
        let boot = match &address.boot_id {
            Some(id) => short_boot(id),
            None => current_boot(),
        };
        let base = config.base_path.clone();
        let root = base.join(dir_name(uid, &address.session, &boot));
        Ok(Self {
            locks: root.join("locks"),
            segments: root.join("segments"),
            root,
            base,
            uid,
            boot,
            session: address.session.clone(),
        })
    }

    /// Create the private directory tree, validating whatever already exists.
    pub fn create_dirs(&self) -> Result<(), SecurityError> {
        security::ensure_private_dir(&self.root)?;
        security::ensure_private_dir(&self.locks)?;
        security::ensure_private_dir(&self.segments)?;
        Ok(())
    }

    /// Validate an existing tree without creating anything. Client side.
    pub fn check_existing(&self) -> Result<(), TransportError> {
        if !self.root.is_dir() {
            return Err(TransportError::NoListener {
                path: self.root.clone(),
            });
        }
        security::validate_owned(&self.root)?;
        security::validate_owned(&self.locks)?;
        security::validate_owned(&self.segments)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks
    }

    pub fn segments_dir(&self) -> &Path {
        &self.segments
    }

    pub fn boot(&self) -> &str {
        &self.boot
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn lock_path(&self, slot_id: u32) -> PathBuf {
        self.locks.join(format!("slot-{slot_id}.lock"))
    }

    pub fn segment_path(&self, slot_id: u32) -> PathBuf {
        self.segments.join(format!("slot-{slot_id}.seg"))
    }

    pub fn listener_lock_path(&self) -> PathBuf {
        self.root.join("listener.lock")
    }

    /// Sibling namespace directories for this user and session from other boots.
    pub fn stale_boot_dirs(&self) -> Vec<PathBuf> {
        let prefix = format!("shmlane-u{}-{}-b", self.uid, self.session);
        let Ok(entries) = fs::read_dir(&self.base) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let boot = name.strip_prefix(&prefix)?;
                (boot != self.boot && boot.len() == 8).then(|| entry.path())
            })
            .collect()
    }
}

fn dir_name(uid: u32, session: &str, boot: &str) -> String {
    format!("shmlane-u{uid}-{session}-b{boot}")
}

fn short_boot(id: &str) -> String {
    let hex: String = id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    if hex.len() == 8 {
        hex
    } else {
        FALLBACK_BOOT.to_string()
    }
}

/// First 8 hex digits of the kernel boot id, or `00000000` where unavailable.
pub fn current_boot() -> String {
    match fs::read_to_string(BOOT_ID_PATH) {
        Ok(id) => short_boot(id.trim()),
        Err(_) => FALLBACK_BOOT.to_string(),
    }
}

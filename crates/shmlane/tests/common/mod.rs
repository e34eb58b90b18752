#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use shmlane::{BackoffConfig, TransportConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A private base directory, removed on drop.
pub struct TempBase {
    pub path: PathBuf,
}

impl TempBase {
    pub fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("shmlane_it_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn config(&self) -> TransportConfig {
        TransportConfig::builder()
            .base_path(self.path.clone())
            .buffer_size(256 * 1024)
            .warm_pool_size(4)
            .max_slots(64)
            .backoff(patient_backoff())
            .build()
            .unwrap()
    }
}

impl Drop for TempBase {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Generous enough for a busy CI machine to drain a ring.
pub fn patient_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(50),
        max_attempts: 200,
    }
}

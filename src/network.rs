/// Host network link state
use log::info;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const POLL_SECS: u64 = 5;

/// Whether any non-loopback interface has its link up
#[derive(Debug, Default)]
pub struct NetworkStatus {
    up: AtomicBool,
}

impl NetworkStatus {
    pub fn new(up: bool) -> Self {
        NetworkStatus {
            up: AtomicBool::new(up),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn set(&self, up: bool) {
        if self.up.swap(up, Ordering::AcqRel) != up {
            info!("Network {}", if up { "available" } else { "lost" });
        }
    }
}

/// Scan a sysfs-style class directory for an interface whose operstate is `up`
pub async fn any_link_up(class_dir: &Path) -> bool {
    let mut entries = match tokio::fs::read_dir(class_dir).await {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name() == "lo" {
            continue;
        }
        if let Ok(state) = tokio::fs::read_to_string(entry.path().join("operstate")).await {
            if state.trim() == "up" {
                return true;
            }
        }
    }
    false
}

pub async fn monitor(status: Arc<NetworkStatus>, class_dir: PathBuf) {
    loop {
        status.set(any_link_up(&class_dir).await);
        sleep(Duration::from_secs(POLL_SECS)).await;
    }
}

/// Durable store-and-forward queue of telemetry records
///
/// Every captured record is written to storage before anything tries to
/// send it, and stays there until the delivery pipeline has seen both the
/// broker acknowledgment and the downstream confirmation for it.
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::ClockSync;
use crate::models::TelemetryRecord;
use crate::storage::Storage;
use crate::utils::{format_datetime, iso_timestamp, patch_timestamps};

/// Suffix of entries captured before the clock was synchronized
pub const UNSYNCHRONIZED_MARKER: &str = "_notSynch";

/// Parsed queue entry name: `<ticks>` or `<ticks>_notSynch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryName {
    pub ticks: i64,
    pub synchronized: bool,
}

impl EntryName {
    /// Anything else in the storage directory is administrative
    pub fn parse(name: &str) -> Option<Self> {
        let (digits, synchronized) = match name.strip_suffix(UNSYNCHRONIZED_MARKER) {
            Some(digits) => (digits, false),
            None => (name, true),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let ticks = digits.parse().ok()?;
        Some(EntryName {
            ticks,
            synchronized,
        })
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.synchronized {
            write!(f, "{}", self.ticks)
        } else {
            write!(f, "{}{}", self.ticks, UNSYNCHRONIZED_MARKER)
        }
    }
}

pub struct DurableQueue<S> {
    storage: S,
    clock: Arc<ClockSync>,
    device_id: String,
    /// Storage serves one operation at a time
    io: Mutex<()>,
    recovered: AtomicBool,
    /// Unsynchronized entries written by this process; their offset is still known
    unsynced_this_boot: Mutex<HashSet<String>>,
}

impl<S: Storage> DurableQueue<S> {
    pub fn new(storage: S, clock: Arc<ClockSync>, device_id: &str) -> Self {
        DurableQueue {
            storage,
            clock,
            device_id: device_id.to_string(),
            io: Mutex::new(()),
            recovered: AtomicBool::new(false),
            unsynced_this_boot: Mutex::new(HashSet::new()),
        }
    }

    fn io(&self) -> MutexGuard<'_, ()> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsynced(&self) -> MutexGuard<'_, HashSet<String>> {
        self.unsynced_this_boot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self) -> bool {
        self.storage.is_available()
    }

    /// Mount storage if it went away
    ///
    /// A fresh mount starts a new mount lifetime, so startup recovery runs
    /// again on it.
    pub fn ensure_mounted(&self) -> bool {
        if self.storage.is_available() {
            return true;
        }
        let _io = self.io();
        match self.storage.mount() {
            Ok(()) => {
                info!("Storage mounted");
                self.recovered.store(false, Ordering::Release);
                true
            }
            Err(e) => {
                warn!("Storage mount failed: {}", e);
                false
            }
        }
    }

    /// Persist a record; returns the entry name
    pub fn enqueue(&self, record: &TelemetryRecord) -> Option<String> {
        let name = EntryName {
            ticks: record.captured.ticks,
            synchronized: record.captured.synchronized,
        }
        .to_string();

        let data = match serde_json::to_vec(&record.to_document(&self.device_id)) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to serialize record {}: {}", name, e);
                return None;
            }
        };

        let result = {
            let _io = self.io();
            self.storage.write(&name, &data)
        };
        if let Err(e) = result {
            error!("Failed to write {}: {}", name, e);
            return None;
        }

        if !record.captured.synchronized {
            self.unsynced().insert(name.clone());
        }
        info!(
            "The file {} has been written (captured {})",
            name,
            format_datetime(record.captured.ticks)
        );
        Some(name)
    }

    /// Delete unsynchronized entries left over from an earlier boot
    ///
    /// Their correcting offset died with that boot. Runs once per mount
    /// lifetime; later calls return 0 without touching storage.
    pub fn recover_at_startup(&self) -> usize {
        if self.recovered.load(Ordering::Acquire) {
            return 0;
        }

        let names = {
            let _io = self.io();
            match self.storage.list() {
                Ok(names) => names,
                Err(e) => {
                    warn!("Startup recovery postponed, storage unavailable: {}", e);
                    return 0;
                }
            }
        };

        let stale: Vec<String> = {
            let ours = self.unsynced();
            names
                .into_iter()
                .filter(|name| matches!(EntryName::parse(name), Some(entry) if !entry.synchronized))
                .filter(|name| !ours.contains(name))
                .collect()
        };

        let mut deleted = 0;
        for name in &stale {
            if self.delete(name) {
                deleted += 1;
            }
        }

        self.recovered.store(true, Ordering::Release);
        if deleted > 0 {
            warn!("Deleted {} unrecoverable unsynchronized record(s)", deleted);
        } else {
            debug!("Startup recovery found nothing to delete");
        }
        deleted
    }

    /// Move an unsynchronized entry to its corrected capture time
    ///
    /// Applies the first sync offset to both the name and every
    /// `iso_timestamp` in the payload, writes the corrected entry and then
    /// deletes the old one. Returns the new name, or `None` while the clock
    /// is unsynchronized or when storage fails.
    pub fn rename_if_synchronized(&self, name: &str) -> Option<String> {
        let entry = EntryName::parse(name)?;
        if entry.synchronized {
            return Some(name.to_string());
        }
        if !self.clock.is_synchronized() {
            return None;
        }
        if !self.unsynced().contains(name) {
            // Written by an earlier boot; this boot's offset does not apply
            debug!("{} awaits startup recovery, not renaming", name);
            return None;
        }
        let offset = self.clock.first_offset()?;

        let corrected = EntryName {
            ticks: entry.ticks + offset,
            synchronized: true,
        };
        let new_name = corrected.to_string();

        let _io = self.io();
        let data = match self.storage.read(name) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to read {} for rename: {}", name, e);
                return None;
            }
        };
        let text = String::from_utf8_lossy(&data);
        let patched = match patch_timestamps(&text, &iso_timestamp(corrected.ticks)) {
            Some(patched) => patched,
            None => {
                error!("Malformed timestamps in {}, leaving it in place", name);
                return None;
            }
        };

        if let Err(e) = self.storage.write(&new_name, patched.as_bytes()) {
            warn!("Failed to write {}: {}", new_name, e);
            return None;
        }
        if let Err(e) = self.storage.delete(name) {
            // The corrected copy exists; a leftover original is deleted by
            // the next startup recovery
            warn!("Failed to delete {} after rename: {}", name, e);
        }
        self.unsynced().remove(name);

        info!("Renamed {} to {}", name, new_name);
        Some(new_name)
    }

    /// Entry names currently on storage (empty when unavailable)
    pub fn list(&self) -> Vec<String> {
        let _io = self.io();
        match self.storage.list() {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list storage: {}", e);
                Vec::new()
            }
        }
    }

    pub fn read(&self, name: &str) -> Option<Vec<u8>> {
        let _io = self.io();
        match self.storage.read(name) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Failed to read {}: {}", name, e);
                None
            }
        }
    }

    pub fn delete(&self, name: &str) -> bool {
        let _io = self.io();
        match self.storage.delete(name) {
            Ok(()) => {
                debug!("Deleted {}", name);
                true
            }
            Err(e) => {
                warn!("Failed to delete {}: {}", name, e);
                false
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.list().iter().any(|n| n == name)
    }
}

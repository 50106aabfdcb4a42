/// Directory-backed storage for queue entries
use log::{debug, warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::storage::Storage;

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Entries live as `<name>.json` inside `root`
///
/// Writes land in a temporary file that is synced and renamed over the
/// final name, so a power cut leaves either the old state or the new one.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, ENTRY_EXTENSION))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, TEMP_EXTENSION))
    }

    /// Remove writes torn by a power cut
    fn remove_stale_temp_files(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                debug!("Removing torn write {}", path.display());
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }
}

impl Storage for FsStorage {
    fn mount(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        self.remove_stale_temp_files()
    }

    fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.entry_path(name))
    }

    fn write(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let temp = self.temp_path(name);
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.entry_path(name))
    }

    fn delete(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.entry_path(name))
    }
}

pub mod fs;
pub mod queue;

pub use fs::FsStorage;
pub use queue::{DurableQueue, EntryName};

use std::io;

/// Non-volatile storage holding queue entries by name
///
/// Names never include the on-disk extension. Every operation may fail
/// while the medium is absent or unmounted.
pub trait Storage: Send + Sync {
    /// Make the medium usable; safe to call when already mounted
    fn mount(&self) -> io::Result<()>;
    fn is_available(&self) -> bool;
    fn list(&self) -> io::Result<Vec<String>>;
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
    fn write(&self, name: &str, data: &[u8]) -> io::Result<()>;
    fn delete(&self, name: &str) -> io::Result<()>;
}

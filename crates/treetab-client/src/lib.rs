pub mod directory;
#[cfg(unix)]
pub mod wire_client;

pub use directory::{DirectoryError, TabDirectory};
#[cfg(unix)]
pub use wire_client::{WireDirectory, WireDirectoryConfig};

mod memory;
pub mod path;
mod remote;

pub use memory::{MemoryRemote, RemoteCall};
pub use remote::{MIME_DIR, RemoteConnector, RemoteError, RemoteFile};

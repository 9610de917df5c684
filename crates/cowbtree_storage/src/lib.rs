//! # cowbtree storage
//!
//! Log devices for the cowbtree journal.
//!
//! A backend is an **opaque, append-only byte store**. The journal decides
//! what the bytes mean; backends only promise that appended bytes can be
//! read back at the offset `append` returned, and that `sync` makes them
//! survive a crash.
//!
//! - [`InMemoryBackend`] keeps the log in a shared buffer. Clones share the
//!   buffer, so a test can keep a handle to the "device" while the store
//!   that owns it is torn down.
//! - [`FileBackend`] keeps the log in a regular file.
//!
//! ```rust
//! use cowbtree_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut device = InMemoryBackend::new();
//! let offset = device.append(b"entry").unwrap();
//! assert_eq!(device.read_at(offset, 5).unwrap(), b"entry");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

//! # Storage driver contract
//!
//! The [`Driver`] trait every storage backend implements, the
//! [`FileWriter`] which gives drivers commit/cancel semantics, and the
//! shared [`StorageError`] type.

mod driver;
mod error;
mod writer;

pub use driver::check_path;
pub use driver::Driver;
pub use driver::Metadata;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use writer::{FileWriter, WriterState};

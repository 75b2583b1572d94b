//! Object store adapters

pub mod memory;
pub mod s3;
pub mod traits;

pub use memory::MemoryStore;
pub use s3::S3Store;
pub use traits::{CompletedPartRecord, ObjectEntry, ObjectStore, PartRecord, StorageError, UploadRecord};

pub mod backend;
pub mod error;
pub mod landing;

pub use backend::{LocalBackend, S3Backend, StorageBackend};
pub use error::StorageError;
pub use landing::{GuardedLandingStore, LandingStore, ObjectInfo, ObjectLandingStore};

pub mod config;
pub mod error;
pub mod storage;
pub mod utils;

pub use error::StorageError;
pub use storage::blob_store::BlobStore;
pub use storage::blob_writer::{BlobWriter, ProvisionalDescriptor};
pub use storage::descriptor::Descriptor;
pub use storage::linked_blob_store::{BlobCreation, CreateOptions, LinkedBlobStore, MountOptions};
pub use storage::purge::{PurgeReport, UploadPurger, purge_uploads};
pub use storage::registry::{Registry, RegistryOptions, Repository};

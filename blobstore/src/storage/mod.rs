pub mod blob_store;
pub mod blob_writer;
pub mod descriptor;
pub mod driver;
pub mod linked_blob_store;
pub mod paths;
pub mod purge;
pub mod registry;

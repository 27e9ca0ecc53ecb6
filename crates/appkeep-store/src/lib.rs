mod error;
mod inventory_store;
mod package_store;

pub use error::StoreError;
pub use inventory_store::{
    validate_identity, FileInventoryStore, InventoryStore, MemoryInventoryStore,
};
pub use package_store::{
    open_package_store, ByteStream, FsPackageStore, HttpPackageStore, PackageMetadata,
    PackageStore,
};

mod archive;
mod event;
mod inventory;
mod names;
mod package;

pub use archive::ArchiveKind;
pub use event::{ErrorKind, ProgressEvent, KEEPALIVE_FRAME};
pub use inventory::InventoryEntry;
pub use names::{compact_name, name_key, normalize_name, significant_words};
pub use package::{PackageReference, ReferenceError};

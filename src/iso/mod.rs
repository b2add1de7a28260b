//! ISO9660 image construction, with optional Joliet, Rock Ridge and El
//! Torito extensions, plus the record layouts the image reader shares.
//!
//! Images are built in one batch: entries only fill a [`StagingTree`] and
//! the image pass lays out every area before writing it in order
//! (system area, volume descriptors, boot catalog, path tables, directory
//! records, boot image, file contents).

mod hierarchy;
mod image;
mod layout;
pub mod names;
mod options;
pub(crate) mod records;
pub(crate) mod stages;
mod tree;

pub(crate) use image::{write_image, IsoModel};
pub use layout::{Extent, ImageLayout};
pub use options::{ElToritoOptions, IsoOptions, MAX_JOLIET_VOLUME_ID_LEN, MAX_VOLUME_ID_LEN};
pub use records::SECTOR_SIZE;
pub use tree::{FileContent, NodeId, StagingTree, MAX_FILE_SIZE};

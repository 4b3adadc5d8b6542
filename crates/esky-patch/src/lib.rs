mod apply;
mod codec;
mod container;
mod delta;
mod diff;
mod ops;
mod tree;
mod varint;

pub use apply::{apply_patch, apply_patch_in_place};
pub use codec::{
    decode_patch, encode_patch, read_patch, read_patch_file, write_patch, write_patch_file,
    PATCH_FORMAT_VERSION, PATCH_MAGIC,
};
pub use container::{build_container, is_container};
pub use delta::apply_delta;
#[cfg(feature = "delta-generate")]
pub use delta::generate_delta;
pub use diff::diff_trees;
pub use ops::{ContainerEntry, ContainerLayout, EntryCompression, PatchOp, PatchSet};

#[cfg(test)]
mod tests;

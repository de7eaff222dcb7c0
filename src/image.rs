// Backing image contract
// The actual file I/O and format detection live outside this crate; the
// storage controller only sees these traits.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Size of one device block in bytes.
pub const BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Error)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(PathBuf),
    #[error("unusable image: {0}")]
    Rejected(String),
    #[error("image i/o failure: {0}")]
    Io(String),
}

/// An open, block-addressable backing image. Closing is `Drop`; the drive
/// record owning the box is the only owner of the handle.
pub trait BlockImage {
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), ImageError>;
    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), ImageError>;

    /// Current extent of the image in bytes.
    fn size(&self) -> u64;

    /// Full pathname of the backing file.
    fn pathname(&self) -> &Path;
}

pub struct OpenedImage {
    pub image: Box<dyn BlockImage>,
    pub write_protected: bool,
}

pub trait ImageCodec {
    fn open(
        &self,
        path: &Path,
        create_if_missing: bool,
        expect_floppy: bool,
    ) -> Result<OpenedImage, ImageError>;

    /// Canonicalize a path the way `open` would resolve it. Used to detect
    /// the same backing file being mounted twice.
    fn resolve(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}

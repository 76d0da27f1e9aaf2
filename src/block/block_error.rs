use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

/// Error type for block device operations
#[derive(Debug)]
pub enum BlockError {
    /// The block index is out of bounds (at or past the device size)
    OutOfBounds,
    /// The buffer has an invalid size (not `BLOCK_SIZE`)
    BufferInvalid,
    /// The device size is not a whole number of blocks, or is too large
    /// to be addressed
    BadGeometry,
    /// I/O error from the underlying device
    Io(io::Error),
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds => write!(f, "block index out of bounds"),
            Self::BufferInvalid => write!(f, "invalid buffer size (not `BLOCK_SIZE`)"),
            Self::BadGeometry => write!(f, "device size is not a whole number of blocks"),
            Self::Io(err) => write!(f, "device I/O error: {err}"),
        }
    }
}

impl Error for BlockError {}

impl From<io::Error> for BlockError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

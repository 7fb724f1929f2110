//! Files of a torrent and blocking range readers over them.

pub mod file;
pub mod pieces;
pub mod reader;

pub use file::File;
pub use pieces::region_pieces;
pub use reader::{ByteRange, Reader, ReaderCloseGuard, ReaderCursor, ReaderRegistry, ReaderState};

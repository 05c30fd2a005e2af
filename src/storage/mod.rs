//! Storage module
//!
//! Piece assembly, hash verification and the on-disk file layout.

pub mod file;
pub mod piece;
pub mod store;

// Re-export file storage types
pub use file::FileStorage;

// Re-export piece types
pub use piece::{hash_matches, PieceBuffer};

// Re-export store types
pub use store::{DiskEvent, PieceStore};

//! Binary wire formats for the synced object store: the version-file layout
//! table and the transient upload-header sidecar. Kept as a separate crate
//! so the codec can be unit-tested and versioned independently of the
//! higher-level store logic that uses it.

pub mod error;
pub mod layout;
pub mod upload_header;

pub use error::WireError;
pub use layout::{ChunkSource, FiniteChunk, LayoutTable};
pub use upload_header::UploadHeaderSidecar;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad magic bytes: {0:?}")]
    BadMagic([u8; 4]),

    #[error("unknown chunk source kind: {0}")]
    UnknownChunkKind(u8),

    #[error("header length mismatch: local={local}, upload={upload}")]
    HeaderLengthMismatch { local: usize, upload: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;

//! Transient `<n>.upload` sidecar written while an upload is in flight.
//!
//! On-disk shape (big-endian):
//!
//! ```text
//! local_version     u64   (bytes 0..8)
//! upload_version    u64   (bytes 8..16)
//! header_len        u32   (bytes 16..20, H below)
//! local_header      H bytes
//! upload_header     H bytes
//! ```
//!
//! The spec describes the two header slots as fixed-size (`16..16+H` and
//! `16+H..16+2H`); since both slots share one length, we persist `H` once
//! rather than duplicating it, and reject a mismatched pair at construction.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Result, WireError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeaderSidecar {
    pub local_version: u64,
    pub upload_version: u64,
    pub local_header: Vec<u8>,
    pub upload_header: Vec<u8>,
}

impl UploadHeaderSidecar {
    pub fn new(
        local_version: u64,
        upload_version: u64,
        local_header: Vec<u8>,
        upload_header: Vec<u8>,
    ) -> Result<Self> {
        if local_header.len() != upload_header.len() {
            return Err(WireError::HeaderLengthMismatch {
                local: local_header.len(),
                upload: upload_header.len(),
            });
        }
        Ok(Self {
            local_version,
            upload_version,
            local_header,
            upload_header,
        })
    }

    pub fn encode<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_u64::<BigEndian>(self.local_version)?;
        w.write_u64::<BigEndian>(self.upload_version)?;
        w.write_u32::<BigEndian>(self.local_header.len() as u32)?;
        w.write_all(&self.local_header)?;
        w.write_all(&self.upload_header)?;
        Ok(())
    }

    pub fn decode<R: Read>(mut r: R) -> Result<Self> {
        let local_version = r.read_u64::<BigEndian>()?;
        let upload_version = r.read_u64::<BigEndian>()?;
        let header_len = r.read_u32::<BigEndian>()? as usize;
        let mut local_header = vec![0u8; header_len];
        r.read_exact(&mut local_header)?;
        let mut upload_header = vec![0u8; header_len];
        r.read_exact(&mut upload_header)?;
        Ok(Self {
            local_version,
            upload_version,
            local_header,
            upload_header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let sidecar =
            UploadHeaderSidecar::new(3, 7, b"local-hdr".to_vec(), b"uploadhdr".to_vec()).unwrap();
        let mut buf = Vec::new();
        sidecar.encode(&mut buf).unwrap();
        let decoded = UploadHeaderSidecar::decode(&buf[..]).unwrap();
        assert_eq!(decoded, sidecar);
    }

    #[test]
    fn rejects_mismatched_header_lengths() {
        let result = UploadHeaderSidecar::new(1, 2, b"short".to_vec(), b"longer-header".to_vec());
        assert!(matches!(
            result,
            Err(WireError::HeaderLengthMismatch { .. })
        ));
    }

    #[test]
    fn empty_headers_round_trip() {
        let sidecar = UploadHeaderSidecar::new(1, 2, vec![], vec![]).unwrap();
        let mut buf = Vec::new();
        sidecar.encode(&mut buf).unwrap();
        let decoded = UploadHeaderSidecar::decode(&buf[..]).unwrap();
        assert_eq!(decoded, sidecar);
    }
}

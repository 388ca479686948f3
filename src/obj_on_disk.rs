//! `ObjOnDisk` — a single version file: header, segment table, segment bytes.
//!
//! The segment table is the `synced-store-wire` crate's `LayoutTable`;
//! this module owns the file handle, the write-side assembly of a new
//! version, and the random-access reconstruction of a logical byte range
//! out of present and base-referenced segments.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use synced_store_wire::{ChunkSource, FiniteChunk, LayoutTable};

use crate::error::{Result, StoreError};
use crate::ports::ByteRange;

fn intersect(a: ByteRange, b: ByteRange) -> ByteRange {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    if end > start {
        ByteRange { start, end }
    } else {
        ByteRange { start, end: start }
    }
}

/// One version file, opened for random-access reads.
pub struct ObjOnDisk {
    path: PathBuf,
    version: u64,
    layout: LayoutTable,
}

impl ObjOnDisk {
    /// Open an already-written version file and decode its layout table.
    pub fn for_existing_file(path: PathBuf, version: u64) -> Result<Self> {
        let mut file = File::open(&path)?;
        let layout = LayoutTable::decode(&mut file)?;
        Ok(Self {
            path,
            version,
            layout,
        })
    }

    /// Write a version whose full layout and segment bytes are already
    /// known (a whole download, or a locally-absorbed version), atomically.
    pub fn create_file_for_existing_version(
        folder: &Path,
        version: u64,
        ext: &str,
        layout: LayoutTable,
        segment_bytes: &[u8],
    ) -> Result<Self> {
        let path = folder.join(format!("{version}.{ext}"));
        write_atomic(&path, &layout, segment_bytes)?;
        Ok(Self {
            path,
            version,
            layout,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &LayoutTable {
        &self.layout
    }

    /// A random-access reader over this version's logical byte stream,
    /// optionally chained to a reader for its base version.
    pub fn get_src(&self) -> Result<ObjSource> {
        let file = File::open(&self.path)?;
        Ok(ObjSource {
            layout: self.layout.clone(),
            file,
            segment_data_ofs: self.layout.encoded_len(),
            base: None,
        })
    }

    /// Segments of `range` already materialised on disk for this version,
    /// without resolving base references — what `Downloader` does *not*
    /// need to fetch.
    pub fn read_segs_only_from_disk(&self, range: ByteRange) -> Vec<FiniteChunk> {
        self.layout
            .chunks
            .iter()
            .filter(|c| c.is_present())
            .filter(|c| {
                let chunk_range = ByteRange {
                    start: c.this_ver_ofs,
                    end: c.end_ofs(),
                };
                !intersect(chunk_range, range).is_empty()
            })
            .copied()
            .collect()
    }

    /// Rewrite every `Base`-sourced segment into a `Present` one by copying
    /// its bytes out of `base_src`, then persist the new layout atomically.
    /// Once this returns, the version no longer depends on its base file.
    pub fn absorb_immediate_base_version(&mut self, base_src: &mut ObjSource) -> Result<()> {
        let mut segment_bytes = Vec::new();
        let mut new_chunks = Vec::with_capacity(self.layout.chunks.len());

        // First pass: copy through bytes already present in this file.
        let mut file = File::open(&self.path)?;
        let segment_data_ofs = self.layout.encoded_len();

        for chunk in &self.layout.chunks {
            let disk_ofs = segment_bytes.len() as u64;
            match chunk.source {
                ChunkSource::Present { disk_ofs: src_ofs } => {
                    file.seek(SeekFrom::Start(segment_data_ofs + src_ofs))?;
                    let mut buf = vec![0u8; chunk.len as usize];
                    file.read_exact(&mut buf)?;
                    segment_bytes.extend_from_slice(&buf);
                }
                ChunkSource::Base { base_ofs } => {
                    let bytes = base_src.read_range(ByteRange {
                        start: base_ofs,
                        end: base_ofs + chunk.len,
                    })?;
                    segment_bytes.extend_from_slice(&bytes);
                }
            }
            new_chunks.push(FiniteChunk {
                this_ver_ofs: chunk.this_ver_ofs,
                len: chunk.len,
                source: ChunkSource::Present { disk_ofs },
            });
        }

        let new_layout = LayoutTable::new(self.layout.header.clone(), new_chunks);
        write_atomic(&self.path, &new_layout, &segment_bytes)?;
        self.layout = new_layout;
        Ok(())
    }

    /// Re-label any segment whose bytes are identical to a range of the
    /// remote base (per `reuse`, computed upstream from the plaintext
    /// chunking the encryption pipeline used) as a `Base` reference, so the
    /// upload can skip re-sending bytes the server already has.
    pub fn diff_from_base(&self, reuse: &[ReuseHint]) -> LayoutTable {
        let chunks = self
            .layout
            .chunks
            .iter()
            .map(|chunk| {
                if let Some(hint) = reuse
                    .iter()
                    .find(|h| h.this_ver_ofs == chunk.this_ver_ofs && h.len == chunk.len)
                {
                    FiniteChunk {
                        this_ver_ofs: chunk.this_ver_ofs,
                        len: chunk.len,
                        source: ChunkSource::Base {
                            base_ofs: hint.base_ofs,
                        },
                    }
                } else {
                    *chunk
                }
            })
            .collect();
        LayoutTable::new(self.layout.header.clone(), chunks)
    }

    /// Move the file (e.g. `<n>.unsynced` -> `<n>.v` on upload completion,
    /// per I3) and keep serving reads from the new path. If the server
    /// rewrote the header during upload (`header_change`), the layout is
    /// rewritten with the new header before the move so reads see it.
    pub fn move_file_and_proxy_this(
        &mut self,
        new_path: PathBuf,
        header_change: Option<Vec<u8>>,
    ) -> Result<()> {
        if let Some(new_header) = header_change {
            let mut file = File::open(&self.path)?;
            let segment_data_ofs = self.layout.encoded_len();
            let present_len: u64 = self
                .layout
                .chunks
                .iter()
                .filter(|c| c.is_present())
                .map(|c| c.len)
                .sum();
            file.seek(SeekFrom::Start(segment_data_ofs))?;
            let mut segment_bytes = vec![0u8; present_len as usize];
            file.read_exact(&mut segment_bytes)?;

            let new_layout = LayoutTable::new(new_header, self.layout.chunks.clone());
            write_atomic(&self.path, &new_layout, &segment_bytes)?;
            self.layout = new_layout;
        }
        std::fs::rename(&self.path, &new_path)?;
        self.path = new_path;
        Ok(())
    }
}

/// A hint that a range of a new version's bytes is identical to a range of
/// its base, supplied by the caller once the encryption pipeline's chunking
/// has been compared against the base's content hashes.
#[derive(Debug, Clone, Copy)]
pub struct ReuseHint {
    pub this_ver_ofs: u64,
    pub len: u64,
    pub base_ofs: u64,
}

/// Builder for a new version file assembled incrementally from chunks of
/// freshly-written bytes and/or references into a base version.
pub struct NewVersionWriter {
    folder: PathBuf,
    version: u64,
    header: Vec<u8>,
    chunks: Vec<FiniteChunk>,
    segment_bytes: Vec<u8>,
    next_ofs: u64,
}

impl NewVersionWriter {
    pub fn new(folder: PathBuf, version: u64, header: Vec<u8>) -> Self {
        Self {
            folder,
            version,
            header,
            chunks: Vec::new(),
            segment_bytes: Vec::new(),
            next_ofs: 0,
        }
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        let disk_ofs = self.segment_bytes.len() as u64;
        self.chunks.push(FiniteChunk {
            this_ver_ofs: self.next_ofs,
            len: bytes.len() as u64,
            source: ChunkSource::Present { disk_ofs },
        });
        self.segment_bytes.extend_from_slice(bytes);
        self.next_ofs += bytes.len() as u64;
    }

    pub fn append_base_ref(&mut self, len: u64, base_ofs: u64) {
        self.chunks.push(FiniteChunk {
            this_ver_ofs: self.next_ofs,
            len,
            source: ChunkSource::Base { base_ofs },
        });
        self.next_ofs += len;
    }

    /// Write the assembled version to `<version>.unsynced` atomically.
    pub fn finish(self) -> Result<ObjOnDisk> {
        let path = self.folder.join(format!("{}.unsynced", self.version));
        let layout = LayoutTable::new(self.header, self.chunks);
        write_atomic(&path, &layout, &self.segment_bytes)?;
        Ok(ObjOnDisk {
            path,
            version: self.version,
            layout,
        })
    }
}

/// A random-access reader for one version's logical byte stream, optionally
/// chained to its base for `Base`-sourced segments.
pub struct ObjSource {
    layout: LayoutTable,
    file: File,
    segment_data_ofs: u64,
    base: Option<Box<ObjSource>>,
}

impl ObjSource {
    pub fn with_base(mut self, base: ObjSource) -> Self {
        self.base = Some(Box::new(base));
        self
    }

    pub fn total_len(&self) -> u64 {
        self.layout.total_len()
    }

    pub fn header(&self) -> &[u8] {
        &self.layout.header
    }

    pub fn read_range(&mut self, range: ByteRange) -> Result<Bytes> {
        let mut out = Vec::with_capacity(range.len() as usize);
        let chunks = self.layout.chunks.clone();
        for chunk in &chunks {
            let chunk_range = ByteRange {
                start: chunk.this_ver_ofs,
                end: chunk.end_ofs(),
            };
            let overlap = intersect(chunk_range, range);
            if overlap.is_empty() {
                continue;
            }
            let skip = overlap.start - chunk.this_ver_ofs;
            match chunk.source {
                ChunkSource::Present { disk_ofs } => {
                    self.file
                        .seek(SeekFrom::Start(self.segment_data_ofs + disk_ofs + skip))?;
                    let mut buf = vec![0u8; overlap.len() as usize];
                    self.file.read_exact(&mut buf)?;
                    out.extend_from_slice(&buf);
                }
                ChunkSource::Base { base_ofs } => {
                    let base = self
                        .base
                        .as_mut()
                        .ok_or(StoreError::NoBaseVersion(chunk.this_ver_ofs))?;
                    let base_start = base_ofs + skip;
                    let bytes = base.read_range(ByteRange {
                        start: base_start,
                        end: base_start + overlap.len(),
                    })?;
                    out.extend_from_slice(&bytes);
                }
            }
        }
        Ok(Bytes::from(out))
    }
}

fn write_atomic(path: &Path, layout: &LayoutTable, segment_bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        layout.encode(&mut tmp)?;
        tmp.write_all(segment_bytes)?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_whole_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = NewVersionWriter::new(dir.path().to_path_buf(), 1, b"hdr".to_vec());
        writer.append_bytes(b"hello ");
        writer.append_bytes(b"world");
        let obj = writer.finish().unwrap();

        let mut src = obj.get_src().unwrap();
        let bytes = src.read_range(ByteRange { start: 0, end: 11 }).unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[test]
    fn partial_range_reads_only_requested_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = NewVersionWriter::new(dir.path().to_path_buf(), 1, vec![]);
        writer.append_bytes(b"0123456789");
        let obj = writer.finish().unwrap();

        let mut src = obj.get_src().unwrap();
        let bytes = src.read_range(ByteRange { start: 2, end: 5 }).unwrap();
        assert_eq!(&bytes[..], b"234");
    }

    #[test]
    fn absorb_base_version_makes_segments_present() {
        let dir = tempfile::tempdir().unwrap();

        let mut base_writer = NewVersionWriter::new(dir.path().to_path_buf(), 1, vec![]);
        base_writer.append_bytes(b"AAAABBBB");
        let base = base_writer.finish().unwrap();

        let folder = dir.path().to_path_buf();
        let path = folder.join("2.unsynced");
        let layout = LayoutTable::new(
            vec![],
            vec![FiniteChunk {
                this_ver_ofs: 0,
                len: 4,
                source: ChunkSource::Base { base_ofs: 4 },
            }],
        );
        write_atomic(&path, &layout, &[]).unwrap();
        let mut derived = ObjOnDisk {
            path,
            version: 2,
            layout,
        };

        let mut base_src = base.get_src().unwrap();
        derived.absorb_immediate_base_version(&mut base_src).unwrap();
        assert!(derived.layout.chunks[0].is_present());

        let mut src = derived.get_src().unwrap();
        let bytes = src.read_range(ByteRange { start: 0, end: 4 }).unwrap();
        assert_eq!(&bytes[..], b"BBBB");
    }

    #[test]
    fn diff_from_base_relabels_matching_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = NewVersionWriter::new(dir.path().to_path_buf(), 1, vec![]);
        writer.append_bytes(b"unchanged");
        let obj = writer.finish().unwrap();

        let reuse = [ReuseHint {
            this_ver_ofs: 0,
            len: 9,
            base_ofs: 100,
        }];
        let diffed = obj.diff_from_base(&reuse);
        assert!(matches!(
            diffed.chunks[0].source,
            ChunkSource::Base { base_ofs: 100 }
        ));
    }

    #[test]
    fn read_segs_only_from_disk_skips_base_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().to_path_buf();
        let path = folder.join("1.unsynced");
        let layout = LayoutTable::new(
            vec![],
            vec![
                FiniteChunk {
                    this_ver_ofs: 0,
                    len: 4,
                    source: ChunkSource::Present { disk_ofs: 0 },
                },
                FiniteChunk {
                    this_ver_ofs: 4,
                    len: 4,
                    source: ChunkSource::Base { base_ofs: 0 },
                },
            ],
        );
        write_atomic(&path, &layout, b"AAAA").unwrap();
        let obj = ObjOnDisk {
            path,
            version: 1,
            layout,
        };

        let present = obj.read_segs_only_from_disk(ByteRange { start: 0, end: 8 });
        assert_eq!(present.len(), 1);
        assert!(present[0].is_present());
    }

    #[test]
    fn move_file_and_proxy_this_updates_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = NewVersionWriter::new(dir.path().to_path_buf(), 1, vec![]);
        writer.append_bytes(b"x");
        let mut obj = writer.finish().unwrap();

        let new_path = dir.path().join("1.v");
        obj.move_file_and_proxy_this(new_path.clone(), None).unwrap();
        assert_eq!(obj.path(), new_path.as_path());
        assert!(new_path.exists());
    }

    #[test]
    fn move_file_and_proxy_this_applies_header_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = NewVersionWriter::new(dir.path().to_path_buf(), 1, b"old-header".to_vec());
        writer.append_bytes(b"hello world");
        let mut obj = writer.finish().unwrap();

        let new_path = dir.path().join("1.v");
        obj.move_file_and_proxy_this(new_path.clone(), Some(b"new-header".to_vec()))
            .unwrap();

        assert_eq!(obj.layout().header, b"new-header");
        let mut src = obj.get_src().unwrap();
        let bytes = src.read_range(ByteRange { start: 0, end: 11 }).unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }
}

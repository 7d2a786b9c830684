//! Materialized files and the chunk merge strategies.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use peerdrop_protocol::ChunkMetadata;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CacheError;
use crate::store::ChunkStore;

/// A complete file on disk, tagged with its original attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub last_modified: Option<i64>,
    pub size: u64,
    pub path: PathBuf,
}

impl MaterializedFile {
    pub fn from_meta(meta: &ChunkMetadata, path: PathBuf) -> Self {
        Self {
            name: meta.file_name.clone(),
            mime_type: meta.mime_type.clone(),
            last_modified: meta.last_modified,
            size: meta.file_size,
            path,
        }
    }

    /// Reads bytes `[start, end)`.
    pub fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let len = end.saturating_sub(start);
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} ended before byte {end}", self.path.display()),
            ));
        }
        Ok(buf)
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

/// How chunks are concatenated into the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Load every chunk, then write once.
    Bulk,
    /// Copy chunk by chunk through a buffered writer.
    Streaming,
}

impl MergeStrategy {
    pub fn for_size(file_size: u64, stream_threshold: u64) -> Self {
        if file_size > stream_threshold {
            Self::Streaming
        } else {
            Self::Bulk
        }
    }
}

/// Concatenates chunks `0..count` of `file_id` into `dest`.
///
/// Writes to a sibling `.part` file and renames it into place, so `dest`
/// only ever holds a complete merge. Returns the bytes written.
pub(crate) fn merge_chunks(
    store: &dyn ChunkStore,
    file_id: &str,
    count: u64,
    dest: &Path,
    strategy: MergeStrategy,
) -> Result<u64, CacheError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let part = part_path(dest);

    let written = match strategy {
        MergeStrategy::Bulk => merge_bulk(store, file_id, count, &part),
        MergeStrategy::Streaming => merge_streaming(store, file_id, count, &part),
    };
    let written = match written {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
    };

    fs::rename(&part, dest)?;
    Ok(written)
}

fn merge_bulk(store: &dyn ChunkStore, file_id: &str, count: u64, part: &Path) -> Result<u64, CacheError> {
    let chunks = store.read_all_chunks(file_id)?;
    let mut out = Vec::with_capacity(chunks.iter().map(|(_, c)| c.len()).sum());
    let mut expected = 0u64;
    for (index, data) in chunks.into_iter().filter(|(i, _)| *i < count) {
        if index != expected {
            return Err(CacheError::MissingChunk(expected));
        }
        out.extend_from_slice(&data);
        expected += 1;
    }
    if expected != count {
        return Err(CacheError::MissingChunk(expected));
    }
    fs::write(part, &out)?;
    Ok(out.len() as u64)
}

fn merge_streaming(
    store: &dyn ChunkStore,
    file_id: &str,
    count: u64,
    part: &Path,
) -> Result<u64, CacheError> {
    let mut writer = BufWriter::new(File::create(part)?);
    let mut written = 0u64;
    for index in 0..count {
        let data = store
            .read_chunk(file_id, index)?
            .ok_or(CacheError::MissingChunk(index))?;
        writer.write_all(&data)?;
        written += data.len() as u64;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(written)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Longest readable prefix kept in a merged file name.
const NAME_PREFIX_LEN: usize = 64;

/// File name used for a merged file: a path-safe prefix of the transfer id
/// followed by the SHA-256 of the full id, so distinct ids never share a
/// file.
pub(crate) fn merged_file_name(file_id: &str) -> String {
    let prefix: String = file_id
        .chars()
        .take(NAME_PREFIX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(file_id.as_bytes()));
    if prefix.is_empty() {
        digest
    } else {
        format!("{prefix}-{digest}")
    }
}

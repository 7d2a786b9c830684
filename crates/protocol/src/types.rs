use serde::{Deserialize, Serialize};

/// Describes one logical file transfer.
///
/// `file_size` and `chunk_size` are the source of truth for the chunk
/// layout: chunk `i` covers bytes `[i * chunk_size, min((i + 1) * chunk_size, file_size))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

impl ChunkMetadata {
    /// Total number of chunks, `ceil(file_size / chunk_size)`.
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Byte range `[start, end)` covered by chunk `index`, `None` past the end.
    pub fn chunk_bounds(&self, index: u64) -> Option<(u64, u64)> {
        if index >= self.chunk_count() {
            return None;
        }
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        Some((start, end))
    }

    /// Length of chunk `index` in bytes (the final chunk may be short).
    pub fn chunk_len(&self, index: u64) -> u64 {
        self.chunk_bounds(index).map_or(0, |(s, e)| e - s)
    }
}

/// Transfer progress in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: u64,
    pub transferred: u64,
    /// Recent throughput in bytes per second (0 when unknown).
    #[serde(default)]
    pub bytes_per_second: f64,
}

impl Progress {
    /// Completion ratio in `[0, 1]`; an empty file counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.transferred as f64 / self.total as f64).min(1.0)
        }
    }
}

use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::write_atomic;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no shard files given")]
    NoShards,
    #[error("shard {0} does not exist")]
    MissingShard(PathBuf),
    #[error("shard {0} is empty; expected at least a header row")]
    EmptyShard(PathBuf),
    #[error("shard {path} header differs from {first}")]
    HeaderMismatch { path: PathBuf, first: PathBuf },
    #[error("parsing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub output: PathBuf,
    pub shard_rows: Vec<u64>,
    pub total_rows: u64,
    pub bytes: u64,
}

struct ShardContents {
    path: PathBuf,
    bytes: Vec<u8>,
    header_end: usize,
    header: ByteRecord,
    rows: u64,
}

impl ShardContents {
    fn header_line(&self) -> &[u8] {
        &self.bytes[..self.header_end]
    }

    fn body(&self) -> &[u8] {
        &self.bytes[self.header_end..]
    }

    fn line_terminator(&self) -> &'static [u8] {
        if self.header_line().ends_with(b"\r\n") {
            b"\r\n"
        } else {
            b"\n"
        }
    }
}

/// Concatenate `shards` into `dest`: the first shard's header once, then every shard's rows in
/// order. Rows are copied byte-for-byte and never reordered or deduplicated.
///
/// The output is assembled in memory and renamed into place, so on error `dest` is untouched.
pub async fn merge_shards(shards: &[PathBuf], dest: &Path) -> Result<MergeSummary, MergeError> {
    if shards.is_empty() {
        return Err(MergeError::NoShards);
    }

    let mut contents = Vec::with_capacity(shards.len());
    for path in shards {
        contents.push(read_shard(path).await?);
    }

    let first = &contents[0];
    let terminator = first.line_terminator();
    for shard in &contents[1..] {
        if shard.header != first.header {
            return Err(MergeError::HeaderMismatch {
                path: shard.path.clone(),
                first: first.path.clone(),
            });
        }
    }

    let capacity = first.header_end + contents.iter().map(|c| c.body().len() + 2).sum::<usize>();
    let mut merged = Vec::with_capacity(capacity);
    merged.extend_from_slice(first.header_line());
    if !merged.ends_with(b"\n") {
        merged.extend_from_slice(terminator);
    }

    for shard in &contents {
        let body = shard.body();
        if body.is_empty() {
            continue;
        }
        merged.extend_from_slice(body);
        if !body.ends_with(b"\n") {
            merged.extend_from_slice(terminator);
        }
    }

    write_atomic(dest, &merged)
        .await
        .map_err(|source| MergeError::Io {
            path: dest.to_path_buf(),
            source,
        })?;

    let shard_rows: Vec<u64> = contents.iter().map(|c| c.rows).collect();
    let total_rows: u64 = shard_rows.iter().sum();
    info!(shards = contents.len(), total_rows, output = %dest.display(), "merged shards");

    Ok(MergeSummary {
        output: dest.to_path_buf(),
        shard_rows,
        total_rows,
        bytes: merged.len() as u64,
    })
}

async fn read_shard(path: &Path) -> Result<ShardContents, MergeError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(MergeError::MissingShard(path.to_path_buf()))
        }
        Err(source) => {
            return Err(MergeError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let header_end = bytes
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(bytes.len());
    let header = parse_header(&bytes[..header_end]).map_err(|source| MergeError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    let header = match header {
        Some(header) => header,
        None => return Err(MergeError::EmptyShard(path.to_path_buf())),
    };

    let rows = count_rows(&bytes[header_end..]).map_err(|source| MergeError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), rows, "read shard");

    Ok(ShardContents {
        path: path.to_path_buf(),
        bytes,
        header_end,
        header,
        rows,
    })
}

fn parse_header(line: &[u8]) -> Result<Option<ByteRecord>, csv::Error> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line);
    let mut record = ByteRecord::new();
    if !reader.read_byte_record(&mut record)? {
        return Ok(None);
    }
    if record.iter().all(|field| field.is_empty()) {
        return Ok(None);
    }
    Ok(Some(record))
}

fn count_rows(body: &[u8]) -> Result<u64, csv::Error> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body);
    let mut record = ByteRecord::new();
    let mut rows = 0u64;
    while reader.read_byte_record(&mut record)? {
        rows += 1;
    }
    Ok(rows)
}

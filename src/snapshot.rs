//! Snapshot archive format.
//!
//! A stream snapshot is a gzip compressed tar. `meta.inf` at the root holds
//! the full stream configuration plus the created time, with a `meta.sum`
//! checksum beside it. Each archived consumer contributes
//! `consumers/<name>/meta.inf` and `meta.sum`. The remaining entries are
//! whatever files the store contributed.

use crate::config::StreamConfig;
use crate::consumer::ConsumerSnapshot;
use crate::store::{SnapshotFile, StoreState};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

pub const META_FILE: &str = "meta.inf";
pub const META_SUM_FILE: &str = "meta.sum";
pub const CONSUMERS_DIR: &str = "consumers";
pub const STREAMS_DIR: &str = "streams";
pub const SNAPSHOTS_DIR: &str = "__snapshots__";

/// Root metadata entry of a snapshot archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
}

/// A finished snapshot.
pub struct SnapshotResult {
    /// Compressed archive bytes.
    pub data: Vec<u8>,
    /// Store state at snapshot time.
    pub state: StoreState,
}

pub fn checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Assembles the archive entries for a snapshot: stream metadata, store
/// files, and consumer metadata.
pub fn build_snapshot_files(
    meta: &StreamMeta,
    store_files: Vec<SnapshotFile>,
    consumers: &[ConsumerSnapshot],
) -> Result<Vec<SnapshotFile>> {
    let meta_buf = serde_json::to_vec_pretty(meta)?;
    let mut files = vec![
        SnapshotFile {
            rel_path: META_SUM_FILE.to_string(),
            data: checksum(&meta_buf).into_bytes(),
        },
        SnapshotFile {
            rel_path: META_FILE.to_string(),
            data: meta_buf,
        },
    ];
    files.extend(store_files);
    for snap in consumers {
        let buf = serde_json::to_vec_pretty(snap)?;
        files.push(SnapshotFile {
            rel_path: format!("{CONSUMERS_DIR}/{}/{META_SUM_FILE}", snap.name),
            data: checksum(&buf).into_bytes(),
        });
        files.push(SnapshotFile {
            rel_path: format!("{CONSUMERS_DIR}/{}/{META_FILE}", snap.name),
            data: buf,
        });
    }
    Ok(files)
}

/// Streams the entries into a gzip compressed tar.
pub fn write_archive(files: &[SnapshotFile]) -> Result<Vec<u8>> {
    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(enc);
    for f in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(f.data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, &f.rel_path, f.data.as_slice())?;
    }
    let enc = tar
        .into_inner()
        .map_err(|e| Error::Restore(format!("failed to finalize archive: {e}")))?;
    Ok(enc.finish()?)
}

/// Unpacks an archive into `dest`.
pub fn unpack_archive(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive
        .unpack(dest)
        .map_err(|e| Error::Restore(format!("failed to unpack archive: {e}")))
}

/// Reads and validates the root `meta.inf` from an unpacked snapshot.
pub fn read_stream_meta(dir: &Path) -> Result<StreamMeta> {
    let buf = std::fs::read(dir.join(META_FILE))
        .map_err(|e| Error::Restore(format!("missing {META_FILE}: {e}")))?;
    if let Ok(sum) = std::fs::read_to_string(dir.join(META_SUM_FILE)) {
        if sum.trim() != checksum(&buf) {
            return Err(Error::Restore(format!("{META_FILE} checksum mismatch")));
        }
    }
    serde_json::from_slice(&buf).map_err(|e| Error::Restore(format!("bad {META_FILE}: {e}")))
}

/// Reads the consumer snapshots from an unpacked archive, checksum
/// verified.
pub fn read_consumer_snapshots(dir: &Path) -> Result<Vec<ConsumerSnapshot>> {
    let cdir = dir.join(CONSUMERS_DIR);
    if !cdir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&cdir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let meta_path = entry.path().join(META_FILE);
        let buf = std::fs::read(&meta_path)
            .map_err(|e| Error::Restore(format!("error restoring consumer {name:?}: {e}")))?;
        let sum = std::fs::read_to_string(entry.path().join(META_SUM_FILE))
            .map_err(|e| Error::Restore(format!("error restoring consumer {name:?}: {e}")))?;
        if sum.trim() != checksum(&buf) {
            return Err(Error::Restore(format!(
                "error restoring consumer {name:?}: checksum mismatch"
            )));
        }
        let snap: ConsumerSnapshot = serde_json::from_slice(&buf)
            .map_err(|e| Error::Restore(format!("error restoring consumer {name:?}: {e}")))?;
        out.push(snap);
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

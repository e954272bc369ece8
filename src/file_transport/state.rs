//! On-disk transfer state (spec §3, §6): the `.desc`/`.data` sidecar pair
//! that backs an in-progress receive, and the sender-side open file
//! handle for an in-progress send.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{MeshError, Result};

/// Persisted header for a receiver-side transfer. Fsynced at least as often
/// as the `.data` file (spec §9 design note) so a crash never reports more
/// progress than the data file actually backs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientDesc {
    pub offset: u64,
    pub filesize: u64,
    pub filename: String,
}

impl TransientDesc {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| MeshError::Storage(e.to_string()))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        let mut f = File::create(path).map_err(|e| MeshError::Storage(e.to_string()))?;
        f.write_all(&bytes).map_err(|e| MeshError::Storage(e.to_string()))?;
        f.sync_all().map_err(|e| MeshError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Sender-side in-flight upload: the cached source file, seeked to the
/// offset the receiver asked to resume from.
pub struct SendState {
    pub file: File,
    pub offset: u64,
}

/// Receiver-side in-flight download.
pub struct ReceiveState {
    pub desc_path: PathBuf,
    pub data_path: PathBuf,
    pub data_file: File,
    pub desc: TransientDesc,
    pub hasher: Sha256,
    pub last_progress_percent: u8,
}

impl ReceiveState {
    pub fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.data_file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| MeshError::Storage(e.to_string()))?;
        self.data_file.write_all(data).map_err(|e| MeshError::Storage(e.to_string()))?;
        self.data_file.sync_data().map_err(|e| MeshError::Storage(e.to_string()))?;
        self.hasher.update(data);
        self.desc.offset = offset + data.len() as u64;
        self.desc.save(&self.desc_path)?;
        Ok(())
    }

    pub fn progress_percent(&self) -> u8 {
        if self.desc.filesize == 0 {
            return 100;
        }
        ((self.desc.offset as u128 * 100) / self.desc.filesize as u128).min(100) as u8
    }
}

pub fn peer_dir(download_dir: &Path, peer: Uuid) -> PathBuf {
    download_dir.join(peer.to_string())
}

pub fn transient_dir(download_dir: &Path, peer: Uuid) -> PathBuf {
    peer_dir(download_dir, peer).join("transient")
}

pub fn transient_desc_path(download_dir: &Path, peer: Uuid, file_id: u64) -> PathBuf {
    transient_dir(download_dir, peer).join(format!("{file_id}.desc"))
}

pub fn transient_data_path(download_dir: &Path, peer: Uuid, file_id: u64) -> PathBuf {
    transient_dir(download_dir, peer).join(format!("{file_id}.data"))
}

pub fn cache_dir(download_dir: &Path) -> PathBuf {
    download_dir.join(".cache")
}

pub fn cache_desc_path(download_dir: &Path, file_id: u64) -> PathBuf {
    cache_dir(download_dir).join(format!("{file_id}.desc"))
}

/// Picks a non-colliding destination filename under `dir` for a completed
/// download, appending `-(N)` for a monotonic `N` and falling back to
/// `-(<uuid>)` if no small `N` is free (spec §4.6).
pub fn unique_target_path(dir: &Path, filename: &str, disambiguator: Uuid) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = split_stem_ext(filename);
    for n in 1..=1000u32 {
        let name = match &ext {
            Some(e) => format!("{stem}-({n}).{e}"),
            None => format!("{stem}-({n})"),
        };
        let c = dir.join(name);
        if !c.exists() {
            return c;
        }
    }
    let name = match &ext {
        Some(e) => format!("{stem}-({disambiguator}).{e}"),
        None => format!("{stem}-({disambiguator})"),
    };
    dir.join(name)
}

fn split_stem_ext(filename: &str) -> (&str, Option<&str>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_target_path_disambiguates_with_counter() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("report.pdf"), b"a").unwrap();
        fs::write(dir.path().join("report-(1).pdf"), b"b").unwrap();
        let picked = unique_target_path(dir.path(), "report.pdf", Uuid::new_v4());
        assert_eq!(picked.file_name().unwrap().to_str().unwrap(), "report-(2).pdf");
    }

    #[test]
    fn unique_target_path_passes_through_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let picked = unique_target_path(dir.path(), "fresh.bin", Uuid::new_v4());
        assert_eq!(picked.file_name().unwrap().to_str().unwrap(), "fresh.bin");
    }
}

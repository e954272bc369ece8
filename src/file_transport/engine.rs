//! File transporter (C6): the credentials/request/begin/chunk/end/stop
//! sub-protocol over C5's `file_*` packet types (spec §4.6).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::{Begin, Chunk, Credentials, End, Request, State, Stop};
use super::state::{
    cache_desc_path, peer_dir, transient_data_path, transient_desc_path, unique_target_path,
    ReceiveState, SendState, TransientDesc,
};
use crate::config::FileConfig;
use crate::error::{MeshError, Result};
use crate::events::Event;
use crate::packet::PacketType;

/// Replies and application events produced by one dispatched `file_*`
/// message (spec §4.6's per-packet-type handling).
#[derive(Default)]
pub struct FileOutcome {
    pub events: Vec<Event>,
    /// Control packets to send back to the peer this message came from,
    /// via C5's regular output queue.
    pub replies: Vec<(PacketType, Vec<u8>)>,
}

pub struct FileTransporter {
    config: FileConfig,
    sends: HashMap<(Uuid, u64), SendState>,
    receives: HashMap<(Uuid, u64), ReceiveState>,
}

impl FileTransporter {
    pub fn new(config: FileConfig) -> Result<Self> {
        fs::create_dir_all(&config.download_directory)
            .map_err(|e| MeshError::Configuration(format!("cannot create download_directory: {e}")))?;
        fs::create_dir_all(super::state::cache_dir(&config.download_directory))
            .map_err(|e| MeshError::Configuration(format!("cannot create .cache dir: {e}")))?;
        Ok(Self { config, sends: HashMap::new(), receives: HashMap::new() })
    }

    /// `send_file`: validates the source file, caches its absolute path,
    /// and returns `(file_id, credentials_payload)` for C5 to transmit.
    pub fn send_file(&mut self, file_id: Option<u64>, path: &Path) -> Result<(u64, Vec<u8>)> {
        let metadata = fs::metadata(path)
            .map_err(|e| MeshError::Configuration(format!("cannot read {}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(MeshError::Configuration(format!("{} is not a regular file", path.display())));
        }
        let filesize = metadata.len();
        if filesize > self.config.max_file_size {
            return Err(MeshError::Configuration(format!(
                "{} ({filesize} bytes) exceeds max_file_size {}",
                path.display(),
                self.config.max_file_size
            )));
        }
        let file_id = file_id.unwrap_or_else(rand::random);
        let abs = fs::canonicalize(path)
            .map_err(|e| MeshError::Configuration(format!("cannot canonicalize {}: {e}", path.display())))?;
        let cache_path = cache_desc_path(&self.config.download_directory, file_id);
        let bytes = bincode::serialize(&abs.to_string_lossy().into_owned())?;
        fs::write(&cache_path, bytes).map_err(|e| MeshError::Storage(e.to_string()))?;

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string());
        let payload = Credentials { file_id, filesize, offset: 0, filename }.encode();
        Ok((file_id, payload))
    }

    /// Builds a `file_stop` payload and tears down any local state for
    /// `(peer, file_id)` on either side (spec §4.6 "either side may emit").
    pub fn stop_file(&mut self, peer: Uuid, file_id: u64) -> Vec<u8> {
        self.sends.remove(&(peer, file_id));
        self.receives.remove(&(peer, file_id));
        Stop { file_id }.encode()
    }

    /// On channel loss, every in-flight incoming transfer from `uuid`
    /// yields `DownloadInterrupted`; transient files are left on disk for
    /// resume on a later session (spec §4.6).
    pub fn expire_addresser(&mut self, uuid: Uuid) -> Vec<Event> {
        let keys: Vec<(Uuid, u64)> =
            self.receives.keys().filter(|(u, _)| *u == uuid).copied().collect();
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            self.receives.remove(&key);
            events.push(Event::DownloadInterrupted {
                uuid,
                file_id: key.1,
                reason: "channel lost".into(),
            });
        }
        self.sends.retain(|(u, _), _| *u != uuid);
        events
    }

    /// Bulk-deletes the download tree. Per-file errors are collected and
    /// surfaced without aborting the traversal (spec §4.6 "wipe").
    pub fn wipe(&mut self) -> Vec<(PathBuf, std::io::Error)> {
        self.sends.clear();
        self.receives.clear();
        let mut errors = Vec::new();
        let Ok(entries) = fs::read_dir(&self.config.download_directory) else { return errors };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().map(|n| n == ".cache").unwrap_or(false) {
                continue;
            }
            let result = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
            if let Err(e) = result {
                errors.push((path, e));
            }
        }
        errors
    }

    /// Dispatches one reassembled `file_*` payload by packet type (spec
    /// §4.5 step 3: "forward to the file transporter").
    pub fn dispatch(&mut self, from: Uuid, packet_type: PacketType, payload: &[u8]) -> Result<FileOutcome> {
        let mut out = FileOutcome::default();
        match packet_type {
            PacketType::FileCredentials => {
                let reply = self.handle_file_credentials(from, payload)?;
                out.replies.push((PacketType::FileRequest, reply));
            }
            PacketType::FileRequest => {
                let begin = self.handle_file_request(from, payload)?;
                out.replies.push((PacketType::FileBegin, begin));
            }
            PacketType::FileBegin => {
                self.handle_file_begin(from, payload)?;
            }
            PacketType::FileChunk => {
                out.events = self.handle_file_chunk(from, payload)?;
            }
            PacketType::FileEnd => {
                let (reply, events) = self.handle_file_end(from, payload)?;
                out.replies.push((PacketType::FileState, reply));
                out.events = events;
            }
            PacketType::FileState => {
                out.events = self.handle_file_state(from, payload)?;
            }
            PacketType::FileStop => {
                out.events = self.handle_file_stop(from, payload)?;
            }
            PacketType::Regular | PacketType::Hello => {}
        }
        Ok(out)
    }

    /// Creates (or re-opens, for resume) the receiver-side transfer state
    /// and registers it in `self.receives` keyed by `(addresser, file_id)`
    /// before replying with a `file_request` (spec §4.6 receiver path).
    fn handle_file_credentials(&mut self, addresser: Uuid, payload: &[u8]) -> Result<Vec<u8>> {
        let cred = Credentials::decode(payload)?;
        let desc_path = transient_desc_path(&self.config.download_directory, addresser, cred.file_id);
        let data_path = transient_data_path(&self.config.download_directory, addresser, cred.file_id);

        let (desc, mut hasher) = if desc_path.exists() {
            let desc = TransientDesc::load(&desc_path)?;
            // Resume: rehash whatever bytes are already on disk so the
            // diagnostic digest logged at completion covers the full file,
            // not just the bytes received this session.
            let mut hasher = Sha256::new();
            if let Ok(mut existing) = File::open(&data_path) {
                let mut buf = Vec::new();
                existing.read_to_end(&mut buf).map_err(|e| MeshError::Storage(e.to_string()))?;
                hasher.update(&buf);
            }
            (desc, hasher)
        } else {
            fs::create_dir_all(desc_path.parent().unwrap()).map_err(|e| MeshError::Storage(e.to_string()))?;
            let desc = TransientDesc { offset: 0, filesize: cred.filesize, filename: cred.filename.clone() };
            desc.save(&desc_path)?;
            File::create(&data_path).map_err(|e| MeshError::Storage(e.to_string()))?;
            (desc, Sha256::new())
        };

        let offset = desc.offset;
        let last_progress_percent = if desc.filesize == 0 {
            100
        } else {
            ((offset as u128 * 100) / desc.filesize as u128).min(100) as u8
        };
        let data_file = OpenOptions::new()
            .write(true)
            .open(&data_path)
            .map_err(|e| MeshError::Storage(e.to_string()))?;

        self.receives.insert(
            (addresser, cred.file_id),
            ReceiveState { desc_path, data_path, data_file, desc, hasher, last_progress_percent },
        );

        debug!(%addresser, file_id = cred.file_id, offset, "requesting file");
        Ok(Request { file_id: cred.file_id, offset }.encode())
    }

    fn handle_file_request(&mut self, addressee: Uuid, payload: &[u8]) -> Result<Vec<u8>> {
        let req = Request::decode(payload)?;
        let cache_path = cache_desc_path(&self.config.download_directory, req.file_id);
        let bytes = fs::read(&cache_path).map_err(|e| MeshError::Storage(e.to_string()))?;
        let abs_path: String = bincode::deserialize(&bytes)?;
        let mut file = File::open(&abs_path).map_err(|e| MeshError::Storage(e.to_string()))?;
        file.seek(SeekFrom::Start(req.offset)).map_err(|e| MeshError::Storage(e.to_string()))?;
        self.sends.insert((addressee, req.file_id), SendState { file, offset: req.offset });
        Ok(Begin { file_id: req.file_id, offset: req.offset }.encode())
    }

    fn handle_file_begin(&mut self, addresser: Uuid, payload: &[u8]) -> Result<()> {
        let begin = Begin::decode(payload)?;
        if let Some(recv) = self.receives.get(&(addresser, begin.file_id)) {
            if recv.desc.offset != begin.offset {
                warn!(
                    %addresser, file_id = begin.file_id,
                    local = recv.desc.offset, remote = begin.offset,
                    "file_begin offset does not match local resume point"
                );
            }
        }
        Ok(())
    }

    /// Called when a writer's per-file output queue for `(addressee,
    /// file_id)` runs dry (spec §4.5's `FileChunkNeeded`). Returns the
    /// next chunk, or a `file_end` once the source is exhausted (and drops
    /// the send state).
    pub fn next_chunk(&mut self, addressee: Uuid, file_id: u64) -> Result<Vec<(PacketType, Vec<u8>)>> {
        let Some(state) = self.sends.get_mut(&(addressee, file_id)) else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; self.config.file_chunk_size];
        let n = state.file.read(&mut buf).map_err(|e| MeshError::Storage(e.to_string()))?;
        if n == 0 {
            self.sends.remove(&(addressee, file_id));
            return Ok(vec![(PacketType::FileEnd, End { file_id }.encode())]);
        }
        buf.truncate(n);
        let offset = state.offset;
        state.offset += n as u64;
        Ok(vec![(PacketType::FileChunk, Chunk { file_id, offset, data: buf }.encode())])
    }

    fn handle_file_chunk(&mut self, addresser: Uuid, payload: &[u8]) -> Result<Vec<Event>> {
        let chunk = Chunk::decode(payload)?;
        let key = (addresser, chunk.file_id);
        let Some(state) = self.receives.get_mut(&key) else { return Ok(Vec::new()) };
        state.write_chunk(chunk.offset, &chunk.data)?;

        let percent = state.progress_percent();
        let granularity = self.config.download_progress_granularity;
        let should_emit = match granularity {
            0 => true,
            100 => false,
            g => percent / g > state.last_progress_percent / g,
        };
        let mut events = Vec::new();
        if should_emit {
            events.push(Event::DownloadProgress { uuid: addresser, file_id: chunk.file_id, percent });
        }
        state.last_progress_percent = percent;
        Ok(events)
    }

    fn handle_file_end(&mut self, addresser: Uuid, payload: &[u8]) -> Result<(Vec<u8>, Vec<Event>)> {
        let end = End::decode(payload)?;
        let Some(state) = self.receives.remove(&(addresser, end.file_id)) else {
            return Ok((State { file_id: end.file_id, success: false }.encode(), Vec::new()));
        };
        let done_path = state.desc_path.with_extension("done");
        fs::rename(&state.desc_path, &done_path).map_err(|e| MeshError::Storage(e.to_string()))?;
        let digest = state.hasher.finalize();
        debug!(%addresser, file_id = end.file_id, hash = %hex::encode(digest), "transfer hashed on receive");

        let dir = peer_dir(&self.config.download_directory, addresser);
        fs::create_dir_all(&dir).map_err(|e| MeshError::Storage(e.to_string()))?;
        let target = unique_target_path(&dir, &state.desc.filename, addresser);
        fs::rename(&state.data_path, &target).map_err(|e| MeshError::Storage(e.to_string()))?;

        let reply = State { file_id: end.file_id, success: true }.encode();
        let events = vec![Event::DownloadComplete { uuid: addresser, file_id: end.file_id, path: target }];
        Ok((reply, events))
    }

    fn handle_file_state(&mut self, addressee: Uuid, payload: &[u8]) -> Result<Vec<Event>> {
        let state = State::decode(payload)?;
        if state.success {
            Ok(Vec::new())
        } else {
            Ok(vec![Event::OnFailure {
                uuid: Some(addressee),
                message: format!("upload of file {} failed on receiver", state.file_id),
            }])
        }
    }

    fn handle_file_stop(&mut self, from: Uuid, payload: &[u8]) -> Result<Vec<Event>> {
        let stop = Stop::decode(payload)?;
        let mut events = Vec::new();
        if self.sends.remove(&(from, stop.file_id)).is_some() {
            events.push(Event::UploadStopped { uuid: from, file_id: stop.file_id });
        }
        if self.receives.remove(&(from, stop.file_id)).is_some() {
            events.push(Event::DownloadInterrupted {
                uuid: from,
                file_id: stop.file_id,
                reason: "stopped by peer".into(),
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn transporter() -> (FileTransporter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FileConfig { download_directory: dir.path().to_path_buf(), ..Default::default() };
        (FileTransporter::new(cfg).unwrap(), dir)
    }

    #[test]
    fn send_file_rejects_oversized_input() {
        let (mut t, dir) = transporter();
        t_config_mut(&mut t).max_file_size = 4;
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![0u8; 16]).unwrap();
        assert!(t.send_file(None, &path).is_err());
    }

    #[test]
    fn full_transfer_round_trip_produces_identical_bytes() {
        let (mut sender, src_dir) = transporter();
        let (mut receiver, _dst_dir) = transporter();
        let addresser = Uuid::new_v4();
        let addressee = Uuid::new_v4();

        let src_path = src_dir.path().join("payload.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs::File::create(&src_path).unwrap().write_all(&data).unwrap();

        let (file_id, cred_payload) = sender.send_file(None, &src_path).unwrap();
        let req_payload = receiver.handle_file_credentials(addresser, &cred_payload).unwrap();
        let begin_payload = sender.handle_file_request(addressee, &req_payload).unwrap();
        receiver.handle_file_begin(addresser, &begin_payload).unwrap();

        loop {
            let msgs = sender.next_chunk(addressee, file_id).unwrap();
            if msgs.is_empty() {
                break;
            }
            let (packet_type, payload) = &msgs[0];
            match packet_type {
                PacketType::FileChunk => {
                    receiver.handle_file_chunk(addresser, payload).unwrap();
                }
                PacketType::FileEnd => {
                    let (_reply, events) = receiver.handle_file_end(addresser, payload).unwrap();
                    assert_eq!(events.len(), 1);
                    if let Event::DownloadComplete { path, .. } = &events[0] {
                        let got = fs::read(path).unwrap();
                        assert_eq!(got, data);
                    } else {
                        panic!("expected DownloadComplete");
                    }
                    break;
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn resume_picks_up_from_stored_offset() {
        let (mut sender, src_dir) = transporter();
        let (mut receiver, _dst_dir) = transporter();
        let addresser = Uuid::new_v4();
        let addressee = Uuid::new_v4();

        let src_path = src_dir.path().join("resume.bin");
        let data = vec![7u8; 100];
        fs::File::create(&src_path).unwrap().write_all(&data).unwrap();
        let (file_id, cred_payload) = sender.send_file(None, &src_path).unwrap();

        let req1 = receiver.handle_file_credentials(addresser, &cred_payload).unwrap();
        assert_eq!(Request::decode(&req1).unwrap().offset, 0);

        // Simulate partial progress already recorded on disk.
        let desc_path = transient_desc_path(&receiver_dl_dir(&receiver), addresser, file_id);
        let mut desc = TransientDesc::load(&desc_path).unwrap();
        desc.offset = 40;
        desc.save(&desc_path).unwrap();

        let req2 = receiver.handle_file_credentials(addresser, &cred_payload).unwrap();
        assert_eq!(Request::decode(&req2).unwrap().offset, 40);
    }

    fn t_config_mut(t: &mut FileTransporter) -> &mut FileConfig {
        &mut t.config
    }

    fn receiver_dl_dir(t: &FileTransporter) -> PathBuf {
        t.config.download_directory.clone()
    }
}

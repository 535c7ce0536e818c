/// Write-ahead log.
///
/// The log is a sequence of generation files (`wal/<generation>.wal`). Every
/// append is fsynced before it returns, so an acknowledged write survives a
/// process crash. `flush` seals the current generation and starts a new one;
/// sealed generations are deleted once their contents live in segments.
///
/// Recovery tolerates exactly one kind of damage: a torn final frame in the
/// newest generation, which is what a crash in the middle of an append leaves
/// behind. A frame is torn when the file ends inside its header, or after an
/// intact header but inside its payload. That frame was never acknowledged,
/// so it is truncated away. A damaged length field is never read as a torn
/// tail: every other integrity failure is reported as
/// [`LakeError::WalIntegrity`].
use super::frame::{self, FrameRead};
use crate::error::{LakeError, LakeResult};
use crate::types::Partition;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const WAL_EXTENSION: &str = "wal";

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct WalRecord {
    pub version: u64,
    pub key: String,
    pub partition: Partition,
    pub created_at_ms: i64,
    pub op: WalOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) enum WalOp {
    /// A compressed value and its uncompressed length.
    Put { raw_len: u64, data: Vec<u8> },
    /// A tombstone.
    Delete,
}

impl WalRecord {
    /// Size of this record once framed on disk.
    pub fn framed_len(&self) -> LakeResult<u64> {
        Ok(bincode::serialized_size(self)? + frame::HEADER_LEN as u64)
    }
}

#[derive(Debug)]
struct SealedGeneration {
    generation: u64,
    path: PathBuf,
    len: u64,
}

/// The append side of the log.
#[derive(Debug)]
pub(super) struct Wal {
    dir: PathBuf,
    generation: u64,
    path: PathBuf,
    file: File,
    len: u64,
    sealed: Vec<SealedGeneration>,
}

/// What recovery found.
#[derive(Debug, Default)]
pub(super) struct Replay {
    /// Intact records in log order.
    pub records: Vec<WalRecord>,
    /// Bytes discarded from a torn tail.
    pub truncated_bytes: u64,
}

impl Wal {
    /// Replay every generation under `dir` and open a fresh one for appends.
    pub fn recover(dir: &Path) -> LakeResult<(Self, Replay)> {
        fs::create_dir_all(dir)?;
        let generations = list_generations(dir)?;
        let newest = generations.last().map(|(generation, _)| *generation);

        let mut replay = Replay::default();
        let mut sealed = Vec::new();
        for (generation, path) in generations {
            let len = replay_generation(&path, Some(generation) == newest, &mut replay)?;
            if len == 0 {
                fs::remove_file(&path)?;
                continue;
            }
            sealed.push(SealedGeneration {
                generation,
                path,
                len,
            });
        }

        let next = newest.map_or(1, |g| g + 1);
        let (path, file) = create_generation(dir, next)?;
        info!(
            generation = next,
            replayed = replay.records.len(),
            pending_generations = sealed.len(),
            "WAL recovered"
        );

        Ok((
            Self {
                dir: dir.to_path_buf(),
                generation: next,
                path,
                file,
                len: 0,
                sealed,
            },
            replay,
        ))
    }

    /// Append and fsync one record. Returns the bytes written.
    pub fn append(&mut self, record: &WalRecord) -> LakeResult<u64> {
        let bytes = frame::encode(&bincode::serialize(record)?);
        let written = self
            .file
            .write_all(&bytes)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            // Leave no partial frame behind an error we report.
            if let Err(truncate_err) = self.file.set_len(self.len) {
                warn!(path = ?self.path, error = %truncate_err, "Failed to roll back WAL append");
            }
            return Err(e.into());
        }
        self.len += bytes.len() as u64;
        Ok(bytes.len() as u64)
    }

    /// Seal the current generation and start a new one.
    ///
    /// Returns every sealed generation not yet retired, oldest first.
    pub fn rotate(&mut self) -> LakeResult<Vec<u64>> {
        if self.len > 0 {
            let next = self.generation + 1;
            let (path, file) = create_generation(&self.dir, next)?;
            let old_path = std::mem::replace(&mut self.path, path);
            let old_file = std::mem::replace(&mut self.file, file);
            drop(old_file);
            self.sealed.push(SealedGeneration {
                generation: self.generation,
                path: old_path,
                len: self.len,
            });
            debug!(sealed = self.generation, next, "WAL generation rotated");
            self.generation = next;
            self.len = 0;
        }
        Ok(self.sealed.iter().map(|s| s.generation).collect())
    }

    /// Delete sealed generations whose records are now in segments.
    pub fn retire(&mut self, generations: &[u64]) -> LakeResult<()> {
        let mut index = 0;
        while index < self.sealed.len() {
            if !generations.contains(&self.sealed[index].generation) {
                index += 1;
                continue;
            }
            match fs::remove_file(&self.sealed[index].path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let retired = self.sealed.remove(index);
            debug!(generation = retired.generation, "WAL generation retired");
        }
        sync_dir(&self.dir)
    }

    /// Bytes held by all generations on disk.
    pub fn disk_bytes(&self) -> u64 {
        self.len + self.sealed.iter().map(|s| s.len).sum::<u64>()
    }
}

fn list_generations(dir: &Path) -> LakeResult<Vec<(u64, PathBuf)>> {
    let mut generations = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(WAL_EXTENSION) {
            continue;
        }
        let Some(generation) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| u64::from_str_radix(s, 16).ok())
        else {
            warn!(path = ?path, "Ignoring WAL file with unexpected name");
            continue;
        };
        generations.push((generation, path));
    }
    generations.sort_by_key(|(generation, _)| *generation);
    Ok(generations)
}

/// Replay one generation into `replay`; returns its length after any truncation.
fn replay_generation(path: &Path, newest: bool, replay: &mut Replay) -> LakeResult<u64> {
    let buf = fs::read(path)?;
    let mut offset = 0usize;
    loop {
        match frame::read_at(&buf, offset) {
            FrameRead::End => break,
            FrameRead::Complete { payload, next } => {
                let record: WalRecord =
                    bincode::deserialize(payload).map_err(|e| LakeError::WalIntegrity {
                        path: path.to_path_buf(),
                        offset: offset as u64,
                        reason: format!("undecodable record: {}", e),
                    })?;
                replay.records.push(record);
                offset = next;
            }
            FrameRead::Truncated if newest => {
                return truncate_tail(path, &buf, offset, replay);
            }
            FrameRead::ChecksumMismatch { end } if newest && end == buf.len() => {
                return truncate_tail(path, &buf, offset, replay);
            }
            // Space the filesystem allocated for an append that never landed.
            FrameRead::BadHeader if newest && buf[offset..].iter().all(|b| *b == 0) => {
                return truncate_tail(path, &buf, offset, replay);
            }
            FrameRead::Truncated => {
                return Err(LakeError::WalIntegrity {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    reason: "truncated frame in a sealed generation".to_string(),
                });
            }
            FrameRead::BadHeader => {
                return Err(LakeError::WalIntegrity {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    reason: "frame length fails its checksum".to_string(),
                });
            }
            FrameRead::ChecksumMismatch { .. } => {
                return Err(LakeError::WalIntegrity {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    reason: "frame checksum mismatch".to_string(),
                });
            }
        }
    }
    Ok(buf.len() as u64)
}

fn truncate_tail(path: &Path, buf: &[u8], offset: usize, replay: &mut Replay) -> LakeResult<u64> {
    let discarded = (buf.len() - offset) as u64;
    warn!(
        path = ?path,
        offset,
        discarded,
        "Discarding torn WAL tail left by an interrupted append"
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset as u64)?;
    file.sync_all()?;
    replay.truncated_bytes += discarded;
    Ok(offset as u64)
}

fn create_generation(dir: &Path, generation: u64) -> LakeResult<(PathBuf, File)> {
    let path = dir.join(format!("{:016x}.{}", generation, WAL_EXTENSION));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    sync_dir(dir)?;
    Ok((path, file))
}

/// Make directory entry changes (create, rename, unlink) durable.
pub(super) fn sync_dir(dir: &Path) -> LakeResult<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(version: u64, key: &str) -> WalRecord {
        WalRecord {
            version,
            key: key.to_string(),
            partition: Partition::Code,
            created_at_ms: 0,
            op: WalOp::Put {
                raw_len: 3,
                data: vec![1, 2, 3],
            },
        }
    }

    fn wal_files(dir: &Path) -> Vec<PathBuf> {
        list_generations(dir)
            .unwrap()
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    #[test]
    fn test_append_then_recover() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, replay) = Wal::recover(dir.path()).unwrap();
            assert!(replay.records.is_empty());
            wal.append(&put(1, "a")).unwrap();
            wal.append(&put(2, "b")).unwrap();
        }
        let (_wal, replay) = Wal::recover(dir.path()).unwrap();
        let versions: Vec<u64> = replay.records.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(replay.truncated_bytes, 0);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, _) = Wal::recover(dir.path()).unwrap();
            wal.append(&put(1, "a")).unwrap();
        }
        let newest = wal_files(dir.path()).pop().unwrap();
        let torn = frame::encode(&bincode::serialize(&put(2, "b")).unwrap());
        let mut file = OpenOptions::new().append(true).open(&newest).unwrap();
        file.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(file);

        let (_wal, replay) = Wal::recover(dir.path()).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert!(replay.truncated_bytes > 0);
    }

    #[test]
    fn test_mid_log_corruption_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, _) = Wal::recover(dir.path()).unwrap();
            wal.append(&put(1, "a")).unwrap();
            wal.append(&put(2, "b")).unwrap();
        }
        let newest = wal_files(dir.path()).pop().unwrap();
        let mut bytes = fs::read(&newest).unwrap();
        bytes[frame::HEADER_LEN + 1] ^= 0xff;
        fs::write(&newest, bytes).unwrap();

        let err = Wal::recover(dir.path()).unwrap_err();
        assert!(matches!(err, LakeError::WalIntegrity { offset: 0, .. }));
    }

    #[test]
    fn test_rotate_and_retire() {
        let dir = TempDir::new().unwrap();
        let (mut wal, _) = Wal::recover(dir.path()).unwrap();
        assert!(wal.rotate().unwrap().is_empty(), "empty generation stays open");

        wal.append(&put(1, "a")).unwrap();
        let sealed = wal.rotate().unwrap();
        assert_eq!(sealed.len(), 1);
        assert!(wal.disk_bytes() > 0);
        assert_eq!(wal_files(dir.path()).len(), 2);

        wal.retire(&sealed).unwrap();
        assert_eq!(wal.disk_bytes(), 0);
        assert_eq!(wal_files(dir.path()).len(), 1);
    }

    #[test]
    fn test_damaged_length_is_fatal_not_torn() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, _) = Wal::recover(dir.path()).unwrap();
            for version in 1..=3 {
                wal.append(&put(version, "k")).unwrap();
            }
        }
        let newest = wal_files(dir.path()).pop().unwrap();
        let mut bytes = fs::read(&newest).unwrap();
        let original_len = bytes.len();
        // Claims far more payload than the file holds.
        bytes[2] ^= 0x10;
        fs::write(&newest, bytes).unwrap();

        let err = Wal::recover(dir.path()).unwrap_err();
        assert!(matches!(err, LakeError::WalIntegrity { offset: 0, .. }));
        assert_eq!(fs::metadata(&newest).unwrap().len() as usize, original_len);
    }

    #[test]
    fn test_zeroed_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let (mut wal, _) = Wal::recover(dir.path()).unwrap();
            wal.append(&put(1, "a")).unwrap();
        }
        let newest = wal_files(dir.path()).pop().unwrap();
        let mut file = OpenOptions::new().append(true).open(&newest).unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        drop(file);

        let (_wal, replay) = Wal::recover(dir.path()).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.truncated_bytes, 64);
    }
}

//! Append-only file store. Each committed batch is one JSON line carrying a
//! CRC32 of its entries and is fsynced before the commit returns. The key
//! index is rebuilt from the file at open.

use super::{
    CommitOutcome, CompactionContext, CompactionStats, DiskEntry, FlushBatch, PersistenceStore,
    ShardIndex, StoreError, StoredDoc,
};
use crate::item::{DiskKey, Seqno, ShardId};
use crc32fast::Hasher;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "shard-";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct BatchFrame {
    high_seqno: Seqno,
    entries: Vec<DiskEntry>,
    crc32: u32,
}

impl BatchFrame {
    fn new(high_seqno: Seqno, entries: Vec<DiskEntry>) -> Result<Self, StoreError> {
        let crc32 = frame_crc(high_seqno, &entries)?;
        Ok(Self {
            high_seqno,
            entries,
            crc32,
        })
    }

    fn is_valid(&self) -> bool {
        frame_crc(self.high_seqno, &self.entries).is_ok_and(|crc| crc == self.crc32)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

fn frame_crc(high_seqno: Seqno, entries: &[DiskEntry]) -> Result<u32, StoreError> {
    let mut hasher = Hasher::new();
    hasher.update(&high_seqno.to_le_bytes());
    hasher.update(&serde_json::to_vec(entries)?);
    Ok(hasher.finalize())
}

#[derive(Debug)]
struct ShardFile {
    path: PathBuf,
    file: File,
    index: ShardIndex,
}

impl ShardFile {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut index = ShardIndex::default();
        let valid_len = if path.exists() {
            replay(&path, &mut index)?
        } else {
            0
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        } else if len < valid_len {
            // The last frame lost only its newline.
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        Ok(Self { path, file, index })
    }

    fn append(&mut self, frame: &BatchFrame) -> Result<(), StoreError> {
        let line = frame.encode()?;
        self.append_line(&line, |file, line| {
            file.write_all(line)?;
            file.sync_data()
        })
    }

    /// Runs `write` against the file. If it fails the file is cut back to
    /// its previous length, so a partial frame never precedes the next one.
    fn append_line(
        &mut self,
        line: &[u8],
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> Result<(), StoreError> {
        let len = self.file.metadata()?.len();
        let Err(err) = write(&mut self.file, line) else {
            return Ok(());
        };
        error!(
            "event=store_append_failed path={} len={} error={}",
            self.path.display(),
            len,
            err
        );
        if let Err(truncate) = self.file.set_len(len).and_then(|()| self.file.sync_all()) {
            error!(
                "event=store_truncate_failed path={} len={} error={}",
                self.path.display(),
                len,
                truncate
            );
        }
        Err(err.into())
    }

    /// Writes the live index as a single frame to a temp file and swaps it in.
    fn rewrite(&mut self) -> Result<(), StoreError> {
        let frame = BatchFrame::new(self.index.outcome().high_seqno, self.index.entries())?;
        let tmp = self.path.with_extension("jsonl.compact");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&frame.encode()?)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        Ok(())
    }
}

/// Rebuilds `index` from `path`. Returns the byte length of the valid
/// prefix; a torn or corrupt final line is dropped, earlier damage is fatal.
fn replay(path: &Path, index: &mut ShardIndex) -> Result<u64, StoreError> {
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<Vec<u8>> = reader
        .split(b'\n')
        .collect::<Result<_, _>>()?;
    let mut valid_len = 0u64;
    let last = lines.len().saturating_sub(1);
    for (number, line) in lines.iter().enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            valid_len += line.len() as u64 + 1;
            continue;
        }
        let frame = serde_json::from_slice::<BatchFrame>(line)
            .ok()
            .filter(BatchFrame::is_valid);
        match frame {
            Some(frame) => {
                index.apply(&frame.entries);
                index.set_high_seqno(frame.high_seqno);
                valid_len += line.len() as u64 + 1;
            }
            None if number == last => {
                warn!(
                    "event=store_torn_tail path={} line={} bytes={}",
                    path.display(),
                    number + 1,
                    line.len()
                );
                break;
            }
            None => {
                return Err(StoreError::Corrupt {
                    path: path.display().to_string(),
                    line: number + 1,
                    reason: "checksum or decode failure".to_string(),
                })
            }
        }
    }
    Ok(valid_len)
}

/// File-backed [`PersistenceStore`], one log file per shard under `dir`.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    shards: Mutex<HashMap<ShardId, ShardFile>>,
}

impl FileStore {
    /// Opens every shard file already present in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut shards = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(shard) = shard_from_path(&path) else {
                continue;
            };
            shards.insert(shard, ShardFile::open(path)?);
        }
        debug!(
            "event=store_opened dir={} shards={}",
            dir.display(),
            shards.len()
        );
        Ok(Self {
            dir,
            shards: Mutex::new(shards),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_path(&self, shard: ShardId) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", shard.0))
    }

    fn with_shard<T>(
        &self,
        shard: ShardId,
        f: impl FnOnce(&mut ShardFile) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut shards = self.shards.lock();
        if !shards.contains_key(&shard) {
            let file = ShardFile::open(self.shard_path(shard))?;
            shards.insert(shard, file);
        }
        match shards.get_mut(&shard) {
            Some(file) => f(file),
            None => Err(StoreError::Corrupt {
                path: self.shard_path(shard).display().to_string(),
                line: 0,
                reason: "shard file vanished".to_string(),
            }),
        }
    }
}

fn shard_from_path(path: &Path) -> Option<ShardId> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    id.parse().ok().map(ShardId)
}

impl PersistenceStore for FileStore {
    fn get(&self, shard: ShardId, key: &DiskKey) -> Result<Option<StoredDoc>, StoreError> {
        self.with_shard(shard, |file| Ok(file.index.get(key).cloned()))
    }

    fn commit_batch(&self, shard: ShardId, batch: &FlushBatch) -> Result<CommitOutcome, StoreError> {
        let frame = BatchFrame::new(batch.high_seqno(), batch.entries())?;
        self.with_shard(shard, |file| {
            file.append(&frame)?;
            file.index.apply(&frame.entries);
            file.index.set_high_seqno(frame.high_seqno);
            Ok(file.index.outcome())
        })
    }

    fn compact(
        &self,
        shard: ShardId,
        context: &CompactionContext,
    ) -> Result<CompactionStats, StoreError> {
        self.with_shard(shard, |file| {
            let mut scratch = file.index.clone();
            let stats = scratch.compact(context);
            let previous = std::mem::replace(&mut file.index, scratch);
            if let Err(err) = file.rewrite() {
                file.index = previous;
                return Err(err);
            }
            debug!(
                "event=store_compacted path={} expired={} tombstones_purged={} prepares_purged={}",
                file.path.display(),
                stats.expired,
                stats.tombstones_purged,
                stats.prepares_purged
            );
            Ok(stats)
        })
    }

    fn counts(&self, shard: ShardId) -> Result<CommitOutcome, StoreError> {
        self.with_shard(shard, |file| Ok(file.index.outcome()))
    }
}

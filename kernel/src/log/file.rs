// File-backed log backend.
//
// One append-only file per table, named by the hex-encoded table id.
// Names longer than `NAME_CHUNK` hex digits are split into nested
// directories, one chunk per path component, so every component stays
// within the file system's name limit. Each record is framed as:
//
//   [8 bytes: sequence (BE)][4 bytes: len (BE)][len bytes: record]
//
// A record becomes visible to readers only after it has been fully
// written (and synced, when `sync_on_write` is set). A torn frame at the
// end of a file, left by a crash mid-append, is truncated on open.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::store::{BackendError, LogBackend};
use super::{Sequence, TableId};

const HEADER_LEN: usize = 12;
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;
const LOG_EXTENSION: &str = "log";
/// Hex digits per path component; leaves room for the extension under
/// the usual 255-byte name limit.
const NAME_CHUNK: usize = 128;

#[derive(Debug)]
struct TableFile {
    path: PathBuf,
    file: File,
    /// Bytes of complete, durable frames.
    durable_len: u64,
    last_sequence: Sequence,
    /// Set when bytes past `durable_len` could not be rolled back; the
    /// file must be cut back before anything else is appended.
    needs_repair: bool,
}

impl TableFile {
    /// Cut the file back to its durable frames.
    fn repair(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.durable_len)?;
        self.file.sync_all()?;
        self.needs_repair = false;
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileLogStore {
    dir: PathBuf,
    sync_on_write: bool,
    tables: DashMap<TableId, Arc<Mutex<TableFile>>>,
}

impl FileLogStore {
    /// Open (or create) a log directory and recover every table file in it.
    pub fn open(dir: impl Into<PathBuf>, sync_on_write: bool) -> Result<Self, BackendError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            sync_on_write,
            tables: DashMap::new(),
        };
        store.recover()?;

        info!(
            dir = %store.dir.display(),
            tables = store.tables.len(),
            "opened file log store"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn recover(&self) -> Result<(), BackendError> {
        let mut paths = Vec::new();
        collect_log_files(&self.dir, &mut paths)?;

        for path in paths {
            let Some(table_id) = table_id_from_path(&self.dir, &path) else {
                warn!(path = %path.display(), "skipping log file with undecodable name");
                continue;
            };

            let data = fs::read(&path)?;
            let (frames, valid_len) = parse_frames(&data);

            if valid_len < data.len() {
                warn!(
                    table_id = %table_id,
                    path = %path.display(),
                    valid_len,
                    file_len = data.len(),
                    "truncating torn tail of log file"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }

            let last_sequence = frames.last().map(|(seq, _)| *seq).unwrap_or(0);
            let file = OpenOptions::new().append(true).open(&path)?;

            debug!(table_id = %table_id, last_sequence, "recovered table log");
            self.tables.insert(
                table_id,
                Arc::new(Mutex::new(TableFile {
                    path,
                    file,
                    durable_len: valid_len as u64,
                    last_sequence,
                    needs_repair: false,
                })),
            );
        }

        Ok(())
    }

    fn table_path(&self, table_id: &TableId) -> PathBuf {
        let name = hex::encode(table_id.as_str().as_bytes());
        let mut path = self.dir.clone();
        let mut rest = name.as_str();
        while rest.len() > NAME_CHUNK {
            let (chunk, tail) = rest.split_at(NAME_CHUNK);
            path.push(chunk);
            rest = tail;
        }
        path.push(format!("{rest}.{LOG_EXTENSION}"));
        path
    }

    fn slot(&self, table_id: &TableId) -> Option<Arc<Mutex<TableFile>>> {
        self.tables.get(table_id).map(|slot| Arc::clone(slot.value()))
    }

    fn slot_or_create(&self, table_id: &TableId) -> Result<Arc<Mutex<TableFile>>, BackendError> {
        let slot = self
            .tables
            .entry(table_id.clone())
            .or_try_insert_with(|| {
                let path = self.table_path(table_id);
                let parent = path.parent().unwrap_or(self.dir.as_path()).to_path_buf();
                fs::create_dir_all(&parent)?;
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                if self.sync_on_write {
                    // Make the new directory entries themselves durable.
                    let mut dir = parent.as_path();
                    loop {
                        File::open(dir)?.sync_all()?;
                        if dir == self.dir {
                            break;
                        }
                        match dir.parent() {
                            Some(up) => dir = up,
                            None => break,
                        }
                    }
                }
                Ok::<_, BackendError>(Arc::new(Mutex::new(TableFile {
                    path,
                    file,
                    durable_len: 0,
                    last_sequence: 0,
                    needs_repair: false,
                })))
            })?;
        Ok(Arc::clone(slot.value()))
    }
}

impl LogBackend for FileLogStore {
    fn append(
        &self,
        table_id: &TableId,
        sequence: Sequence,
        record: &[u8],
    ) -> Result<(), BackendError> {
        if record.len() > MAX_RECORD_LEN {
            return Err(BackendError::Io(format!(
                "record of {} bytes exceeds limit of {MAX_RECORD_LEN}",
                record.len()
            )));
        }

        let slot = self.slot_or_create(table_id)?;
        let mut table = slot.lock();

        if table.needs_repair {
            table.repair().map_err(|err| {
                BackendError::Io(format!(
                    "log of table {table_id} holds a partial frame that cannot be removed: {err}"
                ))
            })?;
            info!(table_id = %table_id, "rolled back partial frame");
        }

        let next = table.last_sequence + 1;
        if sequence != next {
            return Err(BackendError::SequenceTaken {
                table_id: table_id.clone(),
                attempted: sequence,
                next,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + record.len());
        frame.extend_from_slice(&sequence.to_be_bytes());
        frame.extend_from_slice(&(record.len() as u32).to_be_bytes());
        frame.extend_from_slice(record);

        let written = table.file.write_all(&frame).and_then(|_| {
            if self.sync_on_write {
                table.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(err) = written {
            // Drop whatever part of the frame reached the file.
            if let Err(truncate_err) = table.repair() {
                table.needs_repair = true;
                warn!(
                    table_id = %table_id,
                    error = %truncate_err,
                    "failed to roll back partial frame; appends blocked until it is removed"
                );
            }
            return Err(err.into());
        }

        table.durable_len += frame.len() as u64;
        table.last_sequence = sequence;
        Ok(())
    }

    fn read_range(
        &self,
        table_id: &TableId,
        from: Sequence,
        to: Sequence,
    ) -> Result<Vec<(Sequence, Vec<u8>)>, BackendError> {
        let Some(slot) = self.slot(table_id) else {
            return Ok(Vec::new());
        };

        let (path, visible_len) = {
            let table = slot.lock();
            (table.path.clone(), table.durable_len as usize)
        };

        let data = fs::read(&path)?;
        let visible = &data[..visible_len.min(data.len())];
        let (frames, _) = parse_frames(visible);

        Ok(frames
            .into_iter()
            .filter(|(seq, _)| *seq >= from && *seq <= to)
            .map(|(seq, record)| (seq, record.to_vec()))
            .collect())
    }

    fn last_sequence(&self, table_id: &TableId) -> Result<Sequence, BackendError> {
        Ok(self
            .slot(table_id)
            .map(|slot| slot.lock().last_sequence)
            .unwrap_or(0))
    }

    fn tables(&self) -> Result<Vec<TableId>, BackendError> {
        let mut tables: Vec<TableId> = self
            .tables
            .iter()
            .filter(|entry| entry.value().lock().last_sequence > 0)
            .map(|entry| entry.key().clone())
            .collect();
        tables.sort();
        Ok(tables)
    }
}

/// Every `.log` file under `dir`, descending into chunk directories.
fn collect_log_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), BackendError> {
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        if dir_entry.file_type()?.is_dir() {
            collect_log_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXTENSION) {
            out.push(path);
        }
    }
    Ok(())
}

fn table_id_from_path(root: &Path, path: &Path) -> Option<TableId> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let mut name = String::new();
    for component in relative.components() {
        name.push_str(component.as_os_str().to_str()?);
    }
    let bytes = hex::decode(name).ok()?;
    String::from_utf8(bytes).ok().map(TableId::new)
}

/// Split a buffer into complete frames.
///
/// Returns the frames and the byte length they cover; anything past that
/// length is an incomplete or invalid tail.
fn parse_frames(data: &[u8]) -> (Vec<(Sequence, &[u8])>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;

    while data.len() - offset >= HEADER_LEN {
        let mut seq_buf = [0u8; 8];
        seq_buf.copy_from_slice(&data[offset..offset + 8]);
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[offset + 8..offset + HEADER_LEN]);

        let sequence = u64::from_be_bytes(seq_buf);
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_RECORD_LEN || data.len() - offset - HEADER_LEN < len {
            break;
        }

        let start = offset + HEADER_LEN;
        frames.push((sequence, &data[start..start + len]));
        offset = start + len;
    }

    (frames, offset)
}

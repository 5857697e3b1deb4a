use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::*;
use crate::log::LogStorage;
use crate::protos::{LogEntry, LogIndex, Metadata};

const ENTRIES_FILE: &str = "entries.log";
const STATE_FILE: &str = "state.json";

/// Upper bound on a single record; anything larger is a corrupt length prefix
const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

/// Append-only log file driver. Each record is framed as
/// [len: u32 BE] [crc32c: u32 BE] [payload], where the payload is the MessagePack
/// serialization of the entry. An offset table rebuilt on open maps logical index to
/// file offset; truncation cuts the file at a record boundary
///
/// The sentinel entry is materialized on first open so that index 0 is always
/// resolvable and truncation always has a predecessor to fall back to
pub struct DiskLog {
	inner: Mutex<DiskLogInner>
}

struct DiskLogInner {
	file: File,

	/// offsets[i] is the file offset of the record for logical index i
	offsets: Vec<u64>,

	/// Offset one past the final record
	end: u64
}

impl DiskLog {
	pub fn open(dir: &Path) -> Result<DiskLog> {
		let path = dir.join(ENTRIES_FILE);
		let mut file = OpenOptions::new()
			.read(true).write(true).create(true)
			.open(&path)?;

		let len = file.metadata()?.len();
		let mut offsets = Vec::new();
		let mut pos = 0u64;

		while pos < len {
			file.seek(SeekFrom::Start(pos))?;
			let entry = read_record(&mut file)
				.chain_err(|| format!("corrupt log record at offset {}", pos))?;

			if entry.index != offsets.len() as u64 {
				bail!("log record at offset {} has index {}, expected {}",
					pos, entry.index, offsets.len());
			}

			offsets.push(pos);
			pos = file.seek(SeekFrom::Current(0))?;
		}

		let mut log = DiskLog {
			inner: Mutex::new(DiskLogInner { file, offsets, end: pos })
		};

		if log.inner.get_mut().unwrap().offsets.is_empty() {
			log.append(&LogEntry::sentinel())?;
		}

		Ok(log)
	}
}

impl LogStorage for DiskLog {
	fn append(&self, entry: &LogEntry) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();

		if entry.index != inner.offsets.len() as u64 {
			bail!("append out of order: index {} after {} records",
				entry.index, inner.offsets.len());
		}

		let payload = rmps::to_vec(entry)?;
		let at = inner.end;

		inner.file.seek(SeekFrom::Start(at))?;
		inner.file.write_u32::<BigEndian>(payload.len() as u32)?;
		inner.file.write_u32::<BigEndian>(crc32c::crc32c(&payload))?;
		inner.file.write_all(&payload)?;
		inner.file.sync_data()?;

		inner.offsets.push(at);
		inner.end = at + 8 + payload.len() as u64;
		Ok(())
	}

	fn truncate_to_end(&self, from: LogIndex) -> Result<()> {
		if from == 0 {
			bail!("refusing to truncate the sentinel entry");
		}

		let mut inner = self.inner.lock().unwrap();
		if from as usize >= inner.offsets.len() {
			return Ok(());
		}

		let cut = inner.offsets[from as usize];
		inner.file.set_len(cut)?;
		inner.file.sync_data()?;
		inner.offsets.truncate(from as usize);
		inner.end = cut;
		Ok(())
	}

	fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
		let mut inner = self.inner.lock().unwrap();

		let at = match inner.offsets.get(index as usize) {
			Some(&at) => at,
			None => return Ok(None)
		};

		inner.file.seek(SeekFrom::Start(at))?;
		let entry = read_record(&mut inner.file)?;
		Ok(Some(entry))
	}

	fn last_index(&self) -> Result<LogIndex> {
		let inner = self.inner.lock().unwrap();
		Ok(inner.offsets.len() as u64 - 1)
	}
}

fn read_record(file: &mut File) -> Result<LogEntry> {
	let len = file.read_u32::<BigEndian>()?;
	if len > MAX_RECORD_SIZE {
		bail!("record length {} exceeds the sanity limit", len);
	}

	let crc = file.read_u32::<BigEndian>()?;
	let mut payload = vec![0u8; len as usize];
	file.read_exact(&mut payload)?;

	if crc32c::crc32c(&payload) != crc {
		bail!("record checksum mismatch");
	}

	let entry: LogEntry = rmps::from_slice(&payload)?;
	Ok(entry)
}

/// The small persistent-state record, replaced atomically on every change. A missing
/// file means a fresh server; an unreadable one is an operator problem, never silently
/// reset
pub struct MetaStore {
	path: PathBuf
}

impl MetaStore {
	pub fn open(dir: &Path) -> MetaStore {
		MetaStore { path: dir.join(STATE_FILE) }
	}

	pub fn load(&self) -> Result<Option<Metadata>> {
		let data = match fs::read(&self.path) {
			Ok(data) => data,
			Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into())
		};

		let meta = serde_json::from_slice(&data)
			.chain_err(|| "malformed persistent state file")?;
		Ok(Some(meta))
	}

	pub fn save(&self, meta: &Metadata) -> Result<()> {
		let data = serde_json::to_vec(meta)
			.chain_err(|| "failed to serialize persistent state")?;
		common::atomic_replace(&self.path, &data)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

	fn test_dir(name: &str) -> PathBuf {
		let n = NEXT_DIR.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir()
			.join(format!("raft_storage_{}_{}_{}", name, std::process::id(), n));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	fn entry(index: LogIndex, term: u64, data: &[u8]) -> LogEntry {
		LogEntry { index, term, data: data.to_vec() }
	}

	#[test]
	fn open_materializes_the_sentinel() {
		let dir = test_dir("sentinel");
		let log = DiskLog::open(&dir).unwrap();

		assert_eq!(log.last_index().unwrap(), 0);
		assert_eq!(log.get(0).unwrap().unwrap(), LogEntry::sentinel());
	}

	#[test]
	fn entries_survive_a_reopen() {
		let dir = test_dir("reopen");

		{
			let log = DiskLog::open(&dir).unwrap();
			log.append(&entry(1, 1, b"one")).unwrap();
			log.append(&entry(2, 1, b"two")).unwrap();
		}

		let log = DiskLog::open(&dir).unwrap();
		assert_eq!(log.last_index().unwrap(), 2);
		assert_eq!(log.get(1).unwrap().unwrap(), entry(1, 1, b"one"));
		assert_eq!(log.get(2).unwrap().unwrap(), entry(2, 1, b"two"));
		assert_eq!(log.get(3).unwrap(), None);
	}

	#[test]
	fn truncation_is_durable() {
		let dir = test_dir("truncate");

		{
			let log = DiskLog::open(&dir).unwrap();
			for i in 1..=4 {
				log.append(&entry(i, 1, b"x")).unwrap();
			}
			log.truncate_to_end(2).unwrap();

			// The freed indices are reusable immediately
			log.append(&entry(2, 3, b"y")).unwrap();
		}

		let log = DiskLog::open(&dir).unwrap();
		assert_eq!(log.last_index().unwrap(), 2);
		assert_eq!(log.get(2).unwrap().unwrap(), entry(2, 3, b"y"));
		assert_eq!(log.get(3).unwrap(), None);

		assert!(log.truncate_to_end(0).is_err());
	}

	#[test]
	fn out_of_order_append_is_refused() {
		let dir = test_dir("order");
		let log = DiskLog::open(&dir).unwrap();

		assert!(log.append(&entry(5, 1, b"gap")).is_err());
	}

	#[test]
	fn meta_store_round_trip() {
		let dir = test_dir("meta");
		let store = MetaStore::open(&dir);

		assert!(store.load().unwrap().is_none());

		let meta = Metadata { current_term: 7, voted_for: Some(3), last_applied: 4 };
		store.save(&meta).unwrap();
		assert_eq!(store.load().unwrap(), Some(meta));
	}

	#[test]
	fn malformed_meta_is_an_error() {
		let dir = test_dir("badmeta");
		fs::write(dir.join(STATE_FILE), b"not json at all {").unwrap();

		let store = MetaStore::open(&dir);
		assert!(store.load().is_err());
	}
}

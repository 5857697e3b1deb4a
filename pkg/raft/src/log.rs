use std::sync::{Arc, Mutex};

use crate::errors::*;
use crate::protos::{LogEntry, LogIndex, Term};

/// Interface of a persistent log driver. Entries are addressed by their logical index
/// (matching `entry.index`); index 0 is always the sentinel entry
/// Drivers use interior locking so that the paging reads of the consensus module and
/// the appends of the runtime can share one handle
pub trait LogStorage: Send + Sync {
	/// Appends one entry; its index must immediately follow the current last index
	fn append(&self, entry: &LogEntry) -> Result<()>;

	/// Removes every entry with index >= from. The sentinel (from == 0) is irremovable
	fn truncate_to_end(&self, from: LogIndex) -> Result<()>;

	fn get(&self, index: LogIndex) -> Result<Option<LogEntry>>;

	fn last_index(&self) -> Result<LogIndex>;
}

/// Volatile driver, mainly for tests and experiments
pub struct MemoryLog {
	entries: Mutex<Vec<LogEntry>>
}

impl MemoryLog {
	pub fn new() -> MemoryLog {
		MemoryLog { entries: Mutex::new(vec![LogEntry::sentinel()]) }
	}
}

impl LogStorage for MemoryLog {
	fn append(&self, entry: &LogEntry) -> Result<()> {
		let mut entries = self.entries.lock().unwrap();
		let last = entries.last().unwrap().index;
		if entry.index != last + 1 {
			bail!("append out of order: at {} after {}", entry.index, last);
		}
		entries.push(entry.clone());
		Ok(())
	}

	fn truncate_to_end(&self, from: LogIndex) -> Result<()> {
		if from == 0 {
			bail!("refusing to truncate the sentinel entry");
		}
		let mut entries = self.entries.lock().unwrap();
		entries.truncate(from as usize);
		Ok(())
	}

	fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
		let entries = self.entries.lock().unwrap();
		Ok(entries.get(index as usize).cloned())
	}

	fn last_index(&self) -> Result<LogIndex> {
		let entries = self.entries.lock().unwrap();
		Ok(entries.last().unwrap().index)
	}
}

/// The single owner of log state as the consensus module sees it: an in-memory window
/// over the tail of the log plus a handle to the persistent driver for everything
/// older. The window always holds at least one entry so that the previous-entry checks
/// of the protocol are total
///
/// Only the tail is loaded on startup; older entries are paged in on demand and the
/// window is extended backwards when the commit index moves over entries not yet in
/// memory
pub struct Log {
	window: Vec<LogEntry>,
	store: Arc<dyn LogStorage>
}

impl Log {
	pub fn new(store: Arc<dyn LogStorage>) -> Result<Log> {
		let last = store.last_index()?;
		let tail = match store.get(last)? {
			Some(e) => e,
			None => bail!("log store is missing its own tail entry {}", last)
		};

		Ok(Log { window: vec![tail], store })
	}

	/// The driver handle, shared with the runtime which executes LogStore actions
	pub fn store(&self) -> Arc<dyn LogStorage> {
		self.store.clone()
	}

	fn window_start(&self) -> LogIndex {
		self.window[0].index
	}

	pub fn last(&self) -> &LogEntry {
		self.window.last().unwrap()
	}

	pub fn last_index(&self) -> LogIndex {
		self.last().index
	}

	pub fn term_of(&self, index: LogIndex) -> Result<Option<Term>> {
		Ok(self.get(index)?.map(|e| e.term))
	}

	pub fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
		if index > self.last_index() {
			return Ok(None);
		}
		if index >= self.window_start() {
			let off = (index - self.window_start()) as usize;
			return Ok(Some(self.window[off].clone()));
		}
		self.store.get(index)
	}

	/// All entries from the given index (inclusive) through the tail, paging the
	/// prefix from the driver where the window does not reach back far enough
	pub fn entries_from(&self, index: LogIndex) -> Result<Vec<LogEntry>> {
		if index > self.last_index() {
			return Ok(Vec::new());
		}

		let mut out = Vec::new();
		let mut i = index;
		while i < self.window_start() {
			match self.store.get(i)? {
				Some(e) => out.push(e),
				None => bail!("log store is missing entry {}", i)
			}
			i += 1;
		}

		let off = (i - self.window_start()) as usize;
		out.extend_from_slice(&self.window[off..]);
		Ok(out)
	}

	/// Appends to the window only; durability is the runtime's LogStore action
	pub fn append(&mut self, entry: LogEntry) {
		debug_assert_eq!(entry.index, self.last_index() + 1);
		self.window.push(entry);
	}

	/// Removes every entry at index >= from and returns them. When the cut reaches
	/// below the window the driver is truncated as well; the window is refilled with
	/// the entry at from - 1 so it never underflows
	pub fn truncate_from(&mut self, from: LogIndex) -> Result<Vec<LogEntry>> {
		let removed = self.entries_from(from)?;

		if from < self.window_start() {
			self.store.truncate_to_end(from)?;
			self.window.clear();
		} else {
			let keep = (from - self.window_start()) as usize;
			self.window.truncate(keep);
		}

		if self.window.is_empty() {
			match self.store.get(from - 1)? {
				Some(e) => self.window.push(e),
				None => bail!("log store is missing entry {}", from - 1)
			}
		}

		Ok(removed)
	}

	/// Extends the window backwards so that it covers the given index. Used when the
	/// commit index moves over entries that were not resident
	pub fn load_from(&mut self, index: LogIndex) -> Result<()> {
		if index > 0 && index < self.window_start() {
			self.window = self.entries_from(index)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(index: LogIndex, term: Term) -> LogEntry {
		LogEntry { index, term, data: format!("e{}", index).into_bytes() }
	}

	fn seeded_store(terms: &[Term]) -> Arc<MemoryLog> {
		let store = Arc::new(MemoryLog::new());
		for (i, &term) in terms.iter().enumerate() {
			store.append(&entry(i as LogIndex + 1, term)).unwrap();
		}
		store
	}

	#[test]
	fn starts_with_only_the_tail_resident() {
		let store = seeded_store(&[1, 1, 2]);
		let log = Log::new(store).unwrap();

		assert_eq!(log.window_start(), 3);
		assert_eq!(log.last_index(), 3);

		// Older entries still resolve through the driver
		assert_eq!(log.term_of(1).unwrap(), Some(1));
		assert_eq!(log.get(2).unwrap().unwrap(), entry(2, 1));
		assert_eq!(log.term_of(4).unwrap(), None);
	}

	#[test]
	fn entries_from_pages_the_prefix() {
		let store = seeded_store(&[1, 1, 2, 2]);
		let log = Log::new(store).unwrap();

		let all = log.entries_from(2).unwrap();
		assert_eq!(all, vec![entry(2, 1), entry(3, 2), entry(4, 2)]);

		assert!(log.entries_from(5).unwrap().is_empty());
	}

	#[test]
	fn truncate_refills_from_the_store() {
		let store = seeded_store(&[1, 1, 2]);
		let mut log = Log::new(store).unwrap();

		// The whole window (just entry 3) goes away; entry 2 must be pulled back in
		let removed = log.truncate_from(3).unwrap();
		assert_eq!(removed, vec![entry(3, 2)]);
		assert_eq!(log.last_index(), 2);
		assert_eq!(log.last().term, 1);
	}

	#[test]
	fn truncate_below_window_hits_the_driver() {
		let store = seeded_store(&[1, 1, 2]);
		let mut log = Log::new(store.clone()).unwrap();

		let removed = log.truncate_from(2).unwrap();
		assert_eq!(removed.len(), 2);
		assert_eq!(log.last_index(), 1);
		assert_eq!(store.last_index().unwrap(), 1);
	}

	#[test]
	fn load_from_extends_the_window() {
		let store = seeded_store(&[1, 2, 3]);
		let mut log = Log::new(store).unwrap();

		log.load_from(1).unwrap();
		assert_eq!(log.window_start(), 1);
		assert_eq!(log.last_index(), 3);
	}

	#[test]
	fn append_extends_the_tail() {
		let store = seeded_store(&[1]);
		let mut log = Log::new(store).unwrap();

		log.append(entry(2, 1));
		assert_eq!(log.last_index(), 2);
		assert_eq!(log.entries_from(1).unwrap().len(), 2);
	}
}

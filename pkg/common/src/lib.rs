extern crate fs2;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// An advisory exclusive lock on a data directory
/// Held for the lifetime of this object so that two server instances can never operate on the same files
pub struct DirLock {
	/// File kept open for the duration of the lock
	_file: File,

	path: PathBuf
}

impl DirLock {
	/// Locks an existing directory
	/// NOTE: Will currently panic if the directory does not exist (the caller is responsible for creating it)
	pub fn open(path: &Path) -> io::Result<DirLock> {
		if !path.is_dir() {
			return Err(io::Error::new(io::ErrorKind::NotFound, "Directory does not exist"));
		}

		let lockfile_path = path.join("LOCK");

		let lockfile = OpenOptions::new()
			.write(true).create(true)
			.open(&lockfile_path)?;

		// Returns an error if another process already holds it
		lockfile.try_lock_exclusive()?;

		Ok(DirLock {
			_file: lockfile,
			path: path.to_owned()
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

/// Replaces the contents of a file such that a crash at any point leaves either the old or the new contents intact
/// Writes to a sibling temporary file, syncs it, and renames over the destination
pub fn atomic_replace(path: &Path, data: &[u8]) -> io::Result<()> {
	let mut tmp_path = path.to_owned().into_os_string();
	tmp_path.push(".tmp");
	let tmp_path = PathBuf::from(tmp_path);

	{
		let mut f = File::create(&tmp_path)?;
		f.write_all(data)?;
		f.sync_all()?;
	}

	fs::rename(&tmp_path, path)?;
	Ok(())
}

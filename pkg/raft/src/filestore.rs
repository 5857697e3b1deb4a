use std::collections::HashMap;
use std::io::{self, BufRead, ErrorKind};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use raft::state_machine::StateMachine;

const MAX_FILENAME_LEN: usize = 250;
const MAX_CONTENTS_LEN: u64 = 10 * 1024 * 1024;

/// One file-store command or reply. Commands travel through the replicated log as
/// MessagePack; replies additionally have a line rendering for the client protocol
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Msg {
	Read { filename: String },
	Write { filename: String, contents: Vec<u8>, exptime: Option<u64> },
	Cas { filename: String, version: u64, contents: Vec<u8>, exptime: Option<u64> },
	Delete { filename: String },

	Contents { version: u64, exptime: u64, contents: Vec<u8> },
	Ok { version: Option<u64> },
	ErrFileNotFound,
	ErrVersion { version: u64 },
	ErrCmd,
	ErrInternal,
	Redirect { addr: String }
}

#[derive(Debug)]
pub enum ReadError {
	/// The client spoke something that is not a command
	Malformed,

	/// The connection ended or broke mid-command
	Io(io::Error)
}

/// Parses one command off the wire. Commands carrying contents are followed by
/// exactly `numbytes` bytes and a CRLF
pub fn read_msg<R: BufRead>(r: &mut R) -> Result<Msg, ReadError> {
	let mut line = String::new();
	let n = r.read_line(&mut line).map_err(ReadError::Io)?;
	if n == 0 {
		return Err(ReadError::Io(io::Error::new(ErrorKind::UnexpectedEof, "connection closed")));
	}

	let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
	let mut parts = line.split_whitespace();

	let msg = match parts.next() {
		Some("read") => Msg::Read { filename: filename(parts.next())? },

		Some("delete") => Msg::Delete { filename: filename(parts.next())? },

		Some("write") => {
			let filename = filename(parts.next())?;
			let numbytes = number(parts.next())?;
			let exptime = optional_number(parts.next())?;
			no_more(&mut parts)?;
			let contents = read_contents(r, numbytes)?;
			return Ok(Msg::Write { filename, contents, exptime });
		}

		Some("cas") => {
			let filename = filename(parts.next())?;
			let version = number(parts.next())?;
			let numbytes = number(parts.next())?;
			let exptime = optional_number(parts.next())?;
			no_more(&mut parts)?;
			let contents = read_contents(r, numbytes)?;
			return Ok(Msg::Cas { filename, version, contents, exptime });
		}

		_ => return Err(ReadError::Malformed)
	};

	no_more(&mut parts)?;
	Ok(msg)
}

fn filename(part: Option<&str>) -> Result<String, ReadError> {
	match part {
		Some(name) if !name.is_empty() && name.len() <= MAX_FILENAME_LEN => Ok(name.to_string()),
		_ => Err(ReadError::Malformed)
	}
}

fn number(part: Option<&str>) -> Result<u64, ReadError> {
	part.and_then(|p| p.parse().ok()).ok_or(ReadError::Malformed)
}

fn optional_number(part: Option<&str>) -> Result<Option<u64>, ReadError> {
	match part {
		None => Ok(None),
		Some(p) => p.parse().map(Some).map_err(|_| ReadError::Malformed)
	}
}

fn no_more(parts: &mut std::str::SplitWhitespace) -> Result<(), ReadError> {
	match parts.next() {
		None => Ok(()),
		Some(_) => Err(ReadError::Malformed)
	}
}

fn read_contents<R: BufRead>(r: &mut R, numbytes: u64) -> Result<Vec<u8>, ReadError> {
	if numbytes > MAX_CONTENTS_LEN {
		return Err(ReadError::Malformed);
	}

	let mut contents = vec![0u8; numbytes as usize];
	r.read_exact(&mut contents).map_err(ReadError::Io)?;

	let mut crlf = [0u8; 2];
	r.read_exact(&mut crlf).map_err(ReadError::Io)?;
	if &crlf != b"\r\n" {
		return Err(ReadError::Malformed);
	}
	Ok(contents)
}

struct FileNode {
	contents: Vec<u8>,
	version: u64,
	expires: Option<Instant>
}

/// The replicated application: files keyed by name, each carrying a version that
/// increments on every successful write or cas, and an optional expiry after which
/// the file behaves as absent
pub struct FileStore {
	files: Mutex<HashMap<String, FileNode>>
}

impl FileStore {
	pub fn new() -> FileStore {
		FileStore { files: Mutex::new(HashMap::new()) }
	}

	pub fn process(&self, msg: &Msg) -> Msg {
		let mut files = self.files.lock().unwrap();

		match msg {
			Msg::Read { filename } => {
				match live(&mut files, filename) {
					Some(node) => Msg::Contents {
						version: node.version,
						exptime: remaining_secs(node.expires),
						contents: node.contents.clone()
					},
					None => Msg::ErrFileNotFound
				}
			}

			Msg::Write { filename, contents, exptime } => {
				let version = live(&mut files, filename).map_or(0, |n| n.version) + 1;
				files.insert(filename.clone(), FileNode {
					contents: contents.clone(),
					version,
					expires: expires_at(*exptime)
				});
				Msg::Ok { version: Some(version) }
			}

			Msg::Cas { filename, version, contents, exptime } => {
				match live(&mut files, filename) {
					None => Msg::ErrFileNotFound,
					Some(node) => {
						if node.version != *version {
							Msg::ErrVersion { version: node.version }
						} else {
							node.contents = contents.clone();
							node.version += 1;
							node.expires = expires_at(*exptime);
							Msg::Ok { version: Some(node.version) }
						}
					}
				}
			}

			Msg::Delete { filename } => {
				if live(&mut files, filename).is_some() {
					files.remove(filename);
					Msg::Ok { version: None }
				} else {
					Msg::ErrFileNotFound
				}
			}

			// Replies are never valid commands
			_ => Msg::ErrCmd
		}
	}
}

/// Looks a file up, reaping it first if its expiry has passed
fn live<'a>(files: &'a mut HashMap<String, FileNode>, name: &str) -> Option<&'a mut FileNode> {
	let expired = match files.get(name) {
		Some(node) => node.expires.map_or(false, |at| Instant::now() >= at),
		None => return None
	};
	if expired {
		files.remove(name);
		return None;
	}
	files.get_mut(name)
}

fn expires_at(exptime: Option<u64>) -> Option<Instant> {
	match exptime {
		None | Some(0) => None,
		Some(secs) => Some(Instant::now() + Duration::from_secs(secs))
	}
}

fn remaining_secs(expires: Option<Instant>) -> u64 {
	expires.map_or(0, |at| at.saturating_duration_since(Instant::now()).as_secs())
}

impl StateMachine for FileStore {
	fn apply(&self, payload: &[u8]) -> Vec<u8> {
		let reply = match rmps::from_slice::<Msg>(payload) {
			Ok(msg) => self.process(&msg),
			Err(_) => Msg::ErrInternal
		};
		rmps::to_vec(&reply).unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::BufReader;

	fn parse(input: &[u8]) -> Result<Msg, ReadError> {
		read_msg(&mut BufReader::new(input))
	}

	#[test]
	fn commands_parse_off_the_wire() {
		assert_eq!(parse(b"read foo\r\n").unwrap(), Msg::Read { filename: "foo".into() });
		assert_eq!(parse(b"delete foo\r\n").unwrap(), Msg::Delete { filename: "foo".into() });

		assert_eq!(parse(b"write foo 3\r\nabc\r\n").unwrap(), Msg::Write {
			filename: "foo".into(), contents: b"abc".to_vec(), exptime: None
		});
		assert_eq!(parse(b"write foo 3 60\r\nabc\r\n").unwrap(), Msg::Write {
			filename: "foo".into(), contents: b"abc".to_vec(), exptime: Some(60)
		});
		assert_eq!(parse(b"cas foo 7 3\r\nabc\r\n").unwrap(), Msg::Cas {
			filename: "foo".into(), version: 7, contents: b"abc".to_vec(), exptime: None
		});
	}

	#[test]
	fn malformed_commands_are_rejected() {
		for &bad in [
			&b"frobnicate foo\r\n"[..],
			&b"read\r\n"[..],
			&b"read foo extra\r\n"[..],
			&b"write foo notanumber\r\nabc\r\n"[..],
			&b"write foo 3\r\nabcd\r\n"[..]  // contents not terminated by CRLF
		].iter() {
			match parse(bad) {
				Err(ReadError::Malformed) => {}
				other => panic!("expected a parse failure for {:?}, got {:?}", bad, other)
			}
		}
	}

	#[test]
	fn closed_connections_read_as_io_errors() {
		match parse(b"") {
			Err(ReadError::Io(_)) => {}
			other => panic!("expected an io error, got {:?}", other)
		}
	}

	#[test]
	fn writes_bump_the_version() {
		let store = FileStore::new();

		let r1 = store.process(&Msg::Write {
			filename: "f".into(), contents: b"a".to_vec(), exptime: None
		});
		assert_eq!(r1, Msg::Ok { version: Some(1) });

		let r2 = store.process(&Msg::Write {
			filename: "f".into(), contents: b"b".to_vec(), exptime: None
		});
		assert_eq!(r2, Msg::Ok { version: Some(2) });

		match store.process(&Msg::Read { filename: "f".into() }) {
			Msg::Contents { version, exptime, contents } => {
				assert_eq!(version, 2);
				assert_eq!(exptime, 0);
				assert_eq!(contents, b"b".to_vec());
			}
			other => panic!("unexpected read reply {:?}", other)
		}
	}

	#[test]
	fn cas_succeeds_only_on_the_current_version() {
		let store = FileStore::new();
		store.process(&Msg::Write { filename: "f".into(), contents: b"a".to_vec(), exptime: None });

		let stale = store.process(&Msg::Cas {
			filename: "f".into(), version: 9, contents: b"b".to_vec(), exptime: None
		});
		assert_eq!(stale, Msg::ErrVersion { version: 1 });

		let fresh = store.process(&Msg::Cas {
			filename: "f".into(), version: 1, contents: b"b".to_vec(), exptime: None
		});
		assert_eq!(fresh, Msg::Ok { version: Some(2) });

		let missing = store.process(&Msg::Cas {
			filename: "ghost".into(), version: 1, contents: b"b".to_vec(), exptime: None
		});
		assert_eq!(missing, Msg::ErrFileNotFound);
	}

	#[test]
	fn deletes_and_missing_files() {
		let store = FileStore::new();
		assert_eq!(store.process(&Msg::Delete { filename: "f".into() }), Msg::ErrFileNotFound);
		assert_eq!(store.process(&Msg::Read { filename: "f".into() }), Msg::ErrFileNotFound);

		store.process(&Msg::Write { filename: "f".into(), contents: b"a".to_vec(), exptime: None });
		assert_eq!(store.process(&Msg::Delete { filename: "f".into() }), Msg::Ok { version: None });
		assert_eq!(store.process(&Msg::Read { filename: "f".into() }), Msg::ErrFileNotFound);
	}

	#[test]
	fn replies_are_not_commands() {
		let store = FileStore::new();
		assert_eq!(store.process(&Msg::ErrInternal), Msg::ErrCmd);
	}

	#[test]
	fn apply_round_trips_through_messagepack() {
		let store = FileStore::new();
		let cmd = rmps::to_vec(&Msg::Write {
			filename: "f".into(), contents: b"abc".to_vec(), exptime: None
		}).unwrap();

		let reply: Msg = rmps::from_slice(&store.apply(&cmd)).unwrap();
		assert_eq!(reply, Msg::Ok { version: Some(1) });

		let reply: Msg = rmps::from_slice(&store.apply(b"garbage")).unwrap();
		assert_eq!(reply, Msg::ErrInternal);
	}
}

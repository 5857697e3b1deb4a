use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use raft::errors::*;
use raft::server::{ExecuteError, Server};

use crate::filestore::{read_msg, FileStore, Msg, ReadError};

/// Accepts client connections forever; each one is served on its own thread with one
/// command outstanding at a time
pub fn serve(server: Arc<Server<FileStore>>, port: u16) -> Result<()> {
	let listener = TcpListener::bind(("0.0.0.0", port))
		.chain_err(|| format!("cannot bind the client listener on port {}", port))?;
	info!("client listener on port {}", port);

	for conn in listener.incoming() {
		match conn {
			Ok(stream) => {
				let server = server.clone();
				thread::spawn(move || serve_conn(server, stream));
			}
			Err(e) => warn!("failed to accept a client connection: {}", e)
		}
	}
	Ok(())
}

fn serve_conn(server: Arc<Server<FileStore>>, stream: TcpStream) {
	let mut reader = match stream.try_clone() {
		Ok(s) => BufReader::new(s),
		Err(_) => return
	};
	let mut writer = stream;

	loop {
		let msg = match read_msg(&mut reader) {
			Ok(msg) => msg,
			Err(ReadError::Malformed) => {
				let _ = write_reply(&mut writer, &Msg::ErrCmd);
				return;
			}
			Err(ReadError::Io(_)) => return
		};

		// The command is opaque to the consensus layer; it replicates the bytes and
		// hands back whatever the file store answered at commit time
		let payload = match rmps::to_vec(&msg) {
			Ok(p) => p,
			Err(_) => {
				let _ = write_reply(&mut writer, &Msg::ErrInternal);
				continue;
			}
		};

		let reply = match server.execute(payload) {
			Ok(bytes) => match rmps::from_slice::<Msg>(&bytes) {
				Ok(reply) => reply,
				Err(_) => Msg::ErrInternal
			},

			Err(ExecuteError::NotLeader { leader_addr: Some(addr) }) => Msg::Redirect { addr },

			// No known leader: nothing useful to point the client at
			Err(ExecuteError::NotLeader { leader_addr: None }) => Msg::ErrInternal,

			Err(ExecuteError::Aborted) => Msg::ErrInternal,

			// An abandoned rendezvous takes its connection with it
			Err(ExecuteError::Timeout) => return
		};

		if write_reply(&mut writer, &reply).is_err() {
			return;
		}
	}
}

/// Renders a reply in the line protocol; contents follow their header line
pub fn write_reply<W: Write>(w: &mut W, msg: &Msg) -> std::io::Result<()> {
	let line = match msg {
		Msg::Contents { version, exptime, contents } =>
			format!("CONTENTS {} {} {}", version, contents.len(), exptime),
		Msg::Ok { version: Some(v) } => format!("OK {}", v),
		Msg::Ok { version: None } => "OK".to_string(),
		Msg::ErrFileNotFound => "ERR_FILE_NOT_FOUND".to_string(),
		Msg::ErrVersion { version } => format!("ERR_VERSION {}", version),
		Msg::ErrCmd => "ERR_CMD_ERR".to_string(),
		Msg::ErrInternal => "ERR_INTERNAL".to_string(),
		Msg::Redirect { addr } => format!("ERR_REDIRECT {}", addr),

		// Commands have no line rendering; seeing one here is a bug upstream
		_ => "ERR_INTERNAL".to_string()
	};

	w.write_all(line.as_bytes())?;
	w.write_all(b"\r\n")?;
	if let Msg::Contents { contents, .. } = msg {
		w.write_all(contents)?;
		w.write_all(b"\r\n")?;
	}
	w.flush()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rendered(msg: &Msg) -> Vec<u8> {
		let mut buf = Vec::new();
		write_reply(&mut buf, msg).unwrap();
		buf
	}

	#[test]
	fn replies_render_in_the_line_protocol() {
		assert_eq!(rendered(&Msg::Ok { version: Some(3) }), b"OK 3\r\n".to_vec());
		assert_eq!(rendered(&Msg::Ok { version: None }), b"OK\r\n".to_vec());
		assert_eq!(rendered(&Msg::ErrFileNotFound), b"ERR_FILE_NOT_FOUND\r\n".to_vec());
		assert_eq!(rendered(&Msg::ErrVersion { version: 7 }), b"ERR_VERSION 7\r\n".to_vec());
		assert_eq!(rendered(&Msg::ErrCmd), b"ERR_CMD_ERR\r\n".to_vec());
		assert_eq!(
			rendered(&Msg::Redirect { addr: "10.0.0.2:6001".into() }),
			b"ERR_REDIRECT 10.0.0.2:6001\r\n".to_vec()
		);
	}

	#[test]
	fn contents_carry_their_payload_line() {
		let reply = Msg::Contents { version: 2, exptime: 60, contents: b"abc".to_vec() };
		assert_eq!(rendered(&reply), b"CONTENTS 2 3 60\r\nabc\r\n".to_vec());
	}
}

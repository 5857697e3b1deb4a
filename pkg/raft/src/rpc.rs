use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::config::PeerConfig;
use crate::errors::*;
use crate::protos::{Destination, Envelope, PeerMessage, ServerId};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything larger than this is a corrupt length prefix, not a message
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Writes one length-prefixed MessagePack frame
pub fn write_frame<W: Write>(w: &mut W, msg: &PeerMessage) -> Result<()> {
	let payload = rmps::to_vec(msg)?;
	w.write_u32::<BigEndian>(payload.len() as u32)?;
	w.write_all(&payload)?;
	w.flush()?;
	Ok(())
}

/// Reads one frame; errors cover both a closed stream and undecodable bytes
pub fn read_frame<R: Read>(r: &mut R) -> Result<PeerMessage> {
	let len = r.read_u32::<BigEndian>()?;
	if len > MAX_FRAME_SIZE {
		bail!("frame length {} exceeds the sanity limit", len);
	}

	let mut payload = vec![0u8; len as usize];
	r.read_exact(&mut payload)?;
	Ok(rmps::from_slice(&payload)?)
}

/// The peer-to-peer message bus: a listener accepting inbound connections whose frames
/// are funneled into the inbox channel, plus one sender thread per peer which owns the
/// outbound connection and reconnects lazily
///
/// Delivery is best effort: a frame that cannot be written is dropped and the protocol
/// above recovers through retransmission
pub struct Cluster {
	outboxes: HashMap<ServerId, Sender<PeerMessage>>,
	listen_addr: SocketAddr,
	shutdown: Arc<AtomicBool>,
	acceptor: Option<JoinHandle<()>>
}

impl Cluster {
	/// Binds the peer listener and spawns the sender threads. Fails fast if the
	/// listen address is unusable
	pub fn start(id: ServerId, peers: &[PeerConfig], inbox: Sender<Envelope>) -> Result<Cluster> {
		let me = match peers.iter().find(|p| p.id == id) {
			Some(p) => p,
			None => bail!("server {} is not in the peer list", id)
		};

		let listener = TcpListener::bind(me.addr().as_str())
			.chain_err(|| format!("cannot bind peer listener on {}", me.addr()))?;
		let listen_addr = listener.local_addr()?;

		let shutdown = Arc::new(AtomicBool::new(false));
		let acceptor = {
			let shutdown = shutdown.clone();
			thread::spawn(move || accept_loop(listener, inbox, shutdown))
		};

		let mut outboxes = HashMap::new();
		for peer in peers.iter().filter(|p| p.id != id) {
			let (tx, rx) = channel();
			let peer_id = peer.id;
			let addr = peer.addr();
			thread::spawn(move || sender_loop(peer_id, addr, rx));
			outboxes.insert(peer.id, tx);
		}

		Ok(Cluster {
			outboxes,
			listen_addr,
			shutdown,
			acceptor: Some(acceptor)
		})
	}

	pub fn send(&self, to: Destination, msg: PeerMessage) {
		match to {
			Destination::To(id) => {
				match self.outboxes.get(&id) {
					// The sender thread being gone only means we are shutting down
					Some(tx) => { let _ = tx.send(msg); }
					None => warn!("dropping message for unknown server {}", id)
				}
			}
			Destination::Broadcast => {
				for tx in self.outboxes.values() {
					let _ = tx.send(msg.clone());
				}
			}
		}
	}

	/// Stops accepting, joins the acceptor, and releases every outbound connection
	pub fn shutdown(&mut self) {
		if self.shutdown.swap(true, Ordering::SeqCst) {
			return;
		}

		// Poke our own listener so the blocking accept observes the flag
		let _ = TcpStream::connect_timeout(&self.listen_addr, CONNECT_TIMEOUT);
		if let Some(handle) = self.acceptor.take() {
			let _ = handle.join();
		}

		// Dropping the outboxes ends the sender threads
		self.outboxes.clear();
	}
}

impl Drop for Cluster {
	fn drop(&mut self) {
		self.shutdown();
	}
}

fn accept_loop(listener: TcpListener, inbox: Sender<Envelope>, shutdown: Arc<AtomicBool>) {
	for conn in listener.incoming() {
		if shutdown.load(Ordering::SeqCst) {
			break;
		}
		match conn {
			Ok(stream) => {
				let inbox = inbox.clone();
				thread::spawn(move || receive_loop(stream, inbox));
			}
			Err(e) => warn!("failed to accept a peer connection: {}", e)
		}
	}
}

fn receive_loop(stream: TcpStream, inbox: Sender<Envelope>) {
	let mut reader = BufReader::new(stream);
	loop {
		match read_frame(&mut reader) {
			Ok(msg) => {
				let envelope = Envelope { from: msg.from_id(), msg };
				if inbox.send(envelope).is_err() {
					// The node loop is gone
					break;
				}
			}
			Err(e) => {
				// Closed connection or garbage on the wire; either way this stream is done
				debug!("peer connection ended: {}", e);
				break;
			}
		}
	}
}

fn sender_loop(peer_id: ServerId, addr: String, rx: Receiver<PeerMessage>) {
	let mut conn: Option<TcpStream> = None;

	for msg in rx.iter() {
		// One reconnect attempt per message; a frame lost here is recovered by the
		// protocol's retransmission, not by queueing
		let mut delivered = false;
		for _ in 0..2 {
			if conn.is_none() {
				conn = connect(&addr);
			}
			if let Some(ref mut stream) = conn {
				if write_frame(stream, &msg).is_ok() {
					delivered = true;
					break;
				}
			}
			conn = None;
		}

		if !delivered {
			debug!("dropping frame for unreachable server {} at {}", peer_id, addr);
		}
	}
}

fn connect(addr: &str) -> Option<TcpStream> {
	let sockaddr = addr.to_socket_addrs().ok()?.next()?;
	let stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT).ok()?;
	stream.set_nodelay(true).ok()?;
	Some(stream)
}

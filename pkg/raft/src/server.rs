use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Config;
use crate::node::{Commit, RaftNode};
use crate::protos::{CommitError, Request, ServerId};
use crate::state_machine::StateMachine;

/// How long a submitted command may wait for its commit before the request is
/// abandoned and the connection torn down
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal outcome of a client command at the submission boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteError {
	/// This server cannot help; resubmit at the given address if one is known
	NotLeader { leader_addr: Option<String> },

	/// The command was lost to a leader change before committing; safe to retry
	Aborted,

	/// No commit arrived within the request timeout
	Timeout
}

pub type ExecuteResult = std::result::Result<Vec<u8>, ExecuteError>;

type Waiter = SyncSender<ExecuteResult>;

struct Shared<S: StateMachine> {
	node: Arc<RaftNode>,
	machine: Arc<S>,

	/// Rendezvous per in-flight request, keyed by request id. Written by submitting
	/// connection threads, read by the commit consumer
	active: RwLock<HashMap<u64, Waiter>>,

	next_req_id: AtomicU64,

	/// Client-facing address of every peer, for building redirects
	client_addrs: HashMap<ServerId, String>
}

/// The linearizing dispatcher between client connections and the replicated log.
/// Every inbound command is wrapped with this server's id and a fresh request id,
/// submitted to the node, and parked on a rendezvous; the commit consumer thread
/// applies committed entries to the application and routes each commit (or its
/// failure) back to the rendezvous registered on the origin server
pub struct Server<S: StateMachine> {
	shared: Arc<Shared<S>>,
	consumer: Mutex<Option<JoinHandle<()>>>
}

impl<S: StateMachine> Server<S> {
	pub fn start(
		node: Arc<RaftNode>, machine: Arc<S>, config: &Config, commits: Receiver<Commit>
	) -> Arc<Server<S>> {
		let shared = Arc::new(Shared {
			node,
			machine,
			active: RwLock::new(HashMap::new()),
			next_req_id: AtomicU64::new(0),
			client_addrs: config.peers.iter()
				.map(|p| (p.id, p.client_addr()))
				.collect()
		});

		let consumer = {
			let shared = shared.clone();
			thread::spawn(move || consume_commits(shared, commits))
		};

		Arc::new(Server {
			shared,
			consumer: Mutex::new(Some(consumer))
		})
	}

	/// Replicates one command and blocks until its commit is routed back, the
	/// request times out, or the command is rejected
	pub fn execute(&self, payload: Vec<u8>) -> ExecuteResult {
		let req_id = self.shared.next_req_id.fetch_add(1, Ordering::SeqCst) + 1;

		let (tx, rx) = sync_channel(1);
		self.shared.active.write().unwrap().insert(req_id, tx);

		let wrapped = Request {
			origin: self.shared.node.id(),
			req_id,
			payload
		};
		// The wrapper is plain data; failing to encode it would be a programming error
		let encoded = rmps::to_vec(&wrapped).expect("request wrapper must encode");
		self.shared.node.append(encoded);

		let outcome = match rx.recv_timeout(REQUEST_TIMEOUT) {
			Ok(outcome) => outcome,
			Err(_) => Err(ExecuteError::Timeout)
		};

		self.shared.active.write().unwrap().remove(&req_id);
		outcome
	}

	pub fn node(&self) -> &Arc<RaftNode> {
		&self.shared.node
	}

	/// Stops the node, waits for the commit stream to drain, and joins the consumer
	pub fn shutdown(&self) {
		self.shared.node.shutdown();
		if let Some(handle) = self.consumer.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}

fn consume_commits<S: StateMachine>(shared: Arc<Shared<S>>, commits: Receiver<Commit>) {
	for commit in commits.iter() {
		let request: Request = match rmps::from_slice(&commit.entry.data) {
			Ok(r) => r,
			Err(e) => {
				warn!("dropping undecodable entry {}: {}", commit.entry.index, e);
				continue;
			}
		};

		let outcome = match commit.error {
			// Committed entries mutate the application on every replica; the reply
			// only matters on the origin
			None => Ok(shared.machine.apply(&request.payload)),

			Some(CommitError::NotLeader { leader }) => {
				let leader_addr = leader
					.and_then(|id| shared.client_addrs.get(&id).cloned());
				Err(ExecuteError::NotLeader { leader_addr })
			}

			Some(CommitError::Overwritten) => Err(ExecuteError::Aborted)
		};

		if request.origin == shared.node.id() {
			let waiter = shared.active.read().unwrap().get(&request.req_id).cloned();
			if let Some(waiter) = waiter {
				// The rendezvous may be full or the client gone; either way the
				// commit itself already happened
				let _ = waiter.try_send(outcome);
			}
		}

		shared.node.update_last_applied(commit.entry.index);
	}

	debug!("commit stream closed; dispatcher exiting");
}

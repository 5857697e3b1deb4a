use std::sync::mpsc::{channel, sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::consensus::{ConsensusModule, Tick};
use crate::errors::*;
use crate::log::{Log, LogStorage};
use crate::protos::*;
use crate::rpc::Cluster;
use crate::storage::{DiskLog, MetaStore};

/// Commits queue up here for the dispatcher; a full channel backpressures the loop
const COMMIT_CHANNEL_CAPACITY: usize = 200;

/// A committed entry, or a client command that failed before reaching the log
#[derive(Debug, Clone)]
pub struct Commit {
	pub entry: LogEntry,
	pub error: Option<CommitError>
}

enum LoopMessage {
	Event(Event),
	Shutdown
}

/// Handle on a running replica: owns the event loop thread which in turn owns the
/// consensus module, the transport, and the storage. Everything reaches the module
/// through the single event channel, so exactly one event is reduced at a time and its
/// actions finish before the next event is dequeued
pub struct RaftNode {
	id: ServerId,
	events: Sender<LoopMessage>,
	handle: Mutex<Option<JoinHandle<()>>>
}

impl RaftNode {
	/// Loads (or initializes) the durable state under the configured directory,
	/// starts the peer transport, and spawns the loop. Returns the node handle plus
	/// the commit stream the dispatcher consumes
	pub fn start(config: &Config) -> Result<(Arc<RaftNode>, Receiver<Commit>)> {
		let meta_store = MetaStore::open(&config.log_dir);
		let meta = match meta_store.load()? {
			Some(meta) => {
				info!("[{}] restored: term {}, voted_for {:?}, last_applied {}",
					config.id, meta.current_term, meta.voted_for, meta.last_applied);
				meta
			}
			None => {
				let meta = Metadata::default();
				meta_store.save(&meta)?;
				meta
			}
		};

		let store: Arc<dyn LogStorage> = Arc::new(DiskLog::open(&config.log_dir)?);
		let log = Log::new(store.clone())?;

		let module = ConsensusModule::new(
			config.id, config.peer_ids(), meta, log,
			config.election_timeout_ms, config.heartbeat_timeout_ms
		);

		let (event_tx, event_rx) = channel();
		let (commit_tx, commit_rx) = sync_channel(COMMIT_CHANNEL_CAPACITY);

		// The transport delivers into its own channel; a forwarder folds the envelopes
		// into the one stream the loop blocks on
		let (envelope_tx, envelope_rx) = channel();
		let cluster = Cluster::start(config.id, &config.peers, envelope_tx)?;
		{
			let events = event_tx.clone();
			thread::spawn(move || {
				for envelope in envelope_rx.iter() {
					let forwarded = events.send(LoopMessage::Event(Event::from(envelope.msg)));
					if forwarded.is_err() {
						break;
					}
				}
			});
		}

		let handle = thread::spawn(move || {
			run_loop(module, cluster, store, meta_store, event_rx, commit_tx)
		});

		let node = Arc::new(RaftNode {
			id: config.id,
			events: event_tx,
			handle: Mutex::new(Some(handle))
		});
		Ok((node, commit_rx))
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	/// Submits a client command; the outcome comes back through the commit stream
	pub fn append(&self, data: Vec<u8>) {
		let _ = self.events.send(LoopMessage::Event(Event::ClientAppend { data }));
	}

	/// Tells the module the dispatcher has routed the commit at the given index
	pub fn update_last_applied(&self, index: LogIndex) {
		let _ = self.events.send(LoopMessage::Event(Event::UpdateLastApplied { index }));
	}

	/// Stops the loop and blocks until transport and log are released
	pub fn shutdown(&self) {
		let _ = self.events.send(LoopMessage::Shutdown);
		if let Some(handle) = self.handle.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}

fn run_loop(
	mut module: ConsensusModule,
	mut cluster: Cluster,
	store: Arc<dyn LogStorage>,
	meta_store: MetaStore,
	events: Receiver<LoopMessage>,
	commits: SyncSender<Commit>
) {
	let mut deadline = Instant::now() + Duration::from_millis(module.initial_alarm_ms());

	loop {
		let now = Instant::now();
		let wait = if deadline > now { deadline - now } else { Duration::from_millis(0) };

		let event = match events.recv_timeout(wait) {
			Ok(LoopMessage::Event(event)) => event,
			Ok(LoopMessage::Shutdown) => {
				info!("[{}] shutting down", module.id());
				break;
			}
			Err(RecvTimeoutError::Timeout) => {
				// Fallback deadline in case the reducer leaves the alarm untouched
				deadline = Instant::now() + Duration::from_millis(module.initial_alarm_ms());
				Event::Timeout
			}
			Err(RecvTimeoutError::Disconnected) => break
		};

		let mut tick = Tick::empty();
		if let Err(e) = module.handle(event, &mut tick) {
			error!("[{}] consensus failure: {}", module.id(), e);
			std::process::exit(1);
		}

		let executed = execute(&cluster, store.as_ref(), &meta_store, &commits, tick, &mut deadline);
		if let Err(e) = executed {
			// A state or log flush that cannot complete means this replica is done;
			// the rest of the cluster treats it as a crash
			error!("[{}] persistence failure: {}", module.id(), e);
			std::process::exit(1);
		}
	}

	cluster.shutdown();
	// Dropping `commits` here closes the commit stream and unblocks the dispatcher
}

fn execute(
	cluster: &Cluster,
	store: &dyn LogStorage,
	meta_store: &MetaStore,
	commits: &SyncSender<Commit>,
	tick: Tick,
	deadline: &mut Instant
) -> Result<()> {
	for action in tick.actions {
		match action {
			Action::Send { to, msg } => cluster.send(to, msg),

			Action::LogStore { entry } => store_entry(store, &entry)?,

			Action::PersistState { meta } => meta_store.save(&meta)?,

			Action::Commit { entry, error } => {
				// A send failure only means the dispatcher is already gone
				let _ = commits.send(Commit { entry, error });
			}

			Action::SetAlarm { after_ms } => {
				*deadline = Instant::now() + Duration::from_millis(after_ms);
			}
		}
	}
	Ok(())
}

/// Appends to the durable log, truncating a stale suffix first so the driver stays
/// contiguous. A hole between the durable tail and the entry is unrecoverable
fn store_entry(store: &dyn LogStorage, entry: &LogEntry) -> Result<()> {
	let last = store.last_index()?;
	if last >= entry.index {
		store.truncate_to_end(entry.index)?;
	} else if last + 1 != entry.index {
		bail!("log store gap: durable tail is {} but entry {} arrived", last, entry.index);
	}
	store.append(entry)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::PeerConfig;
	use crate::log::MemoryLog;
	use std::net::TcpListener;

	#[test]
	fn store_entry_overwrites_a_stale_suffix() {
		let store = MemoryLog::new();
		for i in 1..=3 {
			store.append(&LogEntry { index: i, term: 1, data: vec![] }).unwrap();
		}

		store_entry(&store, &LogEntry { index: 2, term: 2, data: b"new".to_vec() }).unwrap();
		assert_eq!(store.last_index().unwrap(), 2);
		assert_eq!(store.get(2).unwrap().unwrap().term, 2);

		assert!(store_entry(&store, &LogEntry { index: 9, term: 2, data: vec![] }).is_err());
	}

	#[test]
	fn a_follower_node_fails_client_commands_over_the_commit_stream() {
		let port = {
			let l = TcpListener::bind("127.0.0.1:0").unwrap();
			l.local_addr().unwrap().port()
		};

		let dir = std::env::temp_dir()
			.join(format!("raft_node_test_{}_{}", std::process::id(), port));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();

		let config = Config {
			id: 1,
			log_dir: dir,
			election_timeout_ms: 10_000,
			heartbeat_timeout_ms: 1_000,
			client_port: 0,
			peers: vec![PeerConfig {
				id: 1, host: "127.0.0.1".into(), port, client_port: None
			}]
		};

		let (node, commits) = RaftNode::start(&config).unwrap();

		// Still a follower (the election alarm is far away), so the command fails
		// straight back with a redirect error
		node.append(b"hello".to_vec());
		let commit = commits.recv_timeout(Duration::from_secs(5)).unwrap();
		assert_eq!(commit.entry.data, b"hello".to_vec());
		match commit.error {
			Some(CommitError::NotLeader { leader: None }) => {}
			other => panic!("unexpected commit outcome: {:?}", other)
		}

		node.shutdown();
		// The loop is gone, so the commit stream must be closed
		assert!(commits.recv().is_err());
	}
}

/// Type used to uniquely identify each server in the cluster. Ids are assigned in the
/// configuration file, start at 1, and never change for the lifetime of the cluster
pub type ServerId = u64;

pub type Term = u64;

pub type LogIndex = u64;

/// Persistent information describing the state of the current server
/// Must be durable before any message disclosing a new value is released
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
	/// Latest term seen by this server (starts at 0)
	pub current_term: Term,

	/// The id of the server that we have voted for in the current term
	pub voted_for: Option<ServerId>,

	/// Index of the last log entry handed to the application state machine
	pub last_applied: LogIndex
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata {
			current_term: 0,
			voted_for: None,
			last_applied: 0
		}
	}
}

/// The format of a single entry in every server's append-only log
/// Indices are dense: the entry at position p in any contiguous run has index
/// first_index + p. Index 0 is a synthetic sentinel with term 0 so that the log is
/// never empty and every check against a "previous" entry is well defined
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: Vec<u8>
}

impl LogEntry {
	pub fn sentinel() -> LogEntry {
		LogEntry { index: 0, term: 0, data: Vec::new() }
	}
}

/// A client command as it is stored inside a log entry. The origin server and request
/// id let the dispatcher on the origin route the commit back to the waiting connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
	pub origin: ServerId,
	pub req_id: u64,
	pub payload: Vec<u8>
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppendEntriesRequest {
	pub from_id: ServerId,
	pub term: Term,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	/// Entries are contiguous and immediately follow prev_log_index
	pub entries: Vec<LogEntry>,
	pub leader_commit: LogIndex
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppendEntriesResponse {
	pub from_id: ServerId,
	pub term: Term,
	pub success: bool,

	/// Index of the very end of the responder's log. Lets the leader rewind next_index
	/// without probing one entry at a time
	pub last_log_index: LogIndex
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestVoteRequest {
	pub from_id: ServerId,
	pub term: Term,
	pub last_log_index: LogIndex,
	pub last_log_term: Term
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestVoteResponse {
	pub from_id: ServerId,
	pub term: Term,
	pub granted: bool
}

/// Everything that may travel between two servers over the peer transport
/// A closed union: an unknown frame is a decode error at the transport, never an event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum PeerMessage {
	AppendEntries(AppendEntriesRequest),
	AppendEntriesResponse(AppendEntriesResponse),
	RequestVote(RequestVoteRequest),
	RequestVoteResponse(RequestVoteResponse)
}

impl PeerMessage {
	pub fn from_id(&self) -> ServerId {
		match self {
			PeerMessage::AppendEntries(m) => m.from_id,
			PeerMessage::AppendEntriesResponse(m) => m.from_id,
			PeerMessage::RequestVote(m) => m.from_id,
			PeerMessage::RequestVoteResponse(m) => m.from_id
		}
	}
}

/// A received message paired with its sender
#[derive(Debug, Clone)]
pub struct Envelope {
	pub from: ServerId,
	pub msg: PeerMessage
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Destination {
	Broadcast,
	To(ServerId)
}

/// Inputs to the consensus state machine. One event is reduced at a time and every
/// effect it requires comes back out as an ordered list of actions
#[derive(Debug, Clone)]
pub enum Event {
	AppendEntries(AppendEntriesRequest),
	AppendEntriesResponse(AppendEntriesResponse),
	RequestVote(RequestVoteRequest),
	RequestVoteResponse(RequestVoteResponse),

	/// The single logical alarm fired
	Timeout,

	/// A client command submitted on this server
	ClientAppend { data: Vec<u8> },

	/// The dispatcher finished routing the commit at the given index
	UpdateLastApplied { index: LogIndex }
}

impl From<PeerMessage> for Event {
	fn from(msg: PeerMessage) -> Event {
		match msg {
			PeerMessage::AppendEntries(m) => Event::AppendEntries(m),
			PeerMessage::AppendEntriesResponse(m) => Event::AppendEntriesResponse(m),
			PeerMessage::RequestVote(m) => Event::RequestVote(m),
			PeerMessage::RequestVoteResponse(m) => Event::RequestVoteResponse(m)
		}
	}
}

/// Why a commit notification carries no applicable entry
#[derive(Debug, Clone, PartialEq)]
pub enum CommitError {
	/// This server cannot accept client commands; the hint names the last known leader
	NotLeader { leader: Option<ServerId> },

	/// The entry was truncated from the log before ever being committed
	Overwritten
}

/// External side effects requested by the consensus state machine, executed by the
/// runtime strictly in emission order
#[derive(Debug, Clone)]
pub enum Action {
	Send { to: Destination, msg: PeerMessage },

	/// Deliver an entry (or a failure bound to a client command) to the dispatcher
	Commit { entry: LogEntry, error: Option<CommitError> },

	/// Make the entry durable in the persistent log
	LogStore { entry: LogEntry },

	/// Flush a snapshot of the persistent fields; must complete before any following
	/// Send is released
	PersistState { meta: Metadata },

	/// Replace the single alarm with a new deadline this far in the future
	SetAlarm { after_ms: u64 }
}

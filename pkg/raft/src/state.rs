use std::collections::HashMap;

use crate::protos::{LogIndex, ServerId};

/// Volatile role-specific state. Everything here is rebuilt from scratch on a role
/// transition; nothing survives a restart
pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState)
}

pub struct ServerFollowerState {
	/// The server we last accepted an AppendEntries from in the current term, used as
	/// the redirect hint for misdirected client commands
	pub last_leader_id: Option<ServerId>
}

pub struct ServerCandidateState {
	/// Outcome of the vote solicited from each peer, keyed by the term it was cast in:
	/// +term means granted in that term, -term refused, absent means no answer yet.
	/// Encoding the term makes stale responses from older elections self-ignoring
	pub received_votes: HashMap<ServerId, i64>
}

pub struct ServerLeaderState {
	/// Index of the next log entry to send to each peer
	pub next_index: HashMap<ServerId, LogIndex>,

	/// Highest log index known to be replicated on each server (self included)
	pub match_index: HashMap<ServerId, LogIndex>
}

impl ServerState {
	pub fn idle_follower() -> ServerState {
		ServerState::Follower(ServerFollowerState { last_leader_id: None })
	}

	pub fn is_leader(&self) -> bool {
		match self {
			ServerState::Leader(_) => true,
			_ => false
		}
	}
}

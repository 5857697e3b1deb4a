use std::collections::HashMap;

use rand::Rng;

use crate::errors::*;
use crate::log::Log;
use crate::protos::*;
use crate::state::*;

/// Uniform random slack in [0, this) ms added to every election alarm so that
/// simultaneous timeouts rarely collide twice in a row
pub const ELECTION_JITTER_MS: u64 = 200;

/// Term carried by the refusal sent when a leader sees an AppendEntries for its own
/// term. Two leaders in one term cannot happen; a term below every real one flags the
/// reply without making the (supposed) other leader adopt it
const DUPLICATE_LEADER_SENTINEL: Term = 0;

/// All external side effects requested while reducing a single event, in the exact
/// order the runtime must execute them
pub struct Tick {
	pub actions: Vec<Action>
}

impl Tick {
	pub fn empty() -> Tick {
		Tick { actions: Vec::new() }
	}

	pub fn send(&mut self, to: ServerId, msg: PeerMessage) {
		self.actions.push(Action::Send { to: Destination::To(to), msg });
	}

	pub fn broadcast(&mut self, msg: PeerMessage) {
		self.actions.push(Action::Send { to: Destination::Broadcast, msg });
	}

	pub fn commit(&mut self, entry: LogEntry) {
		self.actions.push(Action::Commit { entry, error: None });
	}

	pub fn commit_failed(&mut self, entry: LogEntry, error: CommitError) {
		self.actions.push(Action::Commit { entry, error: Some(error) });
	}

	pub fn log_store(&mut self, entry: LogEntry) {
		self.actions.push(Action::LogStore { entry });
	}

	pub fn persist(&mut self, meta: &Metadata) {
		self.actions.push(Action::PersistState { meta: meta.clone() });
	}

	pub fn set_alarm(&mut self, after_ms: u64) {
		self.actions.push(Action::SetAlarm { after_ms });
	}
}

/// The deterministic core of the protocol: a reducer over (state, event) producing the
/// ordered actions in a Tick. It never touches the network or the clock; the log
/// handle it owns is the single authority on entry contents, addressed purely by
/// logical index
pub struct ConsensusModule {
	/// Id of the server we are representing
	id: ServerId,

	/// Every server in the cluster, self included. Fixed for the process lifetime
	peers: Vec<ServerId>,

	meta: Metadata,

	log: Log,

	/// Highest log index known to be replicated on a majority. Volatile; rediscovered
	/// after a restart
	commit_index: LogIndex,

	state: ServerState,

	election_timeout_ms: u64,
	heartbeat_timeout_ms: u64
}

impl ConsensusModule {
	pub fn new(
		id: ServerId, peers: Vec<ServerId>, mut meta: Metadata, log: Log,
		election_timeout_ms: u64, heartbeat_timeout_ms: u64
	) -> ConsensusModule {
		// A term recorded in the log proves that term was observed, even if the
		// metadata write racing it was lost
		let last_log_term = log.last().term;
		if last_log_term > meta.current_term {
			meta.current_term = last_log_term;
			meta.voted_for = None;
		}

		ConsensusModule {
			id,
			peers,
			meta,
			log,
			commit_index: 0,
			state: ServerState::idle_follower(),
			election_timeout_ms,
			heartbeat_timeout_ms
		}
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	pub fn meta(&self) -> &Metadata {
		&self.meta
	}

	pub fn log(&self) -> &Log {
		&self.log
	}

	pub fn commit_index(&self) -> LogIndex {
		self.commit_index
	}

	pub fn is_leader(&self) -> bool {
		self.state.is_leader()
	}

	/// Deadline for the very first alarm after startup
	pub fn initial_alarm_ms(&self) -> u64 {
		self.election_alarm_ms()
	}

	fn election_alarm_ms(&self) -> u64 {
		self.election_timeout_ms + rand::thread_rng().gen_range(0, ELECTION_JITTER_MS)
	}

	/// Votes required to decide anything: strictly more than half of the cluster
	fn majority(&self) -> usize {
		self.peers.len() / 2 + 1
	}

	pub fn handle(&mut self, event: Event, tick: &mut Tick) -> Result<()> {
		match event {
			Event::AppendEntries(req) => self.append_entries(req, tick),
			Event::AppendEntriesResponse(resp) => self.append_entries_response(resp, tick),
			Event::RequestVote(req) => self.request_vote(req, tick),
			Event::RequestVoteResponse(resp) => self.request_vote_response(resp, tick),
			Event::Timeout => self.timeout(tick),
			Event::ClientAppend { data } => self.client_append(data, tick),
			Event::UpdateLastApplied { index } => self.update_last_applied(index, tick)
		}
	}

	/// The alarm fired: leaders emit a heartbeat round, everyone else starts an
	/// election for the next term
	fn timeout(&mut self, tick: &mut Tick) -> Result<()> {
		if self.state.is_leader() {
			let last = self.log.last();
			let heartbeat = AppendEntriesRequest {
				from_id: self.id,
				term: self.meta.current_term,
				prev_log_index: last.index,
				prev_log_term: last.term,
				entries: Vec::new(),
				leader_commit: self.commit_index
			};
			tick.broadcast(PeerMessage::AppendEntries(heartbeat));
			tick.set_alarm(self.heartbeat_timeout_ms);
			return Ok(());
		}

		self.meta.current_term += 1;
		self.meta.voted_for = Some(self.id);

		let mut received_votes = HashMap::new();
		received_votes.insert(self.id, self.meta.current_term as i64);
		self.state = ServerState::Candidate(ServerCandidateState { received_votes });

		info!("[{}] starting election for term {}", self.id, self.meta.current_term);

		// The vote for ourselves must hit disk before anyone learns the new term
		tick.persist(&self.meta);
		let alarm = self.election_alarm_ms();
		tick.set_alarm(alarm);

		let last = self.log.last();
		tick.broadcast(PeerMessage::RequestVote(RequestVoteRequest {
			from_id: self.id,
			term: self.meta.current_term,
			last_log_index: last.index,
			last_log_term: last.term
		}));
		Ok(())
	}

	fn request_vote(&mut self, req: RequestVoteRequest, tick: &mut Tick) -> Result<()> {
		if req.term < self.meta.current_term {
			tick.send(req.from_id, PeerMessage::RequestVoteResponse(RequestVoteResponse {
				from_id: self.id,
				term: self.meta.current_term,
				granted: false
			}));
			return Ok(());
		}

		let mut changed = false;
		if req.term > self.meta.current_term {
			self.meta.current_term = req.term;
			self.meta.voted_for = None;
			self.state = ServerState::idle_follower();
			changed = true;
		}

		let granted = match self.meta.voted_for {
			None => {
				// Grant only to a candidate whose log is at least as up to date as
				// ours, compared lexicographically on (last term, last index)
				let last = self.log.last();
				let up_to_date = req.last_log_term > last.term
					|| (req.last_log_term == last.term && req.last_log_index >= last.index);

				if up_to_date {
					self.meta.voted_for = Some(req.from_id);
					changed = true;
				}
				up_to_date
			}

			// Within one term a cast vote never moves; the same candidate may ask again
			Some(id) => id == req.from_id
		};

		if changed {
			tick.persist(&self.meta);
		}
		if granted {
			debug!("[{}] cast vote for {} in term {}", self.id, req.from_id, self.meta.current_term);
		}

		tick.send(req.from_id, PeerMessage::RequestVoteResponse(RequestVoteResponse {
			from_id: self.id,
			term: self.meta.current_term,
			granted
		}));
		Ok(())
	}

	fn request_vote_response(&mut self, resp: RequestVoteResponse, tick: &mut Tick) -> Result<()> {
		if resp.term > self.meta.current_term {
			self.meta.current_term = resp.term;
			self.meta.voted_for = None;
			self.state = ServerState::idle_follower();
			tick.persist(&self.meta);
			let alarm = self.election_alarm_ms();
			tick.set_alarm(alarm);
			return Ok(());
		}
		if resp.term < self.meta.current_term {
			return Ok(());
		}

		enum Outcome { Nothing, StepDown, Promote }

		let majority = self.majority();
		let outcome = match self.state {
			ServerState::Candidate(ref mut s) => {
				let signed = resp.term as i64;
				let seen = s.received_votes.get(&resp.from_id).map_or(0, |v| v.abs());

				if seen < signed {
					s.received_votes.insert(
						resp.from_id,
						if resp.granted { signed } else { -signed }
					);

					let granted = s.received_votes.values().filter(|&&v| v == signed).count();
					let refused = s.received_votes.values().filter(|&&v| v == -signed).count();

					if refused >= majority {
						Outcome::StepDown
					} else if granted >= majority {
						Outcome::Promote
					} else {
						Outcome::Nothing
					}
				} else {
					// A duplicate or a leftover from an older election
					Outcome::Nothing
				}
			}
			_ => Outcome::Nothing
		};

		match outcome {
			Outcome::StepDown => {
				self.state = ServerState::idle_follower();
			}
			Outcome::Promote => self.become_leader(tick),
			Outcome::Nothing => {}
		}
		Ok(())
	}

	fn become_leader(&mut self, tick: &mut Tick) {
		info!("[{}] won the election for term {}", self.id, self.meta.current_term);

		let last = self.log.last().clone();

		let mut next_index = HashMap::new();
		let mut match_index = HashMap::new();
		for &peer in &self.peers {
			next_index.insert(peer, last.index + 1);
			match_index.insert(peer, 0);
		}
		match_index.insert(self.id, last.index);

		self.state = ServerState::Leader(ServerLeaderState { next_index, match_index });

		// Assert authority immediately. No no-op entry is proposed: entries left over
		// from earlier terms only commit once an entry of this term replicates
		tick.set_alarm(self.heartbeat_timeout_ms);
		tick.broadcast(PeerMessage::AppendEntries(AppendEntriesRequest {
			from_id: self.id,
			term: self.meta.current_term,
			prev_log_index: last.index,
			prev_log_term: last.term,
			entries: Vec::new(),
			leader_commit: self.commit_index
		}));
	}

	fn append_entries(&mut self, req: AppendEntriesRequest, tick: &mut Tick) -> Result<()> {
		if req.term < self.meta.current_term {
			tick.send(req.from_id, PeerMessage::AppendEntriesResponse(AppendEntriesResponse {
				from_id: self.id,
				term: self.meta.current_term,
				success: false,
				last_log_index: self.log.last_index()
			}));
			return Ok(());
		}

		if self.state.is_leader() && req.term == self.meta.current_term {
			warn!("[{}] second leader observed in term {}", self.id, req.term);
			tick.send(req.from_id, PeerMessage::AppendEntriesResponse(AppendEntriesResponse {
				from_id: self.id,
				term: DUPLICATE_LEADER_SENTINEL,
				success: false,
				last_log_index: self.log.last_index()
			}));
			return Ok(());
		}

		// A candidate seeing the leader of its own term, or anyone seeing a newer
		// term, defers to the sender
		match self.state {
			ServerState::Follower(_) => {}
			_ => self.state = ServerState::idle_follower()
		}

		let alarm = self.election_alarm_ms();
		tick.set_alarm(alarm);

		let mut changed = false;
		if req.term > self.meta.current_term {
			self.meta.current_term = req.term;
			self.meta.voted_for = None;
			changed = true;
		}

		if let ServerState::Follower(ref mut s) = self.state {
			s.last_leader_id = Some(req.from_id);
		}

		// The entry before the batch must exist here with the matching term
		let consistent = self.log.last_index() >= req.prev_log_index
			&& self.log.term_of(req.prev_log_index)? == Some(req.prev_log_term);

		if !consistent {
			if changed {
				tick.persist(&self.meta);
			}
			tick.send(req.from_id, PeerMessage::AppendEntriesResponse(AppendEntriesResponse {
				from_id: self.id,
				term: self.meta.current_term,
				success: false,
				last_log_index: self.log.last_index()
			}));
			return Ok(());
		}

		// Anything beyond the agreed point came from a deposed leader. Fail out every
		// client still waiting on one of those slots
		if self.log.last_index() > req.prev_log_index {
			let removed = self.log.truncate_from(req.prev_log_index + 1)?;
			info!("[{}] truncated {} conflicting entries after index {}",
				self.id, removed.len(), req.prev_log_index);
			for entry in removed {
				tick.commit_failed(entry, CommitError::Overwritten);
			}
		}

		for entry in &req.entries {
			self.log.append(entry.clone());
			tick.log_store(entry.clone());
		}

		if req.leader_commit > self.commit_index {
			let new_commit = std::cmp::min(req.leader_commit, self.log.last_index());
			if new_commit > self.commit_index {
				self.log.load_from(new_commit)?;
				for i in (self.commit_index + 1)..=new_commit {
					match self.log.get(i)? {
						Some(entry) => tick.commit(entry),
						None => bail!("committed entry {} is missing from the log", i)
					}
				}
				self.commit_index = new_commit;
			}
		}

		if changed {
			tick.persist(&self.meta);
		}

		// Pure heartbeats are never acknowledged; the leader relies on its own alarm
		// rather than on explicit liveness replies
		if !req.entries.is_empty() {
			tick.send(req.from_id, PeerMessage::AppendEntriesResponse(AppendEntriesResponse {
				from_id: self.id,
				term: self.meta.current_term,
				success: true,
				last_log_index: self.log.last_index()
			}));
		}
		Ok(())
	}

	fn append_entries_response(&mut self, resp: AppendEntriesResponse, tick: &mut Tick) -> Result<()> {
		if resp.term > self.meta.current_term {
			self.meta.current_term = resp.term;
			self.meta.voted_for = None;
			self.state = ServerState::idle_follower();
			tick.persist(&self.meta);
			let alarm = self.election_alarm_ms();
			tick.set_alarm(alarm);
			return Ok(());
		}

		let st = match self.state {
			ServerState::Leader(ref mut s) => s,
			// Stale responses reaching a non-leader carry no information
			_ => return Ok(())
		};

		if !resp.success {
			// The follower's log diverges or falls short; rewind to its reported tail
			// and resend everything from there
			let next = st.next_index.entry(resp.from_id).or_insert(1);
			if resp.last_log_index + 1 < *next {
				*next = resp.last_log_index + 1;
			}
			let next = *next;

			let prev = match self.log.get(next - 1)? {
				Some(e) => e,
				None => bail!("log entry {} needed for retransmission is missing", next - 1)
			};
			let entries = self.log.entries_from(next)?;

			tick.send(resp.from_id, PeerMessage::AppendEntries(AppendEntriesRequest {
				from_id: self.id,
				term: self.meta.current_term,
				prev_log_index: prev.index,
				prev_log_term: prev.term,
				entries,
				leader_commit: self.commit_index
			}));
			return Ok(());
		}

		{
			let matched = st.match_index.entry(resp.from_id).or_insert(0);
			if resp.last_log_index <= *matched {
				return Ok(());
			}
			*matched = resp.last_log_index;
		}
		st.next_index.insert(resp.from_id, resp.last_log_index + 1);

		// Highest index replicated on a majority, counted over every server including
		// ourselves. Only an entry of the current term may move the commit point;
		// older entries ride along beneath it
		let mut sorted: Vec<LogIndex> = st.match_index.values().cloned().collect();
		sorted.sort();

		let majority_pos = self.peers.len() / 2;
		for i in (0..=majority_pos).rev() {
			let candidate = sorted[i];
			if candidate > self.commit_index
				&& self.log.term_of(candidate)? == Some(self.meta.current_term) {

				self.log.load_from(candidate)?;
				for k in (self.commit_index + 1)..=candidate {
					match self.log.get(k)? {
						Some(entry) => tick.commit(entry),
						None => bail!("committed entry {} is missing from the log", k)
					}
				}
				self.commit_index = candidate;
				break;
			}
		}
		Ok(())
	}

	fn client_append(&mut self, data: Vec<u8>, tick: &mut Tick) -> Result<()> {
		match self.state {
			ServerState::Leader(ref mut st) => {
				let prev = self.log.last().clone();
				let entry = LogEntry {
					index: prev.index + 1,
					term: self.meta.current_term,
					data
				};

				self.log.append(entry.clone());
				st.match_index.insert(self.id, entry.index);

				tick.log_store(entry.clone());
				tick.broadcast(PeerMessage::AppendEntries(AppendEntriesRequest {
					from_id: self.id,
					term: self.meta.current_term,
					prev_log_index: prev.index,
					prev_log_term: prev.term,
					entries: vec![entry],
					leader_commit: self.commit_index
				}));
			}

			ServerState::Follower(ref s) => {
				let leader = s.last_leader_id.or(self.meta.voted_for);
				tick.commit_failed(
					LogEntry { index: 0, term: 0, data },
					CommitError::NotLeader { leader }
				);
			}

			ServerState::Candidate(_) => {
				tick.commit_failed(
					LogEntry { index: 0, term: 0, data },
					CommitError::NotLeader { leader: None }
				);
			}
		}
		Ok(())
	}

	fn update_last_applied(&mut self, index: LogIndex, tick: &mut Tick) -> Result<()> {
		if index > self.meta.last_applied {
			self.meta.last_applied = index;
			tick.persist(&self.meta);
		}
		Ok(())
	}
}

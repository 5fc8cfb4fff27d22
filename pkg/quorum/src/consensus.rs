use super::errors::*;
use super::log::*;
use super::persist::PersistentState;
use super::protos::*;
use super::state::*;

use std::cmp;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;

/// At some random time in this range of milliseconds, a follower will become a
/// candidate if it has not heard from a valid leader
const ELECTION_TIMEOUT: (u64, u64) = (500, 1000);

/// If the leader doesn't send anything else within this amount of time, then it
/// will send an empty heartbeat to all followers
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(150);

/// Position in the log that a proposed command will occupy if it is ever
/// committed
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
	pub term: Term,
	pub index: LogIndex,
}

pub type ProposeResult = std::result::Result<Proposal, ProposeError>;

#[derive(Debug)]
pub enum ProposeError {
	/// The entry can't be proposed by this server because we are not the
	/// current leader
	NotLeader { leader_hint: Option<ServerId> },
}

/// Represents all external side effects requested by the ConsensusModule
/// during a single operation. The caller is responsible for persisting
/// metadata/log changes before any reply that depends on them leaves the
/// server, and for sending out the messages.
pub struct Tick {
	/// Time at which this tick is happening
	pub time: Instant,

	/// If set, the persistent metadata has changed
	pub meta: bool,

	/// If set, entries were appended to (or truncated from) the log
	pub new_entries: bool,

	/// Requests that need to be sent out
	pub messages: Vec<Message>,

	/// If no other events occur, this is when the next tick should occur
	pub next_tick: Option<Duration>,
}

impl Tick {
	pub fn empty() -> Self {
		Self::new(Instant::now())
	}

	pub fn new(time: Instant) -> Self {
		Tick {
			time,
			meta: false,
			new_entries: false,
			messages: vec![],
			next_tick: None,
		}
	}

	pub fn write_meta(&mut self) {
		self.meta = true;
	}

	pub fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}
}

/// Wrapper around a response that must not leave this server until the
/// metadata it depends on has been made durable.
pub struct MustPersistMetadata<T> {
	inner: T,
}

impl<T> MustPersistMetadata<T> {
	fn new(inner: T) -> Self {
		MustPersistMetadata { inner }
	}

	// This is more of a self-check as there is no easy way for us to
	// generically verify that the api user has actually persisted the
	// metadata.
	pub fn persisted(self) -> T {
		self.inner
	}
}

/// A single peer's view of the consensus protocol.
///
/// This is purely a state machine: time and inbound requests are fed in, and
/// all side effects (messages, persistence requirements, the next deadline)
/// come back out on the Tick. All methods assume the caller holds the one
/// peer-wide lock.
pub struct ConsensusModule {
	/// Id of the current server we are representing
	id: ServerId,

	/// All servers in the cluster, including ourselves. Fixed for the lifetime
	/// of the cluster.
	peers: Vec<ServerId>,

	meta: Metadata,

	log: Log,

	/// Index of the highest log entry known to be committed. Volatile; always
	/// starts at 0 after a restart and catches back up from the leader.
	commit_index: LogIndex,

	state: ServerState,
}

impl ConsensusModule {
	/// Creates a new consensus module given the restored persistent state. The
	/// module always starts out as a follower.
	pub fn new(
		peers: Vec<ServerId>,
		id: ServerId,
		mut meta: Metadata,
		log: Log,
		now: Instant,
	) -> ConsensusModule {
		debug_assert!(peers.contains(&id));

		// If the log somehow contains a newer term than the metadata, we know
		// that we never cast a vote in that term.
		let last_log_term = log.last_term();
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
			state: Self::new_follower(now),
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
		match self.state {
			ServerState::Leader(_) => true,
			_ => false,
		}
	}

	/// Snapshot of everything that must survive a crash, for handing to the
	/// persister.
	pub fn persistent_state(&self) -> PersistentState {
		PersistentState {
			meta: self.meta.clone(),
			entries: self.log.persisted_entries(),
		}
	}

	/// Propose a new state machine command. Only the current leader will
	/// accept it; everyone else reports who they believe the leader to be.
	pub fn propose_command(&mut self, data: Vec<u8>, out: &mut Tick) -> ProposeResult {
		match self.state {
			ServerState::Leader(_) => {}
			ServerState::Follower(ref s) => {
				return Err(ProposeError::NotLeader {
					leader_hint: s.last_leader_id.or(self.meta.voted_for),
				});
			}
			ServerState::Candidate(_) => {
				return Err(ProposeError::NotLeader { leader_hint: None });
			}
		}

		let index = self.log.last_index() + 1;
		let term = self.meta.current_term;

		out.new_entries = true;
		self.log.append(LogEntry { index, term, data });

		// Replicate the new entry to the other servers right away.
		self.cycle(out);

		Ok(Proposal { term, index })
	}

	/// Drives time-based behavior: election timeouts, heartbeats and commit
	/// advancement. Safe to call at any time; next_tick on the output says
	/// when it needs to be called again at the latest.
	pub fn cycle(&mut self, tick: &mut Tick) {
		enum ServerStateSummary {
			Follower {
				elapsed: Duration,
				election_timeout: Duration,
			},
			Candidate {
				vote_count: usize,
				election_start: Instant,
				election_timeout: Duration,
			},
			Leader {
				next_commit_index: Option<LogIndex>,
			},
		}

		// Move the important information out of the state so that the match
		// below can freely mutate it.
		let summary = match self.state {
			ServerState::Follower(ref s) => ServerStateSummary::Follower {
				elapsed: tick.time.duration_since(s.last_heartbeat),
				election_timeout: s.election_timeout,
			},
			ServerState::Candidate(ref s) => ServerStateSummary::Candidate {
				// We always voted for ourselves.
				vote_count: 1 + s.votes_received.len(),
				election_start: s.election_start,
				election_timeout: s.election_timeout,
			},
			ServerState::Leader(ref s) => ServerStateSummary::Leader {
				next_commit_index: self.find_next_commit_index(s),
			},
		};

		match summary {
			ServerStateSummary::Follower {
				elapsed,
				election_timeout,
			} => {
				// A single-server cluster does not need to wait for anyone.
				if elapsed >= election_timeout || self.peers.len() == 1 {
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			}

			ServerStateSummary::Candidate {
				vote_count,
				election_start,
				election_timeout,
			} => {
				if vote_count >= self.majority_size() {
					info!(
						"[{}] won the election for term {}",
						self.id, self.meta.current_term
					);

					let last_log_index = self.log.last_index();

					let servers = self
						.peers
						.iter()
						.filter(|s| **s != self.id)
						.map(|s| (*s, ServerProgress::new(last_log_index)))
						.collect::<HashMap<_, _>>();

					self.state = ServerState::Leader(ServerLeaderState { servers });

					// Cycle again to send out initial heartbeats asserting our
					// authority.
					self.cycle(tick);
				} else {
					let elapsed = tick.time.duration_since(election_start);

					if elapsed >= election_timeout {
						self.start_election(tick);
					} else {
						tick.next_tick = Some(election_timeout - elapsed);
					}
				}
			}

			ServerStateSummary::Leader { next_commit_index } => {
				if let Some(ci) = next_commit_index {
					self.update_committed(ci);
				}

				let mut next_heartbeat = self.replicate_entries(tick);

				// Heartbeats are pointless when there is no one else.
				if self.peers.len() == 1 {
					next_heartbeat = Duration::from_secs(1);
				}

				tick.next_tick = Some(next_heartbeat);
			}
		}
	}

	/// On the leader, finds the best value for the next commit index, if any
	/// is currently possible.
	fn find_next_commit_index(&self, s: &ServerLeaderState) -> Option<LogIndex> {
		// Starting at the last entry in our log, go backwards until we find an
		// entry that a majority has replicated.
		let mut ci = self.log.last_index();

		let majority = self.majority_size();
		while ci > self.commit_index {
			let term = self.log.term(ci).unwrap_or(0);

			if term < self.meta.current_term {
				// Terms in the log are monotonic, so there are no more entries
				// from our own term below this point. Anything older commits
				// only transitively through a current-term entry above it.
				break;
			} else if term == self.meta.current_term {
				// As the leader our own log trivially contains this entry.
				let mut count = 1;

				for (id, progress) in s.servers.iter() {
					if *id == self.id {
						continue;
					}

					if progress.match_index >= ci {
						count += 1;
					}
				}

				if count >= majority {
					return Some(ci);
				}
			}

			ci -= 1;
		}

		None
	}

	/// On the leader, produces requests to replicate or maintain the state of
	/// the log on all other servers. Sending heartbeats is the base case of
	/// this process. Returns the amount of time until the next heartbeat is
	/// due.
	fn replicate_entries(&mut self, tick: &mut Tick) -> Duration {
		let state = match self.state {
			ServerState::Leader(ref mut s) => s,

			// This function should only ever be called on the leader.
			_ => panic!("Not the leader"),
		};

		let leader_id = self.id;
		let term = self.meta.current_term;
		let leader_commit = self.commit_index;
		let log = &self.log;

		let last_log_index = log.last_index();

		// Given some previous index, produces a request containing all entries
		// after that index.
		let new_request = |prev_log_index: LogIndex| -> AppendEntriesRequest {
			AppendEntriesRequest {
				term,
				leader_id,
				prev_log_index,
				prev_log_term: log.term(prev_log_index).unwrap_or(0),
				entries: log.slice(prev_log_index + 1),
				leader_commit,
			}
		};

		// Used to deduplicate messages that would be exactly the same for
		// multiple followers.
		let mut message_map: HashMap<LogIndex, Message> = HashMap::new();

		// Largest amount of time elapsed since we sent something to any fully
		// caught-up follower.
		let mut since_last_heartbeat = Duration::from_millis(0);

		for server_id in self.peers.iter() {
			if *server_id == leader_id {
				continue;
			}

			let progress = match state.servers.get_mut(server_id) {
				Some(p) => p,
				None => continue,
			};

			// Never have more than one request in flight per follower.
			if progress.request_pending {
				continue;
			}

			// If this server is already up-to-date, don't replicate unless the
			// last request was beyond the heartbeat timeout.
			if progress.match_index >= last_log_index {
				if let Some(ref time) = progress.last_sent {
					let elapsed = tick.time.duration_since(*time);

					if elapsed < HEARTBEAT_TIMEOUT {
						if elapsed > since_last_heartbeat {
							since_last_heartbeat = elapsed;
						}

						continue;
					}
				}
			}

			progress.request_pending = true;
			progress.last_sent = Some(tick.time);

			let msg_key = progress.next_index - 1;

			if let Some(msg) = message_map.get_mut(&msg_key) {
				msg.to.push(*server_id);
			} else {
				let req = new_request(msg_key);

				message_map.insert(
					msg_key,
					Message {
						to: vec![*server_id],
						body: MessageBody::AppendEntries(req, last_log_index),
					},
				);
			}
		}

		for (_, msg) in message_map.into_iter() {
			tick.send(msg);
		}

		HEARTBEAT_TIMEOUT - since_last_heartbeat
	}

	fn start_election(&mut self, tick: &mut Tick) {
		self.meta.current_term += 1;
		self.meta.voted_for = Some(self.id);
		tick.write_meta();

		info!(
			"[{}] starting election for term {}",
			self.id, self.meta.current_term
		);

		self.state = ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout: Self::new_election_timeout(),
			votes_received: std::collections::HashSet::new(),
		});

		self.perform_election(tick);

		// In a single-server cluster this will immediately make us the leader.
		self.cycle(tick);
	}

	fn perform_election(&self, tick: &mut Tick) {
		let last_log_index = self.log.last_index();
		let last_log_term = self.log.last_term();

		let req = RequestVoteRequest {
			term: self.meta.current_term,
			candidate_id: self.id,
			last_log_index,
			last_log_term,
		};

		let ids = self
			.peers
			.iter()
			.cloned()
			.filter(|s| *s != self.id)
			.collect::<Vec<_>>();

		// Single-server cluster.
		if ids.is_empty() {
			return;
		}

		tick.send(Message {
			to: ids,
			body: MessageBody::RequestVote(req),
		});
	}

	/// Creates a new follower state with a fresh election timeout.
	fn new_follower(now: Instant) -> ServerState {
		ServerState::Follower(ServerFollowerState {
			election_timeout: Self::new_election_timeout(),
			last_leader_id: None,
			last_heartbeat: now,
		})
	}

	/// Makes this server a follower in the current term.
	fn become_follower(&mut self, tick: &mut Tick) {
		self.state = Self::new_follower(tick.time);
		self.cycle(tick);
	}

	/// Run every single time a term is seen in a remote request or response.
	/// If another server has a higher term than us, then we must become a
	/// follower.
	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			tick.write_meta();

			self.become_follower(tick);
		}
	}

	fn update_committed(&mut self, index: LogIndex) {
		assert!(index > self.commit_index);
		self.commit_index = index;
	}

	/// Number of servers whose agreement is needed to get anything done.
	fn majority_size(&self) -> usize {
		(self.peers.len() / 2) + 1
	}

	fn new_election_timeout() -> Duration {
		let mut rng = rand::thread_rng();
		let time = ELECTION_TIMEOUT.0
			+ ((rng.next_u32() as u64) * (ELECTION_TIMEOUT.1 - ELECTION_TIMEOUT.0))
				/ (std::u32::MAX as u64);

		Duration::from_millis(time)
	}

	/// Whether a RequestVote request would currently be granted. Mutates
	/// nothing; assumes observe_term has already run for the request's term.
	fn would_grant_vote(&self, req: &RequestVoteRequest) -> bool {
		if req.term < self.meta.current_term {
			return false;
		}

		let last_log_index = self.log.last_index();
		let last_log_term = self.log.last_term();

		// Whether or not the candidate's log is at least as up-to-date as our
		// own.
		let up_to_date = req.last_log_term > last_log_term
			|| (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

		if !up_to_date {
			return false;
		}

		match self.meta.voted_for {
			// If we have already voted in this term, we are not allowed to
			// change our minds.
			Some(id) => id == req.candidate_id,

			None => true,
		}
	}

	/// Called when another server is requesting that we vote for it.
	pub fn request_vote(
		&mut self,
		req: RequestVoteRequest,
		tick: &mut Tick,
	) -> MustPersistMetadata<RequestVoteResponse> {
		self.observe_term(req.term, tick);

		let granted = self.would_grant_vote(&req);

		if granted {
			// A granted vote counts as leader contact for the purposes of the
			// election timer.
			if let ServerState::Follower(ref mut s) = self.state {
				s.last_heartbeat = tick.time;
			}

			self.meta.voted_for = Some(req.candidate_id);
			tick.write_meta();

			info!(
				"[{}] casted vote for {} in term {}",
				self.id, req.candidate_id, self.meta.current_term
			);
		}

		MustPersistMetadata::new(RequestVoteResponse {
			term: self.meta.current_term,
			vote_granted: granted,
		})
	}

	/// Handles a reply to a RequestVote that we issued. sent_term is the term
	/// the request went out in; replies from older elections are dropped.
	pub fn request_vote_callback(
		&mut self,
		from_id: ServerId,
		sent_term: Term,
		resp: RequestVoteResponse,
		tick: &mut Tick,
	) {
		self.observe_term(resp.term, tick);

		// Only meaningful if we are still in the election the request was sent
		// for.
		if self.meta.current_term != sent_term {
			return;
		}

		if from_id == self.id {
			warn!("[{}] rejected duplicate self vote", self.id);
			return;
		}

		let should_cycle = if let ServerState::Candidate(ref mut s) = self.state {
			if resp.vote_granted {
				s.votes_received.insert(from_id);
			}

			true
		} else {
			false
		};

		if should_cycle {
			// Needed in case we just reached a majority.
			self.cycle(tick);
		}
	}

	/// Called when another server is requesting that we append entries from
	/// its log. Malformed requests fail the RPC itself (the reply is simply
	/// dropped); everything else is answered with success or a consistency
	/// rejection.
	pub fn append_entries(
		&mut self,
		req: AppendEntriesRequest,
		tick: &mut Tick,
	) -> Result<MustPersistMetadata<AppendEntriesResponse>> {
		self.observe_term(req.term, tick);

		// If a candidate sees a leader established for the current term, it
		// loses the election.
		if req.term == self.meta.current_term {
			let is_candidate = match self.state {
				ServerState::Candidate(_) => true,
				_ => false,
			};

			if is_candidate {
				self.become_follower(tick);
			}
		}

		let current_term = self.meta.current_term;
		let response =
			|success: bool| MustPersistMetadata::new(AppendEntriesResponse {
				term: current_term,
				success,
			});

		if req.term < self.meta.current_term {
			// Not the current leader; the term in this rejection will demote
			// it.
			return Ok(response(false));
		}

		match self.state {
			ServerState::Follower(ref mut s) => {
				s.last_heartbeat = tick.time;
				s.last_leader_id = Some(req.leader_id);
			}
			ServerState::Leader(_) => {
				bail!("Observed a second leader in the same term");
			}
			ServerState::Candidate(_) => {
				bail!("Still a candidate after observing the current leader");
			}
		}

		// Sanity check that the batch is contiguous and sorted before we touch
		// the log with it.
		if req.entries.len() >= 1 {
			let first = &req.entries[0];
			if first.term < req.prev_log_term || first.index != req.prev_log_index + 1 {
				bail!("Received entries do not immediately follow the previous position");
			}

			for i in 0..(req.entries.len() - 1) {
				let cur = &req.entries[i];
				let next = &req.entries[i + 1];

				if cur.term > next.term || next.index != cur.index + 1 {
					bail!("Received entries are unsorted, duplicated, or inconsistent");
				}
			}
		}

		// Consistency check against the entry right before the new ones.
		match self.log.term(req.prev_log_index) {
			Some(term) => {
				if term != req.prev_log_term {
					// Our log conflicts with the leader at this position; the
					// leader will walk backwards and retry.
					return Ok(response(false));
				}
			}
			// We are missing entries before this batch.
			None => return Ok(response(false)),
		};

		// Index into the entries array of the first entry not already in our
		// log.
		let mut first_new = 0;

		for e in req.entries.iter() {
			match self.log.term(e.index) {
				Some(t) if t == e.term => {
					// Already have it (this request is a retry).
					first_new += 1;
				}
				Some(_) => {
					// Conflict: everything at and after this index must go.
					if self.commit_index >= e.index {
						bail!("Refusing to truncate entries that are already committed");
					}

					self.log.truncate_suffix(e.index);
					break;
				}
				None => break,
			}
		}

		if first_new < req.entries.len() {
			tick.new_entries = true;

			for e in &req.entries[first_new..] {
				self.log.append(e.clone());
			}
		}

		// The last index this request vouches for. Must be computed from the
		// request rather than our log, which may contain unvalidated entries
		// beyond it.
		let last_new = req.prev_log_index + req.entries.len() as LogIndex;

		if req.leader_commit > self.commit_index {
			let next_commit = cmp::min(req.leader_commit, last_new);

			if next_commit > self.commit_index {
				self.update_committed(next_commit);
			}
		}

		Ok(response(true))
	}

	/// Handles a reply to an AppendEntries that we issued as leader.
	/// last_index is the last log index replicated by that request; sent_term
	/// is the term it was sent in.
	pub fn append_entries_callback(
		&mut self,
		from_id: ServerId,
		sent_term: Term,
		last_index: LogIndex,
		resp: AppendEntriesResponse,
		tick: &mut Tick,
	) {
		self.observe_term(resp.term, tick);

		if self.meta.current_term != sent_term {
			return;
		}

		let should_cycle = if let ServerState::Leader(ref mut s) = self.state {
			match s.servers.get_mut(&from_id) {
				Some(progress) => {
					if resp.success {
						if last_index > progress.match_index {
							progress.match_index = last_index;
							progress.next_index = last_index + 1;
						}
					} else if progress.next_index > 1 {
						// Walk backwards one entry at a time until our logs
						// agree.
						progress.next_index -= 1;
					}

					progress.request_pending = false;
					true
				}
				None => false,
			}
		} else {
			false
		};

		if should_cycle {
			// Something may have changed the commit index or freed up a
			// follower for more entries.
			self.cycle(tick);
		}
	}

	/// Handles getting no response at all (within the transport's timeout)
	/// for an AppendEntries request. The periodic heartbeat will retry.
	pub fn append_entries_noresponse(&mut self, from_id: ServerId, _tick: &mut Tick) {
		if let ServerState::Leader(ref mut s) = self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				progress.request_pending = false;
			}
		}
	}
}

use super::protos::*;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub struct ServerFollowerState {
	/// Amount of time since the last heartbeat after which we will become a
	/// candidate
	pub election_timeout: Duration,

	/// Id of the last leader we have received an AppendEntries from (used as a
	/// hint for rejected proposals)
	pub last_leader_id: Option<ServerId>,

	/// Last time we received a valid heartbeat from the current leader or
	/// granted a vote
	pub last_heartbeat: Instant,
}

pub struct ServerCandidateState {
	/// Time at which this election was started
	pub election_start: Instant,

	/// Similar to the follower timeout: how long we will wait on this election
	/// before giving up and starting a new one
	pub election_timeout: Duration,

	/// Set of servers that granted us their vote in this election; we always
	/// count ourselves in addition to these.
	pub votes_received: HashSet<ServerId>,
}

/// Replication state that a leader tracks for one other server.
pub struct ServerProgress {
	/// Next log index to send to this server
	pub next_index: LogIndex,

	/// Highest log index known to be replicated on this server
	pub match_index: LogIndex,

	/// Whether a request is currently in flight to this server. Only one is
	/// ever outstanding at a time.
	pub request_pending: bool,

	/// When the last request to this server was sent
	pub last_sent: Option<Instant>,
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex) -> Self {
		ServerProgress {
			next_index: last_log_index + 1,
			match_index: 0,
			request_pending: false,
			last_sent: None,
		}
	}
}

pub struct ServerLeaderState {
	pub servers: HashMap<ServerId, ServerProgress>,
}

/// The role of the current server along with all state exclusive to that
/// role. Transitions replace the whole variant so that nothing like a stale
/// leader table can survive a step-down.
pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState),
}

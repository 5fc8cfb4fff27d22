
/// Type used to uniquely identify each server. Ids index into a fixed roster
/// that is identical on every server in the cluster.
pub type ServerId = u64;

pub type Term = u64;

pub type LogIndex = u64;

/// Persistent information describing the state of the current server. Must be
/// written to stable storage before any reply that depends on it leaves this
/// server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
	/// Latest term seen by this server (starts at 0)
	pub current_term: Term,

	/// The id of the server that we have voted for in the current term
	pub voted_for: Option<ServerId>,
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata {
			current_term: 0,
			voted_for: None,
		}
	}
}

/// A single entry in the append-only log. Entries carry their own index; the
/// entry at index 0 is a sentinel with term 0 which is never applied or sent
/// over the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

/// The entries are assumed to be sorted and contiguous, immediately following
/// the (prev_log_index, prev_log_term) position.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	pub entries: Vec<LogEntry>,
	pub leader_commit: LogIndex,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,
}

/// One committed log entry handed to the co-located service, in log order.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyMsg {
	pub command_valid: bool,
	pub command: Vec<u8>,
	pub command_index: LogIndex,
}

#[derive(Debug, Clone)]
pub enum MessageBody {
	RequestVote(RequestVoteRequest),

	/// The index is the last index replicated by the request, retained so that
	/// the reply handler knows how far the follower's log matches on success.
	AppendEntries(AppendEntriesRequest, LogIndex),
}

/// An outbound request produced by the consensus module. A single body may be
/// addressed to many servers when they all need the same thing.
#[derive(Debug, Clone)]
pub struct Message {
	pub to: Vec<ServerId>,
	pub body: MessageBody,
}

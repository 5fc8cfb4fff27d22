use super::consensus::*;
use super::errors::*;
use super::log::Log;
use super::persist::{PersistentState, Persister};
use super::protos::*;
use super::rpc::{marshal, unmarshal, RpcRequest, RpcResponse, Service, Transport};

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Fallback wait for the driver when a cycle produced no explicit deadline.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Ordered channel to the co-located service. Delivery may block (the sink is
/// allowed to apply backpressure); it is never called while the peer's lock is
/// held.
pub trait ApplySink: Send {
	fn deliver(&self, msg: ApplyMsg) -> Result<()>;
}

impl ApplySink for std::sync::mpsc::Sender<ApplyMsg> {
	fn deliver(&self, msg: ApplyMsg) -> Result<()> {
		self.send(msg).map_err(|_| "apply sink disconnected".into())
	}
}

impl ApplySink for std::sync::mpsc::SyncSender<ApplyMsg> {
	fn deliver(&self, msg: ApplyMsg) -> Result<()> {
		self.send(msg).map_err(|_| "apply sink disconnected".into())
	}
}

/// Everything guarded by the one peer-wide lock.
struct ServerInstance {
	module: ConsensusModule,

	persister: Arc<dyn Persister>,

	/// Highest log index already handed to the apply sink. Only the apply
	/// pump advances this.
	last_applied: LogIndex,

	shutdown: bool,
}

impl ServerInstance {
	/// Makes whatever the tick touched durable. Runs under the lock so that
	/// saves can never be reordered against each other.
	fn persist_if_needed(&mut self, tick: &Tick) -> Result<()> {
		if tick.meta || tick.new_entries {
			let blob = marshal(&self.module.persistent_state())?;
			self.persister.save(&blob)?;
		}

		Ok(())
	}
}

struct ServerShared {
	inst: Mutex<ServerInstance>,

	/// Wakes the driver loop when something may have changed its deadline
	wakeup: Condvar,

	/// Wakes the apply pump when the commit index may have advanced
	apply_ready: Condvar,

	transport: Arc<dyn Transport>,
}

/// A single running Raft peer: the consensus module plus the background tasks
/// that animate it (timer driver, outbound RPCs, apply pump).
pub struct Server {
	shared: Arc<ServerShared>,
	background: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Server {
	/// Creates and starts a peer. Persistent state is restored from the
	/// persister and the peer begins as a follower. Returns promptly; all
	/// ongoing work happens on background threads.
	pub fn start(
		peers: Vec<ServerId>,
		me: ServerId,
		transport: Arc<dyn Transport>,
		persister: Arc<dyn Persister>,
		sink: Box<dyn ApplySink>,
	) -> Result<Arc<Server>> {
		let state = match persister.load()? {
			Some(ref blob) => unmarshal::<PersistentState>(blob)?,
			None => PersistentState::default(),
		};

		let module = ConsensusModule::new(
			peers,
			me,
			state.meta,
			Log::from_entries(state.entries),
			Instant::now(),
		);

		let shared = Arc::new(ServerShared {
			inst: Mutex::new(ServerInstance {
				module,
				persister,
				last_applied: 0,
				shutdown: false,
			}),
			wakeup: Condvar::new(),
			apply_ready: Condvar::new(),
			transport,
		});

		let driver = {
			let shared = shared.clone();
			thread::spawn(move || drive(shared))
		};

		let applier = {
			let shared = shared.clone();
			thread::spawn(move || apply_pump(shared, sink))
		};

		Ok(Arc::new(Server {
			shared,
			background: Mutex::new(vec![driver, applier]),
		}))
	}

	/// Submits a command for agreement. Returns the log position the command
	/// will occupy if it commits, along with whether this peer accepted it as
	/// leader. There is no guarantee the command ever commits.
	pub fn execute(&self, data: Vec<u8>) -> (LogIndex, Term, bool) {
		let mut guard = self.shared.inst.lock().unwrap();

		let term = guard.module.meta().current_term;
		if guard.shutdown {
			return (0, term, false);
		}

		let mut tick = Tick::empty();
		match guard.module.propose_command(data, &mut tick) {
			Ok(prop) => {
				let index = prop.index;
				let term = prop.term;

				// The new entry must be durable and on its way to the
				// followers before we report it.
				if finish_tick(&self.shared, guard, tick).is_err() {
					return (0, term, false);
				}

				(index, term, true)
			}
			Err(ProposeError::NotLeader { .. }) => (0, term, false),
		}
	}

	/// Snapshot of (current term, whether this peer believes it is leader).
	pub fn get_state(&self) -> (Term, bool) {
		let guard = self.shared.inst.lock().unwrap();
		(
			guard.module.meta().current_term,
			!guard.shutdown && guard.module.is_leader(),
		)
	}

	/// Stops all background activity. Idempotent; operations on a shut-down
	/// peer return promptly and report non-leadership.
	pub fn shutdown(&self) {
		{
			let mut guard = self.shared.inst.lock().unwrap();
			if guard.shutdown {
				return;
			}
			guard.shutdown = true;
		}

		self.shared.wakeup.notify_all();
		self.shared.apply_ready.notify_all();

		let handles: Vec<_> = self.background.lock().unwrap().drain(..).collect();
		for h in handles {
			let _ = h.join();
		}
	}
}

impl Service for Server {
	fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
		let mut guard = self.shared.inst.lock().unwrap();
		if guard.shutdown {
			bail!("Server is shutting down");
		}

		let mut tick = Tick::empty();
		let res = guard.module.request_vote(req, &mut tick);

		// The vote must hit stable storage before the reply leaves.
		finish_tick(&self.shared, guard, tick)?;

		Ok(res.persisted())
	}

	fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
		let mut guard = self.shared.inst.lock().unwrap();
		if guard.shutdown {
			bail!("Server is shutting down");
		}

		let mut tick = Tick::empty();
		let res = guard.module.append_entries(req, &mut tick);

		// Even a failed request may have advanced our term.
		finish_tick(&self.shared, guard, tick)?;

		Ok(res?.persisted())
	}
}

/// Carries out everything a tick asked for: persistence (under the lock),
/// waking the apply pump, and sending messages (after the lock is released).
fn finish_tick(
	shared: &Arc<ServerShared>,
	mut guard: MutexGuard<ServerInstance>,
	tick: Tick,
) -> Result<()> {
	let result = guard.persist_if_needed(&tick);
	if let Err(ref e) = result {
		// A peer that cannot persist may violate safety if it keeps going. In
		// particular the tick's messages must not go out: they may replicate
		// entries that never made it to stable storage.
		error!("Halting raft peer: failed to persist state: {}", e);
		guard.shutdown = true;
		drop(guard);
		return result;
	}

	if guard.module.commit_index() > guard.last_applied {
		shared.apply_ready.notify_one();
	}

	let messages = tick.messages;
	drop(guard);

	if !messages.is_empty() {
		dispatch(shared, messages);
	}

	shared.wakeup.notify_one();

	result
}

/// Fans a batch of outbound requests out to their targets, one detached
/// thread per in-flight RPC.
fn dispatch(shared: &Arc<ServerShared>, messages: Vec<Message>) {
	for msg in messages {
		for to in &msg.to {
			let shared = shared.clone();
			let to = *to;
			let body = msg.body.clone();

			thread::spawn(move || send_message(shared, to, body));
		}
	}
}

/// Performs one outbound RPC and feeds the reply (or its absence) back into
/// the consensus module. The role/term staleness checks live in the
/// callbacks themselves.
fn send_message(shared: Arc<ServerShared>, to: ServerId, body: MessageBody) {
	match body {
		MessageBody::RequestVote(req) => {
			let sent_term = req.term;
			let resp = shared.transport.call(to, &RpcRequest::RequestVote(req));

			let mut guard = shared.inst.lock().unwrap();
			if guard.shutdown {
				return;
			}

			let mut tick = Tick::empty();
			match resp {
				Some(RpcResponse::RequestVote(r)) => {
					guard.module.request_vote_callback(to, sent_term, r, &mut tick)
				}
				// A lost vote is retried only by the next election.
				_ => return,
			}

			let _ = finish_tick(&shared, guard, tick);
		}

		MessageBody::AppendEntries(req, last_index) => {
			let sent_term = req.term;
			let resp = shared.transport.call(to, &RpcRequest::AppendEntries(req));

			let mut guard = shared.inst.lock().unwrap();
			if guard.shutdown {
				return;
			}

			let mut tick = Tick::empty();
			match resp {
				Some(RpcResponse::AppendEntries(r)) => guard
					.module
					.append_entries_callback(to, sent_term, last_index, r, &mut tick),
				_ => guard.module.append_entries_noresponse(to, &mut tick),
			}

			let _ = finish_tick(&shared, guard, tick);
		}
	}
}

/// The driver loop: repeatedly lets the consensus module act on the current
/// time, then sleeps until its next deadline or until someone wakes it.
fn drive(shared: Arc<ServerShared>) {
	let mut guard = shared.inst.lock().unwrap();

	while !guard.shutdown {
		let mut tick = Tick::empty();
		guard.module.cycle(&mut tick);

		if guard.persist_if_needed(&tick).is_err() {
			error!("Halting raft peer: failed to persist state");
			guard.shutdown = true;
			break;
		}

		if guard.module.commit_index() > guard.last_applied {
			shared.apply_ready.notify_one();
		}

		if !tick.messages.is_empty() {
			let messages = std::mem::replace(&mut tick.messages, vec![]);
			drop(guard);
			dispatch(&shared, messages);
			guard = shared.inst.lock().unwrap();
			continue;
		}

		let wait = tick.next_tick.unwrap_or(IDLE_TICK);
		let (g, _) = shared.wakeup.wait_timeout(guard, wait).unwrap();
		guard = g;
	}

	// Unblock the apply pump so it can observe the shutdown.
	drop(guard);
	shared.apply_ready.notify_all();
}

/// The single in-order deliverer of committed entries. Snapshots the newly
/// committed suffix under the lock, delivers it unlocked, then records how
/// far it got.
fn apply_pump(shared: Arc<ServerShared>, sink: Box<dyn ApplySink>) {
	let mut guard = shared.inst.lock().unwrap();

	loop {
		if guard.shutdown {
			return;
		}

		let commit_index = guard.module.commit_index();
		if guard.last_applied >= commit_index {
			guard = shared.apply_ready.wait(guard).unwrap();
			continue;
		}

		let start = guard.last_applied + 1;
		let batch: Vec<LogEntry> = (start..=commit_index)
			.filter_map(|i| guard.module.log().entry(i).cloned())
			.collect();

		drop(guard);

		let mut delivered = start - 1;
		let mut sink_closed = false;

		for e in batch {
			let msg = ApplyMsg {
				command_valid: true,
				command: e.data,
				command_index: e.index,
			};

			if sink.deliver(msg).is_err() {
				sink_closed = true;
				break;
			}

			delivered = e.index;
		}

		guard = shared.inst.lock().unwrap();
		if delivered > guard.last_applied {
			guard.last_applied = delivered;
		}

		if sink_closed {
			warn!("Apply sink disconnected; stopping the apply pump");
			return;
		}
	}
}

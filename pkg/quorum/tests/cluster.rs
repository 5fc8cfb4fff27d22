extern crate quorum;

use quorum::persist::MemoryPersister;
use quorum::protos::*;
use quorum::rpc::{LocalNetwork, LocalTransport};
use quorum::server::Server;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// An in-process cluster with a controllable network, in the style the real
/// deployments are wired up: one server, persister and apply channel per
/// peer, all routed through a LocalNetwork.
struct TestCluster {
	roster: Vec<ServerId>,
	net: Arc<LocalNetwork>,
	servers: Vec<Option<Arc<Server>>>,
	persisters: Vec<Arc<MemoryPersister>>,
	applied: Vec<Receiver<ApplyMsg>>,
}

impl TestCluster {
	fn launch(n: u64) -> TestCluster {
		let roster: Vec<ServerId> = (0..n).collect();

		let mut cluster = TestCluster {
			roster: roster.clone(),
			net: LocalNetwork::new(),
			servers: vec![],
			persisters: vec![],
			applied: vec![],
		};

		for _ in roster.iter() {
			let (_tx, rx) = mpsc::channel();
			cluster.servers.push(None);
			cluster.persisters.push(Arc::new(MemoryPersister::new()));
			cluster.applied.push(rx);
		}

		for id in roster {
			cluster.boot(id);
		}

		cluster
	}

	/// Starts (or restarts) one peer from whatever its persister holds.
	fn boot(&mut self, id: ServerId) {
		let (tx, rx) = mpsc::channel();

		let server = Server::start(
			self.roster.clone(),
			id,
			LocalTransport::new(self.net.clone(), id),
			self.persisters[id as usize].clone(),
			Box::new(tx),
		)
		.expect("Failed to start server");

		self.net.register(id, server.clone());
		self.servers[id as usize] = Some(server);
		self.applied[id as usize] = rx;
	}

	fn server(&self, id: ServerId) -> &Arc<Server> {
		self.servers[id as usize]
			.as_ref()
			.expect("Server is not running")
	}

	/// Simulates a machine dying: the peer stops and drops off the network.
	/// Its stable storage survives for a later restart.
	fn crash(&mut self, id: ServerId) {
		if let Some(server) = self.servers[id as usize].take() {
			server.shutdown();
		}
		self.net.remove(id);
	}

	fn restart(&mut self, id: ServerId) {
		self.boot(id);
	}

	fn live_ids(&self) -> Vec<ServerId> {
		self.servers
			.iter()
			.enumerate()
			.filter(|(_, s)| s.is_some())
			.map(|(id, _)| id as ServerId)
			.collect()
	}

	fn await_leader(&self) -> ServerId {
		self.await_leader_among(&self.live_ids())
	}

	/// Waits until exactly one of the given peers claims leadership.
	fn await_leader_among(&self, ids: &[ServerId]) -> ServerId {
		let deadline = Instant::now() + Duration::from_secs(10);

		while Instant::now() < deadline {
			let leaders: Vec<ServerId> = ids
				.iter()
				.cloned()
				.filter(|id| self.server(*id).get_state().1)
				.collect();

			if leaders.len() == 1 {
				return leaders[0];
			}

			thread::sleep(Duration::from_millis(50));
		}

		panic!("No single leader emerged in time");
	}

	/// Waits for a leader that stays leader: a split-vote round can briefly
	/// leave a higher-term candidate around that deposes the first winner.
	fn await_stable_leader(&self) -> ServerId {
		let deadline = Instant::now() + Duration::from_secs(20);

		while Instant::now() < deadline {
			let leader = self.await_leader();
			let (term, _) = self.server(leader).get_state();

			thread::sleep(Duration::from_millis(700));

			let (term_after, still_leader) = self.server(leader).get_state();
			if still_leader && term_after == term {
				return leader;
			}
		}

		panic!("Leadership never stabilized");
	}

	/// Submits a command through whichever peer currently leads, retrying
	/// across leadership changes.
	fn submit(&self, data: &[u8]) -> LogIndex {
		let deadline = Instant::now() + Duration::from_secs(10);

		while Instant::now() < deadline {
			let leader = self.await_leader();
			let (index, _term, ok) = self.server(leader).execute(data.to_vec());
			if ok {
				return index;
			}

			thread::sleep(Duration::from_millis(50));
		}

		panic!("Failed to submit a command in time");
	}

	/// The next message on a peer's apply stream must be exactly this entry;
	/// anything else (wrong index, wrong command, silence) is a failure.
	fn expect_apply(&self, id: ServerId, index: LogIndex, data: &[u8]) {
		let msg = self.applied[id as usize]
			.recv_timeout(Duration::from_secs(10))
			.unwrap_or_else(|_| panic!("Peer {} never applied index {}", id, index));

		assert!(msg.command_valid);
		assert_eq!(
			msg.command_index, index,
			"Peer {} applied out of order",
			id
		);
		assert_eq!(msg.command, data.to_vec(), "Peer {} applied wrong command", id);
	}

	fn assert_no_apply(&self, id: ServerId, within: Duration) {
		match self.applied[id as usize].recv_timeout(within) {
			Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
			Ok(msg) => panic!("Peer {} unexpectedly applied index {}", id, msg.command_index),
		}
	}

	fn shutdown(&mut self) {
		for server in self.servers.iter_mut() {
			if let Some(server) = server.take() {
				server.shutdown();
			}
		}
	}
}

#[test]
fn initial_election_settles_on_one_leader() {
	let mut cluster = TestCluster::launch(3);

	let leader = cluster.await_stable_leader();

	let (leader_term, still_leader) = cluster.server(leader).get_state();
	assert!(still_leader);

	for id in cluster.live_ids() {
		let (term, is_leader) = cluster.server(id).get_state();
		assert_eq!(term, leader_term);
		assert_eq!(is_leader, id == leader);
	}

	cluster.shutdown();
}

#[test]
fn commands_replicate_to_every_peer_in_order() {
	let mut cluster = TestCluster::launch(3);

	let leader = cluster.await_stable_leader();
	let (index, _term, ok) = cluster.server(leader).execute(b"x".to_vec());
	assert!(ok);
	assert_eq!(index, 1);

	for id in 0..3 {
		cluster.expect_apply(id, 1, b"x");
	}

	// Exactly once: nothing further shows up on any stream.
	for id in 0..3 {
		cluster.assert_no_apply(id, Duration::from_millis(400));
	}

	assert_eq!(cluster.submit(b"y"), 2);
	assert_eq!(cluster.submit(b"z"), 3);

	for id in 0..3 {
		cluster.expect_apply(id, 2, b"y");
		cluster.expect_apply(id, 3, b"z");
	}

	cluster.shutdown();
}

#[test]
fn follower_restart_preserves_log_and_catches_up() {
	let mut cluster = TestCluster::launch(3);

	let leader = cluster.await_stable_leader();
	assert_eq!(cluster.submit(b"a"), 1);
	for id in 0..3 {
		cluster.expect_apply(id, 1, b"a");
	}

	let follower = (0..3).find(|id| *id != leader).unwrap();
	cluster.crash(follower);

	// A majority is still up, so replication keeps working.
	assert_eq!(cluster.submit(b"b"), 2);
	for id in cluster.live_ids() {
		cluster.expect_apply(id, 2, b"b");
	}

	// The restarted peer rebuilds from its persisted log and replays the
	// whole committed prefix in order.
	cluster.restart(follower);
	cluster.expect_apply(follower, 1, b"a");
	cluster.expect_apply(follower, 2, b"b");

	cluster.shutdown();
}

#[test]
fn leader_crash_fails_over_and_rejoins() {
	let mut cluster = TestCluster::launch(3);

	let leader = cluster.await_stable_leader();
	assert_eq!(cluster.submit(b"one"), 1);
	for id in 0..3 {
		cluster.expect_apply(id, 1, b"one");
	}

	cluster.crash(leader);

	// The two surviving peers are still a quorum: they elect a new leader
	// and keep committing.
	assert_eq!(cluster.submit(b"two"), 2);
	for id in cluster.live_ids() {
		cluster.expect_apply(id, 2, b"two");
	}

	// The old leader comes back as a follower and replays the same history.
	cluster.restart(leader);
	cluster.expect_apply(leader, 1, b"one");
	cluster.expect_apply(leader, 2, b"two");

	cluster.shutdown();
}

#[test]
fn partitioned_minority_never_commits() {
	let mut cluster = TestCluster::launch(3);

	let old_leader = cluster.await_stable_leader();
	let (old_term, _) = cluster.server(old_leader).get_state();

	let majority: Vec<ServerId> = (0..3).filter(|id| *id != old_leader).collect();
	let minority: &[ServerId] = &[old_leader];
	cluster.net.set_partition(&[minority, &majority]);

	// The isolated leader still accepts a command into its log, but it can
	// never commit it.
	let (_, _, accepted) = cluster.server(old_leader).execute(b"lost".to_vec());
	assert!(accepted);

	// The majority side elects a fresh leader at a higher term and moves on.
	let new_leader = cluster.await_leader_among(&majority);
	let (new_term, _) = cluster.server(new_leader).get_state();
	assert!(new_term > old_term);

	let (index, _, ok) = cluster.server(new_leader).execute(b"committed".to_vec());
	assert!(ok);
	assert_eq!(index, 1);

	for id in majority.iter() {
		cluster.expect_apply(*id, 1, b"committed");
	}

	cluster.net.heal();

	// Once reconnected the deposed leader steps down...
	let deadline = Instant::now() + Duration::from_secs(10);
	while cluster.server(old_leader).get_state().1 {
		assert!(Instant::now() < deadline, "Old leader never stepped down");
		thread::sleep(Duration::from_millis(50));
	}

	let (_, _, still_leader) = cluster.server(old_leader).execute(b"probe".to_vec());
	assert!(!still_leader);

	// ...and converges on the majority's history. The minority entry never
	// reaches any apply stream: index 1 is "committed" everywhere.
	cluster.expect_apply(old_leader, 1, b"committed");

	assert_eq!(cluster.submit(b"second"), 2);
	for id in 0..3 {
		cluster.expect_apply(id, 2, b"second");
	}

	cluster.shutdown();
}

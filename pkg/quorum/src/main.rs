#[macro_use] extern crate error_chain;
#[macro_use] extern crate log;

extern crate clap;
extern crate env_logger;
extern crate quorum;

use clap::{App, Arg};
use quorum::errors::*;
use quorum::persist::MemoryPersister;
use quorum::protos::*;
use quorum::rpc::{LocalNetwork, LocalTransport};
use quorum::server::Server;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Spins up an in-process cluster, replicates a batch of commands through the
/// elected leader, and prints what every peer applied.
fn run() -> Result<()> {
	let matches = App::new("quorum-node")
		.about("Demo cluster for the quorum consensus module")
		.arg(
			Arg::with_name("peers")
				.long("peers")
				.short("p")
				.value_name("N")
				.help("Number of peers in the cluster")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("commands")
				.long("commands")
				.short("c")
				.value_name("K")
				.help("Number of commands to replicate")
				.takes_value(true),
		)
		.get_matches();

	let n: u64 = matches
		.value_of("peers")
		.unwrap_or("3")
		.parse()
		.chain_err(|| "Invalid peer count")?;
	let k: u64 = matches
		.value_of("commands")
		.unwrap_or("5")
		.parse()
		.chain_err(|| "Invalid command count")?;

	if n == 0 {
		bail!("A cluster needs at least one peer");
	}

	let roster: Vec<ServerId> = (0..n).collect();
	let net = LocalNetwork::new();

	let mut servers = vec![];
	let mut sinks = vec![];

	for id in roster.iter().cloned() {
		let (tx, rx) = mpsc::channel();
		let persister = Arc::new(MemoryPersister::new());

		let server = Server::start(
			roster.clone(),
			id,
			LocalTransport::new(net.clone(), id),
			persister,
			Box::new(tx),
		)?;

		net.register(id, server.clone());
		servers.push(server);
		sinks.push(rx);
	}

	let leader = await_leader(&servers)?;
	info!("Peer {} was elected leader", leader);

	for i in 0..k {
		let command = format!("command-{}", i).into_bytes();
		let (index, term, is_leader) = servers[leader as usize].execute(command);
		if !is_leader {
			bail!("Leadership changed mid-run; submit to another peer");
		}

		info!("Submitted entry {} in term {}", index, term);
	}

	// Give the slowest peer a moment to catch up.
	thread::sleep(Duration::from_millis(1500));

	for (id, rx) in sinks.iter().enumerate() {
		print!("peer {}:", id);
		while let Ok(msg) = rx.try_recv() {
			print!(
				" [{}]={}",
				msg.command_index,
				String::from_utf8_lossy(&msg.command)
			);
		}
		println!();
	}

	for server in servers.iter() {
		server.shutdown();
	}

	Ok(())
}

/// Polls until exactly one peer claims leadership.
fn await_leader(servers: &[Arc<Server>]) -> Result<ServerId> {
	let deadline = Instant::now() + Duration::from_secs(10);

	while Instant::now() < deadline {
		let leaders: Vec<ServerId> = servers
			.iter()
			.enumerate()
			.filter(|(_, s)| s.get_state().1)
			.map(|(id, _)| id as ServerId)
			.collect();

		if leaders.len() == 1 {
			return Ok(leaders[0]);
		}

		thread::sleep(Duration::from_millis(50));
	}

	bail!("No leader emerged in time")
}

fn main() {
	env_logger::init();

	if let Err(e) = run() {
		error!("{}", e);
		std::process::exit(1);
	}
}

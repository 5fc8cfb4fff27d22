use super::errors::*;
use super::protos::*;

use crate::rmps;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// How long a caller waits on an unreachable peer before giving up on the
/// reply. Real transports own this internally; the in-process one simulates
/// it.
const RPC_TIMEOUT: Duration = Duration::from_millis(50);

pub fn marshal<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
	Ok(rmps::to_vec(obj)?)
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	Ok(rmps::from_slice(data)?)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RpcRequest {
	RequestVote(RequestVoteRequest),
	AppendEntries(AppendEntriesRequest),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RpcResponse {
	RequestVote(RequestVoteResponse),
	AppendEntries(AppendEntriesResponse),
}

/// The two RPCs a peer serves. An Err means the request could not be handled
/// at all; the transport turns that into a lost reply.
pub trait Service: Send + Sync {
	fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse>;

	fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;
}

/// Point-to-point request/reply to other peers. None means the reply did not
/// arrive within the transport's internal timeout: the request may have been
/// lost, the reply may have been lost, or the peer may be down. The transport
/// may reorder and drop but never fabricates or corrupts.
pub trait Transport: Send + Sync {
	fn call(&self, to: ServerId, req: &RpcRequest) -> Option<RpcResponse>;
}

/// An in-process network connecting the peers of one cluster. Requests are
/// routed by server id and pass through the wire encoding both ways, so no
/// memory is ever shared between caller and callee.
///
/// Servers can be split into partition groups; calls across groups (or to an
/// unregistered id) behave like a dropped request.
pub struct LocalNetwork {
	services: Mutex<HashMap<ServerId, Arc<dyn Service>>>,
	groups: Mutex<HashMap<ServerId, u32>>,
}

impl LocalNetwork {
	pub fn new() -> Arc<LocalNetwork> {
		Arc::new(LocalNetwork {
			services: Mutex::new(HashMap::new()),
			groups: Mutex::new(HashMap::new()),
		})
	}

	pub fn register(&self, id: ServerId, service: Arc<dyn Service>) {
		self.services.lock().unwrap().insert(id, service);
		self.groups.lock().unwrap().entry(id).or_insert(0);
	}

	/// Drops a server from the network entirely, as if its machine died.
	pub fn remove(&self, id: ServerId) {
		self.services.lock().unwrap().remove(&id);
	}

	/// Splits the cluster into the given groups. Servers in different groups
	/// cannot exchange any messages.
	pub fn set_partition(&self, partitions: &[&[ServerId]]) {
		let mut groups = self.groups.lock().unwrap();
		for (i, part) in partitions.iter().enumerate() {
			for id in part.iter() {
				groups.insert(*id, i as u32);
			}
		}
	}

	/// Reconnects everyone.
	pub fn heal(&self) {
		let mut groups = self.groups.lock().unwrap();
		for (_, g) in groups.iter_mut() {
			*g = 0;
		}
	}

	fn reachable(&self, from: ServerId, to: ServerId) -> bool {
		let groups = self.groups.lock().unwrap();
		let a = groups.get(&from).cloned().unwrap_or(0);
		let b = groups.get(&to).cloned().unwrap_or(0);
		a == b
	}
}

/// One server's handle onto a LocalNetwork.
pub struct LocalTransport {
	net: Arc<LocalNetwork>,
	from: ServerId,
}

impl LocalTransport {
	pub fn new(net: Arc<LocalNetwork>, from: ServerId) -> Arc<LocalTransport> {
		Arc::new(LocalTransport { net, from })
	}
}

impl Transport for LocalTransport {
	fn call(&self, to: ServerId, req: &RpcRequest) -> Option<RpcResponse> {
		if !self.net.reachable(self.from, to) {
			thread::sleep(RPC_TIMEOUT);
			return None;
		}

		let service = {
			let services = self.net.services.lock().unwrap();
			services.get(&to).cloned()
		};

		let service = match service {
			Some(s) => s,
			None => {
				thread::sleep(RPC_TIMEOUT);
				return None;
			}
		};

		// Force everything across the wire format.
		let request: RpcRequest = match marshal(req).and_then(|raw| unmarshal(&raw)) {
			Ok(r) => r,
			Err(_) => return None,
		};

		let result = match request {
			RpcRequest::RequestVote(r) => service.request_vote(r).map(RpcResponse::RequestVote),
			RpcRequest::AppendEntries(r) => {
				service.append_entries(r).map(RpcResponse::AppendEntries)
			}
		};

		match result {
			Ok(resp) => {
				// If the link went down while the request was being served, the
				// reply is lost too.
				if !self.net.reachable(self.from, to) {
					thread::sleep(RPC_TIMEOUT);
					return None;
				}

				Some(resp)
			}
			Err(_) => None,
		}
	}
}

#[macro_use] extern crate serde_derive;
#[macro_use] extern crate error_chain;

// Aliased because this crate has its own `log` module.
#[macro_use] extern crate log as logging;

extern crate rand;
extern crate rmp_serde as rmps;
extern crate serde;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(std::io::Error);
			Encode(crate::rmps::encode::Error);
			Decode(crate::rmps::decode::Error);
		}
	}
}

pub mod protos;
pub mod log;
mod state;
pub mod consensus;
pub mod persist;
pub mod rpc;
pub mod server;

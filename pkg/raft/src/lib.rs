#[macro_use] extern crate serde_derive;
#[macro_use] extern crate error_chain;
#[macro_use] extern crate log as logging;

extern crate common;
extern crate byteorder;
extern crate crc32c;
extern crate rand;
extern crate rmps;
extern crate serde;
extern crate serde_json;
extern crate toml;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
			Encode(::rmps::encode::Error);
			Decode(::rmps::decode::Error);
		}
	}
}

pub mod config;
pub mod protos;
mod state;
pub mod log;
pub mod storage;
pub mod consensus;
pub mod rpc;
pub mod node;
pub mod server;
pub mod state_machine;

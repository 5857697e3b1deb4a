#[macro_use] extern crate serde_derive;
#[macro_use] extern crate log;

extern crate clap;
extern crate common;
extern crate ctrlc;
extern crate env_logger;
extern crate raft;
extern crate rmps;
extern crate serde;

mod client;
mod filestore;

use std::path::Path;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

use clap::{App, Arg};

use common::DirLock;
use raft::config::Config;
use raft::errors::*;
use raft::node::RaftNode;
use raft::server::Server;

use crate::filestore::FileStore;

fn run() -> Result<()> {
	env_logger::init();

	let matches = App::new("raftfs")
		.about("Replicated versioned file store")
		.arg(Arg::with_name("config")
			.long("config")
			.short("c")
			.value_name("FILE")
			.help("TOML configuration for this server instance")
			.required(true)
			.takes_value(true))
		.get_matches();

	let config = Config::load(Path::new(matches.value_of("config").unwrap()))?;

	std::fs::create_dir_all(&config.log_dir)?;
	let _lock = DirLock::open(&config.log_dir)
		.chain_err(|| "another instance already owns the data directory")?;

	let (node, commits) = RaftNode::start(&config)?;
	let machine = Arc::new(FileStore::new());
	let server = Server::start(node, machine, &config, commits);

	{
		let server = server.clone();
		let port = config.client_port;
		thread::spawn(move || {
			if let Err(e) = client::serve(server, port) {
				error!("client listener failed: {}", e);
				std::process::exit(1);
			}
		});
	}

	info!("server {} up; peer port {}, client port {}",
		config.id, config.self_peer().port, config.client_port);

	// Park until a signal arrives, then take the replica down in one piece
	let (stop_tx, stop_rx) = channel();
	ctrlc::set_handler(move || {
		let _ = stop_tx.send(());
	}).chain_err(|| "cannot install the shutdown handler")?;
	let _ = stop_rx.recv();

	info!("signal received; shutting down");
	server.shutdown();
	Ok(())
}

fn main() {
	if let Err(e) = run() {
		eprintln!("error: {}", e);
		std::process::exit(1);
	}
}

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::*;
use crate::protos::ServerId;

/// One server of the fixed cluster as named in the configuration file
#[derive(Deserialize, Debug, Clone)]
pub struct PeerConfig {
	pub id: ServerId,
	pub host: String,
	pub port: u16,

	/// Port the server's client listener sits on; used to build redirect targets.
	/// Falls back to the peer port when absent
	#[serde(default)]
	pub client_port: Option<u16>
}

impl PeerConfig {
	pub fn addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	pub fn client_addr(&self) -> String {
		format!("{}:{}", self.host, self.client_port.unwrap_or(self.port))
	}
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	pub id: ServerId,
	pub log_dir: PathBuf,
	pub election_timeout_ms: u64,
	pub heartbeat_timeout_ms: u64,
	pub client_port: u16,
	pub peers: Vec<PeerConfig>
}

impl Config {
	pub fn load(path: &Path) -> Result<Config> {
		let text = fs::read_to_string(path)
			.chain_err(|| format!("cannot read config file {:?}", path))?;
		let config: Config = toml::from_str(&text)
			.chain_err(|| format!("cannot parse config file {:?}", path))?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if self.peers.is_empty() {
			bail!("config names no peers");
		}

		let mut ids: Vec<ServerId> = self.peers.iter().map(|p| p.id).collect();
		ids.sort();
		ids.dedup();
		if ids.len() != self.peers.len() {
			bail!("config contains duplicate peer ids");
		}

		if self.peer(self.id).is_none() {
			bail!("own id {} does not appear in the peer list", self.id);
		}
		Ok(())
	}

	pub fn peer(&self, id: ServerId) -> Option<&PeerConfig> {
		self.peers.iter().find(|p| p.id == id)
	}

	pub fn self_peer(&self) -> &PeerConfig {
		self.peer(self.id).unwrap()
	}

	pub fn peer_ids(&self) -> Vec<ServerId> {
		self.peers.iter().map(|p| p.id).collect()
	}
}

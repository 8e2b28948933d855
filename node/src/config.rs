use ledger_sync_core::{
	self_peer::SelfPeerConfig,
	types::{duration_seconds_format, tracing_level_format, SyncConfig},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	/// File system path where the blocks, the peers and the indicators are stored (default: "ledger_data").
	pub data_path: String,
	/// Currency name of the network the node belongs to.
	pub currency: String,
	/// DNS name announced in the self peering document (default: None).
	pub remote_host: Option<String>,
	/// IPv4 address announced in the self peering document (default: None).
	pub remote_ipv4: Option<String>,
	/// IPv6 address announced in the self peering document (default: None).
	pub remote_ipv6: Option<String>,
	/// Port announced in the self peering document (default: 8999).
	pub remote_port: Option<u16>,
	/// Path to the base58 encoded ed25519 seed of the node, generated if missing (default: "<data_path>/secret_key").
	pub secret_key_path: Option<String>,
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	/// Timeout of the requests to the remote nodes, in seconds (default: 10).
	#[serde(with = "duration_seconds_format")]
	pub http_timeout: Duration,
	/// Pubkeys of the members, whose diverging chains are followed (default: []).
	pub members: Vec<String>,
	/// Endpoints of the nodes used to discover the first peers (default: []).
	pub bootstraps: Vec<String>,
	#[serde(flatten)]
	pub sync: SyncConfig,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			data_path: "ledger_data".to_owned(),
			currency: String::new(),
			remote_host: None,
			remote_ipv4: None,
			remote_ipv6: None,
			remote_port: Some(8999),
			secret_key_path: None,
			log_level: Level::INFO,
			log_format_json: false,
			http_timeout: Duration::from_secs(10),
			members: vec![],
			bootstraps: vec![],
			sync: Default::default(),
		}
	}
}

impl RuntimeConfig {
	pub fn secret_key_path(&self) -> String {
		self.secret_key_path
			.clone()
			.unwrap_or_else(|| format!("{}/secret_key", self.data_path))
	}
}

impl From<&RuntimeConfig> for SelfPeerConfig {
	fn from(val: &RuntimeConfig) -> Self {
		SelfPeerConfig {
			currency: val.currency.clone(),
			remote_host: val.remote_host.clone(),
			remote_ipv4: val.remote_ipv4.clone(),
			remote_ipv6: val.remote_ipv6.clone(),
			remote_port: val.remote_port,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_config_uses_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		std::fs::write(
			&path,
			r#"
currency = "test_net"
remote_host = "node.example.org"
log_level = "debug"
http_timeout = 3
avg_gen_time = 60
members = ["A", "B"]
"#,
		)
		.unwrap();

		let config: RuntimeConfig = confy::load_path(&path).unwrap();
		assert_eq!(config.currency, "test_net");
		assert_eq!(config.log_level, Level::DEBUG);
		assert_eq!(config.http_timeout, Duration::from_secs(3));
		assert_eq!(config.sync.avg_gen_time, 60);
		assert_eq!(config.sync.sync_interval(), Duration::from_secs(60));
		assert_eq!(config.sync.download_batch_size, 50);
		assert_eq!(config.members.len(), 2);
		assert_eq!(config.secret_key_path(), "ledger_data/secret_key");
	}

	#[test]
	fn self_peer_config_from_runtime_config() {
		let config = RuntimeConfig {
			currency: "test_net".to_string(),
			remote_ipv4: Some("10.0.0.1".to_string()),
			..Default::default()
		};
		let self_peer = SelfPeerConfig::from(&config);
		assert_eq!(
			self_peer.endpoint().unwrap(),
			"BASIC_MERKLED_API 10.0.0.1 8999"
		);
	}
}

//! Shared ledger structs and enums.
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::{
	fmt::{self, Display, Formatter},
	str::FromStr,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Hash part of the anchor used by peering documents not bound to any known block.
pub const SPECIAL_BLOCK_HASH: &str =
	"E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
/// Anchor used by peering documents not bound to any known block.
pub const SPECIAL_BLOCK: &str =
	"0-E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";

/// Immutable ledger block, as stored in block files and served by remote nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
	pub number: u32,
	pub hash: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub previous_hash: Option<String>,
	pub median_time: u64,
	#[serde(default)]
	pub issuer: String,
	#[serde(default)]
	pub transactions: Vec<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dividend: Option<u64>,
}

impl Block {
	pub fn anchor(&self) -> BlockAnchor {
		BlockAnchor {
			number: self.number,
			hash: self.hash.clone(),
		}
	}

	/// Checks that `self` directly extends `parent`.
	pub fn extends(&self, parent: &Block) -> bool {
		self.number == parent.number + 1 && self.previous_hash.as_deref() == Some(&parent.hash)
	}
}

/// `number-hash` pair referencing a block.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockAnchor {
	pub number: u32,
	pub hash: String,
}

impl BlockAnchor {
	pub fn special() -> Self {
		BlockAnchor {
			number: 0,
			hash: SPECIAL_BLOCK_HASH.to_string(),
		}
	}

	pub fn is_special(&self) -> bool {
		self.number == 0 && self.hash == SPECIAL_BLOCK_HASH
	}
}

impl FromStr for BlockAnchor {
	type Err = Error;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		let (number, hash) = value
			.split_once('-')
			.ok_or_else(|| Error::Protocol(format!("Invalid block anchor {value}")))?;
		let number = number
			.parse::<u32>()
			.map_err(|_| Error::Protocol(format!("Invalid block anchor number {value}")))?;
		if hash.is_empty() {
			return Err(Error::Protocol(format!("Missing block anchor hash {value}")));
		}
		Ok(BlockAnchor {
			number,
			hash: hash.to_string(),
		})
	}
}

impl TryFrom<String> for BlockAnchor {
	type Error = Error;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<BlockAnchor> for String {
	fn from(anchor: BlockAnchor) -> Self {
		anchor.to_string()
	}
}

impl Display for BlockAnchor {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.number, self.hash)
	}
}

/// Synchronization configuration (see `RuntimeConfig` of the node for details)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Average block generation time, in seconds (default: 160).
	pub avg_gen_time: u64,
	/// Block pulling interval, as a multiple of the average generation time (default: 1).
	pub sync_block_interval: u64,
	/// Peers crawling interval, as a multiple of the average generation time (default: 10).
	pub sync_peers_interval: u64,
	/// Self peering document refresh interval, as a multiple of the average generation time (default: 6).
	pub self_peer_interval: u64,
	/// Interval between two liveness checks of the DOWN peers (default: 10 sec).
	#[serde(with = "duration_seconds_format")]
	pub liveness_interval: Duration,
	/// Periodic crawls are skipped when more UP peers than this are known (default: 4).
	pub enough_peers: usize,
	/// Number of blocks requested in one download (default: 50).
	pub download_batch_size: u32,
	/// Maximum depth searched for a common block with a diverging member peer (default: 100).
	pub fork_window: u32,
	/// Validity of a membership, in seconds (default: 1 year).
	pub ms_validity: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			avg_gen_time: 160,
			sync_block_interval: 1,
			sync_peers_interval: 10,
			self_peer_interval: 6,
			liveness_interval: Duration::from_secs(10),
			enough_peers: 4,
			download_batch_size: 50,
			fork_window: 100,
			ms_validity: 31_557_600,
		}
	}
}

impl SyncConfig {
	pub fn sync_interval(&self) -> Duration {
		Duration::from_secs(self.avg_gen_time * self.sync_block_interval)
	}

	pub fn crawl_interval(&self) -> Duration {
		Duration::from_secs(self.avg_gen_time * self.sync_peers_interval)
	}

	pub fn self_peer_interval(&self) -> Duration {
		Duration::from_secs(self.avg_gen_time * self.self_peer_interval)
	}
}

/// Milliseconds elapsed since the unix epoch.
pub fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_millis() as u64)
		.unwrap_or_default()
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

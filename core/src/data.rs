use crate::{error::Result, ledger::Indicators, ledger::Core, peer::PeerRecord};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

mod keys;
use keys::*;

mod file_db;
pub use file_db::*;

mod mem_db;
pub use mem_db::*;

mod write_queue;
pub use write_queue::*;

/// Key space for the peering state
pub const PEERING_SPACE: &str = "peering";

/// Key space for the chain state
pub const CHAIN_SPACE: &str = "chain";

/// Type of the database key which we can get from the custom key.
pub trait RecordKey: Send + Sync + 'static {
	type Type: Serialize + DeserializeOwned + Send + Sync + 'static;

	fn space(&self) -> Option<&'static str>;

	/// Returns key space (if any) and key
	fn key(&self) -> String;
}

#[async_trait]
pub trait Database {
	/// Puts value for given key into database.
	/// Key is serialized into database key, value is serialized into type supported by database.
	async fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<()>;

	/// Gets value for given key.
	/// Key is serialized into database key, value is deserialized into the given type.
	async fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>>;

	/// Deletes value from the database for the given key.
	async fn delete<T: RecordKey>(&self, key: T) -> Result<()>;
}

pub struct PeersKey;

impl RecordKey for PeersKey {
	type Type = Vec<PeerRecord>;

	fn space(&self) -> Option<&'static str> {
		Some(PEERING_SPACE)
	}

	fn key(&self) -> String {
		PEERS_KEY.into()
	}
}

pub struct IndicatorsKey;

impl RecordKey for IndicatorsKey {
	type Type = Indicators;

	fn space(&self) -> Option<&'static str> {
		Some(CHAIN_SPACE)
	}

	fn key(&self) -> String {
		INDICATORS_KEY.into()
	}
}

pub struct CoresKey;

impl RecordKey for CoresKey {
	type Type = Vec<Core>;

	fn space(&self) -> Option<&'static str> {
		Some(CHAIN_SPACE)
	}

	fn key(&self) -> String {
		CORES_KEY.into()
	}
}

use crate::{data::Database, error::Result};
use async_trait::async_trait;
use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use super::RecordKey;

#[derive(Clone)]
pub struct MemoryDB {
	map: Arc<RwLock<HashMap<HashMapKey, String>>>,
}

#[derive(Eq, Hash, PartialEq)]
pub struct HashMapKey(pub String);

impl Default for MemoryDB {
	fn default() -> Self {
		MemoryDB {
			map: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl<T: RecordKey> From<T> for HashMapKey {
	fn from(value: T) -> Self {
		let key = value.key();
		HashMapKey(match value.space() {
			Some(space) => format!("{space}::{key}"),
			None => key,
		})
	}
}

#[async_trait]
impl Database for MemoryDB {
	async fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<()> {
		let encoded = serde_json::to_string(&value)?;
		let mut map = self.map.write().expect("Lock acquired");
		map.insert(key.into(), encoded);
		Ok(())
	}

	async fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>> {
		let map = self.map.read().expect("Lock acquired");
		map.get(&key.into())
			.map(|value| serde_json::from_str(value))
			.transpose()
			.map_err(Into::into)
	}

	async fn delete<T: RecordKey>(&self, key: T) -> Result<()> {
		let mut map = self.map.write().expect("Lock acquired");
		map.remove(&key.into());
		Ok(())
	}
}

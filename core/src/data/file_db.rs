use super::{RecordKey, WriteQueue};
use crate::{
	data::Database,
	error::{Error, Result},
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Database keeping every record in its own pretty printed JSON file.
///
/// Records live under `<root>/<space>/<key>.json`, writes go through the shared [`WriteQueue`].
#[derive(Clone)]
pub struct FileDB {
	root: PathBuf,
	queue: WriteQueue,
}

impl FileDB {
	pub fn open(root: impl AsRef<Path>, queue: WriteQueue) -> Self {
		FileDB {
			root: root.as_ref().to_path_buf(),
			queue,
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn queue(&self) -> &WriteQueue {
		&self.queue
	}

	fn path<T: RecordKey>(&self, key: &T) -> PathBuf {
		let file_name = format!("{}.json", key.key());
		match key.space() {
			Some(space) => self.root.join(space).join(file_name),
			None => self.root.join(file_name),
		}
	}
}

#[async_trait]
impl Database for FileDB {
	async fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<()> {
		let contents = serde_json::to_vec_pretty(&value)?;
		self.queue.write(&self.path(&key), contents).await
	}

	async fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>> {
		let path = self.path(&key);
		let contents = match fs::read(&path).await {
			Ok(contents) => contents,
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(error) => return Err(error.into()),
		};
		serde_json::from_slice(&contents)
			.map(Some)
			.map_err(|error| Error::StorageCorruption(format!("{}: {error}", path.display())))
	}

	async fn delete<T: RecordKey>(&self, key: T) -> Result<()> {
		self.queue.remove_file(&self.path(&key)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{data::IndicatorsKey, ledger::Indicators};

	#[tokio::test]
	async fn put_get_delete() {
		let dir = tempfile::tempdir().unwrap();
		let db = FileDB::open(dir.path(), WriteQueue::new());
		assert!(db.get(IndicatorsKey).await.unwrap().is_none());

		let indicators = Indicators {
			current_number: Some(7),
			..Default::default()
		};
		db.put(IndicatorsKey, indicators).await.unwrap();
		assert!(dir.path().join("chain").join("indicators.json").exists());

		let stored = db.get(IndicatorsKey).await.unwrap().unwrap();
		assert_eq!(stored.current_number, Some(7));

		db.delete(IndicatorsKey).await.unwrap();
		assert!(db.get(IndicatorsKey).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn unreadable_record_is_corruption() {
		let dir = tempfile::tempdir().unwrap();
		let db = FileDB::open(dir.path(), WriteQueue::new());
		fs::create_dir_all(dir.path().join("chain")).await.unwrap();
		fs::write(dir.path().join("chain").join("indicators.json"), b"{\"curr")
			.await
			.unwrap();

		let result = db.get(IndicatorsKey).await;
		assert!(matches!(result, Err(Error::StorageCorruption(_))));
	}
}

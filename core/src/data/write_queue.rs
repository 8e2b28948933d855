use crate::error::Result;
use std::{
	path::{Path, PathBuf},
	sync::Arc,
};
use tokio::{fs, sync::Mutex};
use tracing::trace;

/// Process wide FIFO through which every file write goes.
///
/// Only one write is in flight at any time. Waiters are served in the order they
/// queued up, since the underlying Tokio mutex is fair.
///
/// Contents are written into a hidden sibling file first and then renamed over the
/// target, so readers observe either the previous or the new contents.
#[derive(Clone, Default)]
pub struct WriteQueue {
	lock: Arc<Mutex<()>>,
}

impl WriteQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn write(&self, path: &Path, contents: Vec<u8>) -> Result<()> {
		let _guard = self.lock.lock().await;
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await?;
		}
		let staging = staging_path(path);
		fs::write(&staging, contents).await?;
		fs::rename(&staging, path).await?;
		trace!(path = %path.display(), "File written");
		Ok(())
	}

	pub async fn remove_file(&self, path: &Path) -> Result<()> {
		let _guard = self.lock.lock().await;
		match fs::remove_file(path).await {
			Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
			_ => Ok(()),
		}
	}

	pub async fn remove_dir_all(&self, path: &Path) -> Result<()> {
		let _guard = self.lock.lock().await;
		match fs::remove_dir_all(path).await {
			Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
			_ => Ok(()),
		}
	}
}

/// Staging files are hidden, so directory listings can skip them.
fn staging_path(path: &Path) -> PathBuf {
	let name = path
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or_default();
	path.with_file_name(format!(".{name}.tmp"))
}

pub fn is_staging_file(name: &str) -> bool {
	name.starts_with('.')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn write_replaces_contents() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested").join("file.json");
		let queue = WriteQueue::new();

		queue.write(&path, b"first".to_vec()).await.unwrap();
		queue.write(&path, b"second".to_vec()).await.unwrap();

		assert_eq!(fs::read(&path).await.unwrap(), b"second");
		assert!(!staging_path(&path).exists());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_writes_never_interleave() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file.json");
		let queue = WriteQueue::new();

		let writes = (0..16u8).map(|index| {
			let queue = queue.clone();
			let path = path.clone();
			tokio::spawn(async move { queue.write(&path, vec![index; 4096]).await })
		});
		for write in writes {
			write.await.unwrap().unwrap();
		}

		let contents = fs::read(&path).await.unwrap();
		assert_eq!(contents.len(), 4096);
		assert!(contents.iter().all(|byte| *byte == contents[0]));
	}

	#[tokio::test]
	async fn removing_missing_paths_succeeds() {
		let dir = tempfile::tempdir().unwrap();
		let queue = WriteQueue::new();
		queue.remove_file(&dir.path().join("missing")).await.unwrap();
		queue
			.remove_dir_all(&dir.path().join("missing_dir"))
			.await
			.unwrap();
	}
}

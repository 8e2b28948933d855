//! Sharded on-disk persistence of immutable blocks.
//!
//! Blocks are grouped into shard directories of [`SHARD_SIZE`] heights, each block in its own
//! JSON file named after its zero-padded number:
//!
//! ```text
//! <root>/blocks/500/0000000499.json
//! <root>/blocks/1000/0000000501.json
//! ```
//!
//! The highest stored height is cached and recovered from the directory layout when needed.

use crate::{
	data::{is_staging_file, WriteQueue},
	error::{Error, Result},
	types::Block,
};
use std::{
	path::{Path, PathBuf},
	sync::Mutex,
};
use tokio::fs;
use tracing::{debug, warn};

/// Number of block heights grouped into one shard directory.
pub const SHARD_SIZE: u32 = 500;

const BLOCKS_DIR: &str = "blocks";

/// Shard directory holding the given block height.
pub fn shard_of(number: u32) -> u32 {
	(number / SHARD_SIZE + 1) * SHARD_SIZE
}

pub fn block_file_name(number: u32) -> String {
	format!("{number:010}.json")
}

#[derive(Default)]
struct MaxNumberCache {
	loaded: bool,
	max_number: Option<u32>,
}

pub struct BlockStore {
	root: PathBuf,
	queue: WriteQueue,
	cache: Mutex<MaxNumberCache>,
	// keeps the conflict check and the write of a block together
	write_lock: tokio::sync::Mutex<()>,
}

impl BlockStore {
	pub fn new(root: impl AsRef<Path>, queue: WriteQueue) -> Self {
		BlockStore {
			root: root.as_ref().to_path_buf(),
			queue,
			cache: Mutex::new(MaxNumberCache::default()),
			write_lock: tokio::sync::Mutex::new(()),
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn blocks_dir(&self) -> PathBuf {
		self.root.join(BLOCKS_DIR)
	}

	pub fn path_of(&self, number: u32) -> PathBuf {
		self.blocks_dir()
			.join(shard_of(number).to_string())
			.join(block_file_name(number))
	}

	/// Reads the block stored at the given height.
	pub async fn read_block(&self, number: u32) -> Result<Block> {
		let path = self.path_of(number);
		let contents = match fs::read(&path).await {
			Ok(contents) => contents,
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
				return Err(Error::NotFound(format!("Block {number}")))
			},
			Err(error) => return Err(error.into()),
		};
		serde_json::from_slice(&contents)
			.map_err(|error| Error::StorageCorruption(format!("{}: {error}", path.display())))
	}

	pub async fn read_block_by_number_and_hash(&self, number: u32, hash: &str) -> Result<Block> {
		match self.read_block(number).await {
			Ok(block) if block.hash == hash => Ok(block),
			Ok(_) | Err(Error::NotFound(_)) => Err(Error::NotFound(format!("Block {number}-{hash}"))),
			Err(error) => Err(error),
		}
	}

	/// Persists the block, returning `false` when an identical block was already stored.
	pub async fn write_block(&self, block: &Block) -> Result<bool> {
		let _guard = self.write_lock.lock().await;

		match self.read_block(block.number).await {
			Ok(existing) if existing.hash == block.hash => return Ok(false),
			Ok(existing) => {
				return Err(Error::Conflict(format!(
					"Block {} already stored with hash {}",
					block.number, existing.hash
				)))
			},
			Err(Error::NotFound(_)) => {},
			Err(Error::StorageCorruption(reason)) => {
				warn!(block_number = block.number, reason, "Overwriting unreadable block file");
			},
			Err(error) => return Err(error),
		}

		let contents = serde_json::to_vec_pretty(block)?;
		self.queue.write(&self.path_of(block.number), contents).await?;

		let mut cache = self.cache.lock().expect("Lock acquired");
		if cache.loaded {
			cache.max_number = cache.max_number.max(Some(block.number));
		}
		Ok(true)
	}

	/// Checks whether the given height is covered by the stored blocks.
	///
	/// The cached max height is refreshed from disk when `number` is above it.
	pub async fn has_block(&self, number: u32) -> Result<bool> {
		let cached = {
			let cache = self.cache.lock().expect("Lock acquired");
			cache.loaded.then_some(cache.max_number)
		};
		if let Some(Some(max_number)) = cached {
			if number <= max_number {
				return Ok(true);
			}
		}
		let max_number = self.refresh_max_number().await?;
		Ok(max_number.is_some_and(|max_number| number <= max_number))
	}

	/// Highest stored block height, recovered from disk on first use.
	pub async fn get_max_number(&self) -> Result<Option<u32>> {
		let cached = {
			let cache = self.cache.lock().expect("Lock acquired");
			cache.loaded.then_some(cache.max_number)
		};
		match cached {
			Some(max_number) => Ok(max_number),
			None => self.refresh_max_number().await,
		}
	}

	async fn refresh_max_number(&self) -> Result<Option<u32>> {
		let recovered = self.recover_max_number().await?;
		let mut cache = self.cache.lock().expect("Lock acquired");
		// concurrent writes may have advanced the cache meanwhile
		cache.max_number = if cache.loaded {
			cache.max_number.max(recovered)
		} else {
			recovered
		};
		cache.loaded = true;
		Ok(cache.max_number)
	}

	/// Rebuilds the max height from the directory layout.
	///
	/// The highest shard directory is inspected and its highest file name is the max height.
	/// An empty shard directory yields the last height of the previous shard.
	pub async fn recover_max_number(&self) -> Result<Option<u32>> {
		let shards = list_numeric_entries(&self.blocks_dir(), |name| name.to_string()).await?;
		let Some(shard) = shards.into_iter().max() else {
			return Ok(None);
		};
		if shard == 0 || shard % SHARD_SIZE != 0 {
			return Err(Error::StorageCorruption(format!(
				"Unexpected block shard directory {shard}"
			)));
		}

		let shard_dir = self.blocks_dir().join(shard.to_string());
		let numbers = list_numeric_entries(&shard_dir, |name| {
			name.strip_suffix(".json").unwrap_or(name).to_string()
		})
		.await?;

		let Some(max_number) = numbers.into_iter().max() else {
			debug!(shard, "Empty block shard directory");
			return Ok(shard.checked_sub(SHARD_SIZE + 1));
		};
		if shard_of(max_number) != shard {
			return Err(Error::StorageCorruption(format!(
				"Block {max_number} stored in shard {shard}"
			)));
		}
		Ok(Some(max_number))
	}

	/// Removes every block of this store.
	pub async fn remove_home(&self) -> Result<()> {
		self.queue.remove_dir_all(&self.root).await?;
		let mut cache = self.cache.lock().expect("Lock acquired");
		*cache = MaxNumberCache {
			loaded: true,
			max_number: None,
		};
		Ok(())
	}
}

/// Lists directory entries as numbers, skipping staging files.
///
/// A missing directory has no entries, a non numeric entry is a corruption.
async fn list_numeric_entries(dir: &Path, stem: impl Fn(&str) -> String) -> Result<Vec<u32>> {
	let mut entries = match fs::read_dir(dir).await {
		Ok(entries) => entries,
		Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
		Err(error) => return Err(error.into()),
	};

	let mut numbers = vec![];
	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name().to_string_lossy().into_owned();
		if is_staging_file(&name) {
			continue;
		}
		let number = stem(&name).parse::<u32>().map_err(|_| {
			Error::StorageCorruption(format!("Unexpected entry {name} in {}", dir.display()))
		})?;
		numbers.push(number);
	}
	Ok(numbers)
}

//! Local chain state: the main block store, its derived indicators and the fork cores.
use crate::{
	block_store::BlockStore,
	data::{CoresKey, Database, IndicatorsKey, WriteQueue},
	error::{Error, Result},
	types::Block,
};
use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CORES_DIR: &str = "cores";

/// State derived from the persisted blocks, advanced on each saved block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Indicators {
	pub current_number: Option<u32>,
	pub last_saved_block_file: Option<u32>,
	#[serde(rename = "lastUDBlock")]
	pub last_ud_block: Option<u32>,
	pub last_block_of_issuer: HashMap<String, u32>,
	pub current_membership_excluding_block: Option<u32>,
}

impl Indicators {
	fn advance(&mut self, block: &Block) {
		self.current_number = self.current_number.max(Some(block.number));
		self.last_saved_block_file = self.last_saved_block_file.max(Some(block.number));
		if block.dividend.is_some() {
			self.last_ud_block = Some(block.number);
		}
		if !block.issuer.is_empty() {
			self.last_block_of_issuer
				.insert(block.issuer.clone(), block.number);
		}
	}
}

/// Fork branch rooted at the first block diverging from the main chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Core {
	pub fork_point_number: u32,
	pub fork_point_hash: String,
	#[serde(default)]
	pub fork_point_previous_hash: Option<String>,
}

impl Core {
	pub fn from_block(block: &Block) -> Self {
		Core {
			fork_point_number: block.number,
			fork_point_hash: block.hash.clone(),
			fork_point_previous_hash: block.previous_hash.clone(),
		}
	}

	pub fn name(&self) -> String {
		format!("{}-{}", self.fork_point_number, self.fork_point_hash)
	}

	fn same_fork_point(&self, other: &Core) -> bool {
		self.fork_point_number == other.fork_point_number
			&& self.fork_point_hash == other.fork_point_hash
	}
}

/// Read access to the locally known main chain blocks.
#[automock]
#[async_trait]
pub trait BlockIndex: Send + Sync {
	async fn current_block(&self) -> Result<Option<Block>>;

	/// Returns the main chain block with the given number, if its hash matches.
	async fn block_by_number_and_hash(&self, number: u32, hash: &str) -> Result<Option<Block>>;
}

pub struct Ledger<D> {
	db: D,
	root: PathBuf,
	queue: WriteQueue,
	blocks: BlockStore,
	ms_validity: u64,
	// also serializes the block saves
	indicators: Mutex<Indicators>,
	cores: Mutex<Vec<Core>>,
}

impl<D: Database + Send + Sync> Ledger<D> {
	/// Opens the ledger stored under `root`.
	///
	/// Blocks persisted after the last indicators update are replayed onto the indicators.
	pub async fn open(
		root: impl AsRef<Path>,
		db: D,
		queue: WriteQueue,
		ms_validity: u64,
	) -> Result<Self> {
		let root = root.as_ref().to_path_buf();
		let blocks = BlockStore::new(&root, queue.clone());
		let indicators = db.get(IndicatorsKey).await?.unwrap_or_default();
		let cores = db.get(CoresKey).await?.unwrap_or_default();

		let ledger = Ledger {
			db,
			root,
			queue,
			blocks,
			ms_validity,
			indicators: Mutex::new(indicators),
			cores: Mutex::new(cores),
		};
		ledger.recover_indicators().await?;
		Ok(ledger)
	}

	async fn recover_indicators(&self) -> Result<()> {
		let mut indicators = self.indicators.lock().await;
		let Some(max_number) = self.blocks.get_max_number().await? else {
			return Ok(());
		};
		let from = indicators.current_number.map_or(0, |number| number + 1);
		if from > max_number {
			return Ok(());
		}

		warn!(
			current_number = ?indicators.current_number,
			max_number, "Chain head lags behind stored blocks, replaying"
		);
		for number in from..=max_number {
			let block = self.blocks.read_block(number).await?;
			indicators.advance(&block);
			indicators.current_membership_excluding_block = self
				.membership_excluding_block(indicators.current_membership_excluding_block, &block)
				.await?;
		}
		self.db.put(IndicatorsKey, indicators.clone()).await
	}

	pub fn blocks(&self) -> &BlockStore {
		&self.blocks
	}

	pub async fn indicators(&self) -> Indicators {
		self.indicators.lock().await.clone()
	}

	pub async fn current_number(&self) -> Option<u32> {
		self.indicators.lock().await.current_number
	}

	pub async fn get_block(&self, number: u32) -> Result<Block> {
		self.blocks.read_block(number).await
	}

	pub async fn has_block(&self, number: u32) -> Result<bool> {
		self.blocks.has_block(number).await
	}

	pub async fn get_block_by_number_and_hash(&self, number: u32, hash: &str) -> Result<Block> {
		self.blocks.read_block_by_number_and_hash(number, hash).await
	}

	pub async fn last_ud_block(&self) -> Result<Option<Block>> {
		let number = self.indicators.lock().await.last_ud_block;
		self.read_optional(number).await
	}

	pub async fn last_block_of_issuer(&self, issuer: &str) -> Result<Option<Block>> {
		let number = self
			.indicators
			.lock()
			.await
			.last_block_of_issuer
			.get(issuer)
			.copied();
		self.read_optional(number).await
	}

	async fn read_optional(&self, number: Option<u32>) -> Result<Option<Block>> {
		match number {
			Some(number) => self.blocks.read_block(number).await.map(Some),
			None => Ok(None),
		}
	}

	/// Appends the block to the main chain and advances the indicators.
	pub async fn save_block(&self, block: &Block) -> Result<()> {
		let mut indicators = self.indicators.lock().await;
		let next_number = indicators.current_number.map_or(0, |number| number + 1);
		if block.number > next_number {
			return Err(Error::Conflict(format!(
				"Block {} does not follow the chain head {:?}",
				block.number, indicators.current_number
			)));
		}

		self.blocks.write_block(block).await?;
		indicators.advance(block);
		indicators.current_membership_excluding_block = self
			.membership_excluding_block(indicators.current_membership_excluding_block, block)
			.await?;
		self.db.put(IndicatorsKey, indicators.clone()).await?;

		debug!(block_number = block.number, block_hash = block.hash, "Block saved");
		Ok(())
	}

	/// Highest block whose memberships have expired as of `current`.
	///
	/// Moves forward from `excluding` while blocks are older than the membership validity.
	async fn membership_excluding_block(
		&self,
		excluding: Option<u32>,
		current: &Block,
	) -> Result<Option<u32>> {
		if current.number == 0 {
			return Ok(None);
		}
		let Some(limit) = current.median_time.checked_sub(self.ms_validity) else {
			return Ok(excluding);
		};

		let mut result = excluding;
		for number in excluding.unwrap_or(0)..=current.number {
			let median_time = if number == current.number {
				current.median_time
			} else {
				self.blocks.read_block(number).await?.median_time
			};
			if median_time > limit {
				break;
			}
			result = Some(number);
		}
		Ok(result)
	}

	pub async fn cores(&self) -> Vec<Core> {
		self.cores.lock().await.clone()
	}

	/// Block store holding the blocks of the given fork core.
	pub fn load_core(&self, core: &Core) -> BlockStore {
		BlockStore::new(
			self.root.join(CORES_DIR).join(core.name()),
			self.queue.clone(),
		)
	}

	/// Registers a new fork core starting at `block`.
	pub async fn fork(&self, block: &Block) -> Result<BlockStore> {
		let core = Core::from_block(block);
		let mut cores = self.cores.lock().await;
		if cores.iter().any(|existing| existing.same_fork_point(&core)) {
			return Err(Error::Conflict(format!("Fork {} already exists", core.name())));
		}
		cores.push(core.clone());
		self.db.put(CoresKey, cores.clone()).await?;

		info!(fork_point = core.name(), "Fork core created");
		Ok(self.load_core(&core))
	}

	/// Discards the fork core along with its blocks.
	pub async fn unfork(&self, core: &Core) -> Result<()> {
		let mut cores = self.cores.lock().await;
		cores.retain(|existing| !existing.same_fork_point(core));
		self.db.put(CoresKey, cores.clone()).await?;
		self.load_core(core).remove_home().await?;

		info!(fork_point = core.name(), "Fork core removed");
		Ok(())
	}

	pub async fn core_head(&self, core: &Core) -> Result<Option<Block>> {
		let store = self.load_core(core);
		match store.get_max_number().await? {
			Some(number) => store.read_block(number).await.map(Some),
			None => Ok(None),
		}
	}

	/// Stores a block diverging from the main chain.
	///
	/// The block either extends the head of an existing core, or branches off a main chain
	/// block and starts a new core. Returns `false` when it connects to neither.
	pub async fn save_fork_block(&self, block: &Block) -> Result<bool> {
		for core in self.cores().await {
			let store = self.load_core(&core);
			if store
				.read_block_by_number_and_hash(block.number, &block.hash)
				.await
				.is_ok()
			{
				return Ok(true);
			}
			let Some(head) = self.core_head(&core).await? else {
				continue;
			};
			if block.extends(&head) {
				store.write_block(block).await?;
				debug!(block_number = block.number, fork_point = core.name(), "Fork extended");
				return Ok(true);
			}
		}

		let (Some(parent_number), Some(previous_hash)) =
			(block.number.checked_sub(1), block.previous_hash.as_deref())
		else {
			return Ok(false);
		};
		match self
			.blocks
			.read_block_by_number_and_hash(parent_number, previous_hash)
			.await
		{
			Ok(_) => {
				let store = self.fork(block).await?;
				store.write_block(block).await?;
				Ok(true)
			},
			Err(Error::NotFound(_)) => Ok(false),
			Err(error) => Err(error),
		}
	}

	/// Discards every core whose head does not exceed the main chain head.
	pub async fn remove_forks(&self) -> Result<usize> {
		let Some(current_number) = self.current_number().await else {
			return Ok(0);
		};
		let mut removed = 0;
		for core in self.cores().await {
			let head_number = self
				.core_head(&core)
				.await?
				.map_or(core.fork_point_number, |head| head.number);
			if head_number <= current_number {
				self.unfork(&core).await?;
				removed += 1;
			}
		}
		Ok(removed)
	}
}

#[async_trait]
impl<D: Database + Send + Sync> BlockIndex for Ledger<D> {
	async fn current_block(&self) -> Result<Option<Block>> {
		let number = self.current_number().await;
		self.read_optional(number).await
	}

	async fn block_by_number_and_hash(&self, number: u32, hash: &str) -> Result<Option<Block>> {
		match self.get_block_by_number_and_hash(number, hash).await {
			Ok(block) => Ok(Some(block)),
			Err(Error::NotFound(_)) => Ok(None),
			Err(error) => Err(error),
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::data::MemoryDB;

	pub(crate) fn chain_block(number: u32, hash: &str, previous_hash: Option<&str>) -> Block {
		Block {
			number,
			hash: hash.to_string(),
			previous_hash: previous_hash.map(str::to_string),
			median_time: 1_000 + number as u64 * 100,
			issuer: "ISSUER".to_string(),
			transactions: vec![],
			dividend: None,
		}
	}

	/// Blocks `0..count` hashed `H0`, `H1`...
	pub(crate) fn main_chain(count: u32) -> Vec<Block> {
		(0..count)
			.map(|number| {
				let previous = number.checked_sub(1).map(|previous| format!("H{previous}"));
				chain_block(number, &format!("H{number}"), previous.as_deref())
			})
			.collect()
	}

	async fn open(dir: &tempfile::TempDir, db: MemoryDB) -> Ledger<MemoryDB> {
		Ledger::open(dir.path(), db, WriteQueue::new(), 250)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn save_block_advances_indicators() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = open(&dir, MemoryDB::default()).await;
		let mut blocks = main_chain(3);
		blocks[1].dividend = Some(100);
		blocks[2].issuer = "OTHER".to_string();

		for block in &blocks {
			ledger.save_block(block).await.unwrap();
		}

		let indicators = ledger.indicators().await;
		assert_eq!(indicators.current_number, Some(2));
		assert_eq!(indicators.last_saved_block_file, Some(2));
		assert_eq!(indicators.last_ud_block, Some(1));
		assert_eq!(indicators.last_block_of_issuer.get("ISSUER"), Some(&1));
		assert_eq!(indicators.last_block_of_issuer.get("OTHER"), Some(&2));
		assert_eq!(ledger.current_block().await.unwrap().unwrap().hash, "H2");
		assert_eq!(ledger.last_ud_block().await.unwrap().unwrap().number, 1);
	}

	#[tokio::test]
	async fn save_block_rejects_gaps() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = open(&dir, MemoryDB::default()).await;
		let blocks = main_chain(3);

		ledger.save_block(&blocks[0]).await.unwrap();
		let result = ledger.save_block(&blocks[2]).await;

		assert!(matches!(result, Err(Error::Conflict(_))));
		assert_eq!(ledger.current_number().await, Some(0));
	}

	#[tokio::test]
	async fn lagging_head_is_recovered_on_open() {
		let dir = tempfile::tempdir().unwrap();
		let db = MemoryDB::default();
		let blocks = main_chain(3);
		{
			let ledger = open(&dir, db.clone()).await;
			ledger.save_block(&blocks[0]).await.unwrap();
			// block file written, indicators never updated
			ledger.blocks().write_block(&blocks[1]).await.unwrap();
		}

		let ledger = open(&dir, db).await;
		assert_eq!(ledger.current_number().await, Some(1));
		ledger.save_block(&blocks[2]).await.unwrap();
	}

	#[tokio::test]
	async fn membership_excluding_block_advances() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = open(&dir, MemoryDB::default()).await;

		for block in &main_chain(6) {
			ledger.save_block(block).await.unwrap();
		}

		// 250 seconds validity with 100 seconds between blocks
		let indicators = ledger.indicators().await;
		assert_eq!(indicators.current_membership_excluding_block, Some(2));
	}

	#[tokio::test]
	async fn duplicate_fork_is_conflict() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = open(&dir, MemoryDB::default()).await;
		let fork_block = chain_block(1, "F1", Some("H0"));

		ledger.fork(&fork_block).await.unwrap();
		let result = ledger.fork(&fork_block).await;

		assert!(matches!(result, Err(Error::Conflict(_))));
		assert_eq!(ledger.cores().await.len(), 1);
	}

	#[tokio::test]
	async fn fork_blocks_are_stored_in_cores() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = open(&dir, MemoryDB::default()).await;
		for block in &main_chain(2) {
			ledger.save_block(block).await.unwrap();
		}

		let fork_1 = chain_block(1, "F1", Some("H0"));
		let fork_2 = chain_block(2, "F2", Some("F1"));
		let orphan = chain_block(5, "X5", Some("X4"));

		assert!(ledger.save_fork_block(&fork_1).await.unwrap());
		assert!(ledger.save_fork_block(&fork_2).await.unwrap());
		assert!(!ledger.save_fork_block(&orphan).await.unwrap());

		let cores = ledger.cores().await;
		assert_eq!(cores, vec![Core::from_block(&fork_1)]);
		assert!(dir
			.path()
			.join("cores/1-F1/blocks/500/0000000002.json")
			.exists());
		let head = ledger.core_head(&cores[0]).await.unwrap().unwrap();
		assert_eq!(head.hash, "F2");
	}

	#[tokio::test]
	async fn remove_forks_discards_outgrown_cores() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = open(&dir, MemoryDB::default()).await;
		let blocks = main_chain(4);
		for block in &blocks[..2] {
			ledger.save_block(block).await.unwrap();
		}
		ledger
			.save_fork_block(&chain_block(1, "F1", Some("H0")))
			.await
			.unwrap();
		ledger
			.save_fork_block(&chain_block(2, "F2", Some("F1")))
			.await
			.unwrap();

		assert_eq!(ledger.remove_forks().await.unwrap(), 0);

		ledger.save_block(&blocks[2]).await.unwrap();
		assert_eq!(ledger.remove_forks().await.unwrap(), 1);
		assert!(ledger.cores().await.is_empty());
		assert!(!dir.path().join("cores/1-F1").exists());
	}

	#[tokio::test]
	async fn block_index_lookup() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = open(&dir, MemoryDB::default()).await;
		ledger.save_block(&main_chain(1)[0]).await.unwrap();

		assert!(ledger
			.block_by_number_and_hash(0, "H0")
			.await
			.unwrap()
			.is_some());
		assert!(ledger
			.block_by_number_and_hash(0, "OTHER")
			.await
			.unwrap()
			.is_none());
		assert!(ledger
			.block_by_number_and_hash(3, "H3")
			.await
			.unwrap()
			.is_none());
	}
}

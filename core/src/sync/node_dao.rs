use super::{BlockDao, BlockValidator, MembershipOracle, Verdict};
use crate::{
	data::Database,
	error::{Error, Result},
	ledger::{BlockIndex, Ledger},
	network::RemoteNode,
	peer::PeerRecord,
	types::Block,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Data access pulling from one connected peer into the local ledger.
pub struct NodeDao<D> {
	ledger: Arc<Ledger<D>>,
	node: Arc<dyn RemoteNode>,
	peer: PeerRecord,
	validator: Arc<dyn BlockValidator>,
	membership: Arc<dyn MembershipOracle>,
}

impl<D> NodeDao<D> {
	pub fn new(
		ledger: Arc<Ledger<D>>,
		node: Arc<dyn RemoteNode>,
		peer: PeerRecord,
		validator: Arc<dyn BlockValidator>,
		membership: Arc<dyn MembershipOracle>,
	) -> Self {
		NodeDao {
			ledger,
			node,
			peer,
			validator,
			membership,
		}
	}
}

fn none_if_not_found(result: Result<Block>) -> Result<Option<Block>> {
	match result {
		Ok(block) => Ok(Some(block)),
		Err(Error::NotFound(_)) => Ok(None),
		Err(error) => Err(error),
	}
}

#[async_trait]
impl<D: Database + Send + Sync + 'static> BlockDao for NodeDao<D> {
	async fn local_current(&self) -> Result<Option<Block>> {
		self.ledger.current_block().await
	}

	async fn remote_current(&self, _peer: &PeerRecord) -> Result<Option<Block>> {
		none_if_not_found(self.node.get_current_block().await)
	}

	async fn remote_peers(&self) -> Result<Vec<PeerRecord>> {
		Ok(vec![self.peer.clone()])
	}

	async fn get_local_block(&self, number: u32) -> Result<Option<Block>> {
		none_if_not_found(self.ledger.get_block(number).await)
	}

	async fn get_remote_block(&self, _peer: &PeerRecord, number: u32) -> Result<Option<Block>> {
		none_if_not_found(self.node.get_block(number).await)
	}

	async fn apply_main_branch(&self, block: Block) -> Result<bool> {
		let head = self.ledger.current_block().await?;
		match self.validator.verdict(&block, head.as_ref()) {
			Verdict::MainBranch => {
				self.ledger.save_block(&block).await?;
				Ok(true)
			},
			Verdict::Fork => self.ledger.save_fork_block(&block).await,
			Verdict::Rejected => {
				debug!(block_number = block.number, block_hash = block.hash, "Block rejected by validator");
				Ok(false)
			},
		}
	}

	async fn remove_forks(&self) -> Result<()> {
		let removed = self.ledger.remove_forks().await?;
		if removed > 0 {
			debug!(removed, "Fork cores removed");
		}
		Ok(())
	}

	async fn is_member_peer(&self, peer: &PeerRecord) -> Result<bool> {
		self.membership.is_member(peer.pubkey()).await
	}

	async fn download_blocks(
		&self,
		_peer: &PeerRecord,
		from_number: u32,
		count: u32,
	) -> Result<Vec<Block>> {
		self.node.get_blocks_range(from_number, count).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		data::{MemoryDB, WriteQueue},
		ledger::tests::{chain_block, main_chain},
		network::MockRemoteNode,
		peer::tests::document,
		sync::{pull, ChainLinkValidator, MockMembershipOracle},
		types::SyncConfig,
	};
	use tokio_util::sync::CancellationToken;

	async fn ledger(dir: &tempfile::TempDir, local: &[Block]) -> Arc<Ledger<MemoryDB>> {
		let ledger = Ledger::open(dir.path(), MemoryDB::default(), WriteQueue::new(), 1_000_000)
			.await
			.unwrap();
		for block in local {
			ledger.save_block(block).await.unwrap();
		}
		Arc::new(ledger)
	}

	fn node(blocks: Vec<Block>) -> Arc<dyn RemoteNode> {
		let mut node = MockRemoteNode::new();
		let head = blocks.last().cloned();
		node.expect_get_current_block()
			.returning(move || head.clone().ok_or(Error::NotFound("current".to_string())));
		let served = blocks.clone();
		node.expect_get_block().returning(move |number| {
			served
				.get(number as usize)
				.cloned()
				.ok_or(Error::NotFound(format!("Block {number}")))
		});
		node.expect_get_blocks_range()
			.returning(move |from, count| {
				Ok(blocks
					.iter()
					.skip(from as usize)
					.take(count as usize)
					.cloned()
					.collect())
			});
		Arc::new(node)
	}

	fn membership(member: bool) -> Arc<dyn MembershipOracle> {
		let mut membership = MockMembershipOracle::new();
		membership.expect_is_member().returning(move |_| Ok(member));
		Arc::new(membership)
	}

	fn dao(
		ledger: Arc<Ledger<MemoryDB>>,
		remote: Vec<Block>,
		member: bool,
	) -> NodeDao<MemoryDB> {
		NodeDao::new(
			ledger,
			node(remote),
			PeerRecord::new(document("P", 1, &[]), 0),
			Arc::new(ChainLinkValidator),
			membership(member),
		)
	}

	#[tokio::test]
	async fn remote_lookups_map_not_found_to_none() {
		let dir = tempfile::tempdir().unwrap();
		let dao = dao(ledger(&dir, &main_chain(1)).await, main_chain(3), false);
		let peer = dao.peer.clone();

		assert!(dao.get_remote_block(&peer, 2).await.unwrap().is_some());
		assert!(dao.get_remote_block(&peer, 7).await.unwrap().is_none());
		assert!(dao.get_local_block(2).await.unwrap().is_none());
		assert_eq!(dao.remote_current(&peer).await.unwrap().unwrap().number, 2);
	}

	#[tokio::test]
	async fn validator_verdicts_are_applied() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = ledger(&dir, &main_chain(2)).await;
		let dao = dao(ledger.clone(), vec![], false);

		assert!(dao.apply_main_branch(chain_block(2, "H2", Some("H1"))).await.unwrap());
		assert_eq!(ledger.current_number().await, Some(2));

		assert!(dao.apply_main_branch(chain_block(2, "F2", Some("H1"))).await.unwrap());
		assert_eq!(ledger.cores().await.len(), 1);
		assert_eq!(ledger.current_number().await, Some(2));

		assert!(!dao.apply_main_branch(chain_block(0, "X0", None)).await.unwrap());
	}

	#[tokio::test]
	async fn fork_of_member_peer_is_stored_and_kept_while_longer() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = ledger(&dir, &main_chain(4)).await;
		let mut remote = main_chain(2);
		remote.push(chain_block(2, "F2", Some("H1")));
		remote.push(chain_block(3, "F3", Some("F2")));
		remote.push(chain_block(4, "F4", Some("F3")));
		let dao = dao(ledger.clone(), remote, true);
		let config = SyncConfig {
			fork_window: 5,
			..Default::default()
		};

		let report = pull(&config, &dao, &CancellationToken::new()).await.unwrap();

		assert_eq!(report.applied(), 3);
		assert_eq!(ledger.current_number().await, Some(3));
		let cores = ledger.cores().await;
		assert_eq!(cores.len(), 1);
		assert_eq!(cores[0].fork_point_hash, "F2");
		assert_eq!(ledger.core_head(&cores[0]).await.unwrap().unwrap().hash, "F4");
	}

	#[tokio::test]
	async fn shorter_forks_are_removed_after_the_pass() {
		let dir = tempfile::tempdir().unwrap();
		let ledger = ledger(&dir, &main_chain(2)).await;
		ledger
			.save_fork_block(&chain_block(1, "F1", Some("H0")))
			.await
			.unwrap();
		let dao = dao(ledger.clone(), main_chain(4), false);

		pull(&SyncConfig::default(), &dao, &CancellationToken::new())
			.await
			.unwrap();

		assert_eq!(ledger.current_number().await, Some(3));
		assert!(ledger.cores().await.is_empty());
	}
}

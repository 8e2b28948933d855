//! Breadth first discovery of peers through the known peers leaves of remote nodes.
use crate::{
	crypto::Verifier,
	data::Database,
	error::Result,
	network::{check_peer_validity, PeerTransport},
	peer::{PeerDocument, PeerRecord},
	peer_registry::PeerRegistry,
};
use futures::future::join_all;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrawlMode {
	/// Scheduled crawl, skipped when enough peers are known.
	Periodic,
	Manual,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrawlReport {
	pub discovered: usize,
	pub registered: usize,
}

pub struct PeerCrawler<D> {
	registry: Arc<PeerRegistry<D>>,
	transport: Arc<dyn PeerTransport>,
	verifier: Arc<dyn Verifier>,
	self_pubkey: String,
	enough_peers: usize,
}

impl<D: Database + Send + Sync> PeerCrawler<D> {
	pub fn new(
		registry: Arc<PeerRegistry<D>>,
		transport: Arc<dyn PeerTransport>,
		verifier: Arc<dyn Verifier>,
		self_pubkey: String,
		enough_peers: usize,
	) -> Self {
		PeerCrawler {
			registry,
			transport,
			verifier,
			self_pubkey,
			enough_peers,
		}
	}

	/// Runs one crawl pass and records the discovered peers.
	pub async fn crawl(&self, mode: CrawlMode) -> Result<CrawlReport> {
		let mut frontier = self
			.registry
			.find_peers_excluding(&[self.self_pubkey.clone()]);
		if mode == CrawlMode::Periodic && frontier.len() > self.enough_peers {
			debug!(up_peers = frontier.len(), "Enough peers known, crawl skipped");
			return Ok(CrawlReport::default());
		}

		let mut visited = frontier
			.iter()
			.map(|peer| peer.pubkey().to_string())
			.collect::<HashSet<_>>();
		visited.insert(self.self_pubkey.clone());

		let mut discovered = vec![];
		while !frontier.is_empty() {
			debug!(frontier = frontier.len(), "Crawling peers");
			let leaves = join_all(frontier.iter().map(|peer| self.crawl_peer(peer))).await;

			let mut next_frontier = vec![];
			for document in leaves.into_iter().flatten() {
				if document.currency.is_empty() || !visited.insert(document.pubkey.clone()) {
					continue;
				}
				next_frontier.push(PeerRecord::new(document.clone(), 0));
				discovered.push(document);
			}
			frontier = next_frontier;
		}
		info!(discovered = discovered.len(), "Crawling done");

		let mut report = CrawlReport {
			discovered: discovered.len(),
			registered: 0,
		};
		for document in discovered {
			let pubkey = document.pubkey.clone();
			match self.registry.submit_peer(document, false, true).await {
				Ok(_) => report.registered += 1,
				Err(error) => debug!(pubkey, %error, "Discovered peer not recorded"),
			}
		}
		Ok(report)
	}

	/// Leaves gathered from the peer, until the first failure.
	async fn crawl_peer(&self, peer: &PeerRecord) -> Vec<PeerDocument> {
		let mut leaves = vec![];
		if let Err(error) = self.fetch_leaves(peer, &mut leaves).await {
			debug!(pubkey = peer.pubkey(), %error, "Crawl of peer interrupted");
		}
		leaves
	}

	async fn fetch_leaves(&self, peer: &PeerRecord, leaves: &mut Vec<PeerDocument>) -> Result<()> {
		let node = self.transport.connect(peer).await?;
		check_peer_validity(self.verifier.as_ref(), peer, node.as_ref()).await?;
		for hash in node.list_peer_leaves().await? {
			leaves.push(node.get_peer_leaf(&hash).await?);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		data::MemoryDB,
		error::Error,
		network::{MockPeerTransport, MockRemoteNode, RemoteNode},
		peer::tests::document,
		peer_registry::tests::{registry, verifier},
	};
	use std::collections::HashMap;

	/// Transport where each pubkey reports the given leaves, and unknown pubkeys are unreachable.
	fn transport(network: HashMap<&'static str, Vec<&'static str>>) -> MockPeerTransport {
		let mut transport = MockPeerTransport::new();
		transport.expect_connect().returning(move |peer| {
			let pubkey = peer.pubkey().to_string();
			let Some(leaves) = network.get(pubkey.as_str()).cloned() else {
				return Err(Error::ConnectionError(pubkey));
			};
			let mut node = MockRemoteNode::new();
			let self_pubkey = pubkey.clone();
			node.expect_get_self_peering()
				.returning(move || Ok(document(&self_pubkey, 1, &[])));
			node.expect_list_peer_leaves().returning(move || {
				Ok(leaves.iter().map(|leaf| format!("HASH_{leaf}")).collect())
			});
			node.expect_get_peer_leaf().returning(|hash| {
				let pubkey = hash.trim_start_matches("HASH_");
				Ok(document(pubkey, 1, &[]))
			});
			Ok(Arc::new(node) as Arc<dyn RemoteNode>)
		});
		transport
	}

	async fn crawler(
		seeds: &[&str],
		transport: MockPeerTransport,
		enough_peers: usize,
	) -> PeerCrawler<MemoryDB> {
		let registry = Arc::new(registry(10).await);
		for seed in seeds {
			registry
				.submit_peer(document(seed, 1, &[]), false, true)
				.await
				.unwrap();
		}
		PeerCrawler::new(
			registry,
			Arc::new(transport),
			verifier(true),
			"SELF".to_string(),
			enough_peers,
		)
	}

	#[tokio::test]
	async fn peer_reported_twice_is_registered_once() {
		let network = HashMap::from([("A", vec!["X"]), ("B", vec!["X"]), ("X", vec![])]);
		let crawler = crawler(&["A", "B"], transport(network), 4).await;

		let report = crawler.crawl(CrawlMode::Manual).await.unwrap();

		assert_eq!(report, CrawlReport { discovered: 1, registered: 1 });
		assert_eq!(crawler.registry.list_peers().len(), 3);
		assert!(crawler.registry.get_peer("X").unwrap().is_up());
	}

	#[tokio::test]
	async fn crawl_follows_leaves_breadth_first() {
		let network = HashMap::from([
			("A", vec!["B", "SELF"]),
			("B", vec!["C"]),
			("C", vec!["A", "D"]),
		]);
		let crawler = crawler(&["A"], transport(network), 4).await;

		let report = crawler.crawl(CrawlMode::Manual).await.unwrap();

		// D is unreachable, which does not prevent its registration
		assert_eq!(report, CrawlReport { discovered: 3, registered: 3 });
		let mut pubkeys = crawler
			.registry
			.list_peers()
			.into_iter()
			.map(|peer| peer.document.pubkey)
			.collect::<Vec<_>>();
		pubkeys.sort();
		assert_eq!(pubkeys, vec!["A", "B", "C", "D"]);
	}

	#[tokio::test]
	async fn periodic_crawl_is_skipped_with_enough_peers() {
		let mut transport = MockPeerTransport::new();
		transport.expect_connect().never();
		let crawler = crawler(&["A", "B", "C"], transport, 2).await;

		let report = crawler.crawl(CrawlMode::Periodic).await.unwrap();
		assert_eq!(report, CrawlReport::default());
	}

	#[tokio::test]
	async fn manual_crawl_ignores_enough_peers() {
		let network = HashMap::from([("A", vec!["X"]), ("B", vec![]), ("C", vec![])]);
		let crawler = crawler(&["A", "B", "C"], transport(network), 2).await;

		let report = crawler.crawl(CrawlMode::Manual).await.unwrap();
		assert_eq!(report.registered, 1);
	}

	#[tokio::test]
	async fn unknown_anchor_leaves_are_skipped() {
		let mut transport = MockPeerTransport::new();
		transport.expect_connect().returning(|peer| {
			let pubkey = peer.pubkey().to_string();
			let mut node = MockRemoteNode::new();
			node.expect_get_self_peering()
				.returning(move || Ok(document(&pubkey, 1, &[])));
			node.expect_list_peer_leaves()
				.returning(|| Ok(vec!["FAR".to_string()]));
			// anchored on a block above the local head
			node.expect_get_peer_leaf()
				.returning(|_| Ok(document("FAR", 50, &[])));
			Ok(Arc::new(node) as Arc<dyn RemoteNode>)
		});
		let crawler = crawler(&["A"], transport, 4).await;

		let report = crawler.crawl(CrawlMode::Manual).await.unwrap();
		assert_eq!(report, CrawlReport { discovered: 1, registered: 0 });
		assert!(crawler.registry.get_peer("FAR").is_err());
	}
}

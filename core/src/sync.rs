//! Block pulling from the UP peers.
//!
//! The pulling algorithm in [`pull`] only relies on the [`BlockDao`] operations, and is
//! independent from the storage and the transport. [`SyncEngine`] runs it against each
//! selected peer through a [`NodeDao`].
use crate::{
	crypto::Verifier,
	data::Database,
	error::{Error, Result},
	ledger::Ledger,
	network::{check_peer_validity, PeerTransport},
	peer::PeerRecord,
	peer_registry::PeerRegistry,
	types::{Block, SyncConfig},
};
use async_trait::async_trait;
use mockall::automock;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod node_dao;
pub use node_dao::NodeDao;

mod validation;
pub use validation::*;

/// Local and remote data access needed to pull blocks.
#[automock]
#[async_trait]
pub trait BlockDao: Send + Sync {
	async fn local_current(&self) -> Result<Option<Block>>;

	async fn remote_current(&self, peer: &PeerRecord) -> Result<Option<Block>>;

	async fn remote_peers(&self) -> Result<Vec<PeerRecord>>;

	async fn get_local_block(&self, number: u32) -> Result<Option<Block>>;

	async fn get_remote_block(&self, peer: &PeerRecord, number: u32) -> Result<Option<Block>>;

	/// Applies the block, returning `false` if it is rejected.
	async fn apply_main_branch(&self, block: Block) -> Result<bool>;

	async fn remove_forks(&self) -> Result<()>;

	async fn is_member_peer(&self, peer: &PeerRecord) -> Result<bool>;

	async fn download_blocks(
		&self,
		peer: &PeerRecord,
		from_number: u32,
		count: u32,
	) -> Result<Vec<Block>>;
}

/// Result of pulling blocks from one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerOutcome {
	/// No local chain to extend.
	NoLocalChain,
	UpToDate,
	/// Blocks applied up to the peer head.
	Pulled { applied: u32 },
	/// Pulling stopped at the first rejected block.
	Rejected { applied: u32, number: u32 },
	/// The peer chain diverges and cannot be followed.
	Diverged,
	/// The peer had nothing newer to serve.
	NothingNewer,
	Unreachable(String),
	Failed(String),
	Cancelled { applied: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullReport {
	pub outcomes: Vec<(String, PeerOutcome)>,
	pub cancelled: bool,
}

impl PullReport {
	pub fn applied(&self) -> u32 {
		self.outcomes
			.iter()
			.map(|(_, outcome)| match outcome {
				PeerOutcome::Pulled { applied }
				| PeerOutcome::Rejected { applied, .. }
				| PeerOutcome::Cancelled { applied } => *applied,
				_ => 0,
			})
			.sum()
	}

	pub fn unreachable(&self) -> impl Iterator<Item = &str> {
		self.outcomes.iter().filter_map(|(pubkey, outcome)| {
			matches!(outcome, PeerOutcome::Unreachable(_)).then_some(pubkey.as_str())
		})
	}

	fn extend(&mut self, other: PullReport) {
		self.outcomes.extend(other.outcomes);
		self.cancelled |= other.cancelled;
	}
}

/// State of one pull from one peer.
struct SyncSession<'a> {
	peer: &'a PeerRecord,
	cancel: &'a CancellationToken,
	last_applied: Option<u32>,
	applied: u32,
}

impl<'a> SyncSession<'a> {
	fn new(peer: &'a PeerRecord, cancel: &'a CancellationToken) -> Self {
		SyncSession {
			peer,
			cancel,
			last_applied: None,
			applied: 0,
		}
	}

	fn record_applied(&mut self, number: u32) {
		self.last_applied = Some(number);
		self.applied += 1;
	}
}

/// Pulls the missing blocks from every peer of `dao`.
///
/// Failures of one peer never abort the pass. Cancellation is observed between peers and
/// between downloaded batches.
pub async fn pull(
	config: &SyncConfig,
	dao: &dyn BlockDao,
	cancel: &CancellationToken,
) -> Result<PullReport> {
	let mut report = PullReport::default();
	for peer in dao.remote_peers().await? {
		if cancel.is_cancelled() {
			report.cancelled = true;
			break;
		}
		let pubkey = peer.pubkey().to_string();
		let outcome = match pull_peer(config, dao, &peer, cancel).await {
			Ok(outcome) => outcome,
			Err(Error::ConnectionError(reason)) => {
				debug!(pubkey, reason, "Peer unreachable while pulling blocks");
				PeerOutcome::Unreachable(reason)
			},
			Err(Error::NotFound(_)) => PeerOutcome::NothingNewer,
			Err(error) => {
				warn!(pubkey, %error, "Block pulling from peer failed");
				PeerOutcome::Failed(error.to_string())
			},
		};
		if matches!(outcome, PeerOutcome::Cancelled { .. }) {
			report.cancelled = true;
		}
		report.outcomes.push((pubkey, outcome));
		if report.cancelled {
			break;
		}
	}

	if let Err(error) = dao.remove_forks().await {
		warn!(%error, "Cannot remove fork cores");
	}
	Ok(report)
}

async fn pull_peer(
	config: &SyncConfig,
	dao: &dyn BlockDao,
	peer: &PeerRecord,
	cancel: &CancellationToken,
) -> Result<PeerOutcome> {
	let Some(local) = dao.local_current().await? else {
		return Ok(PeerOutcome::NoLocalChain);
	};
	let Some(remote) = dao.remote_current(peer).await? else {
		return Ok(PeerOutcome::NothingNewer);
	};
	if remote.number <= local.number {
		return Ok(PeerOutcome::UpToDate);
	}

	let from_number = match dao.get_remote_block(peer, local.number).await? {
		None => return Ok(PeerOutcome::NothingNewer),
		Some(block) if block.hash == local.hash => local.number + 1,
		Some(_) if dao.is_member_peer(peer).await? => {
			match find_common_block(config.fork_window, dao, peer, local.number).await? {
				Some(common) => {
					info!(pubkey = peer.pubkey(), common, "Following diverging member peer");
					common + 1
				},
				None => return Ok(PeerOutcome::Diverged),
			}
		},
		Some(_) => {
			debug!(pubkey = peer.pubkey(), "Peer diverges from local chain");
			return Ok(PeerOutcome::Diverged);
		},
	};

	let mut session = SyncSession::new(peer, cancel);
	let mut next_number = from_number;
	while next_number <= remote.number {
		if session.cancel.is_cancelled() {
			return Ok(PeerOutcome::Cancelled {
				applied: session.applied,
			});
		}
		let count = config.download_batch_size.min(remote.number - next_number + 1);
		let blocks = match dao.download_blocks(session.peer, next_number, count).await {
			Ok(blocks) => blocks,
			Err(Error::NotFound(_)) if session.applied == 0 => {
				return Ok(PeerOutcome::NothingNewer)
			},
			Err(Error::NotFound(_)) => break,
			Err(error) => return Err(error),
		};
		if blocks.is_empty() {
			break;
		}
		for block in blocks {
			let number = block.number;
			if number != next_number {
				debug!(
					pubkey = peer.pubkey(),
					block_number = number,
					expected = next_number,
					"Block out of sequence"
				);
				return Ok(PeerOutcome::Rejected {
					applied: session.applied,
					number,
				});
			}
			if !dao.apply_main_branch(block).await? {
				debug!(pubkey = peer.pubkey(), block_number = number, "Block rejected");
				return Ok(PeerOutcome::Rejected {
					applied: session.applied,
					number,
				});
			}
			session.record_applied(number);
			next_number = number + 1;
		}
	}

	debug!(
		pubkey = peer.pubkey(),
		last_applied = ?session.last_applied,
		"Blocks pulled"
	);
	Ok(PeerOutcome::Pulled {
		applied: session.applied,
	})
}

/// Highest block at most `fork_window` below `local_number` that both chains share.
async fn find_common_block(
	fork_window: u32,
	dao: &dyn BlockDao,
	peer: &PeerRecord,
	local_number: u32,
) -> Result<Option<u32>> {
	for depth in 1..=fork_window {
		let Some(number) = local_number.checked_sub(depth) else {
			break;
		};
		let (Some(local), Some(remote)) = (
			dao.get_local_block(number).await?,
			dao.get_remote_block(peer, number).await?,
		) else {
			return Ok(None);
		};
		if local.hash == remote.hash {
			return Ok(Some(number));
		}
	}
	Ok(None)
}

pub struct SyncEngine<D> {
	ledger: Arc<Ledger<D>>,
	registry: Arc<PeerRegistry<D>>,
	transport: Arc<dyn PeerTransport>,
	verifier: Arc<dyn Verifier>,
	validator: Arc<dyn BlockValidator>,
	membership: Arc<dyn MembershipOracle>,
	config: SyncConfig,
	self_pubkey: String,
	// held while a pass runs
	in_flight: tokio::sync::Mutex<()>,
}

impl<D: Database + Send + Sync + 'static> SyncEngine<D> {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		ledger: Arc<Ledger<D>>,
		registry: Arc<PeerRegistry<D>>,
		transport: Arc<dyn PeerTransport>,
		verifier: Arc<dyn Verifier>,
		validator: Arc<dyn BlockValidator>,
		membership: Arc<dyn MembershipOracle>,
		config: SyncConfig,
		self_pubkey: String,
	) -> Self {
		SyncEngine {
			ledger,
			registry,
			transport,
			verifier,
			validator,
			membership,
			config,
			self_pubkey,
			in_flight: tokio::sync::Mutex::new(()),
		}
	}

	/// Runs one pull pass over the UP peers in random order, or only over `pubkey`.
	pub async fn sync(&self, pubkey: Option<&str>, cancel: &CancellationToken) -> Result<PullReport> {
		let _in_flight = self.in_flight.lock().await;

		let mut peers = self
			.registry
			.find_peers_excluding(&[self.self_pubkey.clone()]);
		if let Some(pubkey) = pubkey {
			peers.retain(|peer| peer.pubkey() == pubkey);
		}
		peers.shuffle(&mut rand::thread_rng());

		let mut report = PullReport::default();
		for peer in peers {
			if cancel.is_cancelled() {
				report.cancelled = true;
				break;
			}
			let pubkey = peer.pubkey().to_string();
			let node = match self.connect(&peer).await {
				Ok(node) => node,
				Err(Error::ConnectionError(reason)) => {
					self.set_down(&pubkey).await;
					report
						.outcomes
						.push((pubkey, PeerOutcome::Unreachable(reason)));
					continue;
				},
				Err(error) => {
					debug!(pubkey, %error, "Peer not usable for pulling blocks");
					report
						.outcomes
						.push((pubkey, PeerOutcome::Failed(error.to_string())));
					continue;
				},
			};

			let dao = NodeDao::new(
				self.ledger.clone(),
				node,
				peer,
				self.validator.clone(),
				self.membership.clone(),
			);
			let peer_report = match pull(&self.config, &dao, cancel).await {
				Ok(peer_report) => peer_report,
				Err(error) => {
					warn!(pubkey, %error, "Block pulling from peer failed");
					report
						.outcomes
						.push((pubkey, PeerOutcome::Failed(error.to_string())));
					continue;
				},
			};
			for pubkey in peer_report.unreachable() {
				self.set_down(pubkey).await;
			}
			report.extend(peer_report);
		}

		info!(
			peers = report.outcomes.len(),
			applied = report.applied(),
			cancelled = report.cancelled,
			"Sync pass done"
		);
		Ok(report)
	}

	async fn connect(&self, peer: &PeerRecord) -> Result<Arc<dyn crate::network::RemoteNode>> {
		let node = self.transport.connect(peer).await?;
		check_peer_validity(self.verifier.as_ref(), peer, node.as_ref()).await?;
		Ok(node)
	}

	async fn set_down(&self, pubkey: &str) {
		if let Err(error) = self.registry.set_down(pubkey).await {
			warn!(pubkey, %error, "Cannot set peer DOWN");
		}
	}
}

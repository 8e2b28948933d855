//! Table of the known peers and their liveness status.
//!
//! The registry is the only owner of the peer records. Mutations of the same peer are
//! serialized by a per-pubkey lock, and every mutation persists the whole table.
use crate::{
	crypto::{verify_document, Verifier},
	data::{Database, PeersKey},
	error::{Error, Result},
	ledger::BlockIndex,
	peer::{PeerDocument, PeerRecord, PeerStatus},
	types::{now_millis, BlockAnchor},
};
use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, RwLock},
};
use tracing::{debug, trace};

pub struct PeerRegistry<D> {
	db: D,
	chain: Arc<dyn BlockIndex>,
	verifier: Arc<dyn Verifier>,
	peers: RwLock<HashMap<String, PeerRecord>>,
	peer_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
	// snapshot and write of the table happen together
	persist_lock: tokio::sync::Mutex<()>,
}

impl<D: Database + Send + Sync> PeerRegistry<D> {
	/// Loads the persisted peer table.
	pub async fn load(
		db: D,
		chain: Arc<dyn BlockIndex>,
		verifier: Arc<dyn Verifier>,
	) -> Result<Self> {
		let peers = db
			.get(PeersKey)
			.await?
			.unwrap_or_default()
			.into_iter()
			.map(|record| (record.pubkey().to_string(), record))
			.collect::<HashMap<_, _>>();
		debug!(count = peers.len(), "Peer table loaded");

		Ok(PeerRegistry {
			db,
			chain,
			verifier,
			peers: RwLock::new(peers),
			peer_locks: Mutex::new(HashMap::new()),
			persist_lock: tokio::sync::Mutex::new(()),
		})
	}

	fn peer_lock(&self, pubkey: &str) -> Arc<tokio::sync::Mutex<()>> {
		let mut locks = self.peer_locks.lock().expect("Lock acquired");
		locks.entry(pubkey.to_string()).or_default().clone()
	}

	async fn persist(&self) -> Result<()> {
		let _guard = self.persist_lock.lock().await;
		let mut snapshot = self.list_peers();
		snapshot.sort_by(|a, b| a.pubkey().cmp(b.pubkey()));
		self.db.put(PeersKey, snapshot).await
	}

	/// Records a peering document.
	///
	/// With `cautious`, the signature must match and the anchor block must be known
	/// locally. Otherwise an unknown anchor is replaced by the special block. Unless `erase`
	/// is set, a document not anchored above the recorded one is rejected.
	pub async fn submit_peer(
		&self,
		document: PeerDocument,
		erase: bool,
		cautious: bool,
	) -> Result<PeerRecord> {
		let lock = self.peer_lock(&document.pubkey);
		let _guard = lock.lock().await;

		if cautious && !verify_document(self.verifier.as_ref(), &document) {
			return Err(Error::SignatureMismatch);
		}

		let mut document = document;
		// anchor number claimed by the peer, before any downgrade
		let claimed_number = document.block.number;
		let status_ts = if document.block.is_special() {
			0
		} else {
			let BlockAnchor { number, hash } = &document.block;
			match self.chain.block_by_number_and_hash(*number, hash).await? {
				Some(block) => block.median_time,
				None if cautious => return Err(Error::UnknownReferenceBlock),
				None => {
					document.block = BlockAnchor::special();
					0
				},
			}
		};

		let existing = self.get_peer(&document.pubkey).ok();
		let record = match existing {
			Some(existing) if claimed_number <= existing.document.block.number && !erase => {
				return Err(Error::AlreadyRecorded);
			},
			Some(mut existing) => {
				existing.merge(document, status_ts);
				existing
			},
			None => PeerRecord::new(document, status_ts),
		};

		self.peers
			.write()
			.expect("Lock acquired")
			.insert(record.pubkey().to_string(), record.clone());
		self.persist().await?;

		debug!(pubkey = record.pubkey(), block = %record.document.block, "Peer recorded");
		Ok(record)
	}

	async fn update_status(
		&self,
		pubkey: &str,
		update: impl FnOnce(&mut PeerRecord),
	) -> Result<PeerRecord> {
		let lock = self.peer_lock(pubkey);
		let _guard = lock.lock().await;

		let record = {
			let mut peers = self.peers.write().expect("Lock acquired");
			let record = peers
				.get_mut(pubkey)
				.ok_or_else(|| Error::NotFound(format!("Peer {pubkey}")))?;
			update(record);
			record.clone()
		};
		self.persist().await?;
		Ok(record)
	}

	/// Marks the peer DOWN and records the contact attempt.
	pub async fn set_down(&self, pubkey: &str) -> Result<PeerRecord> {
		let now = now_millis();
		let record = self
			.update_status(pubkey, |record| {
				record.status = PeerStatus::Down;
				record.first_down.get_or_insert(now);
				record.last_try = Some(now);
			})
			.await?;
		trace!(pubkey, "Peer set DOWN");
		Ok(record)
	}

	pub async fn set_up(&self, pubkey: &str) -> Result<PeerRecord> {
		let record = self
			.update_status(pubkey, |record| {
				record.status = PeerStatus::Up;
				record.first_down = None;
				record.last_try = None;
			})
			.await?;
		trace!(pubkey, "Peer set UP");
		Ok(record)
	}

	pub fn get_peer(&self, pubkey: &str) -> Result<PeerRecord> {
		self.peers
			.read()
			.expect("Lock acquired")
			.get(pubkey)
			.cloned()
			.ok_or_else(|| Error::NotFound(format!("Peer {pubkey}")))
	}

	fn filter_peers(&self, predicate: impl Fn(&PeerRecord) -> bool) -> Vec<PeerRecord> {
		self.peers
			.read()
			.expect("Lock acquired")
			.values()
			.filter(|record| predicate(*record))
			.cloned()
			.collect()
	}

	pub fn list_peers(&self) -> Vec<PeerRecord> {
		self.filter_peers(|_| true)
	}

	pub fn list_up_peers(&self) -> Vec<PeerRecord> {
		self.filter_peers(PeerRecord::is_up)
	}

	/// UP peers whose pubkey is not in `pubkeys`.
	pub fn find_peers_excluding(&self, pubkeys: &[String]) -> Vec<PeerRecord> {
		let excluded = pubkeys.iter().collect::<HashSet<_>>();
		self.filter_peers(|record| {
			record.is_up() && !excluded.contains(&record.document.pubkey)
		})
	}

	/// DOWN peers whose pubkey is not in `pubkeys`.
	pub fn find_down_peers_excluding(&self, pubkeys: &[String]) -> Vec<PeerRecord> {
		let excluded = pubkeys.iter().collect::<HashSet<_>>();
		self.filter_peers(|record| {
			!record.is_up() && !excluded.contains(&record.document.pubkey)
		})
	}

	pub fn find_peers_by_hashes(&self, hashes: &[String]) -> Vec<PeerRecord> {
		let hashes = hashes.iter().collect::<HashSet<_>>();
		self.filter_peers(|record| hashes.contains(&record.hash))
	}

	/// Sorted hashes of the UP peers, served to other nodes as the known peers leaves.
	pub fn merkle_leaves(&self) -> Vec<String> {
		let mut leaves = self
			.list_up_peers()
			.into_iter()
			.map(|record| record.hash)
			.collect::<Vec<_>>();
		leaves.sort();
		leaves
	}
}

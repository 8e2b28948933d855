//! Generation of the signed peering document of the node itself.
use crate::{
	crypto::{sign_document, Signer},
	data::Database,
	error::{Error, Result},
	ledger::Ledger,
	network::BASIC_MERKLED_API,
	peer::{PeerDocument, PeerRecord, PEER_DOCUMENT_VERSION},
	peer_registry::PeerRegistry,
	types::BlockAnchor,
};
use std::sync::Arc;
use tracing::info;

/// Number of blocks the self peering anchor stays behind the chain head.
const ANCHOR_DEPTH: u32 = 30;

/// Public address of the node and its currency.
#[derive(Clone, Debug, Default)]
pub struct SelfPeerConfig {
	pub currency: String,
	pub remote_host: Option<String>,
	pub remote_ipv4: Option<String>,
	pub remote_ipv6: Option<String>,
	pub remote_port: Option<u16>,
}

impl SelfPeerConfig {
	/// `BASIC_MERKLED_API` endpoint built from the configured address parts.
	pub fn endpoint(&self) -> Result<String> {
		let parts = [&self.remote_host, &self.remote_ipv4, &self.remote_ipv6]
			.into_iter()
			.flatten()
			.filter(|part| !part.is_empty())
			.cloned()
			.chain(self.remote_port.map(|port| port.to_string()))
			.collect::<Vec<_>>();
		if parts.is_empty() {
			return Err(Error::Config("No remote address configured".to_string()));
		}
		Ok(format!("{BASIC_MERKLED_API} {}", parts.join(" ")))
	}
}

/// Anchor number, trailing the chain head but always above the previous anchor.
pub fn anchor_number(current: Option<u32>, previous: Option<u32>) -> u32 {
	let trailing = current.map_or(0, |current| current.saturating_sub(ANCHOR_DEPTH));
	let above_previous = previous.map_or(0, |previous| previous + 1);
	trailing.max(above_previous)
}

pub struct SelfPeer<D> {
	ledger: Arc<Ledger<D>>,
	registry: Arc<PeerRegistry<D>>,
	signer: Arc<dyn Signer>,
	config: SelfPeerConfig,
}

impl<D: Database + Send + Sync> SelfPeer<D> {
	pub fn new(
		ledger: Arc<Ledger<D>>,
		registry: Arc<PeerRegistry<D>>,
		signer: Arc<dyn Signer>,
		config: SelfPeerConfig,
	) -> Self {
		SelfPeer {
			ledger,
			registry,
			signer,
			config,
		}
	}

	pub fn pubkey(&self) -> String {
		self.signer.pubkey()
	}

	/// Signs a fresh peering document of the node and records it.
	pub async fn generate(&self) -> Result<PeerRecord> {
		if self.config.currency.is_empty() {
			return Err(Error::Config("No currency configured".to_string()));
		}
		let endpoint = self.config.endpoint()?;
		let pubkey = self.signer.pubkey();

		let current = self.ledger.current_number().await;
		let previous = self
			.registry
			.get_peer(&pubkey)
			.ok()
			.map(|record| record.document.block.number);
		let number = anchor_number(current, previous);
		let block = match self.ledger.get_block(number).await {
			Ok(block) => block.anchor(),
			Err(Error::NotFound(_)) => BlockAnchor::special(),
			Err(error) => return Err(error),
		};

		let mut document = PeerDocument {
			version: PEER_DOCUMENT_VERSION,
			currency: self.config.currency.clone(),
			pubkey,
			endpoints: vec![endpoint],
			block,
			signature: String::new(),
		};
		sign_document(self.signer.as_ref(), &mut document);

		let record = self.registry.submit_peer(document, true, true).await?;
		info!(
			pubkey = record.pubkey(),
			block = %record.document.block,
			endpoint = record.document.endpoints.join(", "),
			"Self peering document generated"
		);
		Ok(record)
	}
}

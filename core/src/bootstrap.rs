//! First contact with a known node, seeding the peer table and an empty ledger.
use crate::{
	crypto::{verify_document, Verifier},
	data::Database,
	error::{Error, Result},
	ledger::Ledger,
	network::PeerTransport,
	peer::{PeerDocument, PeerRecord, PEER_DOCUMENT_VERSION},
	peer_registry::PeerRegistry,
	types::BlockAnchor,
};
use tracing::{debug, info};

/// Records the peering document of the node behind `endpoint`, and its genesis block when the
/// local ledger is empty.
pub async fn bootstrap<D: Database + Send + Sync>(
	endpoint: &str,
	currency: &str,
	ledger: &Ledger<D>,
	registry: &PeerRegistry<D>,
	transport: &dyn PeerTransport,
	verifier: &dyn Verifier,
) -> Result<Option<PeerRecord>> {
	let seed = PeerRecord::new(
		PeerDocument {
			version: PEER_DOCUMENT_VERSION,
			currency: currency.to_string(),
			pubkey: String::new(),
			endpoints: vec![endpoint.to_string()],
			block: BlockAnchor::special(),
			signature: String::new(),
		},
		0,
	);
	let node = transport.connect(&seed).await?;
	let document = node.get_self_peering().await?;
	if !verify_document(verifier, &document) {
		return Err(Error::SignatureMismatch);
	}
	if !currency.is_empty() && document.currency != currency {
		return Err(Error::PeerChanged(format!(
			"Bootstrap node {endpoint} runs currency {}",
			document.currency
		)));
	}

	if ledger.current_number().await.is_none() {
		let genesis = node.get_block(0).await?;
		if genesis.number != 0 || genesis.previous_hash.is_some() {
			return Err(Error::Protocol(format!(
				"Bootstrap node {endpoint} served an invalid genesis block"
			)));
		}
		ledger.save_block(&genesis).await?;
		info!(block_hash = genesis.hash, "Genesis block fetched");
	}

	match registry.submit_peer(document, false, false).await {
		Ok(record) => {
			info!(pubkey = record.pubkey(), endpoint, "Bootstrap peer recorded");
			Ok(Some(record))
		},
		Err(Error::AlreadyRecorded) => {
			debug!(endpoint, "Bootstrap peer already known");
			Ok(None)
		},
		Err(error) => Err(error),
	}
}

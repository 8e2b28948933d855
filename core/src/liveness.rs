//! Periodic recontact of the DOWN peers, with a backoff growing with their downtime.
use crate::{
	crypto::Verifier,
	data::Database,
	error::Result,
	network::{check_peer_validity, PeerTransport},
	peer::{PeerDocument, PeerRecord},
	peer_registry::PeerRegistry,
	types::now_millis,
};
use std::sync::Arc;
use tracing::{debug, trace};

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
const MONTH: u64 = 30 * DAY;

/// Elapsed downtime upper bound and retry interval, in millis.
const BACKOFF_TIERS: [(u64, u64); 6] = [
	(MINUTE, 10 * SECOND),
	(10 * MINUTE, MINUTE),
	(HOUR, 10 * MINUTE),
	(DAY, HOUR),
	(WEEK, DAY),
	(MONTH, WEEK),
];

/// Retry interval for a peer DOWN for `downtime` millis, none beyond the last tier.
pub fn retry_interval(downtime: u64) -> Option<u64> {
	BACKOFF_TIERS
		.iter()
		.find(|(bound, _)| downtime <= *bound)
		.map(|(_, interval)| *interval)
}

/// Millis to wait before the next retry, a retry is due when it is not positive.
///
/// Returns `None` when the peer is not retried anymore.
pub fn wait_remaining(now: u64, first_down: u64, last_try: Option<u64>) -> Option<i64> {
	let interval = retry_interval(now.saturating_sub(first_down))?;
	let waited = last_try.map_or(0, |last_try| now.saturating_sub(last_try));
	Some(interval as i64 - waited as i64)
}

pub struct LivenessProber<D> {
	registry: Arc<PeerRegistry<D>>,
	transport: Arc<dyn PeerTransport>,
	verifier: Arc<dyn Verifier>,
	self_pubkey: String,
}

impl<D: Database + Send + Sync> LivenessProber<D> {
	pub fn new(
		registry: Arc<PeerRegistry<D>>,
		transport: Arc<dyn PeerTransport>,
		verifier: Arc<dyn Verifier>,
		self_pubkey: String,
	) -> Self {
		LivenessProber {
			registry,
			transport,
			verifier,
			self_pubkey,
		}
	}

	/// Probes the DOWN peers due for a retry, returning how many came back UP.
	pub async fn probe(&self) -> Result<usize> {
		let now = now_millis();
		let mut revived = 0;
		for peer in self
			.registry
			.find_down_peers_excluding(&[self.self_pubkey.clone()])
		{
			let first_down = peer.first_down.unwrap_or(now);
			let Some(remaining) = wait_remaining(now, first_down, peer.last_try) else {
				continue;
			};
			if remaining > 0 {
				continue;
			}
			if self.probe_peer(&peer).await? {
				revived += 1;
			}
		}
		Ok(revived)
	}

	async fn probe_peer(&self, peer: &PeerRecord) -> Result<bool> {
		let pubkey = peer.pubkey();
		trace!(pubkey, "Checking if peer is UP");
		// the attempt is recorded whatever the outcome
		self.registry.set_down(pubkey).await?;

		match self.check(peer).await {
			Ok(document) => {
				self.registry.set_up(pubkey).await?;
				debug!(pubkey, "Peer is UP again");
				if document.block != peer.document.block {
					if let Err(error) = self.registry.submit_peer(document, false, true).await {
						debug!(pubkey, %error, "Updated peer document not recorded");
					}
				}
				Ok(true)
			},
			Err(error) => {
				let record = self.registry.set_down(pubkey).await?;
				let now = now_millis();
				let next_retry = wait_remaining(now, record.first_down.unwrap_or(now), Some(now));
				match next_retry {
					Some(delay) => debug!(pubkey, %error, next_retry_ms = delay, "Peer is still DOWN"),
					None => debug!(pubkey, %error, "Peer is DOWN, no further retries"),
				}
				Ok(false)
			},
		}
	}

	async fn check(&self, peer: &PeerRecord) -> Result<PeerDocument> {
		let node = self.transport.connect(peer).await?;
		check_peer_validity(self.verifier.as_ref(), peer, node.as_ref()).await
	}
}

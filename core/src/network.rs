//! Remote node access: the capabilities consumed from the transport and peer revalidation.
use crate::{
	crypto::{verify_document, Verifier},
	error::{Error, Result},
	peer::{PeerDocument, PeerRecord},
	types::Block,
};
use async_trait::async_trait;
use mockall::automock;
use std::{
	fmt::{self, Display, Formatter},
	net::{Ipv4Addr, Ipv6Addr},
	str::FromStr,
	sync::Arc,
};
use tracing::warn;

pub mod http;

/// Name of the merkle based HTTP API endpoints.
pub const BASIC_MERKLED_API: &str = "BASIC_MERKLED_API";

/// Operations a connected remote node exposes.
#[automock]
#[async_trait]
pub trait RemoteNode: Send + Sync {
	/// Current peering document of the remote node itself.
	async fn get_self_peering(&self) -> Result<PeerDocument>;

	/// Hashes of the peers known by the remote node.
	async fn list_peer_leaves(&self) -> Result<Vec<String>>;

	/// Peering document behind one of the known peers leaves.
	async fn get_peer_leaf(&self, hash: &str) -> Result<PeerDocument>;

	async fn get_current_block(&self) -> Result<Block>;

	async fn get_block(&self, number: u32) -> Result<Block>;

	async fn get_blocks_range(&self, from_number: u32, count: u32) -> Result<Vec<Block>>;
}

#[automock]
#[async_trait]
pub trait PeerTransport: Send + Sync {
	/// Connects to the peer through the first usable endpoint.
	async fn connect(&self, peer: &PeerRecord) -> Result<Arc<dyn RemoteNode>>;
}

/// `BASIC_MERKLED_API [dns] [ipv4] [ipv6] port` endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoint {
	pub host: Option<String>,
	pub ipv4: Option<Ipv4Addr>,
	pub ipv6: Option<Ipv6Addr>,
	pub port: u16,
}

impl Endpoint {
	/// Base URL, preferring the DNS name over the IPv4 and IPv6 addresses.
	pub fn base_url(&self) -> Option<String> {
		let host = match (&self.host, self.ipv4, self.ipv6) {
			(Some(host), _, _) => host.clone(),
			(None, Some(ipv4), _) => ipv4.to_string(),
			(None, None, Some(ipv6)) => format!("[{ipv6}]"),
			(None, None, None) => return None,
		};
		Some(format!("http://{host}:{}", self.port))
	}
}

impl FromStr for Endpoint {
	type Err = Error;

	fn from_str(value: &str) -> Result<Self> {
		let mut parts = value.split_whitespace().collect::<Vec<_>>();
		if parts.first() != Some(&BASIC_MERKLED_API) {
			return Err(Error::Protocol(format!("Unsupported endpoint {value}")));
		}
		let port = parts
			.pop()
			.and_then(|port| port.parse::<u16>().ok())
			.ok_or_else(|| Error::Protocol(format!("Missing endpoint port {value}")))?;

		let mut endpoint = Endpoint {
			port,
			..Default::default()
		};
		for part in parts.into_iter().skip(1) {
			if let Ok(ipv4) = part.parse::<Ipv4Addr>() {
				endpoint.ipv4 = Some(ipv4);
			} else if let Ok(ipv6) = part.parse::<Ipv6Addr>() {
				endpoint.ipv6 = Some(ipv6);
			} else {
				endpoint.host = Some(part.to_string());
			}
		}
		if endpoint.base_url().is_none() {
			return Err(Error::Protocol(format!("Missing endpoint address {value}")));
		}
		Ok(endpoint)
	}
}

impl Display for Endpoint {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{BASIC_MERKLED_API}")?;
		if let Some(host) = &self.host {
			write!(f, " {host}")?;
		}
		if let Some(ipv4) = self.ipv4 {
			write!(f, " {ipv4}")?;
		}
		if let Some(ipv6) = self.ipv6 {
			write!(f, " {ipv6}")?;
		}
		write!(f, " {}", self.port)
	}
}

/// Fetches the current peering document of `node` and checks it against `claimed`.
///
/// The document must be correctly signed, for the same currency and pubkey, and must not be
/// anchored below the recorded anchor.
pub async fn check_peer_validity(
	verifier: &dyn Verifier,
	claimed: &PeerRecord,
	node: &dyn RemoteNode,
) -> Result<PeerDocument> {
	let document = node.get_self_peering().await?;
	let claimed_document = &claimed.document;

	let violation = if !verify_document(verifier, &document) {
		Some("signature does not match")
	} else if document.currency != claimed_document.currency {
		Some("currency changed")
	} else if document.pubkey != claimed_document.pubkey {
		Some("pubkey changed")
	} else if document.block.number < claimed_document.block.number {
		Some("block anchor decreased")
	} else {
		None
	};

	match violation {
		Some(reason) => {
			warn!(pubkey = claimed_document.pubkey, reason, "Peer has changed");
			Err(Error::PeerChanged(format!(
				"{}: {reason}",
				claimed_document.pubkey
			)))
		},
		None => Ok(document),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{crypto::MockVerifier, peer::tests::document};
	use test_case::test_case;

	#[test_case("BASIC_MERKLED_API 127.0.0.1 8999" => Some("http://127.0.0.1:8999".to_string()))]
	#[test_case("BASIC_MERKLED_API node.example.org 10.0.0.1 80" => Some("http://node.example.org:80".to_string()))]
	#[test_case("BASIC_MERKLED_API ::1 8999" => Some("http://[::1]:8999".to_string()))]
	#[test_case("BASIC_MERKLED_API 8999" => None)]
	#[test_case("BASIC_MERKLED_API 127.0.0.1" => None)]
	#[test_case("OTHER_API 127.0.0.1 8999" => None)]
	fn endpoint_base_url(value: &str) -> Option<String> {
		value
			.parse::<Endpoint>()
			.ok()
			.and_then(|endpoint| endpoint.base_url())
	}

	#[test]
	fn endpoint_display() {
		let value = "BASIC_MERKLED_API node.example.org 10.0.0.1 ::1 8999";
		let endpoint = value.parse::<Endpoint>().unwrap();
		assert_eq!(endpoint.to_string(), value);
	}

	fn verifier(valid: bool) -> MockVerifier {
		let mut verifier = MockVerifier::new();
		verifier.expect_verify().return_const(valid);
		verifier
	}

	fn node(document: PeerDocument) -> MockRemoteNode {
		let mut node = MockRemoteNode::new();
		node.expect_get_self_peering()
			.returning(move || Ok(document.clone()));
		node
	}

	#[tokio::test]
	async fn valid_peer() {
		let claimed = PeerRecord::new(document("P", 3, &[]), 0);
		let fetched = check_peer_validity(&verifier(true), &claimed, &node(document("P", 4, &[])))
			.await
			.unwrap();
		assert_eq!(fetched.block.number, 4);
	}

	#[tokio::test]
	async fn changed_peers_are_detected() {
		let claimed = PeerRecord::new(document("P", 3, &[]), 0);
		let mut other_currency = document("P", 3, &[]);
		other_currency.currency = "other_net".to_string();

		let cases = [
			(verifier(false), document("P", 3, &[])),
			(verifier(true), other_currency),
			(verifier(true), document("Q", 3, &[])),
			(verifier(true), document("P", 2, &[])),
		];
		for (verifier, fetched) in cases {
			let result = check_peer_validity(&verifier, &claimed, &node(fetched)).await;
			assert!(matches!(result, Err(Error::PeerChanged(_))));
		}
	}

	#[tokio::test]
	async fn connection_errors_are_propagated() {
		let claimed = PeerRecord::new(document("P", 3, &[]), 0);
		let mut node = MockRemoteNode::new();
		node.expect_get_self_peering()
			.returning(|| Err(Error::ConnectionError("refused".to_string())));

		let result = check_peer_validity(&verifier(true), &claimed, &node).await;
		assert!(matches!(result, Err(Error::ConnectionError(_))));
	}
}

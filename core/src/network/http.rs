//! HTTP transport for the `BASIC_MERKLED_API` endpoints.
use super::{Endpoint, PeerTransport, RemoteNode};
use crate::{
	error::{Error, Result},
	peer::{PeerDocument, PeerRecord},
	types::Block,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use std::{sync::Arc, time::Duration};
use tracing::trace;

#[derive(Deserialize)]
struct LeavesResponse {
	#[serde(default)]
	leaves: Vec<String>,
}

#[derive(Deserialize)]
struct LeafResponse {
	leaf: Option<MerkleLeaf>,
}

#[derive(Deserialize)]
struct MerkleLeaf {
	hash: String,
	value: Option<PeerDocument>,
}

#[derive(Clone)]
pub struct HttpTransport {
	client: Client,
}

impl HttpTransport {
	pub fn new(timeout: Duration) -> Result<Self> {
		let client = Client::builder()
			.timeout(timeout)
			.connect_timeout(timeout)
			.build()
			.map_err(|error| Error::Config(format!("Cannot build HTTP client: {error}")))?;
		Ok(HttpTransport { client })
	}
}

#[async_trait]
impl PeerTransport for HttpTransport {
	async fn connect(&self, peer: &PeerRecord) -> Result<Arc<dyn RemoteNode>> {
		let base_url = peer
			.document
			.endpoints
			.iter()
			.filter_map(|endpoint| endpoint.parse::<Endpoint>().ok())
			.find_map(|endpoint| endpoint.base_url())
			.ok_or_else(|| {
				Error::ConnectionError(format!("No usable endpoint for {}", peer.pubkey()))
			})?;

		trace!(pubkey = peer.pubkey(), base_url, "Connecting to peer");
		Ok(Arc::new(HttpNode {
			client: self.client.clone(),
			base_url,
		}))
	}
}

pub struct HttpNode {
	client: Client,
	base_url: String,
}

impl HttpNode {
	pub fn new(client: Client, base_url: String) -> Self {
		HttpNode { client, base_url }
	}

	async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
		let url = format!("{}{path}", self.base_url);
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(|error| request_error(&url, error))?;

		match response.status() {
			StatusCode::NOT_FOUND => return Err(Error::NotFound(url)),
			status if !status.is_success() => {
				return Err(Error::Protocol(format!("{url} responded with {status}")))
			},
			_ => {},
		}
		response
			.json::<T>()
			.await
			.map_err(|error| request_error(&url, error))
	}
}

fn request_error(url: &str, error: reqwest::Error) -> Error {
	if error.is_connect() || error.is_timeout() || error.is_request() {
		Error::ConnectionError(format!("{url}: {error}"))
	} else {
		Error::Protocol(format!("{url}: {error}"))
	}
}

#[async_trait]
impl RemoteNode for HttpNode {
	async fn get_self_peering(&self) -> Result<PeerDocument> {
		self.get("/network/peering").await
	}

	async fn list_peer_leaves(&self) -> Result<Vec<String>> {
		let response: LeavesResponse = self.get("/network/peering/peers?leaves=true").await?;
		Ok(response.leaves)
	}

	async fn get_peer_leaf(&self, hash: &str) -> Result<PeerDocument> {
		let response: LeafResponse = self
			.get(&format!("/network/peering/peers?leaf={hash}"))
			.await?;
		response
			.leaf
			.filter(|leaf| leaf.hash == hash)
			.and_then(|leaf| leaf.value)
			.ok_or_else(|| Error::NotFound(format!("Peer leaf {hash}")))
	}

	async fn get_current_block(&self) -> Result<Block> {
		self.get("/blockchain/current").await
	}

	async fn get_block(&self, number: u32) -> Result<Block> {
		self.get(&format!("/blockchain/block/{number}")).await
	}

	async fn get_blocks_range(&self, from_number: u32, count: u32) -> Result<Vec<Block>> {
		self.get(&format!("/blockchain/blocks/{count}/{from_number}"))
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peer::tests::document;

	#[tokio::test]
	async fn peer_without_endpoint_is_unreachable() {
		let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
		let peer = PeerRecord::new(document("P", 1, &["OTHER_API 127.0.0.1 80"]), 0);

		let result = transport.connect(&peer).await;
		assert!(matches!(result, Err(Error::ConnectionError(_))));
	}

	#[tokio::test]
	async fn refused_connection_is_connection_error() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		drop(listener);

		let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
		let endpoint = format!("BASIC_MERKLED_API 127.0.0.1 {port}");
		let peer = PeerRecord::new(document("P", 1, &[&endpoint]), 0);

		let node = transport.connect(&peer).await.unwrap();
		let result = node.get_current_block().await;
		assert!(matches!(result, Err(Error::ConnectionError(_))));
	}

	#[test]
	fn leaf_response_layout() {
		let json = r#"{
			"depth": 1,
			"leavesCount": 1,
			"leaf": {
				"hash": "ABCD",
				"value": {
					"version": 1,
					"currency": "test_net",
					"pubkey": "P",
					"endpoints": ["BASIC_MERKLED_API 127.0.0.1 8999"],
					"block": "3-H3",
					"signature": "SIG"
				}
			}
		}"#;
		let response: LeafResponse = serde_json::from_str(json).unwrap();
		let leaf = response.leaf.unwrap();
		assert_eq!(leaf.hash, "ABCD");
		assert_eq!(leaf.value.unwrap().block.number, 3);
	}
}

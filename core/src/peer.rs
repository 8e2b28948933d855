//! Peering documents and the locally recorded peer state.
use crate::types::BlockAnchor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;

pub const PEER_DOCUMENT_VERSION: u32 = 1;

/// Signed peering document, as exchanged with remote nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDocument {
	pub version: u32,
	pub currency: String,
	pub pubkey: String,
	pub endpoints: Vec<String>,
	pub block: BlockAnchor,
	#[serde(default)]
	pub signature: String,
}

impl PeerDocument {
	/// Unsigned raw form, which is the signed payload.
	pub fn raw(&self) -> String {
		let mut raw = String::new();
		let _ = writeln!(raw, "Version: {}", self.version);
		raw.push_str("Type: Peer\n");
		let _ = writeln!(raw, "Currency: {}", self.currency);
		let _ = writeln!(raw, "PublicKey: {}", self.pubkey);
		let _ = writeln!(raw, "Block: {}", self.block);
		raw.push_str("Endpoints:\n");
		for endpoint in &self.endpoints {
			let _ = writeln!(raw, "{endpoint}");
		}
		raw
	}

	pub fn raw_signed(&self) -> String {
		format!("{}{}\n", self.raw(), self.signature)
	}

	/// Uppercase hex SHA-256 of the signed raw form.
	pub fn hash(&self) -> String {
		hex::encode_upper(Sha256::digest(self.raw_signed().as_bytes()))
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerStatus {
	Up,
	Down,
}

/// Recorded state of a peer, keyed by its public key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
	#[serde(flatten)]
	pub document: PeerDocument,
	pub status: PeerStatus,
	/// Median time of the anchor block, in seconds.
	#[serde(rename = "statusTS")]
	pub status_ts: u64,
	/// Unix millis of the first failed contact since the peer was last UP.
	pub first_down: Option<u64>,
	/// Unix millis of the last contact attempt while DOWN.
	pub last_try: Option<u64>,
	pub hash: String,
	pub raw: String,
}

impl PeerRecord {
	pub fn new(document: PeerDocument, status_ts: u64) -> Self {
		let mut record = PeerRecord {
			hash: String::new(),
			raw: String::new(),
			status: PeerStatus::Up,
			status_ts,
			first_down: None,
			last_try: None,
			document: document.clone(),
		};
		record.merge(document, status_ts);
		record
	}

	/// Replaces the document fields with the incoming ones and brings the peer UP.
	pub fn merge(&mut self, document: PeerDocument, status_ts: u64) {
		self.hash = document.hash();
		self.raw = document.raw_signed();
		self.document = document;
		self.status_ts = status_ts;
		self.status = PeerStatus::Up;
		self.first_down = None;
		self.last_try = None;
	}

	pub fn pubkey(&self) -> &str {
		&self.document.pubkey
	}

	pub fn is_up(&self) -> bool {
		self.status == PeerStatus::Up
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	pub(crate) fn document(pubkey: &str, number: u32, endpoints: &[&str]) -> PeerDocument {
		PeerDocument {
			version: PEER_DOCUMENT_VERSION,
			currency: "test_net".to_string(),
			pubkey: pubkey.to_string(),
			endpoints: endpoints.iter().map(|endpoint| endpoint.to_string()).collect(),
			block: BlockAnchor {
				number,
				hash: format!("H{number}"),
			},
			signature: "SIG".to_string(),
		}
	}

	#[test]
	fn raw_forms() {
		let document = document("PUB", 3, &["BASIC_MERKLED_API 127.0.0.1 8999"]);
		let expected = "Version: 1\n\
			Type: Peer\n\
			Currency: test_net\n\
			PublicKey: PUB\n\
			Block: 3-H3\n\
			Endpoints:\n\
			BASIC_MERKLED_API 127.0.0.1 8999\n";
		assert_eq!(document.raw(), expected);
		assert_eq!(document.raw_signed(), format!("{expected}SIG\n"));
	}

	#[test]
	fn hash_is_uppercase_and_tracks_signature() {
		let mut document = document("PUB", 3, &[]);
		let hash = document.hash();
		assert_eq!(hash.len(), 64);
		assert_eq!(hash, hash.to_uppercase());

		document.signature = "OTHER".to_string();
		assert_ne!(document.hash(), hash);
	}

	#[test]
	fn merge_replaces_known_fields() {
		let mut record = PeerRecord::new(document("PUB", 3, &["A"]), 10);
		record.status = PeerStatus::Down;
		record.first_down = Some(1);
		record.last_try = Some(2);

		record.merge(document("PUB", 5, &["B"]), 20);

		assert!(record.is_up());
		assert_eq!(record.document.endpoints, vec!["B".to_string()]);
		assert_eq!(record.document.block.number, 5);
		assert_eq!(record.status_ts, 20);
		assert_eq!(record.first_down, None);
		assert_eq!(record.last_try, None);
		assert_eq!(record.hash, record.document.hash());
	}

	#[test]
	fn record_serialization_layout() {
		let record = PeerRecord::new(document("PUB", 3, &[]), 10);
		let value = serde_json::to_value(&record).unwrap();
		assert_eq!(value["pubkey"], "PUB");
		assert_eq!(value["block"], "3-H3");
		assert_eq!(value["status"], "UP");
		assert_eq!(value["statusTS"], 10);
	}
}

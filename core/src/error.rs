use thiserror::Error;

/// Failures returned by the storage, peering and synchronization components.
#[derive(Error, Debug)]
pub enum Error {
	#[error("Signature from a peer must match")]
	SignatureMismatch,
	#[error("Unknown reference block of peer")]
	UnknownReferenceBlock,
	#[error("A more recent peer document is already recorded")]
	AlreadyRecorded,
	#[error("Peer has changed: {0}")]
	PeerChanged(String),
	#[error("Connection error: {0}")]
	ConnectionError(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Storage corruption: {0}")]
	StorageCorruption(String),
	#[error("Invalid configuration: {0}")]
	Config(String),
	#[error("Remote protocol error: {0}")]
	Protocol(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

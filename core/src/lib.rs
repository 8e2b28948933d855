pub mod block_store;
pub mod bootstrap;
pub mod crawler;
pub mod crypto;
pub mod data;
pub mod error;
pub mod ledger;
pub mod liveness;
pub mod network;
pub mod peer;
pub mod peer_registry;
pub mod scheduler;
pub mod self_peer;
pub mod shutdown;
pub mod sync;
pub mod types;
pub mod utils;

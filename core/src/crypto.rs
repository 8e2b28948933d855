//! Signing and verification of peering documents.
use crate::{
	error::{Error, Result},
	peer::PeerDocument,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use mockall::automock;
use rand::rngs::OsRng;
use std::path::Path;
use tokio::fs;
use tracing::info;

#[automock]
pub trait Verifier: Send + Sync {
	/// Checks the base64 `signature` of `message` against the base58 `pubkey`.
	fn verify(&self, message: &str, signature: &str, pubkey: &str) -> bool;
}

#[automock]
pub trait Signer: Send + Sync {
	/// Base58 encoded public key.
	fn pubkey(&self) -> String;

	/// Base64 encoded signature of `message`.
	fn sign(&self, message: &str) -> String;
}

pub fn verify_document(verifier: &dyn Verifier, document: &PeerDocument) -> bool {
	verifier.verify(&document.raw(), &document.signature, &document.pubkey)
}

pub fn sign_document(signer: &dyn Signer, document: &mut PeerDocument) {
	document.pubkey = signer.pubkey();
	document.signature = signer.sign(&document.raw());
}

#[derive(Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
	fn verify(&self, message: &str, signature: &str, pubkey: &str) -> bool {
		let Some(key) = bs58::decode(pubkey)
			.into_vec()
			.ok()
			.and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
			.and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok())
		else {
			return false;
		};
		let Some(signature) = STANDARD
			.decode(signature)
			.ok()
			.and_then(|bytes| Signature::from_slice(&bytes).ok())
		else {
			return false;
		};
		key.verify(message.as_bytes(), &signature).is_ok()
	}
}

pub struct Ed25519Keypair {
	signing_key: SigningKey,
}

impl Ed25519Keypair {
	pub fn generate() -> Self {
		Ed25519Keypair {
			signing_key: SigningKey::generate(&mut OsRng),
		}
	}

	pub fn from_seed(seed: &[u8; 32]) -> Self {
		Ed25519Keypair {
			signing_key: SigningKey::from_bytes(seed),
		}
	}

	/// Loads the base58 encoded seed stored at `path`, generating and storing one if missing.
	pub async fn load_or_generate(path: &Path) -> Result<Self> {
		match fs::read_to_string(path).await {
			Ok(contents) => {
				let seed = bs58::decode(contents.trim())
					.into_vec()
					.ok()
					.and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
					.ok_or_else(|| {
						Error::Config(format!("Invalid secret key in {}", path.display()))
					})?;
				Ok(Self::from_seed(&seed))
			},
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
				let keypair = Self::generate();
				if let Some(parent) = path.parent() {
					fs::create_dir_all(parent).await?;
				}
				let seed = bs58::encode(keypair.signing_key.to_bytes()).into_string();
				fs::write(path, seed).await?;
				info!(path = %path.display(), pubkey = keypair.pubkey(), "Secret key generated");
				Ok(keypair)
			},
			Err(error) => Err(error.into()),
		}
	}
}

impl Signer for Ed25519Keypair {
	fn pubkey(&self) -> String {
		bs58::encode(self.signing_key.verifying_key().as_bytes()).into_string()
	}

	fn sign(&self, message: &str) -> String {
		STANDARD.encode(self.signing_key.sign(message.as_bytes()).to_bytes())
	}
}

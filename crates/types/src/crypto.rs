//! Crypto provider
//!
//! Signing, verification and hashing are consumed as opaque operations
//! through [`CryptoProvider`]. The bundled provider uses Ed25519 signatures
//! and BLAKE3 digests. Address and identifier derivations live here too so
//! every node derives them the same way.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::constants::{CONTRACT_PREFIX, PERSON_PREFIX, TOKEN_PREFIX, WALLET_PREFIX};

/// Signature and digest primitives
pub trait CryptoProvider: Send + Sync {
    /// Sign `message` with the private half of `keys`
    fn sign(&self, message: &[u8], keys: &KeyPair) -> Vec<u8>;

    /// Verify `signature` over `message` against a raw public key
    fn verify(&self, signature: &[u8], message: &[u8], public_key: &[u8]) -> bool;

    /// Content digest
    fn hash(&self, bytes: &[u8]) -> [u8; 32];
}

/// Ed25519 + BLAKE3
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Provider;

impl CryptoProvider for Ed25519Provider {
    fn sign(&self, message: &[u8], keys: &KeyPair) -> Vec<u8> {
        keys.signing.sign(message).to_bytes().to_vec()
    }

    fn verify(&self, signature: &[u8], message: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify(message, &signature).is_ok()
    }

    fn hash(&self, bytes: &[u8]) -> [u8; 32] {
        *blake3::hash(bytes).as_bytes()
    }
}

/// Node or wallet signing keys
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Fresh random key pair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Parse a hex encoded 32-byte secret
    pub fn from_secret_hex(secret: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(secret.trim(), &mut bytes)?;
        Ok(Self::from_secret_bytes(bytes))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public_bytes())
    }

    /// Wallet address controlled by this key
    pub fn address(&self) -> String {
        wallet_address_from_public(&self.public_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

/// Hex BLAKE3 digest
pub fn content_hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn prefixed_digest(prefix: &str, input: &[u8], take_last: bool) -> String {
    let digest = blake3::hash(input);
    let bytes = digest.as_bytes();
    let slice = if take_last { &bytes[12..] } else { &bytes[..20] };
    format!("{}{}", prefix, hex::encode(slice))
}

/// `0x` + last 20 bytes of the public key digest
pub fn wallet_address_from_public(public_key: &[u8]) -> String {
    prefixed_digest(WALLET_PREFIX, public_key, true)
}

/// Person id minted for a wallet that is not linked to an existing person
pub fn person_id_for_wallet(wallet_address: &str) -> String {
    prefixed_digest(PERSON_PREFIX, wallet_address.as_bytes(), false)
}

/// Token code generated for a token created without a usable code
pub fn derived_token_code(seed: &str) -> String {
    prefixed_digest(TOKEN_PREFIX, seed.as_bytes(), false)
}

/// Contract address derived from the setup transaction
pub fn derived_contract_address(seed: &str) -> String {
    prefixed_digest(CONTRACT_PREFIX, seed.as_bytes(), true)
}

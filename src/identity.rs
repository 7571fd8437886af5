//! Candidate generation and identity derivation.
//!
//! A candidate is raw BIP-39 entropy. The identity is the first account of the
//! standard Ethereum derivation path, so the same candidate always yields the same
//! address and secret key.

use crate::types::{Candidate, EntropySize, Identity};
use bip32::{DerivationPath, XPrv};
use bip39::Mnemonic;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// BIP-44 path of the first Ethereum account.
pub const ETH_DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Internal consistency failure while projecting a candidate into an identity.
#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("invalid candidate entropy: {0}")]
    Mnemonic(#[from] bip39::Error),
    #[error("key derivation failed: {0}")]
    Bip32(#[from] bip32::Error),
    #[error("derived secret key rejected: {0}")]
    SecretKey(#[from] secp256k1::Error),
}

impl Candidate {
    /// Fresh candidate from the OS random source, 12 or 24 words with equal probability.
    pub fn generate() -> Self {
        let size = if OsRng.gen_bool(0.5) {
            EntropySize::Bits256
        } else {
            EntropySize::Bits128
        };
        Self::generate_with_size(size)
    }

    pub fn generate_with_size(size: EntropySize) -> Self {
        let mut entropy = vec![0u8; size.byte_len()];
        OsRng.fill_bytes(&mut entropy);
        Candidate::from_entropy(entropy)
    }
}

/// Derive the identity for a candidate.
pub fn derive(candidate: &Candidate) -> Result<Identity, DerivationError> {
    let mnemonic = Mnemonic::from_entropy(candidate.entropy())?;
    let seed = mnemonic.to_seed_normalized("");

    let path: DerivationPath = ETH_DERIVATION_PATH.parse()?;
    let xprv = XPrv::derive_from_path(seed, &path)?;
    let secret_bytes = xprv.to_bytes();

    let secret_key = SecretKey::from_slice(&secret_bytes)?;
    let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);

    Ok(Identity {
        address: address_from_public_key(&public_key),
        secret_key: format!("0x{}", hex::encode(secret_bytes)),
        mnemonic: mnemonic.to_string(),
    })
}

/// Keccak-256 of the uncompressed key (without the 0x04 prefix), last 20 bytes.
fn address_from_public_key(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);
    to_checksum_address(&hash[12..])
}

/// EIP-55 mixed-case encoding of a 20-byte address.
pub fn to_checksum_address(address: &[u8]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(2 + lower.len());
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> if i % 2 == 0 { 4 } else { 0 }) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

//! Secure-channel handshake wire messages and the deterministic algorithm
//! selection both peers must compute identically.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use crate::error::HandshakeError;

pub const NONCE_LEN: usize = 16;

/// First handshake message, sent in the clear by both sides: the long-term
/// public key (protobuf encoding), a fresh nonce and ordered preference
/// lists per algorithm category.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, Eq, PartialEq)]
pub struct Propose {
    pub public_key: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub exchanges: Vec<String>,
    pub ciphers: Vec<String>,
    pub hashes: Vec<String>,
}

/// Second handshake message: the ephemeral key plus a signature by the
/// long-term identity key over the handshake transcript
/// (`local propose ‖ remote propose ‖ ephemeral key`).
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, Eq, PartialEq)]
pub struct Exchange {
    pub ephemeral_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyExchange {
    X25519,
}

impl KeyExchange {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X25519 => "X25519",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "X25519" => Some(Self::X25519),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cipher {
    Chacha20Poly1305,
    Aes256Gcm,
}

impl Cipher {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chacha20Poly1305 => "CHACHA20_POLY1305",
            Self::Aes256Gcm => "AES_256_GCM",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "CHACHA20_POLY1305" => Some(Self::Chacha20Poly1305),
            "AES_256_GCM" => Some(Self::Aes256Gcm),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SHA256" => Some(Self::Sha256),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Everything we support, in local preference order.
#[must_use]
pub fn supported_exchanges() -> Vec<String> {
    vec![KeyExchange::X25519.as_str().to_owned()]
}

#[must_use]
pub fn supported_ciphers() -> Vec<String> {
    vec![
        Cipher::Chacha20Poly1305.as_str().to_owned(),
        Cipher::Aes256Gcm.as_str().to_owned(),
    ]
}

#[must_use]
pub fn supported_hashes() -> Vec<String> {
    vec![
        HashAlgorithm::Sha256.as_str().to_owned(),
        HashAlgorithm::Sha512.as_str().to_owned(),
    ]
}

/// Which side's stretched key half is used for sending. Derived from the
/// same ordering hash that decides preference, so both peers agree without
/// an extra negotiation bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyOrder {
    LocalFirst,
    RemoteFirst,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Selection {
    pub exchange: KeyExchange,
    pub cipher: Cipher,
    pub hash: HashAlgorithm,
    pub order: KeyOrder,
}

/// Deterministically selects one algorithm per category.
///
/// The ordering rule is a peer-agreed compatibility contract: the peer
/// whose hash `SHA-256(other's public key ‖ own nonce)` compares greater
/// gets its preference order walked first, taking the first entry the
/// other side also lists. Both perspectives compute the same winner
/// because the two hash inputs swap symmetrically.
pub fn select_algorithms(local: &Propose, remote: &Propose) -> Result<Selection, HandshakeError> {
    let oh1 = ordering_hash(&remote.public_key, &local.nonce);
    let oh2 = ordering_hash(&local.public_key, &remote.nonce);

    // On equal hashes the peers share a key and nonce; either list works.
    let order = if oh1 >= oh2 {
        KeyOrder::LocalFirst
    } else {
        KeyOrder::RemoteFirst
    };

    let exchange = select_one(
        order,
        &local.exchanges,
        &remote.exchanges,
        KeyExchange::parse,
        "key exchange",
    )?;
    let cipher = select_one(order, &local.ciphers, &remote.ciphers, Cipher::parse, "cipher")?;
    let hash = select_one(order, &local.hashes, &remote.hashes, HashAlgorithm::parse, "hash")?;

    Ok(Selection {
        exchange,
        cipher,
        hash,
        order,
    })
}

fn ordering_hash(public_key: &[u8], nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(nonce);
    hasher.finalize().into()
}

fn select_one<T>(
    order: KeyOrder,
    local: &[String],
    remote: &[String],
    parse: impl Fn(&str) -> Option<T>,
    category: &'static str,
) -> Result<T, HandshakeError> {
    let (winner, loser) = match order {
        KeyOrder::LocalFirst => (local, remote),
        KeyOrder::RemoteFirst => (remote, local),
    };

    winner
        .iter()
        .filter(|name| loser.contains(name))
        .find_map(|name| parse(name))
        .ok_or(HandshakeError::NoCommonAlgorithm { category })
}

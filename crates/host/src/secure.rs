//! The secure channel: authenticates the remote peer and derives the
//! session keys every later byte is sealed under.
//!
//! Both sides send a `Propose` (identity key, nonce, algorithm
//! preferences), deterministically agree on one algorithm per category,
//! run an X25519 ephemeral exchange, then prove possession of their
//! long-term keys by signing the transcript in an `Exchange`. Key stretch
//! turns the shared secret into two directional key sets; the first sealed
//! record each way confirms the keys by MACing the peer's nonce. Nothing
//! before the switch is encrypted, nothing after it is sent in the clear.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use libp2p_identity::{Keypair, PeerId, PublicKey};
use rand::Rng;
use ring::{agreement, digest, hkdf, hmac};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;
use weft_host_primitives::error::HandshakeError;
use weft_host_primitives::handshake::{
    select_algorithms, supported_ciphers, supported_exchanges, supported_hashes, Exchange,
    HashAlgorithm, KeyOrder, Propose, Selection, NONCE_LEN,
};

mod session;

pub use session::SecureSession;
use session::{SecretCodec, MAX_RECORD_SIZE};

const KDF_CONTEXT: &[u8] = b"weft/secure-channel/1.0.0";

/// Per-direction key material produced by the stretch: an AEAD key, a MAC
/// key spent on the confirmation record, and the record nonce IV.
pub(crate) struct DirectionKeys {
    pub key: [u8; 32],
    pub mac: [u8; 32],
    pub iv: [u8; 12],
}

const DIRECTION_KEY_LEN: usize = 32 + 32 + 12;

impl DirectionKeys {
    fn from_okm(okm: &[u8]) -> Self {
        let mut keys = Self {
            key: [0; 32],
            mac: [0; 32],
            iv: [0; 12],
        };
        keys.key.copy_from_slice(&okm[..32]);
        keys.mac.copy_from_slice(&okm[32..64]);
        keys.iv.copy_from_slice(&okm[64..DIRECTION_KEY_LEN]);
        keys
    }
}

/// Secures an outbound connection, requiring the authenticated remote to
/// match `expected` when one is given.
pub async fn secure_outbound<T>(
    io: T,
    keypair: &Keypair,
    expected: Option<PeerId>,
    deadline: Duration,
) -> Result<(SecureSession<T>, PeerId), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    timeout(deadline, handshake(io, keypair, expected, Preferences::default()))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Secures an accepted inbound connection; the remote identity is learned,
/// not checked against an expectation.
pub async fn secure_inbound<T>(
    io: T,
    keypair: &Keypair,
    deadline: Duration,
) -> Result<(SecureSession<T>, PeerId), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    timeout(deadline, handshake(io, keypair, None, Preferences::default()))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

struct Preferences {
    exchanges: Vec<String>,
    ciphers: Vec<String>,
    hashes: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            exchanges: supported_exchanges(),
            ciphers: supported_ciphers(),
            hashes: supported_hashes(),
        }
    }
}

async fn handshake<T>(
    io: T,
    keypair: &Keypair,
    expected: Option<PeerId>,
    preferences: Preferences,
) -> Result<(SecureSession<T>, PeerId), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(
        io,
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_RECORD_SIZE)
            .new_codec(),
    );

    // Phase 1: proposals, in the clear.
    let local = Propose {
        public_key: keypair.public().encode_protobuf(),
        nonce: rand::thread_rng().gen(),
        exchanges: preferences.exchanges,
        ciphers: preferences.ciphers,
        hashes: preferences.hashes,
    };
    let local_bytes = borsh::to_vec(&local).map_err(|_| HandshakeError::Malformed)?;

    framed.send(Bytes::from(local_bytes.clone())).await?;
    let remote_bytes = framed
        .next()
        .await
        .ok_or(HandshakeError::Malformed)??
        .freeze();

    let remote: Propose =
        borsh::from_slice(&remote_bytes).map_err(|_| HandshakeError::Malformed)?;
    let remote_public = PublicKey::try_decode_protobuf(&remote.public_key)
        .map_err(|_| HandshakeError::Malformed)?;

    let selection = select_algorithms(&local, &remote)?;
    debug!(
        exchange = selection.exchange.as_str(),
        cipher = selection.cipher.as_str(),
        hash = selection.hash.as_str(),
        "handshake algorithms selected"
    );

    // Phase 2: ephemeral exchange, transcript signatures.
    let rng = ring::rand::SystemRandom::new();
    let ephemeral_private = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
        .map_err(|_| HandshakeError::Malformed)?;
    let ephemeral_public = ephemeral_private
        .compute_public_key()
        .map_err(|_| HandshakeError::Malformed)?;

    let transcript = [
        local_bytes.as_slice(),
        remote_bytes.as_ref(),
        ephemeral_public.as_ref(),
    ]
    .concat();
    let signature = keypair
        .sign(&transcript)
        .map_err(|_| HandshakeError::Malformed)?;

    let exchange = Exchange {
        ephemeral_key: ephemeral_public.as_ref().to_vec(),
        signature,
    };
    let exchange_bytes = borsh::to_vec(&exchange).map_err(|_| HandshakeError::Malformed)?;
    framed.send(Bytes::from(exchange_bytes)).await?;

    let remote_exchange_bytes = framed.next().await.ok_or(HandshakeError::Malformed)??;
    let remote_exchange: Exchange =
        borsh::from_slice(&remote_exchange_bytes).map_err(|_| HandshakeError::Malformed)?;

    let remote_transcript = [
        remote_bytes.as_ref(),
        local_bytes.as_slice(),
        remote_exchange.ephemeral_key.as_slice(),
    ]
    .concat();
    if !remote_public.verify(&remote_transcript, &remote_exchange.signature) {
        return Err(HandshakeError::AuthenticationFailed {
            reason: "bad transcript signature",
        });
    }

    // The peer id is re-derived from the proven key, never trusted as sent.
    let remote_peer = remote_public.to_peer_id();
    if let Some(expected) = expected {
        if expected != remote_peer {
            return Err(HandshakeError::AuthenticationFailed {
                reason: "peer id mismatch",
            });
        }
    }

    let peer_ephemeral = agreement::UnparsedPublicKey::new(
        &agreement::X25519,
        remote_exchange.ephemeral_key.as_slice(),
    );
    let (send_keys, recv_keys) = agreement::agree_ephemeral(ephemeral_private, &peer_ephemeral, {
        let local_bytes = local_bytes.as_slice();
        let remote_bytes = remote_bytes.as_ref();
        move |secret| {
            stretch_keys(
                secret,
                &selection,
                local_bytes,
                remote_bytes,
                &local.nonce,
                &remote.nonce,
            )
        }
    })
    .map_err(|_| HandshakeError::AuthenticationFailed {
        reason: "key agreement failed",
    })?
    .map_err(|_| HandshakeError::Malformed)?;

    // Phase 3: switch to sealed records and confirm the keys by returning
    // the peer's nonce under the new MAC keys.
    let confirm_out = confirmation_tag(selection.hash, &send_keys.mac, &remote.nonce);
    let verify_key = confirmation_key(selection.hash, &recv_keys.mac);

    let codec =
        SecretCodec::new(selection.cipher, &send_keys, &recv_keys).map_err(|_| HandshakeError::Malformed)?;
    let mut framed = framed.map_codec(|_| codec);

    framed.send(Bytes::from(confirm_out)).await?;
    let confirm_in = framed.next().await.ok_or(HandshakeError::Malformed)??;
    if hmac::verify(&verify_key, &local.nonce, confirm_in.as_ref()).is_err() {
        return Err(HandshakeError::AuthenticationFailed {
            reason: "key confirmation failed",
        });
    }

    debug!(peer_id = %remote_peer, "secure channel established");
    Ok((SecureSession::new(framed), remote_peer))
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Stretches the shared secret into both directions' key sets. The same
/// ordering that decided algorithm preference assigns the halves, so the
/// peers pick opposite send keys without another negotiation bit.
fn stretch_keys(
    secret: &[u8],
    selection: &Selection,
    local_propose: &[u8],
    remote_propose: &[u8],
    local_nonce: &[u8; NONCE_LEN],
    remote_nonce: &[u8; NONCE_LEN],
) -> Result<(DirectionKeys, DirectionKeys), ring::error::Unspecified> {
    let (first_propose, second_propose, first_nonce, second_nonce) = match selection.order {
        KeyOrder::LocalFirst => (local_propose, remote_propose, local_nonce, remote_nonce),
        KeyOrder::RemoteFirst => (remote_propose, local_propose, remote_nonce, local_nonce),
    };

    let algorithm = match selection.hash {
        HashAlgorithm::Sha256 => hkdf::HKDF_SHA256,
        HashAlgorithm::Sha512 => hkdf::HKDF_SHA512,
    };

    let mut salt = Vec::with_capacity(2 * NONCE_LEN);
    salt.extend_from_slice(first_nonce);
    salt.extend_from_slice(second_nonce);

    let transcript_digest = {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(first_propose);
        ctx.update(second_propose);
        ctx.finish()
    };
    let info: [&[u8]; 4] = [
        KDF_CONTEXT,
        transcript_digest.as_ref(),
        selection.cipher.as_str().as_bytes(),
        selection.hash.as_str().as_bytes(),
    ];

    let mut okm = [0_u8; 2 * DIRECTION_KEY_LEN];
    hkdf::Salt::new(algorithm, &salt)
        .extract(secret)
        .expand(&info, OkmLen(okm.len()))?
        .fill(&mut okm)?;

    let first = DirectionKeys::from_okm(&okm[..DIRECTION_KEY_LEN]);
    let second = DirectionKeys::from_okm(&okm[DIRECTION_KEY_LEN..]);

    Ok(match selection.order {
        KeyOrder::LocalFirst => (first, second),
        KeyOrder::RemoteFirst => (second, first),
    })
}

fn confirmation_key(hash: HashAlgorithm, mac: &[u8; 32]) -> hmac::Key {
    let algorithm = match hash {
        HashAlgorithm::Sha256 => hmac::HMAC_SHA256,
        HashAlgorithm::Sha512 => hmac::HMAC_SHA512,
    };
    hmac::Key::new(algorithm, mac)
}

fn confirmation_tag(hash: HashAlgorithm, mac: &[u8; 32], nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    hmac::sign(&confirmation_key(hash, mac), nonce)
        .as_ref()
        .to_vec()
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::try_join;

    use super::*;

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn handshake_authenticates_and_encrypts_both_ways() {
        let kp_a = Keypair::generate_ed25519();
        let kp_b = Keypair::generate_ed25519();
        let peer_a = kp_a.public().to_peer_id();
        let peer_b = kp_b.public().to_peer_id();

        let (a, b) = duplex(64 * 1024);
        let dial = secure_outbound(a, &kp_a, Some(peer_b), DEADLINE);
        let accept = secure_inbound(b, &kp_b, DEADLINE);

        let ((mut session_a, seen_by_a), (mut session_b, seen_by_b)) =
            try_join!(dial, accept).unwrap();
        assert_eq!(seen_by_a, peer_b);
        assert_eq!(seen_by_b, peer_a);

        session_a.write_all(b"from a").await.unwrap();
        session_a.flush().await.unwrap();
        let mut buf = [0_u8; 6];
        session_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from a");

        session_b.write_all(b"from b").await.unwrap();
        session_b.flush().await.unwrap();
        session_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from b");
    }

    #[tokio::test]
    async fn unexpected_peer_identity_is_rejected() {
        let kp_a = Keypair::generate_ed25519();
        let kp_b = Keypair::generate_ed25519();
        let somebody_else = Keypair::generate_ed25519().public().to_peer_id();

        let (a, b) = duplex(64 * 1024);
        let dial = secure_outbound(a, &kp_a, Some(somebody_else), DEADLINE);
        let accept = tokio::spawn(async move {
            // The dialer aborts; whatever the acceptor sees is fine.
            let _result = secure_inbound(b, &kp_b, DEADLINE).await;
        });

        let err = dial.await.unwrap_err();
        assert!(
            matches!(err, HandshakeError::AuthenticationFailed { reason: "peer id mismatch" }),
            "{err}"
        );
        accept.abort();
    }

    #[tokio::test]
    async fn disjoint_cipher_lists_fail_with_no_common_algorithm() {
        let kp_a = Keypair::generate_ed25519();
        let kp_b = Keypair::generate_ed25519();

        let only = |cipher: &str| Preferences {
            ciphers: vec![cipher.to_owned()],
            ..Preferences::default()
        };

        let (a, b) = duplex(64 * 1024);
        let dial = handshake(a, &kp_a, None, only("CHACHA20_POLY1305"));
        let accept = handshake(b, &kp_b, None, only("AES_256_GCM"));

        let (res_a, res_b) = tokio::join!(dial, accept);
        for res in [res_a.map(|_| ()), res_b.map(|_| ())] {
            let err = res.unwrap_err();
            assert!(
                matches!(err, HandshakeError::NoCommonAlgorithm { category: "cipher" }),
                "{err}"
            );
        }
    }

    #[tokio::test]
    async fn garbage_proposal_is_malformed() {
        let kp = Keypair::generate_ed25519();
        let (a, mut b) = duplex(64 * 1024);

        // A four-byte length prefix framing junk that is not a Propose.
        b.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();

        let err = secure_inbound(a, &kp, DEADLINE).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let kp = Keypair::generate_ed25519();
        let (a, _held_open) = duplex(64 * 1024);

        let err = secure_outbound(a, &kp, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout), "{err}");
    }
}

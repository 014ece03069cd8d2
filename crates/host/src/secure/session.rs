//! Post-handshake session framing: every byte crossing the wire after key
//! derivation travels inside an AEAD-sealed, length-delimited record.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};
use weft_host_primitives::handshake::Cipher;

use super::DirectionKeys;

/// Ceiling on one sealed record, tag included. Writers chunk below this;
/// the decoder tolerates remotes that chunk larger.
pub(crate) const MAX_RECORD_SIZE: usize = 1024 * 1024 + 64;

/// Plaintext cap per record produced by [`SecureSession`] writes.
const RECORD_DATA_CAP: usize = 64 * 1024;

/// Codec sealing outgoing records with the send key and opening incoming
/// ones with the receive key. Nonces are the direction's IV xored with a
/// per-record counter, so both sides stay in lockstep without carrying
/// nonces on the wire.
pub(crate) struct SecretCodec {
    inner: LengthDelimitedCodec,
    seal: LessSafeKey,
    seal_iv: [u8; 12],
    seal_counter: u64,
    open: LessSafeKey,
    open_iv: [u8; 12],
    open_counter: u64,
}

impl SecretCodec {
    pub(crate) fn new(
        cipher: Cipher,
        send: &DirectionKeys,
        recv: &DirectionKeys,
    ) -> Result<Self, ring::error::Unspecified> {
        let algorithm = match cipher {
            Cipher::Chacha20Poly1305 => &CHACHA20_POLY1305,
            Cipher::Aes256Gcm => &AES_256_GCM,
        };

        Ok(Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_RECORD_SIZE)
                .new_codec(),
            seal: LessSafeKey::new(UnboundKey::new(algorithm, &send.key)?),
            seal_iv: send.iv,
            seal_counter: 0,
            open: LessSafeKey::new(UnboundKey::new(algorithm, &recv.key)?),
            open_iv: recv.iv,
            open_counter: 0,
        })
    }
}

fn record_nonce(iv: &[u8; 12], counter: u64) -> Nonce {
    let mut bytes = *iv;
    for (b, c) in bytes[4..].iter_mut().zip(counter.to_be_bytes()) {
        *b ^= c;
    }
    Nonce::assume_unique_for_key(bytes)
}

impl Encoder<Bytes> for SecretCodec {
    type Error = io::Error;

    fn encode(&mut self, plaintext: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        let nonce = record_nonce(&self.seal_iv, self.seal_counter);
        self.seal_counter = self.seal_counter.wrapping_add(1);

        let mut record = plaintext.to_vec();
        self.seal
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut record)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record sealing failed"))?;

        self.inner.encode(Bytes::from(record), dst)
    }
}

impl Decoder for SecretCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        let Some(mut record) = self.inner.decode(src)? else {
            return Ok(None);
        };

        let nonce = record_nonce(&self.open_iv, self.open_counter);
        self.open_counter = self.open_counter.wrapping_add(1);

        let plaintext_len = self
            .open
            .open_in_place(nonce, Aad::empty(), &mut record)
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "record authentication failed")
            })?
            .len();
        record.truncate(plaintext_len);

        Ok(Some(record.freeze()))
    }
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec")
            .field("seal_counter", &self.seal_counter)
            .field("open_counter", &self.open_counter)
            .finish_non_exhaustive()
    }
}

/// An authenticated, encrypted duplex session. Implements `AsyncRead` and
/// `AsyncWrite` so the muxer can layer its own framing on top without
/// knowing about records.
pub struct SecureSession<T> {
    framed: Framed<T, SecretCodec>,
    read_buf: BytesMut,
}

impl<T> SecureSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(framed: Framed<T, SecretCodec>) -> Self {
        Self {
            framed,
            read_buf: BytesMut::new(),
        }
    }
}

impl<T> AsyncRead for SecureSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(this.framed.poll_next_unpin(cx)) {
                Some(Ok(plaintext)) => this.read_buf.extend_from_slice(&plaintext),
                Some(Err(err)) => return Poll::Ready(Err(err)),
                // Clean end of the secured connection.
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<T> AsyncWrite for SecureSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.framed.poll_ready_unpin(cx))?;

        let n = buf.len().min(RECORD_DATA_CAP);
        this.framed.start_send_unpin(Bytes::copy_from_slice(&buf[..n]))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().framed.poll_flush_unpin(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().framed.poll_close_unpin(cx)
    }
}

impl<T> fmt::Debug for SecureSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> DirectionKeys {
        DirectionKeys {
            key: [seed; 32],
            mac: [seed.wrapping_add(1); 32],
            iv: [seed.wrapping_add(2); 12],
        }
    }

    /// Two codec ends wired so that one's send keys are the other's
    /// receive keys.
    fn codec_pair(cipher: Cipher) -> (SecretCodec, SecretCodec) {
        let a = SecretCodec::new(cipher, &keys(1), &keys(9)).unwrap();
        let b = SecretCodec::new(cipher, &keys(9), &keys(1)).unwrap();
        (a, b)
    }

    #[test]
    fn sealed_records_roundtrip_in_order() {
        for cipher in [Cipher::Chacha20Poly1305, Cipher::Aes256Gcm] {
            let (mut a, mut b) = codec_pair(cipher);

            let mut wire = BytesMut::new();
            a.encode(Bytes::from_static(b"first"), &mut wire).unwrap();
            a.encode(Bytes::from_static(b"second"), &mut wire).unwrap();

            assert_eq!(b.decode(&mut wire).unwrap().unwrap(), "first");
            assert_eq!(b.decode(&mut wire).unwrap().unwrap(), "second");
            assert!(b.decode(&mut wire).unwrap().is_none());
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let (mut a, _) = codec_pair(Cipher::Chacha20Poly1305);
        let mut wire = BytesMut::new();
        a.encode(Bytes::from_static(b"cleartext?"), &mut wire).unwrap();

        let haystack = wire.as_ref();
        assert!(!haystack
            .windows(b"cleartext?".len())
            .any(|w| w == b"cleartext?"));
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let (mut a, mut b) = codec_pair(Cipher::Aes256Gcm);
        let mut wire = BytesMut::new();
        a.encode(Bytes::from_static(b"payload"), &mut wire).unwrap();

        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let err = b.decode(&mut wire).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn reordered_records_fail_authentication() {
        let (mut a, mut b) = codec_pair(Cipher::Chacha20Poly1305);

        let mut first = BytesMut::new();
        a.encode(Bytes::from_static(b"one"), &mut first).unwrap();
        let mut second = BytesMut::new();
        a.encode(Bytes::from_static(b"two"), &mut second).unwrap();

        // Delivering the second record first desynchronizes the counters.
        let err = b.decode(&mut second).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        drop(first);
    }
}

//! Encrypted transport wrapper.
//!
//! Wraps a raw byte stream in a ChaCha20 keystream before any protocol byte
//! moves, so even the handshake magic travels encrypted. The key is derived
//! from the shared secret with SHA-256; each side picks a random nonce for
//! its write direction and sends it in the clear as the first twelve stream
//! bytes, which keeps keystreams distinct across connections and directions.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const NONCE_LEN: usize = 12;
const WRITE_CHUNK: usize = 8 * 1024;

/// SHA-256 of the shared secret, as a cipher key.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// A byte stream with ChaCha20 applied in both directions.
pub struct CipherStream<S> {
    inner: S,
    read_cipher: ChaCha20,
    write_cipher: ChaCha20,
    write_buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> CipherStream<S> {
    /// Wrap `inner`, exchanging write-direction nonces first.
    ///
    /// Both ends must call this with the same secret before any other
    /// traffic; the nonce exchange is the only plaintext on the stream.
    pub async fn new(mut inner: S, secret: &str) -> io::Result<Self> {
        let key = derive_key(secret);

        let mut own_nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut own_nonce);
        inner.write_all(&own_nonce).await?;
        inner.flush().await?;

        let mut peer_nonce = [0u8; NONCE_LEN];
        inner.read_exact(&mut peer_nonce).await?;

        Ok(Self {
            read_cipher: ChaCha20::new(&key.into(), &peer_nonce.into()),
            write_cipher: ChaCha20::new(&key.into(), &own_nonce.into()),
            inner,
            write_buf: Vec::new(),
        })
    }

    /// Give the wrapped stream back.
    pub fn into_inner(self) -> S {
        self.inner
    }

    // Push buffered ciphertext down to the inner stream. The buffer holds at
    // most one encrypted chunk, and retrying the inner write must not touch
    // the keystream again, which is why plaintext is never re-encrypted.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.read_cipher.apply_keystream(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(WRITE_CHUNK);
        this.write_buf.extend_from_slice(&buf[..n]);
        this.write_cipher.apply_keystream(&mut this.write_buf);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_both_directions_roundtrip() {
        let (a, b) = duplex(4096);
        let (mut alice, mut bob) = tokio::try_join!(
            CipherStream::new(a, "table stakes"),
            CipherStream::new(b, "table stakes"),
        )
        .unwrap();

        alice.write_all(b"two of spades").await.unwrap();
        alice.flush().await.unwrap();
        let mut got = [0u8; 13];
        bob.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"two of spades");

        bob.write_all(b"ace high").await.unwrap();
        bob.flush().await.unwrap();
        let mut got = [0u8; 8];
        alice.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ace high");
    }

    #[tokio::test]
    async fn test_wire_bytes_are_not_plaintext() {
        let (a, mut raw) = duplex(4096);

        let cipher_side = tokio::spawn(async move {
            let mut stream = CipherStream::new(a, "hidden").await.unwrap();
            stream.write_all(b"royal flush!").await.unwrap();
            stream.flush().await.unwrap();
            stream
        });

        // Play the peer by hand: swap nonces, then read raw ciphertext.
        raw.write_all(&[7u8; NONCE_LEN]).await.unwrap();
        let mut peer_nonce = [0u8; NONCE_LEN];
        raw.read_exact(&mut peer_nonce).await.unwrap();

        let mut on_wire = [0u8; 12];
        raw.read_exact(&mut on_wire).await.unwrap();
        assert_ne!(&on_wire, b"royal flush!");

        cipher_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_secrets_garble_traffic() {
        let (a, b) = duplex(4096);
        let (mut alice, mut eve) = tokio::try_join!(
            CipherStream::new(a, "right"),
            CipherStream::new(b, "wrong"),
        )
        .unwrap();

        alice.write_all(b"queen of hearts").await.unwrap();
        alice.flush().await.unwrap();
        let mut got = [0u8; 15];
        eve.read_exact(&mut got).await.unwrap();
        assert_ne!(&got, b"queen of hearts");
    }

    #[tokio::test]
    async fn test_large_transfer_crosses_chunk_boundary() {
        let (a, b) = duplex(64 * 1024);
        let (mut tx, mut rx) = tokio::try_join!(
            CipherStream::new(a, "bulk"),
            CipherStream::new(b, "bulk"),
        )
        .unwrap();

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            tx.flush().await.unwrap();
            tx
        });

        let mut got = vec![0u8; expect.len()];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expect);
        writer.await.unwrap();
    }
}

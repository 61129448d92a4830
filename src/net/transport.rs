//! Transport Wrappers
//!
//! Every connection wears exactly one byte-stream wrapper underneath the
//! command codec: the ChaCha20 cipher when a shared secret is configured,
//! the adaptive bit packer otherwise. The wrapper is installed before any
//! handshake byte moves, so even the magic number travels covered.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::wire::{CipherStream, PackedStream};

/// First eight bytes on every connection, big endian: `PARLOR01`.
pub const WIRE_MAGIC: i64 = 0x5041_524c_4f52_3031;

/// A byte stream wearing its configured wrapper.
pub enum WireStream<S> {
    /// Encrypted transport, keyed from the shared secret.
    Cipher(CipherStream<S>),
    /// Compressed transport for secretless tables.
    Packed(PackedStream<S>),
}

/// Wrap a raw stream according to the configured secret.
///
/// The cipher variant exchanges nonces on the wire, so both ends must
/// call this before anything else touches the stream.
pub async fn wrap<S>(stream: S, cipher_secret: Option<&str>) -> io::Result<WireStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match cipher_secret {
        Some(secret) => Ok(WireStream::Cipher(CipherStream::new(stream, secret).await?)),
        None => Ok(WireStream::Packed(PackedStream::new(stream))),
    }
}

/// Write the magic number and flush it through the wrapper.
pub async fn send_magic<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&WIRE_MAGIC.to_be_bytes()).await?;
    stream.flush().await
}

/// Read eight bytes and require the magic number.
pub async fn expect_magic<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await?;
    if i64::from_be_bytes(buf) != WIRE_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad magic number",
        ));
    }
    Ok(())
}

/// Fresh random nonce for a password challenge.
pub(crate) fn challenge_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The digest a challenged client must answer with: the hex SHA-256 of
/// the nonce followed by the password. The password itself never crosses
/// the wire.
pub(crate) fn password_digest(nonce: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl<S> AsyncRead for WireStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WireStream::Cipher(s) => Pin::new(s).poll_read(cx, buf),
            WireStream::Packed(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for WireStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WireStream::Cipher(s) => Pin::new(s).poll_write(cx, data),
            WireStream::Packed(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WireStream::Cipher(s) => Pin::new(s).poll_flush(cx),
            WireStream::Packed(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WireStream::Cipher(s) => Pin::new(s).poll_shutdown(cx),
            WireStream::Packed(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

//! Bit-packing transport wrapper.
//!
//! The no-cipher fallback: shrinks traffic, hides nothing. Both ends keep an
//! identical byte-frequency model; each byte travels as a prefix code of its
//! current frequency rank, so the hot symbols of this wire (low integers,
//! tags, length prefixes) cost three bits instead of eight. Model updates are
//! driven purely by the byte sequence, which keeps encoder and decoder in
//! lockstep without ever exchanging the table.
//!
//! Each write becomes one block: `u16 plain_len | u16 packed_len | bytes`.
//! A `packed_len` of zero marks an incompressible block stored raw.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const MAX_BLOCK: usize = 60_000;
const BLOCK_HEADER: usize = 4;

// =============================================================================
// FREQUENCY MODEL
// =============================================================================

// Rank prefix code:
//   ranks   0..4   "0"   + 2 bits
//   ranks   4..20  "10"  + 4 bits
//   ranks  20..84  "110" + 6 bits
//   ranks 84..256  "111" + 8 bits

#[derive(Debug, Clone)]
struct Model {
    byte_at: [u8; 256],
    rank_of: [u16; 256],
    freq: [u32; 256],
}

impl Model {
    fn new() -> Self {
        let mut byte_at = [0u8; 256];
        let mut rank_of = [0u16; 256];
        for i in 0..256 {
            byte_at[i] = i as u8;
            rank_of[i] = i as u16;
        }
        Self {
            byte_at,
            rank_of,
            freq: [0; 256],
        }
    }

    fn rank(&self, byte: u8) -> u16 {
        self.rank_of[byte as usize]
    }

    // Count the byte and bubble it up while it outweighs its neighbor.
    fn bump(&mut self, byte: u8) {
        let f = self.freq[byte as usize].saturating_add(1);
        self.freq[byte as usize] = f;
        let mut rank = self.rank_of[byte as usize] as usize;
        while rank > 0 {
            let above = self.byte_at[rank - 1];
            if self.freq[above as usize] >= f {
                break;
            }
            self.byte_at[rank] = above;
            self.byte_at[rank - 1] = byte;
            self.rank_of[above as usize] = rank as u16;
            self.rank_of[byte as usize] = (rank - 1) as u16;
            rank -= 1;
        }
    }
}

// =============================================================================
// BIT CODER
// =============================================================================

struct BitWriter {
    bytes: Vec<u8>,
    cur: u8,
    used: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            cur: 0,
            used: 0,
        }
    }

    fn push_bits(&mut self, value: u16, count: u8) {
        for i in (0..count).rev() {
            self.cur = (self.cur << 1) | (((value >> i) & 1) as u8);
            self.used += 1;
            if self.used == 8 {
                self.bytes.push(self.cur);
                self.cur = 0;
                self.used = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.cur <<= 8 - self.used;
            self.bytes.push(self.cur);
        }
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bits(&mut self, count: u8) -> Option<u16> {
        let mut value = 0u16;
        for _ in 0..count {
            let byte = *self.bytes.get(self.pos / 8)?;
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | u16::from(bit);
            self.pos += 1;
        }
        Some(value)
    }
}

fn write_symbol(out: &mut BitWriter, rank: u16) {
    match rank {
        0..=3 => {
            out.push_bits(0b0, 1);
            out.push_bits(rank, 2);
        }
        4..=19 => {
            out.push_bits(0b10, 2);
            out.push_bits(rank - 4, 4);
        }
        20..=83 => {
            out.push_bits(0b110, 3);
            out.push_bits(rank - 20, 6);
        }
        _ => {
            out.push_bits(0b111, 3);
            out.push_bits(rank - 84, 8);
        }
    }
}

fn read_symbol(input: &mut BitReader<'_>) -> Option<u16> {
    if input.read_bits(1)? == 0 {
        return input.read_bits(2);
    }
    if input.read_bits(1)? == 0 {
        return Some(4 + input.read_bits(4)?);
    }
    if input.read_bits(1)? == 0 {
        return Some(20 + input.read_bits(6)?);
    }
    Some(84 + input.read_bits(8)?)
}

// One block: header plus packed or raw body. Model updates depend only on
// the plaintext sequence, so the raw fallback keeps both ends in lockstep.
fn encode_block(model: &mut Model, plain: &[u8]) -> Vec<u8> {
    let mut bits = BitWriter::new();
    for &byte in plain {
        write_symbol(&mut bits, model.rank(byte));
        model.bump(byte);
    }
    let packed = bits.finish();

    let mut out = Vec::with_capacity(BLOCK_HEADER + packed.len().min(plain.len()));
    out.extend_from_slice(&(plain.len() as u16).to_be_bytes());
    if packed.len() < plain.len() {
        out.extend_from_slice(&(packed.len() as u16).to_be_bytes());
        out.extend_from_slice(&packed);
    } else {
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(plain);
    }
    out
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

// =============================================================================
// PACKED STREAM
// =============================================================================

/// A byte stream with adaptive bit packing in both directions.
#[derive(Debug)]
pub struct PackedStream<S> {
    inner: S,
    write_model: Model,
    read_model: Model,
    out_buf: Vec<u8>,
    in_raw: Vec<u8>,
    in_plain: Vec<u8>,
    in_plain_pos: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PackedStream<S> {
    /// Wrap `inner`. No bytes are exchanged up front; both models start
    /// identical and stay synchronized through the traffic itself.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            write_model: Model::new(),
            read_model: Model::new(),
            out_buf: Vec::new(),
            in_raw: Vec::new(),
            in_plain: Vec::new(),
            in_plain_pos: 0,
        }
    }

    /// Give the wrapped stream back.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.out_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_buf.drain(..n);
        }
        Poll::Ready(Ok(()))
    }

    // Decode one complete block out of `in_raw`, if one has arrived.
    fn try_decode_block(&mut self) -> io::Result<bool> {
        if self.in_raw.len() < BLOCK_HEADER {
            return Ok(false);
        }
        let plain_len = u16::from_be_bytes([self.in_raw[0], self.in_raw[1]]) as usize;
        let packed_len = u16::from_be_bytes([self.in_raw[2], self.in_raw[3]]) as usize;
        let body_len = if packed_len == 0 { plain_len } else { packed_len };
        if self.in_raw.len() < BLOCK_HEADER + body_len {
            return Ok(false);
        }

        let body = &self.in_raw[BLOCK_HEADER..BLOCK_HEADER + body_len];
        if packed_len == 0 {
            for &byte in body {
                self.read_model.bump(byte);
            }
            self.in_plain.extend_from_slice(body);
        } else {
            let mut bits = BitReader::new(body);
            for _ in 0..plain_len {
                let rank =
                    read_symbol(&mut bits).ok_or_else(|| invalid_data("packed block underrun"))?;
                if rank > 255 {
                    return Err(invalid_data("packed rank out of range"));
                }
                let byte = self.read_model.byte_at[rank as usize];
                self.read_model.bump(byte);
                self.in_plain.push(byte);
            }
        }
        self.in_raw.drain(..BLOCK_HEADER + body_len);
        Ok(true)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for PackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.in_plain_pos < this.in_plain.len() {
                let avail = &this.in_plain[this.in_plain_pos..];
                let n = avail.len().min(buf.remaining());
                buf.put_slice(&avail[..n]);
                this.in_plain_pos += n;
                if this.in_plain_pos == this.in_plain.len() {
                    this.in_plain.clear();
                    this.in_plain_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if this.try_decode_block()? {
                continue;
            }

            let mut tmp = [0u8; 8192];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf))?;
            if tmp_buf.filled().is_empty() {
                if this.in_raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            this.in_raw.extend_from_slice(tmp_buf.filled());
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for PackedStream<S> {
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
        let n = buf.len().min(MAX_BLOCK);
        let block = encode_block(&mut this.write_model, &buf[..n]);
        this.out_buf.extend_from_slice(&block);
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

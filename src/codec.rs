//! Stream transforms that keep the tunnel payload inoffensive on the wire:
//! a byte-wise XOR mask and a packer that turns arbitrary bytes into a valid
//! UTF-8 code-point sequence (so the stream survives text-frame validation).
//!
//! The transforms are plain `AsyncRead`/`AsyncWrite` adapters without any
//! framing; EOF passes straight through.

use crate::common::{BoxedIo, TunnelIo};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// XOR mask applied between the two tunnel ends.
pub const TUNNEL_MASK: u8 = 0x56;

/// XOR applied to low-ASCII bytes by the UTF-8 packer.
const PACK_MASK: u8 = 0x55;

/// Staging buffer bound for the masking writer.
const MASK_BUF: usize = 2048;

/// How much input a single packer write consumes before handing off.
const PACK_CHUNK: usize = 1024;

/// Reader that XORs every byte with a fixed mask. The inverse of
/// [`MaskWriter`] with the same mask, and of itself applied twice.
pub struct MaskReader<R> {
    inner: R,
    mask: u8,
}

impl<R> MaskReader<R> {
    pub fn new(inner: R, mask: u8) -> Self {
        Self { inner, mask }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MaskReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let already = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let mask = self.mask;
        for b in &mut buf.filled_mut()[already..] {
            *b ^= mask;
        }
        Poll::Ready(Ok(()))
    }
}

/// Writer that XORs every byte with a fixed mask before passing it on.
/// Masking happens in a bounded staging buffer so the caller's data is
/// never modified in place.
pub struct MaskWriter<W> {
    inner: W,
    mask: u8,
    staging: Box<[u8; MASK_BUF]>,
}

impl<W> MaskWriter<W> {
    pub fn new(inner: W, mask: u8) -> Self {
        Self {
            inner,
            mask,
            staging: Box::new([0u8; MASK_BUF]),
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for MaskWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        let n = buf.len().min(MASK_BUF);
        for (dst, src) in me.staging[..n].iter_mut().zip(&buf[..n]) {
            *dst = *src ^ me.mask;
        }
        Pin::new(&mut me.inner).poll_write(cx, &me.staging[..n])
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Writer that packs an arbitrary byte stream into valid UTF-8.
///
/// Bytes below 0x80 are emitted as themselves XOR 0x55. A byte with the high
/// bit set is combined with its successor into a 16-bit scalar when that
/// would not land in the UTF-16 surrogate range; otherwise (or at the end of
/// the input) it is encoded alone as the two-byte scalar of its own value,
/// which keeps surrogate code points out of the output entirely.
pub struct Utf8PackWriter<W> {
    inner: W,
    pending: Vec<u8>,
    pos: usize,
}

impl<W> Utf8PackWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(2 * PACK_CHUNK),
            pos: 0,
        }
    }

    fn encode_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut j = 0;
        let mut utf8 = [0u8; 4];
        while j < chunk.len() {
            let v = chunk[j];
            if v < 0x80 {
                self.pending.push(v ^ PACK_MASK);
                j += 1;
                continue;
            }
            let mut scalar = v as u32;
            if v & 0xF8 != 0xD8 && j + 1 < chunk.len() {
                scalar = (scalar << 8) | chunk[j + 1] as u32;
                j += 2;
            } else {
                j += 1;
            }
            let ch = char::from_u32(scalar).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "packed scalar out of range")
            })?;
            self.pending
                .extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> Utf8PackWriter<W> {
    /// Push staged output down to the inner writer; ready once empty.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.pending.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Utf8PackWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        ready!(me.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let take = buf.len().min(PACK_CHUNK);
        me.encode_chunk(&buf[..take])?;

        // Opportunistic drain; staged bytes are owed to the inner writer and
        // the next write or flush finishes the job.
        match me.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        ready!(me.poll_drain(cx))?;
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        ready!(me.poll_drain(cx))?;
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}

/// Reader that reverses [`Utf8PackWriter`].
///
/// Partial UTF-8 sequences at a read boundary stay buffered until the rest
/// arrives. When a decoded scalar expands to more bytes than the caller's
/// buffer has room for, the overflow is held in a four-byte residue and
/// drained first on the next read.
pub struct Utf8UnpackReader<R> {
    inner: R,
    raw: Vec<u8>,
    consumed: usize,
    residue: [u8; 4],
    residue_len: usize,
    residue_pos: usize,
}

impl<R> Utf8UnpackReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            raw: Vec::with_capacity(2 * PACK_CHUNK),
            consumed: 0,
            residue: [0u8; 4],
            residue_len: 0,
            residue_pos: 0,
        }
    }

    /// Decode one scalar from the front of `bytes`. `None` means the buffer
    /// ends mid-sequence.
    fn next_scalar(bytes: &[u8]) -> io::Result<Option<(u32, usize)>> {
        let Some(&first) = bytes.first() else {
            return Ok(None);
        };
        let width = match first {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid UTF-8 lead byte in tunnel stream",
                ))
            }
        };
        if bytes.len() < width {
            return Ok(None);
        }
        match std::str::from_utf8(&bytes[..width])
            .ok()
            .and_then(|s| s.chars().next())
        {
            Some(ch) => Ok(Some((ch as u32, width))),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid UTF-8 sequence in tunnel stream",
            )),
        }
    }

    /// Expand one scalar into output bytes, spilling into the residue when
    /// the caller's buffer fills up.
    fn emit(&mut self, scalar: u32, out: &mut ReadBuf<'_>) -> io::Result<()> {
        if scalar < 0x80 {
            out.put_slice(&[(scalar as u8) ^ PACK_MASK]);
            return Ok(());
        }
        if scalar < 0x100 {
            out.put_slice(&[scalar as u8]);
            return Ok(());
        }
        if scalar < 0x8000 {
            // The packer never forms these; whatever produced them was not
            // our peer.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unpacked scalar in forbidden range",
            ));
        }
        let width = match scalar {
            0..=0xFFFF => 2,
            0x1_0000..=0xFF_FFFF => 3,
            _ => 4,
        };
        let be = scalar.to_be_bytes();
        let bytes = &be[4 - width..];
        let fits = out.remaining().min(width);
        out.put_slice(&bytes[..fits]);
        if fits < width {
            let spill = &bytes[fits..];
            self.residue[..spill.len()].copy_from_slice(spill);
            self.residue_len = spill.len();
            self.residue_pos = 0;
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Utf8UnpackReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut produced = false;
        if me.residue_pos < me.residue_len {
            let n = (me.residue_len - me.residue_pos).min(out.remaining());
            out.put_slice(&me.residue[me.residue_pos..me.residue_pos + n]);
            me.residue_pos += n;
            if me.residue_pos == me.residue_len {
                me.residue_len = 0;
                me.residue_pos = 0;
            }
            if out.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            produced = true;
        }

        loop {
            // Decode everything already buffered.
            while out.remaining() > 0 {
                match Self::next_scalar(&me.raw[me.consumed..])? {
                    Some((scalar, width)) => {
                        me.consumed += width;
                        me.emit(scalar, out)?;
                        produced = true;
                    }
                    None => break,
                }
            }
            if me.consumed > 0 {
                me.raw.drain(..me.consumed);
                me.consumed = 0;
            }
            if produced || out.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            // Need more input before anything can be emitted.
            let mut chunk = [0u8; MASK_BUF];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut me.inner).poll_read(cx, &mut chunk_buf))?;
            let filled = chunk_buf.filled();
            if filled.is_empty() {
                if !me.raw.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "tunnel stream ended mid-sequence",
                    )));
                }
                return Poll::Ready(Ok(()));
            }
            me.raw.extend_from_slice(filled);
        }
    }
}

/// One end of a tunnel with its transforms applied, recombined into a single
/// bidirectional stream.
pub struct TunnelStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Wrap the client end of a tunnel. The server-to-client direction is
/// unmasked on read; client-to-server leaves unmasked. With `text` set, the
/// outermost layer on the wire is the UTF-8 packing in both directions.
pub fn client_stream(io: BoxedIo, mask: u8, text: bool) -> TunnelStream {
    let (r, w) = tokio::io::split(io);
    if text {
        TunnelStream {
            reader: Box::new(MaskReader::new(Utf8UnpackReader::new(r), mask)),
            writer: Box::new(Utf8PackWriter::new(w)),
        }
    } else {
        TunnelStream {
            reader: Box::new(MaskReader::new(r, mask)),
            writer: Box::new(w),
        }
    }
}

/// Wrap the server end of a tunnel; the mirror image of [`client_stream`].
pub fn server_stream(io: BoxedIo, mask: u8, text: bool) -> TunnelStream {
    let (r, w) = tokio::io::split(io);
    if text {
        TunnelStream {
            reader: Box::new(Utf8UnpackReader::new(r)),
            writer: Box::new(MaskWriter::new(Utf8PackWriter::new(w), mask)),
        }
    } else {
        TunnelStream {
            reader: Box::new(r),
            writer: Box::new(MaskWriter::new(w, mask)),
        }
    }
}

/// Erase the concrete stream type behind the common IO trait object.
pub fn boxed<S: TunnelIo + 'static>(io: S) -> BoxedIo {
    Box::new(io)
}

//! PROXY protocol (v1 text, v2 binary) header unwrapping.
//!
//! A header is optional: a connection that does not start with one is
//! passed through untouched. Bytes read past the header are replayed to the
//! next reader through [`PrefixedStream`].

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::config::ProxyProtocolMode;

const V1_PREFIX: &[u8] = b"PROXY ";
/// Longest legal v1 line, CRLF included.
const V1_MAX_LEN: usize = 107;
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";
const V2_FIXED_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("i/o error while reading header: {0}")]
    Io(#[from] io::Error),

    #[error("malformed header: {0}")]
    Malformed(String),

    #[error("header version {found} not accepted in mode {mode:?}")]
    VersionNotAllowed { found: u8, mode: ProxyProtocolMode },
}

/// Addresses carried by a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

/// A stream with already-read bytes put back in front.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detected {
    V1,
    V2,
    None,
}

/// Read an optional PROXY header from the start of `stream`.
///
/// Returns the stream with any over-read bytes restored, and the header
/// addresses when the header carried any (`LOCAL` and `UNKNOWN` do not).
pub async fn accept<S>(
    mut stream: S,
    mode: ProxyProtocolMode,
) -> Result<(PrefixedStream<S>, Option<ProxyHeader>), ProxyProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);

    let detected = loop {
        match detect(&buf) {
            Some(detected) => break detected,
            None => {
                if stream.read_buf(&mut buf).await? == 0 {
                    break Detected::None;
                }
            }
        }
    };

    let header = match detected {
        Detected::None => None,
        Detected::V1 => {
            if mode == ProxyProtocolMode::V2 {
                return Err(ProxyProtocolError::VersionNotAllowed { found: 1, mode });
            }
            let line = read_until_crlf(&mut stream, &mut buf).await?;
            parse_v1(&line)?
        }
        Detected::V2 => {
            if mode == ProxyProtocolMode::V1 {
                return Err(ProxyProtocolError::VersionNotAllowed { found: 2, mode });
            }
            fill(&mut stream, &mut buf, V2_FIXED_LEN).await?;
            let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
            fill(&mut stream, &mut buf, V2_FIXED_LEN + len).await?;
            let block = buf.split_to(V2_FIXED_LEN + len);
            parse_v2(&block)?
        }
    };

    Ok((PrefixedStream::new(buf.freeze(), stream), header))
}

/// Decide once enough bytes are buffered; `None` asks for more.
///
/// Both versions are always recognized; the mode is enforced by the caller.
fn detect(buf: &[u8]) -> Option<Detected> {
    if buf.is_empty() {
        return None;
    }

    let candidates: [(&[u8], Detected); 2] = [(V1_PREFIX, Detected::V1), (V2_SIGNATURE, Detected::V2)];

    let mut undecided = false;
    for (magic, kind) in &candidates {
        let n = buf.len().min(magic.len());
        if buf[..n] != magic[..n] {
            continue;
        }
        if n == magic.len() {
            return Some(*kind);
        }
        undecided = true;
    }

    if undecided {
        None
    } else {
        Some(Detected::None)
    }
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut, len: usize) -> Result<(), ProxyProtocolError> {
    while buf.len() < len {
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyProtocolError::Malformed("truncated header".to_string()));
        }
    }
    Ok(())
}

async fn read_until_crlf<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<BytesMut, ProxyProtocolError> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(buf.split_to(pos + 2));
        }
        if buf.len() >= V1_MAX_LEN {
            return Err(ProxyProtocolError::Malformed("v1 header too long".to_string()));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyProtocolError::Malformed("truncated header".to_string()));
        }
    }
}

fn parse_v1(line: &[u8]) -> Result<Option<ProxyHeader>, ProxyProtocolError> {
    let malformed = |reason: &str| ProxyProtocolError::Malformed(reason.to_string());

    let text = std::str::from_utf8(line).map_err(|_| malformed("v1 header is not ascii"))?;
    let mut fields = text.trim_end_matches("\r\n").split(' ');
    fields.next();

    match fields.next() {
        Some("UNKNOWN") => return Ok(None),
        Some("TCP4") | Some("TCP6") => {}
        _ => return Err(malformed("unsupported v1 protocol")),
    }

    let mut next = |what: &str| fields.next().ok_or_else(|| malformed(what));
    let src_ip: IpAddr = next("missing source address")?.parse().map_err(|_| malformed("bad source address"))?;
    let dst_ip: IpAddr = next("missing destination address")?
        .parse()
        .map_err(|_| malformed("bad destination address"))?;
    let src_port: u16 = next("missing source port")?.parse().map_err(|_| malformed("bad source port"))?;
    let dst_port: u16 = next("missing destination port")?
        .parse()
        .map_err(|_| malformed("bad destination port"))?;

    Ok(Some(ProxyHeader {
        source: SocketAddr::new(src_ip, src_port),
        destination: SocketAddr::new(dst_ip, dst_port),
    }))
}

fn parse_v2(block: &[u8]) -> Result<Option<ProxyHeader>, ProxyProtocolError> {
    let version = block[12] >> 4;
    let command = block[12] & 0x0f;
    if version != 2 {
        return Err(ProxyProtocolError::Malformed(format!("unknown v2 version {version}")));
    }
    // LOCAL: health checks from the proxy itself.
    if command == 0 {
        return Ok(None);
    }

    let addrs = &block[V2_FIXED_LEN..];
    match block[13] >> 4 {
        1 if addrs.len() >= 12 => {
            let src = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let dst = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(IpAddr::V4(src), u16::from_be_bytes([addrs[8], addrs[9]])),
                destination: SocketAddr::new(IpAddr::V4(dst), u16::from_be_bytes([addrs[10], addrs[11]])),
            }))
        }
        2 if addrs.len() >= 36 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&addrs[0..16]);
            dst.copy_from_slice(&addrs[16..32]);
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), u16::from_be_bytes([addrs[32], addrs[33]])),
                destination: SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(dst)),
                    u16::from_be_bytes([addrs[34], addrs[35]]),
                ),
            }))
        }
        // AF_UNSPEC and unix sockets carry nothing usable.
        0 | 3 => Ok(None),
        _ => Err(ProxyProtocolError::Malformed("truncated v2 address block".to_string())),
    }
}

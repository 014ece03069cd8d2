//! Per-stream protocol negotiation.
//!
//! Each side of a freshly opened stream runs one half of a simple
//! line-oriented exchange: the initiator proposes protocol ids from an
//! ordered candidate list, the responder echoes an id it has a binding for
//! or answers `na`. Lines are `uvarint(len) ++ utf8 ++ '\n'`. A failure
//! here kills only the stream, never the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use weft_host_primitives::error::NegotiationError;

/// Responder's rejection line.
const NA: &str = "na";

/// Longest accepted negotiation line, terminator included. Protocol ids
/// are short paths like `/ipfs/ping/1.0.0`; anything near this limit is
/// garbage.
const MAX_LINE_LEN: u64 = 1024;

/// Initiator half: proposes `candidates` in order until one is echoed.
///
/// Exhausting the list yields [`NegotiationError::NoSuchProtocol`]. Any
/// reply other than an echo or `na` is malformed.
pub async fn dial<S>(io: &mut S, candidates: &[&str]) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for candidate in candidates {
        write_line(io, candidate).await?;
        let reply = read_line(io).await?;

        if reply == *candidate {
            trace!(protocol = %reply, "negotiated protocol");
            return Ok(reply);
        }
        if reply == NA {
            debug!(protocol = %candidate, "peer rejected protocol");
            continue;
        }
        return Err(NegotiationError::Malformed);
    }

    Err(NegotiationError::NoSuchProtocol)
}

/// Responder half: echoes the first proposed id for which `supported`
/// holds, answering `na` to the rest. Returns the bound protocol id.
pub async fn listen<S>(
    io: &mut S,
    supported: impl Fn(&str) -> bool,
) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let proposed = read_line(io).await?;
        if proposed == NA {
            return Err(NegotiationError::Malformed);
        }
        if supported(&proposed) {
            write_line(io, &proposed).await?;
            trace!(protocol = %proposed, "accepted proposed protocol");
            return Ok(proposed);
        }
        debug!(protocol = %proposed, "rejecting unbound protocol");
        write_line(io, NA).await?;
    }
}

async fn write_line<S>(io: &mut S, line: &str) -> Result<(), NegotiationError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(line.len() + 6);
    let mut len = line.len() as u64 + 1;
    while len >= 0x80 {
        #[expect(clippy::cast_possible_truncation, reason = "masked to 7 bits")]
        buf.push((len & 0x7f) as u8 | 0x80);
        len >>= 7;
    }
    #[expect(clippy::cast_possible_truncation, reason = "below 0x80")]
    buf.push(len as u8);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');

    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

async fn read_line<S>(io: &mut S) -> Result<String, NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let mut len: u64 = 0;
    let mut shift = 0_u32;
    loop {
        let byte = io.read_u8().await?;
        len |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        // Two uvarint bytes already cover MAX_LINE_LEN.
        if shift > 14 || len > MAX_LINE_LEN {
            return Err(NegotiationError::Malformed);
        }
    }
    // The shortest valid line is a bare terminator; ids must be non-empty.
    if len < 2 || len > MAX_LINE_LEN {
        return Err(NegotiationError::Malformed);
    }

    #[expect(clippy::cast_possible_truncation, reason = "bounded by MAX_LINE_LEN")]
    let mut buf = vec![0_u8; len as usize];
    io.read_exact(&mut buf).await?;

    if buf.pop() != Some(b'\n') {
        return Err(NegotiationError::Malformed);
    }
    String::from_utf8(buf).map_err(|_| NegotiationError::Malformed)
}

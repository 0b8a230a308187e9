//! The per-connection XVC command loop (C5). Parses `getinfo:`, `settck:`,
//! and `shift:` off a TCP byte stream, drives the shift planner for the
//! latter, and writes replies back before reading the next command.

use eyre::{Result, eyre};
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;
use xvcd_io::{PacketLimits, plan_shift, unpack_chunk};

use crate::session::Session;

const GETINFO: &[u8] = b"getinfo:";
const SETTCK: &[u8] = b"settck:";
const SHIFT: &[u8] = b"shift:";

/// Serves XVC commands on `stream` until EOF or a protocol/USB error, at
/// which point `Err` propagates to the caller. Either way the connection is
/// over: a malformed command or USB transport failure both end this one
/// session; the caller (the accept loop) logs it, reopens the USB device,
/// and moves on to the next client per spec §5/§7.
pub async fn serve_connection(stream: &mut TcpStream, session: &mut Session) -> Result<()> {
    loop {
        match read_command(stream).await? {
            Some(Command::GetInfo) => handle_getinfo(stream, session).await?,
            Some(Command::SetTck { period_ns }) => handle_settck(stream, session, period_ns).await?,
            Some(Command::Shift { n_bits }) => handle_shift(stream, session, n_bits).await?,
            None => return Ok(()),
        }
    }
}

enum Command {
    GetInfo,
    SetTck { period_ns: u32 },
    Shift { n_bits: u32 },
}

/// Reads one command's fixed literal + any leading fields. Returns `Ok(None)`
/// on clean EOF before a command starts; a malformed literal or truncated
/// frame is `Err`, which the caller (the outer accept loop) treats as "close
/// this connection, keep serving others".
async fn read_command(stream: &mut TcpStream) -> Result<Option<Command>> {
    let Some(tag) = read_command_tag(stream).await? else {
        return Ok(None);
    };
    match tag.as_slice() {
        GETINFO => Ok(Some(Command::GetInfo)),
        SETTCK => {
            let period_ns = read_u32_le(stream).await?;
            Ok(Some(Command::SetTck { period_ns }))
        }
        SHIFT => {
            let n_bits = read_u32_le(stream).await?;
            Ok(Some(Command::Shift { n_bits }))
        }
        other => Err(eyre!("unknown XVC command: {:?}", String::from_utf8_lossy(other))),
    }
}

/// The three command literals share no common prefix length, so we read
/// byte-by-byte until one of them matches exactly. EOF on the very first
/// byte is a clean disconnect; EOF mid-literal is a protocol error.
async fn read_command_tag(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    const CANDIDATES: [&[u8]; 3] = [GETINFO, SETTCK, SHIFT];
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(eyre!("connection closed mid-command"))
            };
        }
        buf.push(byte[0]);
        if CANDIDATES.iter().any(|c| *c == buf.as_slice()) {
            return Ok(Some(buf));
        }
        if !CANDIDATES.iter().any(|c| c.starts_with(buf.as_slice())) {
            return Err(eyre!("unrecognized command prefix: {:?}", String::from_utf8_lossy(&buf)));
        }
    }
}

/// `fetch32`'s unsigned-accumulator fix: the original reads into a signed
/// int with `v |= c << i` up to `i == 24`, which is implementation-defined
/// for the top byte; accumulating in `u32` sidesteps that entirely.
async fn read_u32_le(stream: &mut TcpStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

async fn handle_getinfo(stream: &mut TcpStream, session: &Session) -> Result<()> {
    let max_bytes = session.config.buffer_capacity;
    let reply = format!("xvcServer_v1.0:{max_bytes}\n");
    stream.write_all(reply.as_bytes()).await?;
    Ok(())
}

async fn handle_settck(stream: &mut TcpStream, session: &mut Session, period_ns: u32) -> Result<()> {
    if session.config.locked_clock_hz.is_none() {
        let requested_hz = 1_000_000_000u64.checked_div(period_ns as u64).unwrap_or(0);
        let (divisor, actual_hz) = xvcd_io::clock::divisor_for_frequency(requested_hz as u32);
        tracing::debug!(period_ns, actual_hz, "settck");
        let mut cmd = Vec::new();
        xvcd_io::mpsse::disable_prescaler(&mut cmd);
        xvcd_io::mpsse::set_clock_divisor(&mut cmd, divisor);
        session.usb.write(&cmd).await?;
    }
    // Echo the requested period verbatim even if a locked (-c) rate or
    // hardware quantization means the actual divisor differs: XVC 1.0
    // clients don't renegotiate.
    stream.write_all(&period_ns.to_le_bytes()).await?;
    Ok(())
}

async fn handle_shift(stream: &mut TcpStream, session: &mut Session, n_bits: u32) -> Result<()> {
    let n_bits = n_bits as usize;
    let max_bits = session.config.buffer_capacity * 8;
    if n_bits > max_bits {
        return Err(eyre!("shift request of {n_bits} bits exceeds capacity {max_bits}"));
    }
    let n_bytes = n_bits.div_ceil(8);

    stream.read_exact(&mut session.tms[..n_bytes]).await?;
    stream.read_exact(&mut session.tdi[..n_bytes]).await?;
    tracing::trace!(
        n_bits,
        tms = %xvcd_io::ShortHex(&session.tms[..n_bytes]),
        tdi = %xvcd_io::ShortHex(&session.tdi[..n_bytes]),
        "shift request"
    );

    session.stats.record_shift(n_bits);

    let limits = PacketLimits {
        bulk_out_max_packet: session.usb.max_packet_size(),
        bulk_in_max_packet: session.usb.max_packet_size(),
    };
    let chunks = plan_shift(n_bits, &session.tms[..n_bytes], &session.tdi[..n_bytes], limits, session.config.loopback);

    let mut out_offset = 0;
    let mut response = Vec::new();
    for chunk in &chunks {
        response.clear();
        response.resize(chunk.response_len, 0);
        session.usb.write(&chunk.cmd).await?;
        session.usb.read_exact(&mut response).await?;
        session.stats.record_chunk(chunk.cmd.len(), chunk.response_len);

        out_offset = unpack_chunk(chunk, &response, &mut session.tdo[..n_bytes], out_offset);
    }
    if out_offset < n_bits {
        tracing::warn!(out_offset, n_bits, "planner/decoder bit-count mismatch");
    }
    tracing::trace!(tdo = %xvcd_io::ShortHex(&session.tdo[..n_bytes]), "shift reply");

    stream.write_all(&session.tdo[..n_bytes]).await?;
    Ok(())
}

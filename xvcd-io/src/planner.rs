//! Shift planner (C3) and TDO reassembler (C4).
//!
//! [`plan_shift`] walks an XVC `(nBits, TMS, TDI)` request and emits a
//! sequence of [`Chunk`]s, each a bounded run of MPSSE tokens that respects
//! the endpoint's packet-size limits. [`unpack_chunk`] consumes one chunk's
//! response bytes and reassembles the TDO bit vector.

use tracing::warn;

use crate::bits::{bit_at, pack_byte, set_bit};
use crate::mpsse::{self, Token};

/// Negotiated USB bulk endpoint packet sizes, read from the device's
/// endpoint descriptors at connect time.
#[derive(Clone, Copy, Debug)]
pub struct PacketLimits {
    pub bulk_out_max_packet: usize,
    pub bulk_in_max_packet: usize,
}

/// One round-trip unit of USB bulk-out + bulk-in, bounded by packet size.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    pub cmd: Vec<u8>,
    pub response_len: usize,
    /// Response-bit widths, in emission order, for [`unpack_chunk`].
    pub segments: Vec<usize>,
}

/// Reserve enough headroom at the top of a chunk's command buffer to emit
/// one more TMS_SHIFT (3 bytes) plus at least a one-byte TDI token (3
/// bytes) before deciding to start a fresh chunk.
const MIN_ROOM: usize = 6;

/// Walk `tms`/`tdi` (each `ceil(n_bits/8)` bytes, LSB-first) and produce the
/// chunked MPSSE command sequence. Returns an empty vec for `n_bits == 0`.
pub fn plan_shift(n_bits: usize, tms: &[u8], tdi: &[u8], limits: PacketLimits, loopback: bool) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if n_bits == 0 {
        return chunks;
    }

    let response_capacity = limits.bulk_in_max_packet.saturating_sub(2);
    let mut cursor = 0usize;
    let mut first_chunk = true;

    while cursor < n_bits {
        let mut chunk = Chunk::default();
        if loopback && first_chunk {
            mpsse::enable_loopback(&mut chunk.cmd);
        }
        first_chunk = false;

        while cursor < n_bits
            && chunk.cmd.len() + MIN_ROOM <= limits.bulk_out_max_packet
            && chunk.response_len + 1 <= response_capacity
        {
            cursor = emit_tms_phase(&mut chunk, tms, tdi, cursor, n_bits);
            let tms_state = bit_at(tms, cursor - 1);
            cursor = emit_tdi_phase(&mut chunk, tms, tdi, cursor, n_bits, tms_state, limits, response_capacity);
        }

        chunks.push(chunk);
    }

    chunks
}

/// Accumulate a run of up to 6 TMS bits that stops when TDI would change
/// state, emit the TMS_SHIFT token, and return the cursor just past the run.
fn emit_tms_phase(chunk: &mut Chunk, tms: &[u8], tdi: &[u8], cursor: usize, n_bits: usize) -> usize {
    let tdi_held = bit_at(tdi, cursor);
    let mut run = 0u8;
    while run < 6 && cursor + run as usize + 1 <= n_bits {
        if run > 0 && bit_at(tdi, cursor + run as usize) != tdi_held {
            break;
        }
        run += 1;
    }

    let tms_bits = pack_byte(tms, cursor, run as usize);
    let last_tms = bit_at(tms, cursor + run as usize - 1);
    // Duplicate the last TMS bit into the slot one past the run so the
    // MPSSE hardware keeps driving it during the following TDI tokens.
    let held_tms_bits = if last_tms { tms_bits | (1 << run) } else { tms_bits };

    Token::TmsShift { len: run, tms_bits: held_tms_bits, tdi: tdi_held }.encode(&mut chunk.cmd);
    chunk.segments.push(run as usize);
    chunk.response_len += 1;

    cursor + run as usize
}

/// Accumulate a run of TDI bits that stops when TMS changes state, command
/// buffer capacity is exhausted, or response capacity is exhausted. Emits a
/// TDI_BYTES token for whole bytes and a trailing TDI_BITS token for the
/// remainder, if any.
#[allow(clippy::too_many_arguments)]
fn emit_tdi_phase(
    chunk: &mut Chunk,
    tms: &[u8],
    tdi: &[u8],
    cursor: usize,
    n_bits: usize,
    tms_state: bool,
    limits: PacketLimits,
    response_capacity: usize,
) -> usize {
    let start = cursor;
    let mut run = 0usize;
    while start + run < n_bits && bit_at(tms, start + run) == tms_state {
        // Bound against the run one bit longer than what's already committed:
        // that's the run this loop would actually emit if it stopped here,
        // and whole-byte/tail tokens can both be live at once (a run that
        // just crossed a byte boundary emits a TDI_BYTES header *and* a
        // trailing TDI_BITS header), so both must be budgeted together.
        let next_run = run + 1;
        let next_whole_bytes = next_run / 8;
        let next_tail = next_run % 8 != 0;
        let next_cmd_extra =
            if next_whole_bytes > 0 { 3 + next_whole_bytes } else { 0 } + if next_tail { 3 } else { 0 };
        let next_resp_extra = next_whole_bytes + usize::from(next_tail);

        if chunk.cmd.len() + next_cmd_extra > limits.bulk_out_max_packet {
            break;
        }
        if chunk.response_len + next_resp_extra > response_capacity {
            break;
        }
        run = next_run;
    }

    if run == 0 {
        return start;
    }

    let whole_bytes = run / 8;
    let tail = run % 8;

    if whole_bytes > 0 {
        let mut bytes = vec![0u8; whole_bytes];
        for (b, byte) in bytes.iter_mut().enumerate() {
            *byte = pack_byte(tdi, start + b * 8, 8);
        }
        Token::TdiBytes { bytes: &bytes }.encode(&mut chunk.cmd);
        chunk.segments.push(whole_bytes * 8);
        chunk.response_len += whole_bytes;
    }

    if tail > 0 {
        let bits_value = pack_byte(tdi, start + whole_bytes * 8, tail);
        Token::TdiBits { len: tail as u8, bits_value }.encode(&mut chunk.cmd);
        chunk.segments.push(tail);
        chunk.response_len += 1;
    }

    start + run
}

/// Consume one chunk's response bytes per its segment-widths list,
/// appending the reassembled TDO bits into `tdo` (LSB-first) starting at
/// bit offset `out_offset`. Returns the new offset.
///
/// A mismatch between `response.len()` and the chunk's expected response
/// size is a planner/decoder desync (spec §4.4, §7): logged and the
/// mismatched tail is skipped rather than panicking the session.
pub fn unpack_chunk(chunk: &Chunk, response: &[u8], tdo: &mut [u8], out_offset: usize) -> usize {
    if response.len() != chunk.response_len {
        warn!(
            expected = chunk.response_len,
            got = response.len(),
            "planner/decoder response length mismatch"
        );
    }

    let mut out_idx = out_offset;
    let mut resp_idx = 0usize;
    for &width in &chunk.segments {
        if width >= 8 {
            let bytes = width / 8;
            if resp_idx + bytes > response.len() {
                break;
            }
            for b in 0..bytes {
                let byte = response[resp_idx + b];
                for bit in 0..8 {
                    set_bit(tdo, out_idx, (byte >> bit) & 1 != 0);
                    out_idx += 1;
                }
            }
            resp_idx += bytes;
        } else {
            if resp_idx >= response.len() {
                break;
            }
            let byte = response[resp_idx];
            let shift = 8 - width;
            for bit in 0..width {
                set_bit(tdo, out_idx, (byte >> (shift + bit)) & 1 != 0);
                out_idx += 1;
            }
            resp_idx += 1;
        }
    }

    out_idx
}

//! Streaming svndiff0/1/2 codec for [`DeltaWindow`] sequences.
//!
//! svndiff is the byte format text deltas travel in across a transport: a
//! four-byte header followed by one encoded window per [`DeltaWindow`].
//! Version 1 compresses the instruction and new-data sections with zlib,
//! version 2 with LZ4.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::window::{DeltaAction, DeltaOp, DeltaWindow};
use crate::{SvnError, SvndiffOptions};

const SVNDIFF_HEADER_LEN: usize = 4;
const ZLIB_MIN_COMPRESS_SIZE: usize = 512;
const MAX_ENCODED_UINT_LEN: usize = 10;
const DELTA_WINDOW_MAX: usize = 128 * 1024;
const MAX_INSTRUCTION_LEN: usize = 2 * MAX_ENCODED_UINT_LEN + 1;
const MAX_INSTRUCTION_SECTION_LEN: usize = DELTA_WINDOW_MAX * MAX_INSTRUCTION_LEN;

/// svndiff format version.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SvndiffVersion {
    /// Uncompressed sections.
    #[default]
    V0,
    /// zlib-compressed sections.
    V1,
    /// LZ4-compressed sections.
    V2,
}

impl SvndiffVersion {
    /// The four-byte stream header for this version.
    pub fn header(self) -> [u8; 4] {
        match self {
            Self::V0 => *b"SVN\0",
            Self::V1 => *b"SVN\x01",
            Self::V2 => *b"SVN\x02",
        }
    }

    fn from_header(header: &[u8; 4]) -> Option<Self> {
        match header {
            b"SVN\0" => Some(Self::V0),
            b"SVN\x01" => Some(Self::V1),
            b"SVN\x02" => Some(Self::V2),
            _ => None,
        }
    }
}

/// Encodes [`DeltaWindow`] values into an svndiff byte stream.
///
/// The header is emitted in front of the first encoded window.
#[derive(Debug)]
pub struct SvndiffEncoder {
    version: SvndiffVersion,
    zlib_level: u32,
    header_written: bool,
}

impl SvndiffEncoder {
    /// Creates an encoder.
    pub fn new(options: &SvndiffOptions) -> Result<Self, SvnError> {
        if options.zlib_level > 9 {
            return Err(SvnError::Protocol("zlib level must be 0..=9".into()));
        }
        Ok(Self {
            version: options.version,
            zlib_level: options.zlib_level,
            header_written: false,
        })
    }

    /// Returns the version this encoder writes.
    pub fn version(&self) -> SvndiffVersion {
        self.version
    }

    /// Encodes one window and returns the bytes to transmit.
    pub fn encode(&mut self, window: &DeltaWindow) -> Result<Vec<u8>, SvnError> {
        let mut out = Vec::new();
        if !self.header_written {
            out.extend_from_slice(&self.version.header());
            self.header_written = true;
        }
        encode_window(self.version, window, self.zlib_level, &mut out)?;
        Ok(out)
    }

    /// Returns the header if no window has been encoded yet.
    ///
    /// A delta stream with no windows still needs the header so the receiver
    /// can tell "empty delta" from "no delta".
    pub fn finish(self) -> Vec<u8> {
        if self.header_written {
            Vec::new()
        } else {
            self.version.header().to_vec()
        }
    }
}

pub(crate) fn encode_window(
    version: SvndiffVersion,
    window: &DeltaWindow,
    zlib_level: u32,
    out: &mut Vec<u8>,
) -> Result<(), SvnError> {
    let mut instructions = Vec::new();
    for op in &window.ops {
        encode_instruction(op, &mut instructions);
    }
    let new_data = wire_new_data(window)?;

    let (instructions_wire, newdata_wire) = match version {
        SvndiffVersion::V0 => (instructions, new_data),
        SvndiffVersion::V1 => (
            compress_zlib(&instructions, zlib_level)?,
            compress_zlib(&new_data, zlib_level)?,
        ),
        SvndiffVersion::V2 => (compress_lz4(&instructions), compress_lz4(&new_data)),
    };

    encode_uint(window.sview_offset, out);
    encode_uint(u64::from(window.sview_len), out);
    encode_uint(u64::from(window.tview_len), out);
    encode_uint(instructions_wire.len() as u64, out);
    encode_uint(newdata_wire.len() as u64, out);

    out.extend_from_slice(&instructions_wire);
    out.extend_from_slice(&newdata_wire);
    Ok(())
}

/// New data as svndiff carries it: new-data instructions have no offset on
/// the wire and read the section in instruction order.
fn wire_new_data(window: &DeltaWindow) -> Result<Vec<u8>, SvnError> {
    let mut pos = 0usize;
    let mut in_order = true;
    for op in window.ops.iter().filter(|op| op.action == DeltaAction::New) {
        in_order &= op.offset as usize == pos;
        pos += op.length as usize;
    }
    if in_order && pos == window.new_data.len() {
        return Ok(window.new_data.clone());
    }

    let mut out = Vec::with_capacity(pos);
    for op in window.ops.iter().filter(|op| op.action == DeltaAction::New) {
        let start = op.offset as usize;
        let end = start + op.length as usize;
        let bytes = window.new_data.get(start..end).ok_or_else(|| {
            SvnError::Protocol("delta [new] instruction overflows new data section".into())
        })?;
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

fn encode_instruction(op: &DeltaOp, out: &mut Vec<u8>) {
    let len = u64::from(op.length);
    let selector = op.action.code() << 6;
    if (len >> 6) == 0 {
        out.push(selector | (len as u8));
    } else {
        out.push(selector);
        encode_uint(len, out);
    }
    if op.action != DeltaAction::New {
        encode_uint(u64::from(op.offset), out);
    }
}

fn encode_uint(val: u64, out: &mut Vec<u8>) {
    let mut v = val >> 7;
    let mut n = 1u32;
    while v > 0 {
        v >>= 7;
        n += 1;
    }

    while n > 1 {
        n -= 1;
        out.push((((val >> (n * 7)) | 0x80) & 0xff) as u8);
    }
    out.push((val & 0x7f) as u8);
}

fn compress_zlib(data: &[u8], zlib_level: u32) -> Result<Vec<u8>, SvnError> {
    let mut out = Vec::new();
    encode_uint(data.len() as u64, &mut out);

    if data.len() < ZLIB_MIN_COMPRESS_SIZE || zlib_level == 0 {
        out.extend_from_slice(data);
        return Ok(out);
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(zlib_level));
    encoder
        .write_all(data)
        .map_err(|err| SvnError::Protocol(format!("zlib encode failed: {err}")))?;
    let compressed = encoder
        .finish()
        .map_err(|err| SvnError::Protocol(format!("zlib finish failed: {err}")))?;

    if compressed.len() >= data.len() {
        out.extend_from_slice(data);
    } else {
        out.extend_from_slice(&compressed);
    }
    Ok(out)
}

fn compress_lz4(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_uint(data.len() as u64, &mut out);

    let compressed = lz4_flex::compress(data);
    if compressed.len() >= data.len() {
        out.extend_from_slice(data);
    } else {
        out.extend_from_slice(&compressed);
    }
    out
}

#[derive(Debug)]
struct WindowHeader {
    sview_offset: u64,
    sview_len: usize,
    tview_len: usize,
    ins_len: usize,
    new_len: usize,
    header_len: usize,
}

#[derive(Debug, Default)]
struct CursorBuf {
    buf: Vec<u8>,
    start: usize,
}

impl CursorBuf {
    fn available(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn push(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.buf.extend_from_slice(bytes);
        }
    }

    fn consume(&mut self, n: usize) {
        self.start = self.start.saturating_add(n);
        if self.start >= self.buf.len() {
            self.buf.clear();
            self.start = 0;
            return;
        }

        // Compact once the consumed prefix dominates the buffer.
        if self.start > 4096 && self.start * 2 > self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

/// Incrementally decodes an svndiff byte stream into [`DeltaWindow`] values.
///
/// Chunks may split the stream at arbitrary byte boundaries.
#[derive(Debug, Default)]
pub struct SvndiffDecoder {
    any_input: bool,
    header: [u8; SVNDIFF_HEADER_LEN],
    header_bytes: usize,
    version: Option<SvndiffVersion>,
    buf: CursorBuf,
    pending_window: Option<WindowHeader>,
    last_sview_offset: u64,
    last_sview_len: u64,
}

impl SvndiffDecoder {
    /// Creates a decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stream version once the header has been read.
    pub fn version(&self) -> Option<SvndiffVersion> {
        self.version
    }

    /// Returns `true` if no bytes have been pushed.
    pub fn is_identity(&self) -> bool {
        !self.any_input
    }

    /// Feeds raw bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), SvnError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.any_input = true;

        let mut input = chunk;
        if self.header_bytes < SVNDIFF_HEADER_LEN {
            let needed = SVNDIFF_HEADER_LEN - self.header_bytes;
            let take = needed.min(input.len());
            self.header[self.header_bytes..self.header_bytes + take]
                .copy_from_slice(&input[..take]);
            self.header_bytes += take;
            input = &input[take..];

            if self.header_bytes == SVNDIFF_HEADER_LEN {
                self.version = SvndiffVersion::from_header(&self.header);
                if self.version.is_none() {
                    return Err(SvnError::Protocol("svndiff has invalid header".into()));
                }
            }
        }

        self.buf.push(input);
        Ok(())
    }

    /// Returns the next complete window, or `None` if more input is needed.
    pub fn next_window(&mut self) -> Result<Option<DeltaWindow>, SvnError> {
        let Some(version) = self.version else {
            return Ok(None);
        };

        if self.pending_window.is_none() {
            let avail = self.buf.available();
            let Some(window) = try_parse_window_header(avail)? else {
                if avail.len() > 5 * MAX_ENCODED_UINT_LEN {
                    return Err(SvnError::Protocol(
                        "svndiff contains a too-large window header".into(),
                    ));
                }
                return Ok(None);
            };
            self.pending_window = Some(window);
        }

        let Some(window) = self.pending_window.as_ref() else {
            return Ok(None);
        };
        let needed = window
            .header_len
            .checked_add(window.ins_len)
            .and_then(|n| n.checked_add(window.new_len))
            .ok_or_else(|| SvnError::Protocol("svndiff window size overflow".into()))?;
        if self.buf.available().len() < needed {
            return Ok(None);
        }

        let Some(window) = self.pending_window.take() else {
            return Ok(None);
        };
        let avail = self.buf.available();
        let base = window.header_len;
        let ins_wire = &avail[base..base + window.ins_len];
        let new_wire = &avail[base + window.ins_len..base + window.ins_len + window.new_len];

        let instructions = decode_section(version, ins_wire, MAX_INSTRUCTION_SECTION_LEN)?;
        let new_data = decode_section(version, new_wire, DELTA_WINDOW_MAX)?;
        self.buf.consume(needed);

        // Source views may only slide forward.
        if window.sview_len > 0 {
            let end = window
                .sview_offset
                .checked_add(window.sview_len as u64)
                .ok_or_else(|| SvnError::Protocol("svndiff source view overflow".into()))?;
            let last_end = self
                .last_sview_offset
                .checked_add(self.last_sview_len)
                .ok_or_else(|| SvnError::Protocol("svndiff last source view overflow".into()))?;

            if window.sview_offset < self.last_sview_offset || end < last_end {
                return Err(SvnError::Protocol(
                    "svndiff has backwards-sliding source views".into(),
                ));
            }
        }
        self.last_sview_offset = window.sview_offset;
        self.last_sview_len = window.sview_len as u64;

        let ops = decode_instructions(&instructions)?;
        let src_ops = ops
            .iter()
            .filter(|op| op.action == DeltaAction::Source)
            .count() as i32;
        Ok(Some(DeltaWindow {
            sview_offset: window.sview_offset,
            sview_len: window.sview_len as u32,
            tview_len: window.tview_len as u32,
            src_ops,
            ops,
            new_data,
        }))
    }

    /// Feeds `chunk` and returns every window it completes.
    pub fn push_and_drain(&mut self, chunk: &[u8]) -> Result<Vec<DeltaWindow>, SvnError> {
        self.push(chunk)?;
        let mut windows = Vec::new();
        while let Some(window) = self.next_window()? {
            windows.push(window);
        }
        Ok(windows)
    }

    /// Checks that the stream ended on a window boundary.
    pub fn finish(&self) -> Result<(), SvnError> {
        if self.is_identity() {
            return Ok(());
        }

        if self.header_bytes < SVNDIFF_HEADER_LEN {
            return Err(SvnError::Protocol(
                "unexpected end of svndiff input (missing header)".into(),
            ));
        }

        if self.pending_window.is_some() || !self.buf.available().is_empty() {
            return Err(SvnError::Protocol(
                "unexpected end of svndiff input (truncated window)".into(),
            ));
        }

        Ok(())
    }
}

fn try_parse_window_header(input: &[u8]) -> Result<Option<WindowHeader>, SvnError> {
    let mut cursor = input;
    let mut header_len = 0usize;
    let mut fields = [0u64; 5];

    for field in &mut fields {
        let Some((value, used)) = try_decode_uint(cursor)? else {
            return Ok(None);
        };
        cursor = &cursor[used..];
        header_len += used;
        *field = value;
    }
    let [sview_offset, sview_len_u64, tview_len_u64, ins_len_u64, new_len_u64] = fields;

    let sview_len = usize::try_from(sview_len_u64)
        .map_err(|_| SvnError::Protocol("svndiff sview_len overflows usize".into()))?;
    let tview_len = usize::try_from(tview_len_u64)
        .map_err(|_| SvnError::Protocol("svndiff tview_len overflows usize".into()))?;
    let ins_len = usize::try_from(ins_len_u64)
        .map_err(|_| SvnError::Protocol("svndiff ins_len overflows usize".into()))?;
    let new_len = usize::try_from(new_len_u64)
        .map_err(|_| SvnError::Protocol("svndiff new_len overflows usize".into()))?;

    if tview_len > DELTA_WINDOW_MAX
        || sview_len > DELTA_WINDOW_MAX
        || new_len > DELTA_WINDOW_MAX + MAX_ENCODED_UINT_LEN
        || ins_len > MAX_INSTRUCTION_SECTION_LEN
    {
        return Err(SvnError::Protocol(
            "svndiff contains a too-large window".into(),
        ));
    }

    if ins_len.checked_add(new_len).is_none()
        || sview_offset.checked_add(sview_len as u64).is_none()
        || sview_len.checked_add(tview_len).is_none()
    {
        return Err(SvnError::Protocol(
            "svndiff contains corrupt window header".into(),
        ));
    }

    Ok(Some(WindowHeader {
        sview_offset,
        sview_len,
        tview_len,
        ins_len,
        new_len,
        header_len,
    }))
}

fn try_decode_uint(input: &[u8]) -> Result<Option<(u64, usize)>, SvnError> {
    let mut val: u64 = 0;
    for (idx, &b) in input.iter().enumerate() {
        val = val
            .checked_shl(7)
            .and_then(|v| v.checked_add(u64::from(b & 0x7f)))
            .ok_or_else(|| SvnError::Protocol("svndiff integer overflow".into()))?;
        if (b & 0x80) == 0 {
            return Ok(Some((val, idx + 1)));
        }
    }
    Ok(None)
}

fn decode_instructions(instructions: &[u8]) -> Result<Vec<DeltaOp>, SvnError> {
    let mut ops = Vec::new();
    let mut ipos = 0usize;
    let mut npos = 0u64;

    while ipos < instructions.len() {
        let selector = instructions[ipos];
        ipos += 1;

        let action = DeltaAction::from_code((selector >> 6) & 0x3)
            .ok_or_else(|| SvnError::Protocol("svndiff invalid action".into()))?;

        let mut len = u64::from(selector & 0x3f);
        if len == 0 {
            let Some((v, used)) = try_decode_uint(&instructions[ipos..])? else {
                return Err(SvnError::Protocol(
                    "svndiff instruction truncated length".into(),
                ));
            };
            ipos += used;
            len = v;
        }
        if len == 0 {
            return Err(SvnError::Protocol(
                "svndiff instruction has length zero".into(),
            ));
        }

        let offset = if action == DeltaAction::New {
            let off = npos;
            npos += len;
            off
        } else {
            let Some((off, used)) = try_decode_uint(&instructions[ipos..])? else {
                return Err(SvnError::Protocol(
                    "svndiff copy instruction missing offset".into(),
                ));
            };
            ipos += used;
            off
        };

        let length = u32::try_from(len)
            .map_err(|_| SvnError::Protocol("svndiff length overflows u32".into()))?;
        let offset = u32::try_from(offset)
            .map_err(|_| SvnError::Protocol("svndiff offset overflows u32".into()))?;
        ops.push(DeltaOp {
            action,
            offset,
            length,
        });
    }
    Ok(ops)
}

fn decode_section(version: SvndiffVersion, wire: &[u8], limit: usize) -> Result<Vec<u8>, SvnError> {
    match version {
        SvndiffVersion::V0 => Ok(wire.to_vec()),
        SvndiffVersion::V1 => decode_zlib_section(wire, limit),
        SvndiffVersion::V2 => decode_lz4_section(wire, limit),
    }
}

fn section_size(wire: &[u8], limit: usize, codec: &str) -> Result<(usize, usize), SvnError> {
    let Some((orig_len_u64, used)) = try_decode_uint(wire)? else {
        return Err(SvnError::Protocol(format!(
            "svndiff {codec} section missing size"
        )));
    };
    let orig_len = usize::try_from(orig_len_u64)
        .map_err(|_| SvnError::Protocol(format!("svndiff {codec} size overflows usize")))?;
    if orig_len > limit {
        return Err(SvnError::Protocol(format!(
            "svndiff {codec} section size too large"
        )));
    }
    Ok((orig_len, used))
}

fn decode_zlib_section(wire: &[u8], limit: usize) -> Result<Vec<u8>, SvnError> {
    let (orig_len, used) = section_size(wire, limit, "zlib")?;
    let data = &wire[used..];
    if data.len() == orig_len {
        return Ok(data.to_vec());
    }

    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| SvnError::Protocol(format!("svndiff zlib decode failed: {err}")))?;
    if out.len() != orig_len {
        return Err(SvnError::Protocol(
            "svndiff zlib decoded length mismatch".into(),
        ));
    }
    Ok(out)
}

fn decode_lz4_section(wire: &[u8], limit: usize) -> Result<Vec<u8>, SvnError> {
    let (orig_len, used) = section_size(wire, limit, "lz4")?;
    let data = &wire[used..];
    if data.len() == orig_len {
        return Ok(data.to_vec());
    }

    let out = lz4_flex::decompress(data, orig_len)
        .map_err(|err| SvnError::Protocol(format!("svndiff lz4 decode failed: {err}")))?;
    if out.len() != orig_len {
        return Err(SvnError::Protocol(
            "svndiff lz4 decoded length mismatch".into(),
        ));
    }
    Ok(out)
}

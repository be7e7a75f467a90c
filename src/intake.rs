//! Job intake: read the single job envelope from the input channel.
//!
//! The channel is read in two gears. A tiny first read is enough to spot an
//! optional leading integer that announces the payload size; after it every
//! read asks for either the rest of that size or a large fixed chunk, so big
//! payloads arrive in few reads without the caller having to announce
//! anything.
//!
//! The client keeps the channel open while it waits for results, so the
//! envelope has to be recognized as complete as soon as its last byte
//! arrives. A [`Boundary`] follows the value's headers across reads, looking
//! at each byte once; the value is decoded only when it is all there.

use std::io::{ErrorKind, Read};

use rmp::Marker;
use tracing::debug;

use crate::arena::{KIB, MIB};
use crate::error::{Fatal, StatusCode};
use crate::wire::decode::{is_symbol, RAW_MAX_DEPTH};

/// Size of the first read; fits any size-hint integer we expect.
pub const FIRST_CHUNK_SIZE: usize = 4;
/// Read size once the first chunk is in and no hint was given
pub const CHUNK_SIZE: usize = 256 * KIB;
/// Upper bound on a size hint
pub const MAX_HINT: usize = 256 * MIB;

/// One named fragment of script text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUnit {
    /// Name used in diagnostics
    pub path: String,
    /// Script text
    pub text: String,
}

impl SourceUnit {
    /// Create a source unit
    #[must_use]
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// The decoded job envelope.
///
/// `input` stays in raw wire form here; turning it into a script value is a
/// timed stage of the run, with its own recoverable failures.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    input: rmpv::Value,
    sources: Vec<SourceUnit>,
    library: Option<Vec<u8>>,
    bytes_read: u64,
}

impl Job {
    /// Create a job with no library and a zero byte count
    #[must_use]
    pub fn new(input: rmpv::Value, sources: Vec<SourceUnit>) -> Self {
        Self {
            input,
            sources,
            library: None,
            bytes_read: 0,
        }
    }

    /// Attach a precompiled library. An empty blob counts as no library.
    #[must_use]
    pub fn with_library(mut self, library: Vec<u8>) -> Self {
        self.library = Some(library).filter(|l| !l.is_empty());
        self
    }

    /// Record how many bytes the job took on the input channel
    #[must_use]
    pub const fn with_bytes_read(mut self, bytes_read: u64) -> Self {
        self.bytes_read = bytes_read;
        self
    }

    /// Raw input value
    #[must_use]
    pub const fn input(&self) -> &rmpv::Value {
        &self.input
    }

    /// Source units in execution order
    #[must_use]
    pub fn sources(&self) -> &[SourceUnit] {
        &self.sources
    }

    /// Precompiled library, if any
    #[must_use]
    pub fn library(&self) -> Option<&[u8]> {
        self.library.as_deref()
    }

    /// Bytes consumed from the input channel
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Read and validate one job from `rd`.
///
/// Unknown envelope keys and anything after the envelope are ignored.
///
/// # Errors
/// `io_failure` when a read fails, `bad_input` when the channel ends early or
/// the envelope is malformed, `structure_too_deep` when it nests absurdly.
pub fn read_job<R: Read>(rd: &mut R) -> Result<Job, Fatal> {
    Intake::new(rd).read()
}

/// Input channel plus everything read from it so far.
struct Intake<'r, R> {
    rd: &'r mut R,
    /// Zeroed up to its length, filled up to `filled`
    buf: Vec<u8>,
    filled: usize,
    decodes: usize,
}

impl<'r, R: Read> Intake<'r, R> {
    fn new(rd: &'r mut R) -> Self {
        Self {
            rd,
            buf: Vec::new(),
            filled: 0,
            decodes: 0,
        }
    }

    fn read(&mut self) -> Result<Job, Fatal> {
        let first_end = self.fill_value(0, None)?;
        let first = self.decode(0, first_end)?;
        let Some(hint) = size_hint(&first) else {
            return self.finish(first);
        };

        debug!(hint, "payload size hint");
        let target = first_end.saturating_add(hint.min(MAX_HINT));
        let end = self.fill_value(first_end, Some(target))?;
        let raw = self.decode(first_end, end)?;
        self.finish(raw)
    }

    /// Read until the value starting at `start` is complete; returns its end.
    fn fill_value(&mut self, start: usize, target: Option<usize>) -> Result<usize, Fatal> {
        let mut boundary = Boundary::new(start);
        loop {
            if let Some(end) = boundary.advance(&self.buf[..self.filled]) {
                return Ok(end);
            }
            let want = match target {
                Some(target) if target > self.filled => target - self.filled,
                _ if self.filled == 0 => FIRST_CHUNK_SIZE,
                _ => CHUNK_SIZE,
            };
            if self.read_chunk(want)? == 0 {
                return Err(Fatal(StatusCode::BadInput));
            }
        }
    }

    /// Read up to `want` more bytes, retrying interrupted reads.
    fn read_chunk(&mut self, want: usize) -> Result<usize, Fatal> {
        let end = self.filled.saturating_add(want);
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        loop {
            match self.rd.read(&mut self.buf[self.filled..end]) {
                Ok(n) => {
                    self.filled += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Err(Fatal(StatusCode::IoFailure)),
            }
        }
    }

    fn decode(&mut self, start: usize, end: usize) -> Result<rmpv::Value, Fatal> {
        self.decodes += 1;
        let mut cursor = &self.buf[start..end];
        rmpv::decode::read_value_with_max_depth(&mut cursor, RAW_MAX_DEPTH).map_err(|e| match e {
            rmpv::decode::Error::DepthLimitExceeded => Fatal(StatusCode::StructureTooDeep),
            _ => Fatal(StatusCode::BadInput),
        })
    }

    fn finish(&self, raw: rmpv::Value) -> Result<Job, Fatal> {
        let bytes_read = self.filled as u64;
        debug!(bytes_read, "job envelope decoded");
        envelope(raw, bytes_read)
    }
}

/// Tracks where one msgpack value ends without decoding it.
#[derive(Debug)]
struct Boundary {
    /// Offset of the next header to look at
    pos: usize,
    /// Values still missing before the outermost one is complete
    owed: u64,
}

impl Boundary {
    const fn new(start: usize) -> Self {
        Self { pos: start, owed: 1 }
    }

    /// Continue over `bytes`, which only ever grows between calls. The end
    /// offset once the value is complete.
    fn advance(&mut self, bytes: &[u8]) -> Option<usize> {
        while self.owed > 0 {
            let Some(rest) = bytes.get(self.pos..) else {
                return None;
            };
            let Some(frame) = frame(rest) else {
                return None;
            };
            self.pos = self.pos.saturating_add(frame.header).saturating_add(frame.payload);
            self.owed = (self.owed - 1).saturating_add(frame.nested);
        }
        (self.pos <= bytes.len()).then_some(self.pos)
    }
}

/// Layout of one encoded value
#[derive(Debug, PartialEq, Eq)]
struct Frame {
    header: usize,
    payload: usize,
    nested: u64,
}

impl Frame {
    const fn new(header: usize, payload: usize, nested: u64) -> Self {
        Self {
            header,
            payload,
            nested,
        }
    }
}

/// What a length field counts
enum Counted {
    Bytes,
    /// Ext payload, preceded by its type byte
    Ext,
    /// Nested values per unit of length
    Values(u64),
}

/// Frame of the value at the start of `bytes`, or `None` while its header is
/// incomplete.
fn frame(bytes: &[u8]) -> Option<Frame> {
    let first = *bytes.first()?;
    let (width, counted) = match Marker::from_u8(first) {
        // 0xc1 reads as nil, as the decoder treats it
        Marker::FixPos(_)
        | Marker::FixNeg(_)
        | Marker::Null
        | Marker::Reserved
        | Marker::True
        | Marker::False => return Some(Frame::new(1, 0, 0)),
        Marker::U8 | Marker::I8 => return Some(Frame::new(1, 1, 0)),
        Marker::U16 | Marker::I16 => return Some(Frame::new(1, 2, 0)),
        Marker::U32 | Marker::I32 | Marker::F32 => return Some(Frame::new(1, 4, 0)),
        Marker::U64 | Marker::I64 | Marker::F64 => return Some(Frame::new(1, 8, 0)),
        Marker::FixStr(n) => return Some(Frame::new(1, usize::from(n), 0)),
        Marker::FixArray(n) => return Some(Frame::new(1, 0, u64::from(n))),
        Marker::FixMap(n) => return Some(Frame::new(1, 0, 2 * u64::from(n))),
        Marker::FixExt1 => return Some(Frame::new(2, 1, 0)),
        Marker::FixExt2 => return Some(Frame::new(2, 2, 0)),
        Marker::FixExt4 => return Some(Frame::new(2, 4, 0)),
        Marker::FixExt8 => return Some(Frame::new(2, 8, 0)),
        Marker::FixExt16 => return Some(Frame::new(2, 16, 0)),
        Marker::Str8 | Marker::Bin8 => (1, Counted::Bytes),
        Marker::Str16 | Marker::Bin16 => (2, Counted::Bytes),
        Marker::Str32 | Marker::Bin32 => (4, Counted::Bytes),
        Marker::Ext8 => (1, Counted::Ext),
        Marker::Ext16 => (2, Counted::Ext),
        Marker::Ext32 => (4, Counted::Ext),
        Marker::Array16 => (2, Counted::Values(1)),
        Marker::Array32 => (4, Counted::Values(1)),
        Marker::Map16 => (2, Counted::Values(2)),
        Marker::Map32 => (4, Counted::Values(2)),
    };

    let field = bytes.get(1..=width)?;
    let len = field.iter().fold(0_u64, |acc, &b| acc << 8 | u64::from(b));
    let bytes_len = usize::try_from(len).unwrap_or(usize::MAX);

    Some(match counted {
        Counted::Bytes => Frame::new(1 + width, bytes_len, 0),
        Counted::Ext => Frame::new(2 + width, bytes_len, 0),
        Counted::Values(per) => Frame::new(1 + width, 0, per * len),
    })
}

fn size_hint(raw: &rmpv::Value) -> Option<usize> {
    match raw {
        rmpv::Value::Integer(n) => n.as_u64().map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
        _ => None,
    }
}

fn envelope(raw: rmpv::Value, bytes_read: u64) -> Result<Job, Fatal> {
    let bad_input = Fatal(StatusCode::BadInput);
    let rmpv::Value::Map(entries) = raw else {
        return Err(bad_input);
    };

    let mut input = None;
    let mut sources = None;
    let mut library = None;
    for (key, value) in entries {
        if input.is_none() && is_symbol(&key, "input") {
            input = Some(value);
        } else if sources.is_none() && is_symbol(&key, "sources") {
            sources = Some(value);
        } else if library.is_none() && is_symbol(&key, "library") {
            library = Some(value);
        }
    }

    let input = input.ok_or(bad_input)?;
    let sources = unpack_sources(sources.ok_or(bad_input)?)?;
    let library = match library {
        None | Some(rmpv::Value::Nil) => Vec::new(),
        Some(rmpv::Value::Binary(bytes)) => bytes,
        Some(_) => return Err(bad_input),
    };

    Ok(Job::new(input, sources)
        .with_library(library)
        .with_bytes_read(bytes_read))
}

fn unpack_sources(raw: rmpv::Value) -> Result<Vec<SourceUnit>, Fatal> {
    let rmpv::Value::Array(items) = raw else {
        return Err(Fatal(StatusCode::BadInput));
    };

    items
        .into_iter()
        .map(|item| match item {
            rmpv::Value::Array(pair) => match pair.as_slice() {
                [rmpv::Value::String(path), rmpv::Value::String(text)] => {
                    match (path.as_str(), text.as_str()) {
                        (Some(path), Some(text)) => Ok(SourceUnit::new(path, text)),
                        _ => Err(Fatal(StatusCode::BadInput)),
                    }
                }
                _ => Err(Fatal(StatusCode::BadInput)),
            },
            _ => Err(Fatal(StatusCode::BadInput)),
        })
        .collect()
}

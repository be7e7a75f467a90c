//! Output stream: every record the host sends to its client.
//!
//! Records are tagged two-element arrays `[:tag, payload]`, written one
//! after another with no framing beyond the encoding itself. Small records
//! are built in memory first and then written in full. The output record is
//! checked in full first and then streamed, so the client never sees a torn
//! record either way.

use std::cell::RefCell;
use std::io::{self, BufWriter, Read, Write};

use crate::error::{leave, ErrorRecord, Fatal, StatusCode};
use crate::timer::MeasurementSink;
use crate::wire::encode::{
    write_array_len, write_int, write_map_len, write_str, write_symbol, write_uint,
};
use crate::wire::Encode;

/// Buffer between the output record encoder and the sink
const OUTPUT_BUFFER: usize = 64 * 1024;

/// Counters reported in the final `:stat` record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Metered instructions
    pub instructions: u64,
    /// All instructions, metered or not
    pub total_instructions: u64,
    /// Live arena bytes at the end of the run
    pub memory: u64,
    /// Bytes consumed from the input channel
    pub bytes_in: u64,
}

/// Unbuffered stream over a raw file descriptor: every call is exactly one
/// `read(2)` or `write(2)`.
#[derive(Debug)]
pub struct FdStream {
    fd: libc::c_int,
}

impl FdStream {
    /// The process's standard input
    #[must_use]
    pub const fn stdin() -> Self {
        Self { fd: 0 }
    }

    /// The process's standard output
    #[must_use]
    pub const fn stdout() -> Self {
        Self { fd: 1 }
    }
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is writable for `buf.len()` bytes for the whole call.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        usize::try_from(n).map_err(|_| io::Error::last_os_error())
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for `buf.len()` bytes for the whole call.
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        usize::try_from(n).map_err(|_| io::Error::last_os_error())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes records onto `W`.
///
/// A failed write is fatal and ends the process on the spot: once a record
/// may be half-written there is nothing sensible left to tell the client.
#[derive(Debug)]
pub struct OutputWriter<W: Write> {
    out: RefCell<W>,
}

impl<W: Write> OutputWriter<W> {
    /// Wrap a sink
    pub const fn new(out: W) -> Self {
        Self {
            out: RefCell::new(out),
        }
    }

    /// Give back the sink
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn send(&self, record: &[u8]) {
        let written = self
            .out
            .try_borrow_mut()
            .map_err(|_| io::Error::from(io::ErrorKind::WouldBlock))
            .and_then(|mut out| out.write_all(record).and_then(|()| out.flush()));
        if written.is_err() {
            leave(StatusCode::IoFailure);
        }
    }

    /// `[:measurement, [:name, micros]]`
    pub fn emit_measurement(&self, name: &str, micros: i64) {
        match measurement_record(name, micros) {
            Ok(record) => self.send(&record),
            Err(fatal) => leave(fatal.status()),
        }
    }

    /// `[:error, {__type: :kind, ...}]`
    ///
    /// # Errors
    /// Fatal encoding errors, e.g. a message too long for the wire
    pub fn emit_error(&self, error: &ErrorRecord) -> Result<(), Fatal> {
        let mut buf = Vec::new();
        tagged(&mut buf, "error")?;
        match error {
            ErrorRecord::Syntax {
                filename,
                line,
                column,
                message,
            } => {
                write_map_len(&mut buf, 5)?;
                type_field(&mut buf, error)?;
                write_symbol(&mut buf, "filename")?;
                write_str(&mut buf, filename)?;
                write_symbol(&mut buf, "line_number")?;
                write_int(&mut buf, i64::from(*line))?;
                write_symbol(&mut buf, "column")?;
                write_int(&mut buf, i64::from(*column))?;
                write_symbol(&mut buf, "message")?;
                write_str(&mut buf, message)?;
            }
            ErrorRecord::Runtime { message, backtrace } => {
                write_map_len(&mut buf, 3)?;
                type_field(&mut buf, error)?;
                write_symbol(&mut buf, "message")?;
                write_str(&mut buf, message)?;
                write_symbol(&mut buf, "backtrace")?;
                write_array_len(&mut buf, backtrace.len())?;
                for frame in backtrace {
                    write_str(&mut buf, frame)?;
                }
            }
            ErrorRecord::UnknownType { type_tag } => {
                write_map_len(&mut buf, 2)?;
                type_field(&mut buf, error)?;
                write_symbol(&mut buf, "type")?;
                write_uint(&mut buf, u64::from(*type_tag))?;
            }
            ErrorRecord::UnknownExt { ext_tag } => {
                write_map_len(&mut buf, 2)?;
                type_field(&mut buf, error)?;
                write_symbol(&mut buf, "type")?;
                write_int(&mut buf, i64::from(*ext_tag))?;
            }
        }
        self.send(&buf);
        Ok(())
    }

    /// `[:output, {extracted: value, stdout: value}]`
    ///
    /// Nothing is written unless both values encode.
    ///
    /// # Errors
    /// `structure_too_deep`, `unknown_type` or `overflow` from either value
    pub fn emit_output(&self, extracted: &impl Encode, stdout: &impl Encode) -> Result<(), Fatal> {
        extracted.check()?;
        stdout.check()?;

        let Ok(mut out) = self.out.try_borrow_mut() else {
            leave(StatusCode::IoFailure);
        };
        let mut buf = BufWriter::with_capacity(OUTPUT_BUFFER, &mut *out);
        let written = output_record(&mut buf, extracted, stdout)
            .and_then(|()| buf.flush().map_err(|_| Fatal(StatusCode::IoFailure)));
        match written {
            Err(Fatal(StatusCode::IoFailure)) => leave(StatusCode::IoFailure),
            other => other,
        }
    }

    /// `[:stat, {instructions, total_instructions, memory, bytes_in}]`
    ///
    /// # Errors
    /// Only on an encoding failure
    pub fn emit_stats(&self, stats: &ExecutionStats) -> Result<(), Fatal> {
        let mut buf = Vec::new();
        tagged(&mut buf, "stat")?;
        write_map_len(&mut buf, 4)?;
        for (name, n) in [
            ("instructions", stats.instructions),
            ("total_instructions", stats.total_instructions),
            ("memory", stats.memory),
            ("bytes_in", stats.bytes_in),
        ] {
            write_symbol(&mut buf, name)?;
            write_uint(&mut buf, n)?;
        }
        self.send(&buf);
        Ok(())
    }
}

impl<W: Write> MeasurementSink for OutputWriter<W> {
    fn emit_measurement(&self, name: &str, micros: i64) {
        Self::emit_measurement(self, name, micros);
    }
}

fn tagged<W: Write>(buf: &mut W, tag: &str) -> Result<(), Fatal> {
    write_array_len(buf, 2)?;
    write_symbol(buf, tag)
}

fn output_record<W: Write>(
    wr: &mut W,
    extracted: &impl Encode,
    stdout: &impl Encode,
) -> Result<(), Fatal> {
    tagged(wr, "output")?;
    write_map_len(wr, 2)?;
    write_symbol(wr, "extracted")?;
    extracted.encode(wr)?;
    write_symbol(wr, "stdout")?;
    stdout.encode(wr)
}

fn type_field(buf: &mut Vec<u8>, error: &ErrorRecord) -> Result<(), Fatal> {
    write_symbol(buf, "__type")?;
    write_symbol(buf, error.kind())
}

fn measurement_record(name: &str, micros: i64) -> Result<Vec<u8>, Fatal> {
    let mut buf = Vec::new();
    tagged(&mut buf, "measurement")?;
    write_array_len(&mut buf, 2)?;
    write_symbol(&mut buf, name)?;
    write_int(&mut buf, micros)?;
    Ok(buf)
}

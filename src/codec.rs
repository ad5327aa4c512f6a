//! Line and block framing for the SCPI dialects.
//!
//! Everything here is dialect-agnostic: commands go out as ASCII lines, replies come back either
//! as a single line or as an IEEE-488.2 definite-length arbitrary block of big-endian `f32`s.
//!
//! Numbers are written with Rust's `Display` for `f64`, which always uses `.` as the decimal
//! separator and never groups digits, so the host locale can't leak into a command.

use core::fmt;

use log::{debug, warn};

use crate::{
    bus::BusSession,
    error::{Error, FormatError, Result},
};

const LF: u8 = b'\n';

/// Give up draining the error queue after this many entries.
const MAX_QUEUED_ERRORS: usize = 32;

/// SCPI representation of "not a number".
const SCPI_NAN: &str = "9.91E+37";

/// Wrapper for writing a number into a command.
///
/// Non-finite values become the SCPI NaN literal instead of `NaN`/`inf`.
#[derive(Debug, Clone, Copy)]
pub struct Num(pub f64);

impl fmt::Display for Num {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_finite() {
            write!(f, "{}", self.0)
        } else {
            f.write_str(SCPI_NAN)
        }
    }
}

/// Split a chained reply into its fields. Both `,` and `;` separate fields.
pub fn split_fields(response: &str) -> impl Iterator<Item = &str> {
    response.split([',', ';']).map(str::trim)
}

/// Parse one numeric field.
pub fn parse_number(token: &str) -> core::result::Result<f64, FormatError> {
    let token = token.trim();
    token
        .parse::<f64>()
        .map_err(|_| FormatError::BadNumber(token.into()))
}

/// Parse every field of a reply as a number. Any bad field fails the whole reply.
pub fn parse_numbers(response: &str) -> core::result::Result<Vec<f64>, FormatError> {
    split_fields(response).map(parse_number).collect()
}

/// Parse a decimal register value such as `+1024`.
pub fn parse_register(token: &str) -> core::result::Result<u32, FormatError> {
    let token = token.trim();
    token
        .parse::<i64>()
        .map(|value| value as u32)
        .map_err(|_| FormatError::BadNumber(token.into()))
}

/// Parse a boolean field (`1`/`0`, `ON`/`OFF`).
pub fn parse_flag(token: &str) -> bool {
    matches!(token.trim(), "1" | "+1" | "ON")
}

/// Decode the `#H<hex>` literal used for register reads.
///
/// Anything else decodes to `0`, i.e. "no bits set".
pub fn decode_hex_register(response: &str) -> u32 {
    response
        .trim()
        .strip_prefix("#H")
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .unwrap_or(0)
}

/// Inspect the start of a definite-length block.
///
/// Returns `Ok(None)` while not enough of the header has arrived, otherwise
/// `(header_len, payload_len)`. `buf` must start at the `#`.
fn block_header(buf: &[u8]) -> core::result::Result<Option<(usize, usize)>, FormatError> {
    match buf.first() {
        None => return Ok(None),
        Some(b'#') => {}
        Some(_) => return Err(FormatError::BlockHeader),
    }
    let Some(&digits) = buf.get(1) else {
        return Ok(None);
    };
    let digits = match digits {
        b'1'..=b'9' => (digits - b'0') as usize,
        // `#0` is the indefinite-length form, which the supplies never send.
        _ => return Err(FormatError::BlockHeader),
    };
    let Some(length) = buf.get(2..2 + digits) else {
        return Ok(None);
    };
    let length = core::str::from_utf8(length)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(FormatError::BlockHeader)?;
    Ok(Some((2 + digits, length)))
}

/// Decode a complete block payload into floats.
fn decode_payload(payload: &[u8]) -> core::result::Result<Vec<f32>, FormatError> {
    if payload.len() % 4 != 0 {
        return Err(FormatError::BlockLength(payload.len()));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|word| f32::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

/// Decode a whole `#<n><len><bytes>` block held in memory.
pub fn decode_block(buf: &[u8]) -> core::result::Result<Vec<f32>, FormatError> {
    let (header, length) = block_header(buf)?.ok_or(FormatError::BlockHeader)?;
    let payload = buf
        .get(header..header + length)
        .ok_or(FormatError::BlockHeader)?;
    decode_payload(payload)
}

/// Encode floats the way the supplies send them with `FORMat:BORDer NORMAL`.
pub fn encode_block(values: &[f32]) -> Vec<u8> {
    let length = (values.len() * 4).to_string();
    let mut out = Vec::with_capacity(2 + length.len() + values.len() * 4);
    out.push(b'#');
    out.push(b'0' + length.len() as u8);
    out.extend_from_slice(length.as_bytes());
    for value in values {
        out.extend_from_slice(&value.to_be_bytes());
    }
    out
}

/// SCPI framing on top of a [BusSession].
///
/// Bytes read past the end of a line are kept for the next read, so a reply split over several
/// transport reads (or several replies in one read) are both handled.
pub struct ScpiBus<S: BusSession> {
    session: S,
    read_buf: Vec<u8>,
    /// A block was just consumed; its trailing newline may still be on its way.
    skip_terminator: bool,
}

impl<S: BusSession> ScpiBus<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            read_buf: Vec::with_capacity(256),
            skip_terminator: false,
        }
    }

    /// Give the session back.
    pub fn into_inner(self) -> S {
        self.session
    }

    pub fn set_timeout(&mut self, timeout: core::time::Duration) -> Result<(), S::Error> {
        self.session
            .set_timeout(timeout)
            .map_err(Error::from_transport)
    }

    /// Clear the device and drop anything buffered locally.
    pub fn clear(&mut self) -> Result<(), S::Error> {
        self.discard_input();
        self.session.clear().map_err(Error::from_transport)
    }

    /// Forget buffered input, e.g. after a reply turned out to be garbage.
    pub fn discard_input(&mut self) {
        self.read_buf.clear();
        self.skip_terminator = false;
    }

    /// Send one command line.
    pub fn write_line(&mut self, cmd: &str) -> Result<(), S::Error> {
        debug!("> {cmd}");
        self.session
            .write_all(cmd.as_bytes())
            .map_err(Error::from_transport)?;
        self.session
            .write_all(&[LF])
            .map_err(Error::from_transport)?;
        self.session.flush().map_err(Error::from_transport)
    }

    /// Read one reply line, without the terminator and surrounding whitespace.
    pub fn read_line(&mut self) -> Result<String, S::Error> {
        let mut scanned = 0;
        let end = loop {
            if self.skip_terminator {
                if let Some(&first) = self.read_buf.first() {
                    self.skip_terminator = false;
                    if first == LF {
                        self.read_buf.drain(..1);
                        continue;
                    }
                }
            }
            if let Some(pos) = self.read_buf[scanned..].iter().position(|&b| b == LF) {
                break scanned + pos;
            }
            scanned = self.read_buf.len();
            self.fill()?;
        };

        let line: Vec<u8> = self.read_buf.drain(..=end).collect();
        let text = core::str::from_utf8(&line).map_err(|_| FormatError::NotUtf8)?;
        let text = text.trim().to_string();
        debug!("< {text}");
        Ok(text)
    }

    /// Write a command and read one line back.
    ///
    /// No error queue check happens here, a separate `SYST:ERR?` is needed for that.
    pub fn query(&mut self, cmd: &str) -> Result<String, S::Error> {
        self.write_line(cmd)?;
        self.read_line()
    }

    /// Query, then parse every field as a number.
    pub fn query_numbers(&mut self, cmd: &str) -> Result<Vec<f64>, S::Error> {
        let response = self.query(cmd)?;
        Ok(parse_numbers(&response)?)
    }

    /// Query a single number.
    pub fn query_number(&mut self, cmd: &str) -> Result<f64, S::Error> {
        let response = self.query(cmd)?;
        let first = split_fields(&response).next().unwrap_or_default();
        Ok(parse_number(first)?)
    }

    /// Query a single decimal register value.
    pub fn query_register(&mut self, cmd: &str) -> Result<u32, S::Error> {
        let response = self.query(cmd)?;
        let first = split_fields(&response).next().unwrap_or_default();
        Ok(parse_register(first)?)
    }

    /// Query exactly `N` numbers.
    pub fn query_array<const N: usize>(&mut self, cmd: &str) -> Result<[f64; N], S::Error> {
        let values = self.query_numbers(cmd)?;
        <[f64; N]>::try_from(values).map_err(|values| {
            Error::ProtocolViolation(format!(
                "{cmd} returned {} values, expected {N}",
                values.len()
            ))
        })
    }

    /// Pop `SYSTem:ERRor?` until the queue reports no error.
    pub fn drain_errors(&mut self) -> Result<(), S::Error> {
        for _ in 0..MAX_QUEUED_ERRORS {
            let entry = self.query("SYSTem:ERRor?")?;
            if entry.starts_with("+0,") || entry.starts_with("0,") {
                return Ok(());
            }
            warn!("discarding queued error {entry}");
        }
        Err(Error::ProtocolViolation(
            "error queue doesn't empty".to_string(),
        ))
    }

    /// Read a definite-length block of floats.
    ///
    /// Leading terminators left over from an earlier reply are skipped. Additional raw reads are
    /// issued until the declared payload length has arrived. On any failure whatever arrived of
    /// the block is dropped, so it can't be mistaken for the next reply.
    pub fn read_binary_block(&mut self) -> Result<Vec<f32>, S::Error> {
        let block = self.take_block();
        if block.is_err() {
            self.discard_input();
        }
        block
    }

    fn take_block(&mut self) -> Result<Vec<f32>, S::Error> {
        loop {
            let leading = self
                .read_buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.read_buf.drain(..leading);
            if !self.read_buf.is_empty() {
                break;
            }
            self.fill()?;
        }

        let (header, length) = loop {
            match block_header(&self.read_buf) {
                Ok(Some(found)) => break found,
                Ok(None) => {
                    self.fill()?;
                }
                Err(err) => return Err(err.into()),
            }
        };

        while self.read_buf.len() < header + length {
            self.fill()?;
        }

        let block: Vec<u8> = self.read_buf.drain(..header + length).collect();
        self.skip_terminator = true;
        debug!("< #block {length} bytes");
        Ok(decode_payload(&block[header..])?)
    }

    /// One raw read, appended to the buffer.
    fn fill(&mut self) -> Result<usize, S::Error> {
        let mut chunk = [0u8; 256];
        let count = self
            .session
            .read(&mut chunk)
            .map_err(Error::from_transport)?;
        if count == 0 {
            return Err(Error::Disconnected);
        }
        self.read_buf.extend_from_slice(&chunk[..count]);
        Ok(count)
    }
}

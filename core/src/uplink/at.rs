//! Line-oriented AT command channel
//!
//! Knows nothing about the modem's command vocabulary: it writes command
//! lines and raw bytes, and waits for a response line that starts with one
//! of a caller-supplied set of tokens. Everything else the modem prints
//! (command echo, unsolicited result codes, blank lines) is skipped.

use embassy_futures::select::{select, Either};
use hal_abstractions::{DelayNs, Monotonic, Read, Write};
use heapless::String;

use super::UplinkError;

/// Longest response line kept; the tail of longer lines is discarded
pub const LINE_CAP: usize = 160;

const RX_CHUNK: usize = 64;

/// One response line, without its terminator
pub type Line = String<LINE_CAP>;

/// Result of waiting for a response token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A line starting with `tokens[token]` arrived
    Matched { token: usize, line: Line },
    /// The deadline passed first
    TimedOut,
}

/// Command/response channel over a byte-stream port
pub struct AtChannel<IO, D, M> {
    io: IO,
    delay: D,
    clock: M,
    rx: [u8; RX_CHUNK],
    rx_pos: usize,
    rx_len: usize,
    partial: Line,
    overlong: bool,
}

impl<IO, D, M> AtChannel<IO, D, M>
where
    IO: Read + Write,
    D: DelayNs,
    M: Monotonic,
{
    pub fn new(io: IO, delay: D, clock: M) -> Self {
        Self {
            io,
            delay,
            clock,
            rx: [0; RX_CHUNK],
            rx_pos: 0,
            rx_len: 0,
            partial: Line::new(),
            overlong: false,
        }
    }

    /// Send one command line, e.g. `AT+QHTTPSTOP`
    ///
    /// Terminated by a lone CR: a trailing LF would land in the data phase of
    /// commands that answer `CONNECT`.
    pub async fn send(&mut self, command: &str) -> Result<(), UplinkError> {
        debug!("modem <- {}", command);
        self.write_raw(command.as_bytes()).await?;
        self.write_raw(b"\r").await
    }

    /// Write bytes verbatim, used inside `CONNECT` data phases
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), UplinkError> {
        self.io.write_all(bytes).await.map_err(|_| UplinkError::Io)?;
        self.io.flush().await.map_err(|_| UplinkError::Io)
    }

    /// Wait up to `timeout_ms` for a line starting with any of `tokens`
    pub async fn await_token(
        &mut self,
        tokens: &[&str],
        timeout_ms: u32,
    ) -> Result<Response, UplinkError> {
        let deadline = self.clock.now_ms() + timeout_ms as u64;
        loop {
            let Some(line) = self.read_line(deadline).await? else {
                return Ok(Response::TimedOut);
            };
            if let Some(token) = tokens.iter().position(|t| line.starts_with(t)) {
                return Ok(Response::Matched { token, line });
            }
            trace!("modem -> {} (skipped)", line.as_str());
        }
    }

    /// Pause between raw writes
    pub async fn pause_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms).await;
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Next non-empty line, or `None` once `deadline_ms` has passed
    pub async fn read_line(&mut self, deadline_ms: u64) -> Result<Option<Line>, UplinkError> {
        loop {
            while self.rx_pos < self.rx_len {
                let byte = self.rx[self.rx_pos];
                self.rx_pos += 1;
                match byte {
                    b'\n' | b'\r' => {
                        let overlong = core::mem::replace(&mut self.overlong, false);
                        if overlong {
                            warn!("modem line longer than {} bytes truncated", LINE_CAP);
                        }
                        if !self.partial.is_empty() {
                            let line = core::mem::take(&mut self.partial);
                            debug!("modem -> {}", line.as_str());
                            return Ok(Some(line));
                        }
                    }
                    byte if byte.is_ascii() => {
                        if self.partial.push(byte as char).is_err() {
                            self.overlong = true;
                        }
                    }
                    _ => {}
                }
            }

            let now = self.clock.now_ms();
            if now >= deadline_ms {
                return Ok(None);
            }
            let remaining = (deadline_ms - now).min(u32::MAX as u64) as u32;

            match select(self.io.read(&mut self.rx), self.delay.delay_ms(remaining)).await {
                Either::First(Ok(n)) => {
                    self.rx_pos = 0;
                    self.rx_len = n;
                }
                Either::First(Err(_)) => return Err(UplinkError::Io),
                Either::Second(()) => return Ok(None),
            }
        }
    }
}

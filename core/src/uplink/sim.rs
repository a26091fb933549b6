//! Simulated cellular modem and clock for host tests

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::{String, ToString};
use std::vec::Vec;

use core::convert::Infallible;

use hal_abstractions::{DelayNs, ErrorType, Monotonic, Read, Write};

/// Millisecond clock that only moves when something waits on it
#[derive(Clone, Default)]
pub struct FakeClock {
    now: Rc<Cell<u64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now.get()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Monotonic for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

impl DelayNs for FakeClock {
    async fn delay_ns(&mut self, ns: u32) {
        self.advance((ns as u64).div_ceil(1_000_000));
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.advance(ms as u64);
    }
}

/// Data phase announced by a command's first numeric argument
#[derive(Clone, Copy, PartialEq, Eq)]
enum Raw {
    None,
    /// `AT+CMD=<len>,...` is followed by exactly `len` raw bytes
    FirstArg,
}

struct Rule {
    prefix: String,
    replies: Vec<String>,
    raw: Raw,
    after_raw: Vec<String>,
    once: bool,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    command: Vec<u8>,
    commands: Vec<String>,
    raw_remaining: usize,
    raw: Vec<u8>,
    after_raw: Vec<String>,
    output: VecDeque<u8>,
}

impl State {
    fn emit(&mut self, lines: &[String]) {
        for line in lines {
            self.output.extend(line.as_bytes());
            self.output.extend(b"\r\n");
        }
    }

    fn on_command(&mut self, command: String) {
        let found = self
            .rules
            .iter()
            .position(|rule| command.starts_with(rule.prefix.as_str()));
        if let Some(index) = found {
            let rule = &self.rules[index];
            let replies = rule.replies.clone();
            if rule.raw == Raw::FirstArg {
                self.raw_remaining = first_arg(&command);
                self.after_raw = rule.after_raw.clone();
            }
            if rule.once {
                self.rules.remove(index);
            }
            self.emit(&replies);
        }
        self.commands.push(command);
    }

    fn on_bytes(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.raw_remaining > 0 {
                let n = self.raw_remaining.min(bytes.len());
                self.raw.extend_from_slice(&bytes[..n]);
                self.raw_remaining -= n;
                bytes = &bytes[n..];
                if self.raw_remaining == 0 {
                    let after = core::mem::take(&mut self.after_raw);
                    self.emit(&after);
                }
                continue;
            }

            let byte = bytes[0];
            bytes = &bytes[1..];
            if byte == b'\r' || byte == b'\n' {
                if !self.command.is_empty() {
                    let command = String::from_utf8_lossy(&self.command).into_owned();
                    self.command.clear();
                    self.on_command(command);
                }
            } else {
                self.command.push(byte);
            }
        }
    }
}

fn first_arg(command: &str) -> usize {
    command
        .split_once('=')
        .and_then(|(_, args)| args.split(',').next())
        .and_then(|arg| arg.trim().parse().ok())
        .unwrap_or(0)
}

/// Scripted modem: replies to command lines from a prefix-matched rule table
#[derive(Clone, Default)]
pub struct SimModem {
    state: Rc<RefCell<State>>,
}

impl SimModem {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, prefix: &str, replies: &[&str], raw: Raw, after_raw: &[&str], once: bool) -> Self {
        self.state.borrow_mut().rules.push(Rule {
            prefix: prefix.to_string(),
            replies: replies.iter().map(|s| s.to_string()).collect(),
            raw,
            after_raw: after_raw.iter().map(|s| s.to_string()).collect(),
            once,
        });
        self
    }

    /// Answer every command starting with `prefix`
    pub fn reply(self, prefix: &str, replies: &[&str]) -> Self {
        self.rule(prefix, replies, Raw::None, &[], false)
    }

    /// Answer only the next command starting with `prefix`
    pub fn reply_once(self, prefix: &str, replies: &[&str]) -> Self {
        self.rule(prefix, replies, Raw::None, &[], true)
    }

    /// Answer with `replies`, absorb the announced byte count, then send `after_raw`
    pub fn reply_with_data(self, prefix: &str, replies: &[&str], after_raw: &[&str]) -> Self {
        self.rule(prefix, replies, Raw::FirstArg, after_raw, false)
    }

    /// Every command line received, in order
    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    /// Every byte received inside data phases, concatenated
    pub fn raw(&self) -> Vec<u8> {
        self.state.borrow().raw.clone()
    }

    /// True when a data phase is still waiting for bytes
    pub fn raw_pending(&self) -> bool {
        self.state.borrow().raw_remaining > 0
    }
}

impl ErrorType for SimModem {
    type Error = Infallible;
}

impl Read for SimModem {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = {
            let mut state = self.state.borrow_mut();
            let n = buf.len().min(state.output.len());
            for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
                *slot = byte;
            }
            n
        };
        if n == 0 {
            // Silent modem: the caller's timeout decides
            core::future::pending::<()>().await;
        }
        Ok(n)
    }
}

impl Write for SimModem {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.state.borrow_mut().on_bytes(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

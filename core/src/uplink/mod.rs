//! Cellular uplink driver
//!
//! Drives a Quectel-style modem's built-in HTTP(S) client over AT commands.
//! Every upload is one self-contained modem session:
//!
//! 1. `AT+QHTTPSTOP` clears whatever a previous failed attempt left open
//! 2. the PDP context is checked and, if needed, configured and activated
//! 3. the HTTP client is configured (context, raw-header mode, SSL context)
//! 4. the request is issued and its terminal result awaited
//!
//! Upload entry points never fail: every error folds into an
//! [`UploadOutcome`] and the caller decides what happens next. There is no
//! retry at this layer.

pub mod at;
pub mod http;
#[cfg(test)]
pub(crate) mod sim;

use core::fmt::Write as _;

use hal_abstractions::{CivilTime, DelayNs, Monotonic, Read, Write};
use heapless::{String, Vec};

use self::at::{AtChannel, Line, Response};
use self::http::{ImagePost, UrlParts};
use crate::clock;
use crate::config::{ConfigError, HubConfig, ModemConfig};
use crate::telemetry::TelemetryRecord;

type Command = String<128>;

const OK: &str = "OK";
const CONNECT: &str = "CONNECT";
const ERROR_TOKENS: [&str; 3] = ["ERROR", "+CME ERROR", "+CMS ERROR"];
const PROBE_ATTEMPTS: usize = 3;

/// What an upload carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PayloadKind {
    Telemetry,
    Image,
}

/// Terminal state of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UploadOutcome {
    Success,
    /// No recognised response within the allotted window
    Timeout,
    /// The modem or the server refused the request
    ModemError,
    /// No usable cellular data connection
    LinkDown,
}

/// Record of one call into the uplink driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UploadAttempt {
    pub kind: PayloadKind,
    pub payload_len: usize,
    pub outcome: UploadOutcome,
}

impl UploadAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == UploadOutcome::Success
    }
}

/// Uplink driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UplinkError {
    /// PDP context could not be activated
    LinkDown,
    /// Expected response token never arrived
    ProtocolTimeout,
    /// Modem answered `ERROR` or reported an HTTP client error
    ModemError,
    /// Server answered outside 2xx
    Rejected { status: u16 },
    /// Server answered 2xx without the success marker
    NotAcknowledged,
    /// Serial port failure
    Io,
    /// Request did not fit its fixed-capacity buffer
    Overflow,
}

impl UplinkError {
    pub fn outcome(&self) -> UploadOutcome {
        match self {
            Self::LinkDown => UploadOutcome::LinkDown,
            Self::ProtocolTimeout => UploadOutcome::Timeout,
            Self::ModemError
            | Self::Rejected { .. }
            | Self::NotAcknowledged
            | Self::Io
            | Self::Overflow => UploadOutcome::ModemError,
        }
    }
}

impl core::fmt::Display for UplinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::LinkDown => write!(f, "cellular data link down"),
            Self::ProtocolTimeout => write!(f, "modem response timeout"),
            Self::ModemError => write!(f, "modem reported an error"),
            Self::Rejected { status } => write!(f, "server rejected request with HTTP {}", status),
            Self::NotAcknowledged => write!(f, "server response lacks the success marker"),
            Self::Io => write!(f, "modem serial port error"),
            Self::Overflow => write!(f, "request exceeds buffer capacity"),
        }
    }
}

impl core::error::Error for UplinkError {}

fn command(args: core::fmt::Arguments<'_>) -> Result<Command, UplinkError> {
    let mut out = Command::new();
    out.write_fmt(args).map_err(|_| UplinkError::Overflow)?;
    Ok(out)
}

fn check_status(err: u16, status: u16) -> Result<(), UplinkError> {
    if err != 0 {
        warn!("modem HTTP client error {}", err);
        return Err(UplinkError::ModemError);
    }
    if !(200..300).contains(&status) {
        return Err(UplinkError::Rejected { status });
    }
    Ok(())
}

/// Cellular uplink over an AT command port
pub struct Uplink<IO, D, M> {
    at: AtChannel<IO, D, M>,
    modem: ModemConfig,
    apn: &'static str,
    token: &'static str,
    endpoint: UrlParts<'static>,
}

impl<IO, D, M> Uplink<IO, D, M>
where
    IO: Read + Write,
    D: DelayNs,
    M: Monotonic,
{
    pub fn new(io: IO, delay: D, clock: M, config: &HubConfig) -> Result<Self, ConfigError> {
        let endpoint = http::parse_url(config.upload_url).ok_or(ConfigError::InvalidUrl)?;
        Ok(Self {
            at: AtChannel::new(io, delay, clock),
            modem: config.modem,
            apn: config.apn,
            token: config.token,
            endpoint,
        })
    }

    /// Check the modem answers `AT`, then turn command echo off
    pub async fn probe(&mut self) -> Result<(), UplinkError> {
        let mut result = Err(UplinkError::ProtocolTimeout);
        for attempt in 1..=PROBE_ATTEMPTS {
            result = self.expect_ok("AT", self.modem.command_timeout_ms).await;
            if result.is_ok() {
                break;
            }
            debug!("modem probe attempt {} failed", attempt);
        }
        result?;
        if self.expect_ok("ATE0", self.modem.command_timeout_ms).await.is_err() {
            warn!("modem refused ATE0, continuing with echo");
        }
        Ok(())
    }

    /// UTC time from the cellular network
    pub async fn network_time(&mut self) -> Result<CivilTime, UplinkError> {
        let line = self
            .query("AT+CCLK?", "+CCLK:", self.modem.command_timeout_ms)
            .await?
            .ok_or(UplinkError::ModemError)?;
        clock::parse_cclk(&line).ok_or_else(|| {
            warn!("implausible network time: {}", line.as_str());
            UplinkError::ModemError
        })
    }

    /// Ask the modem for an orderly power-down
    pub async fn power_down(&mut self) -> Result<(), UplinkError> {
        self.expect_ok("AT+QPOWD=1", self.modem.command_timeout_ms).await
    }

    /// Send one telemetry record as an HTTP GET
    pub async fn upload_telemetry(&mut self, record: &TelemetryRecord) -> UploadAttempt {
        info!(
            "uploading telemetry from node {}: {}% {} V",
            record.node_id, record.moisture_pct, record.battery_volts
        );
        let result = self.get_telemetry(record).await;
        self.finish(PayloadKind::Telemetry, crate::telemetry::WIRE_LEN, result)
    }

    /// Send one image as a multipart POST
    pub async fn upload_image(&mut self, image: &[u8]) -> UploadAttempt {
        info!("uploading image of {} bytes", image.len());
        let result = self.post_image(image).await;
        self.finish(PayloadKind::Image, image.len(), result)
    }

    fn finish(
        &mut self,
        kind: PayloadKind,
        payload_len: usize,
        result: Result<(), UplinkError>,
    ) -> UploadAttempt {
        let outcome = match result {
            Ok(()) => UploadOutcome::Success,
            Err(e) => {
                warn!("{:?} upload failed: {:?}", kind, e);
                e.outcome()
            }
        };
        info!("{:?} upload of {} bytes: {:?}", kind, payload_len, outcome);
        UploadAttempt {
            kind,
            payload_len,
            outcome,
        }
    }

    async fn get_telemetry(&mut self, record: &TelemetryRecord) -> Result<(), UplinkError> {
        let url = http::telemetry_url(&self.endpoint, self.token, record)?;
        self.open_session(false).await?;
        self.set_url(&url).await?;

        let cmd = command(format_args!("AT+QHTTPGET={}", self.modem.http_timeout_secs))?;
        self.at.send(&cmd).await?;
        let (_, line) = self
            .expect(&["+QHTTPGET:"], self.modem.response_timeout_ms)
            .await?;
        let (err, status) =
            http::parse_result(&line, "+QHTTPGET:").ok_or(UplinkError::ModemError)?;
        check_status(err, status)
    }

    async fn post_image(&mut self, image: &[u8]) -> Result<(), UplinkError> {
        let url = http::connect_url(&self.endpoint)?;
        let post = ImagePost::new(&self.endpoint, self.token, image.len())?;
        self.open_session(true).await?;
        self.set_url(&url).await?;

        let secs = self.modem.http_timeout_secs;
        let cmd = command(format_args!("AT+QHTTPPOST={},{},{}", post.total_len(), secs, secs))?;
        self.at.send(&cmd).await?;
        self.expect(&[CONNECT], self.modem.prompt_timeout_ms).await?;

        debug!(
            "streaming {} bytes ({} header, {} body)",
            post.total_len(),
            post.header.len(),
            post.content_length()
        );
        self.at.write_raw(post.header.as_bytes()).await?;
        self.at.write_raw(post.head.as_bytes()).await?;
        for chunk in image.chunks(self.modem.stream_chunk_len.max(1)) {
            self.at.write_raw(chunk).await?;
            self.at.pause_ms(self.modem.stream_delay_ms).await;
        }
        self.at.write_raw(post.tail.as_bytes()).await?;

        let (_, line) = self
            .expect(&["+QHTTPPOST:"], self.modem.response_timeout_ms)
            .await?;
        let (err, status) =
            http::parse_result(&line, "+QHTTPPOST:").ok_or(UplinkError::ModemError)?;
        check_status(err, status)?;

        self.read_acknowledgement().await
    }

    /// Scan the response body for the configured success marker
    async fn read_acknowledgement(&mut self) -> Result<(), UplinkError> {
        let cmd = command(format_args!("AT+QHTTPREAD={}", self.modem.http_timeout_secs))?;
        self.at.send(&cmd).await?;
        self.expect(&[CONNECT], self.modem.prompt_timeout_ms).await?;

        let marker = self.modem.success_marker;
        let deadline = self.at.now_ms() + self.modem.response_timeout_ms as u64;
        let mut acknowledged = false;
        while let Some(line) = self.at.read_line(deadline).await? {
            if line.starts_with("+QHTTPREAD:") {
                break;
            }
            if ERROR_TOKENS.iter().any(|t| line.starts_with(t)) && !acknowledged {
                return Err(UplinkError::ModemError);
            }
            if line.contains(marker) {
                acknowledged = true;
            }
        }

        if acknowledged {
            Ok(())
        } else {
            Err(UplinkError::NotAcknowledged)
        }
    }

    /// Reset, connect and configure the modem's HTTP client
    async fn open_session(&mut self, raw_header: bool) -> Result<(), UplinkError> {
        // Step 1: clear any half-open session; fails harmlessly when idle
        let _ = self
            .expect_ok("AT+QHTTPSTOP", self.modem.command_timeout_ms)
            .await;

        // Step 2: data link
        self.ensure_context().await?;

        // Step 3: HTTP client configuration
        let ctx = self.modem.context_id;
        let timeout = self.modem.command_timeout_ms;
        let cmd = command(format_args!("AT+QHTTPCFG=\"contextid\",{}", ctx))?;
        self.expect_ok(&cmd, timeout).await?;
        let cmd = command(format_args!(
            "AT+QHTTPCFG=\"requestheader\",{}",
            raw_header as u8
        ))?;
        self.expect_ok(&cmd, timeout).await?;

        if self.endpoint.secure {
            let ssl = self.modem.ssl_context_id;
            let cmd = command(format_args!("AT+QHTTPCFG=\"sslctxid\",{}", ssl))?;
            self.expect_ok(&cmd, timeout).await?;
            let cmd = command(format_args!(
                "AT+QSSLCFG=\"seclevel\",{},{}",
                ssl, self.modem.security_level
            ))?;
            self.expect_ok(&cmd, timeout).await?;
        }
        Ok(())
    }

    /// Activate the PDP context unless it already is
    async fn ensure_context(&mut self) -> Result<(), UplinkError> {
        let ctx = self.modem.context_id;
        let prefix = command(format_args!("+QIACT: {},", ctx))?;
        let active = self
            .query("AT+QIACT?", &prefix, self.modem.command_timeout_ms)
            .await
            .map_err(|e| match e {
                UplinkError::ModemError => {
                    warn!("PDP context query refused");
                    UplinkError::LinkDown
                }
                other => other,
            })?;
        if active.is_some() {
            return Ok(());
        }

        info!("activating PDP context {} on APN {}", ctx, self.apn);
        let activation = self.modem.activation_timeout_ms;
        let cmd = command(format_args!("AT+QIDEACT={}", ctx))?;
        let _ = self.expect_ok(&cmd, activation).await;

        let cmd = command(format_args!("AT+QICSGP={},3,\"{}\",\"\",\"\",0", ctx, self.apn))?;
        self.expect_ok(&cmd, self.modem.command_timeout_ms).await?;

        let cmd = command(format_args!("AT+QIACT={}", ctx))?;
        self.expect_ok(&cmd, activation).await.map_err(|e| {
            warn!("PDP context activation failed: {:?}", e);
            UplinkError::LinkDown
        })
    }

    /// Announce and stream the request URL
    async fn set_url(&mut self, url: &str) -> Result<(), UplinkError> {
        let cmd = command(format_args!(
            "AT+QHTTPURL={},{}",
            url.len(),
            self.modem.http_timeout_secs
        ))?;
        self.at.send(&cmd).await?;
        self.expect(&[CONNECT], self.modem.prompt_timeout_ms).await?;
        debug!("modem <- {}", url);
        self.at.write_raw(url.as_bytes()).await?;
        self.expect(&[OK], self.modem.command_timeout_ms).await?;
        Ok(())
    }

    async fn expect_ok(&mut self, cmd: &str, timeout_ms: u32) -> Result<(), UplinkError> {
        self.at.send(cmd).await?;
        self.expect(&[OK], timeout_ms).await.map(|_| ())
    }

    /// Send `cmd` and collect the first line starting with `prefix` before `OK`
    async fn query(
        &mut self,
        cmd: &str,
        prefix: &str,
        timeout_ms: u32,
    ) -> Result<Option<Line>, UplinkError> {
        self.at.send(cmd).await?;
        let mut found = None;
        loop {
            let (token, line) = self.expect(&[prefix, OK], timeout_ms).await?;
            if token == 1 {
                return Ok(found);
            }
            if found.is_none() {
                found = Some(line);
            }
        }
    }

    /// Wait for one of `tokens`; error tokens and timeouts become errors
    async fn expect(&mut self, tokens: &[&str], timeout_ms: u32) -> Result<(usize, Line), UplinkError> {
        let mut all: Vec<&str, 8> = Vec::new();
        for token in tokens.iter().chain(ERROR_TOKENS.iter()) {
            all.push(*token).map_err(|_| UplinkError::Overflow)?;
        }

        match self.at.await_token(&all, timeout_ms).await? {
            Response::Matched { token, line } if token < tokens.len() => Ok((token, line)),
            Response::Matched { line, .. } => {
                warn!("modem error response: {}", line.as_str());
                Err(UplinkError::ModemError)
            }
            Response::TimedOut => {
                warn!("modem timeout waiting for {:?}", tokens.first().copied().unwrap_or(""));
                Err(UplinkError::ProtocolTimeout)
            }
        }
    }
}

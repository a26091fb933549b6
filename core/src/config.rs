//! Hub configuration structures
//!
//! Loaded once at process start and never mutated. Every struct carries a
//! `Default` with the production values and a `validate()` the board runs
//! before handing the configuration to [`crate::hub::Hub`].

use crate::telemetry::TelemetryRecord;
use crate::uplink::http;

/// Wake-window schedule consulted by the duty-cycle scheduler
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WakeSchedule {
    /// Minute-of-hour marks opening a window, strictly increasing, each < 60
    pub marks: &'static [u8],
    /// Window length in minutes; windows wrap across the hour boundary
    pub window_minutes: u8,
    /// First local hour of day mode
    pub day_start_hour: u8,
    /// First local hour of night mode
    pub day_end_hour: u8,
    /// Floor applied to every computed nap
    pub min_nap_secs: u32,
}

impl Default for WakeSchedule {
    fn default() -> Self {
        Self {
            marks: &[13, 28, 43, 58],
            window_minutes: 4,
            day_start_hour: 7,
            day_end_hour: 19,
            min_nap_secs: 10,
        }
    }
}

impl WakeSchedule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.marks.is_empty() {
            return Err(ConfigError::NoWakeMarks);
        }
        if let Some(&mark) = self.marks.iter().find(|&&m| m >= 60) {
            return Err(ConfigError::MarkOutOfRange(mark));
        }
        if self.marks.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::MarksNotIncreasing);
        }
        if self.window_minutes == 0 || self.window_minutes >= 60 {
            return Err(ConfigError::WindowOutOfRange(self.window_minutes));
        }
        for hour in [self.day_start_hour, self.day_end_hour] {
            if hour >= 24 {
                return Err(ConfigError::HourOutOfRange(hour));
            }
        }
        if self.min_nap_secs == 0 {
            return Err(ConfigError::ZeroNapFloor);
        }
        Ok(())
    }
}

/// Radio classification and image reassembly parameters
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageConfig {
    /// Frames must be strictly longer than this to count as image chunks
    pub min_chunk_len: usize,
    /// Gap after the last chunk that closes a transfer
    pub idle_timeout_ms: u64,
    /// Closed transfers shorter than this are discarded as noise
    pub min_image_len: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            min_chunk_len: 16,
            idle_timeout_ms: 3_000,
            min_image_len: 1_024,
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        if self.min_image_len <= self.min_chunk_len {
            return Err(ConfigError::MinImageLen(self.min_image_len));
        }
        Ok(())
    }

    /// Check the thresholds against the reassembly buffer size
    pub fn check_capacity(&self, capacity: usize) -> Result<(), ConfigError> {
        if self.min_image_len > capacity {
            return Err(ConfigError::MinImageLen(self.min_image_len));
        }
        Ok(())
    }
}

/// Cellular modem protocol parameters
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModemConfig {
    /// Plain command → `OK`/`ERROR`
    pub command_timeout_ms: u32,
    /// Command → `CONNECT` data prompt
    pub prompt_timeout_ms: u32,
    /// PDP context activation
    pub activation_timeout_ms: u32,
    /// Request issued → terminal HTTP result
    pub response_timeout_ms: u32,
    /// Timeout the modem applies to its own HTTP operations
    pub http_timeout_secs: u16,
    /// PDP context used for HTTP
    pub context_id: u8,
    /// SSL context used for HTTPS
    pub ssl_context_id: u8,
    /// SSL security level (0 = no certificate verification)
    pub security_level: u8,
    /// Image bytes written per serial burst
    pub stream_chunk_len: usize,
    /// Pause between bursts, respecting the UART flow-control limits
    pub stream_delay_ms: u32,
    /// Substring of the POST response body that confirms ingestion
    pub success_marker: &'static str,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            prompt_timeout_ms: 10_000,
            activation_timeout_ms: 15_000,
            response_timeout_ms: 30_000,
            http_timeout_secs: 60,
            context_id: 1,
            ssl_context_id: 1,
            security_level: 0,
            stream_chunk_len: 512,
            stream_delay_ms: 10,
            success_marker: "success",
        }
    }
}

impl ModemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            self.command_timeout_ms,
            self.prompt_timeout_ms,
            self.activation_timeout_ms,
            self.response_timeout_ms,
        ];
        if timeouts.contains(&0) || self.http_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(1..=16).contains(&self.context_id) {
            return Err(ConfigError::ContextId(self.context_id));
        }
        if self.ssl_context_id > 5 {
            return Err(ConfigError::ContextId(self.ssl_context_id));
        }
        if self.security_level > 2 {
            return Err(ConfigError::SecurityLevel(self.security_level));
        }
        if self.stream_chunk_len == 0 {
            return Err(ConfigError::ZeroStreamChunk);
        }
        if self.success_marker.is_empty() {
            return Err(ConfigError::EmptySuccessMarker);
        }
        Ok(())
    }
}

/// Complete hub configuration
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HubConfig {
    /// Shared secret appended as the `token` query parameter
    pub token: &'static str,
    /// Cloud ingestion base URL, e.g. `https://ingest.example.run.app`
    pub upload_url: &'static str,
    /// Cellular access point name
    pub apn: &'static str,
    /// Short-range radio channel, must match the spokes
    pub radio_channel: u8,
    /// Offset applied to network time before it is written to the wall clock
    pub utc_offset_minutes: i16,
    /// How often the orchestrator consults the scheduler while idle
    pub schedule_check_ms: u64,
    pub schedule: WakeSchedule,
    pub image: ImageConfig,
    pub modem: ModemConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            token: "",
            upload_url: "",
            apn: "jionet",
            radio_channel: 1,
            utc_offset_minutes: 330,
            schedule_check_ms: 5_000,
            schedule: WakeSchedule::default(),
            image: ImageConfig::default(),
            modem: ModemConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.validate()?;
        if self.token.is_empty() {
            return Err(ConfigError::EmptyToken);
        }
        if self.apn.is_empty() {
            return Err(ConfigError::EmptyApn);
        }
        http::parse_url(self.upload_url).ok_or(ConfigError::InvalidUrl)?;
        if !(1..=13).contains(&self.radio_channel) {
            return Err(ConfigError::RadioChannel(self.radio_channel));
        }
        if !(-720..=840).contains(&self.utc_offset_minutes) {
            return Err(ConfigError::UtcOffset(self.utc_offset_minutes));
        }
        self.image.validate()?;
        self.modem.validate()?;
        self.check_request_sizes()
    }

    /// Build the largest request of each shape once, so an oversized token
    /// or URL fails here instead of on every upload
    fn check_request_sizes(&self) -> Result<(), ConfigError> {
        let url = http::parse_url(self.upload_url).ok_or(ConfigError::InvalidUrl)?;
        let widest = TelemetryRecord {
            node_id: i32::MIN,
            moisture_pct: i32::MIN,
            battery_volts: f32::MIN,
        };
        http::telemetry_url(&url, self.token, &widest).map_err(|_| ConfigError::RequestTooLong)?;
        http::connect_url(&url).map_err(|_| ConfigError::RequestTooLong)?;
        http::ImagePost::new(&url, self.token, i32::MAX as usize)
            .map_err(|_| ConfigError::RequestTooLong)?;
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Wake schedule has no marks
    NoWakeMarks,
    /// Wake mark is not a minute of the hour
    MarkOutOfRange(u8),
    /// Wake marks are unsorted or repeated
    MarksNotIncreasing,
    /// Window must be 1..=59 minutes
    WindowOutOfRange(u8),
    /// Day-mode hour is not an hour of the day
    HourOutOfRange(u8),
    /// Nap floor of zero allows a wake/sleep thrash loop
    ZeroNapFloor,
    /// Shared secret missing
    EmptyToken,
    /// Access point name missing
    EmptyApn,
    /// Upload URL is not `http(s)://host[/path]`
    InvalidUrl,
    /// Radio channel outside 1..=13
    RadioChannel(u8),
    /// UTC offset outside -12:00..=+14:00
    UtcOffset(i16),
    /// Image stream chunk length of zero
    ZeroStreamChunk,
    /// Token or URL too long for the request buffers
    RequestTooLong,
    /// Image idle timeout of zero closes every transfer at once
    ZeroIdleTimeout,
    /// Minimum image length not above the chunk threshold, or above the buffer
    MinImageLen(usize),
    /// Modem timeout of zero
    ZeroTimeout,
    /// PDP or SSL context id out of the modem's range
    ContextId(u8),
    /// SSL security level outside 0..=2
    SecurityLevel(u8),
    /// Success marker missing
    EmptySuccessMarker,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoWakeMarks => write!(f, "no wake marks configured"),
            Self::MarkOutOfRange(m) => write!(f, "wake mark {} is not a minute of the hour", m),
            Self::MarksNotIncreasing => write!(f, "wake marks must be strictly increasing"),
            Self::WindowOutOfRange(w) => write!(f, "wake window of {} minutes", w),
            Self::HourOutOfRange(h) => write!(f, "hour {} out of range", h),
            Self::ZeroNapFloor => write!(f, "minimum nap must be positive"),
            Self::EmptyToken => write!(f, "empty upload token"),
            Self::EmptyApn => write!(f, "empty APN"),
            Self::InvalidUrl => write!(f, "invalid upload URL"),
            Self::RadioChannel(c) => write!(f, "radio channel {} out of range", c),
            Self::UtcOffset(o) => write!(f, "UTC offset {} minutes out of range", o),
            Self::ZeroStreamChunk => write!(f, "stream chunk length is zero"),
            Self::RequestTooLong => write!(f, "token or URL too long for a request"),
            Self::ZeroIdleTimeout => write!(f, "image idle timeout is zero"),
            Self::MinImageLen(n) => write!(f, "minimum image length {} out of range", n),
            Self::ZeroTimeout => write!(f, "modem timeout is zero"),
            Self::ContextId(id) => write!(f, "context id {} out of range", id),
            Self::SecurityLevel(l) => write!(f, "security level {} out of range", l),
            Self::EmptySuccessMarker => write!(f, "empty success marker"),
        }
    }
}

impl core::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> HubConfig {
        HubConfig {
            token: "FARM_SEC",
            upload_url: "https://ingest.example.run.app",
            ..HubConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate_once_secrets_are_set() {
        assert_eq!(valid().validate(), Ok(()));
        assert_eq!(HubConfig::default().validate(), Err(ConfigError::EmptyToken));
    }

    #[test]
    fn test_schedule_rejects_bad_marks() {
        let mut cfg = valid();
        cfg.schedule.marks = &[];
        assert_eq!(cfg.validate(), Err(ConfigError::NoWakeMarks));
        cfg.schedule.marks = &[13, 60];
        assert_eq!(cfg.validate(), Err(ConfigError::MarkOutOfRange(60)));
        cfg.schedule.marks = &[28, 13];
        assert_eq!(cfg.validate(), Err(ConfigError::MarksNotIncreasing));
        cfg.schedule.marks = &[13, 13];
        assert_eq!(cfg.validate(), Err(ConfigError::MarksNotIncreasing));
    }

    #[test]
    fn test_schedule_rejects_bad_window_and_hours() {
        let mut cfg = valid();
        cfg.schedule.window_minutes = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::WindowOutOfRange(0)));
        cfg.schedule.window_minutes = 4;
        cfg.schedule.day_end_hour = 24;
        assert_eq!(cfg.validate(), Err(ConfigError::HourOutOfRange(24)));
    }

    #[test]
    fn test_rejects_bad_url_and_channel() {
        let mut cfg = valid();
        cfg.upload_url = "ftp://example.com";
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidUrl));
        cfg.upload_url = "https://example.com/ingest";
        cfg.radio_channel = 14;
        assert_eq!(cfg.validate(), Err(ConfigError::RadioChannel(14)));
    }

    #[test]
    fn test_rejects_token_too_long_for_requests() {
        let mut cfg = valid();
        cfg.token = "K1mZ4pQ8vR2tW6yB0cF3hJ7nL5sX9aD1gE4iM8oU2qT6wZ0bV3eH7kN5rY9uC1xA4fG8jP2lS6mQ0tW3yB7dF1hK5nR9sV2zE6iL0oU4qX8cG3jM7pT1wA5eH9kN2rY6uB0xD4gJ8lS3oV7zC1fI5mQ9tW2bE6hL0nR4uX8aD3gK7pS1vZ5cF9iM2oT6yB0eH4jN8qW3lA7sX1dG5kP9rU2vC6fI0mQ4tY8bE3hL7nZ1oS5w";
        assert!(cfg.token.len() > 220);
        assert_eq!(cfg.validate(), Err(ConfigError::RequestTooLong));

        let mut cfg = valid();
        cfg.token = "a b&c=d/e?f";
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_image_thresholds() {
        let mut cfg = valid();
        cfg.image.idle_timeout_ms = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroIdleTimeout));

        let mut cfg = valid();
        cfg.image.min_image_len = 16;
        assert_eq!(cfg.validate(), Err(ConfigError::MinImageLen(16)));

        let image = ImageConfig::default();
        assert_eq!(image.check_capacity(64 * 1024), Ok(()));
        assert_eq!(image.check_capacity(512), Err(ConfigError::MinImageLen(1_024)));
    }

    #[test]
    fn test_modem_parameters() {
        let mut cfg = valid();
        cfg.modem.response_timeout_ms = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroTimeout));

        let mut cfg = valid();
        cfg.modem.context_id = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ContextId(0)));

        let mut cfg = valid();
        cfg.modem.security_level = 3;
        assert_eq!(cfg.validate(), Err(ConfigError::SecurityLevel(3)));

        let mut cfg = valid();
        cfg.modem.stream_chunk_len = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroStreamChunk));

        let mut cfg = valid();
        cfg.modem.success_marker = "";
        assert_eq!(cfg.validate(), Err(ConfigError::EmptySuccessMarker));
    }
}

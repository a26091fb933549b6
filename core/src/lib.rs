//! Platform-agnostic logic for the field relay hub
//!
//! Everything the hub decides lives here: when to sleep, how inbound radio
//! frames are classified and reassembled, how buffered data is framed into
//! HTTP requests for the cellular modem, and the loop that arbitrates
//! between them. It has NO hardware dependencies; boards supply the
//! `hal-abstractions` traits.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

// Must come first so the logging macros are visible to every module
#[macro_use]
mod fmt;

pub mod bridge;
pub mod clock;
pub mod config;
pub mod hub;
pub mod radio;
pub mod schedule;
pub mod telemetry;
pub mod uplink;

pub use bridge::FrameDecoder;
pub use config::{ConfigError, HubConfig, ImageConfig, ModemConfig, WakeSchedule};
pub use hub::{Hub, Step, UploadStats};
pub use radio::{FrameKind, ImageBuffer, ImageLease, Inbox, RadioHandle, RadioLink, RadioStats};
pub use schedule::{Decision, Scheduler, SleepReason};
pub use telemetry::TelemetryRecord;
pub use uplink::{PayloadKind, UploadAttempt, UploadOutcome, Uplink, UplinkError};

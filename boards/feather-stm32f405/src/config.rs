#![deny(unsafe_code)]
#![deny(warnings)]
//! Build-time hub configuration
//!
//! Secrets never live in the source tree; they are baked in from the build
//! environment:
//!
//! ```text
//! HUB_TOKEN=... HUB_UPLOAD_URL=https://... cargo run --release
//! ```
//!
//! `HUB_APN` is optional and falls back to the default carrier APN.

use hub_core::{HubConfig, ImageBuffer};

/// Reassembly buffer capacity; fits a QVGA JPEG from the camera spoke
pub const IMAGE_CAPACITY: usize = 64 * 1024;

pub type HubImageBuffer = ImageBuffer<IMAGE_CAPACITY>;

/// Baud rate of the cellular modem UART
pub const MODEM_BAUD: u32 = 115_200;
/// Baud rate of the radio co-processor UART
pub const RADIO_BAUD: u32 = 460_800;

/// DMA ring size for each UART receiver
pub const RX_RING_LEN: usize = 4096;
/// Hub poll interval while idle, well under the image idle timeout
pub const IDLE_POLL_MS: u64 = 250;
/// Standby length after the modem failed to come up
pub const MODEM_RETRY_SECS: u32 = 300;

/// Hub configuration with build-time secrets applied
pub fn hub_config() -> HubConfig {
    let defaults = HubConfig::default();
    HubConfig {
        token: option_env!("HUB_TOKEN").unwrap_or(defaults.token),
        upload_url: option_env!("HUB_UPLOAD_URL").unwrap_or(defaults.upload_url),
        apn: option_env!("HUB_APN").unwrap_or(defaults.apn),
        ..defaults
    }
}

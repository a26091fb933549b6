//! Hardware abstraction traits for the field hub firmware
//!
//! This crate defines traits that abstract over hardware differences
//! between boards. BSPs implement these traits; `hub-core` consumes them.
//!
//! - [`WallClock`]: battery-backed calendar clock (the clock source the
//!   duty-cycle scheduler reads)
//! - [`Monotonic`]: millisecond uptime counter, reset on every boot
//! - [`DelayNs`], [`Read`], [`Write`]: re-exported from the embedded-hal /
//!   embedded-io async trait crates for the modem port and pacing delays

#![no_std]
#![deny(unsafe_code)]
#![deny(warnings)]

pub mod clock;

pub use clock::{CivilTime, ClockError, Monotonic, WallClock};
pub use embedded_hal_async::delay::DelayNs;
pub use embedded_io_async::{ErrorType, Read, Write};

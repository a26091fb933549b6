#![deny(unsafe_code)]
#![deny(warnings)]
//! Clock sources for the hub
//!
//! - [`RtcClock`]: the LSE-driven RTC in the backup domain. It keeps local
//!   time through standby and across resets as long as VBAT holds, which
//!   is what the duty-cycle decisions are made against.
//! - [`MonoClock`]: uptime from the TIM2 monotonic, used for every
//!   timeout and idle gap.

use core::cell::RefCell;

use critical_section::Mutex;
use defmt::info;
use embassy_stm32::rtc::{DateTime, DayOfWeek, Rtc};
use hal_abstractions::{CivilTime, ClockError, WallClock};
use hub_core::clock;
use rtic_monotonics::stm32::prelude::*;

use crate::Mono;

/// Global internal RTC instance
static RTC: Mutex<RefCell<Option<Rtc>>> = Mutex::new(RefCell::new(None));

/// Hand the RTC over to the clock module
///
/// Must be called once during system initialization, before any
/// [`RtcClock`] is read.
pub fn initialize_rtc(rtc: Rtc) {
    critical_section::with(|cs| {
        RTC.borrow(cs).replace(Some(rtc));
    });
    info!("Internal RTC initialized");
}

fn day_of_week(time: &CivilTime) -> DayOfWeek {
    match clock::weekday(time) {
        1 => DayOfWeek::Monday,
        2 => DayOfWeek::Tuesday,
        3 => DayOfWeek::Wednesday,
        4 => DayOfWeek::Thursday,
        5 => DayOfWeek::Friday,
        6 => DayOfWeek::Saturday,
        _ => DayOfWeek::Sunday,
    }
}

/// Battery-backed local wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcClock;

impl WallClock for RtcClock {
    fn now(&mut self) -> Result<CivilTime, ClockError> {
        critical_section::with(|cs| {
            let rtc = RTC.borrow(cs).borrow();
            let rtc = rtc.as_ref().ok_or(ClockError::NotInitialized)?;
            let dt = rtc.now().map_err(|_| ClockError::HardwareError)?;
            Ok(CivilTime::new(
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second(),
            ))
        })
    }

    fn set(&mut self, time: CivilTime) -> Result<(), ClockError> {
        let datetime = DateTime::from(
            time.year,
            time.month,
            time.day,
            day_of_week(&time),
            time.hour,
            time.minute,
            time.second,
            0,
        )
        .map_err(|_| ClockError::InvalidTime)?;

        critical_section::with(|cs| {
            let mut rtc = RTC.borrow(cs).borrow_mut();
            let rtc = rtc.as_mut().ok_or(ClockError::NotInitialized)?;
            rtc.set_datetime(datetime)
                .map_err(|_| ClockError::HardwareError)
        })
    }
}

/// Milliseconds since boot, from the TIM2 monotonic
#[derive(Debug, Clone, Copy, Default)]
pub struct MonoClock;

impl hal_abstractions::Monotonic for MonoClock {
    fn now_ms(&self) -> u64 {
        Mono::now().duration_since_epoch().to_millis()
    }
}

//! Clock traits and the calendar value type they exchange

/// Local calendar date and time with one-second resolution
///
/// Plain data; range checks are the producer's job (see
/// [`CivilTime::is_valid`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CivilTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl CivilTime {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    /// Seconds elapsed since local midnight (0..86_400)
    pub const fn seconds_of_day(&self) -> u32 {
        self.hour as u32 * 3600 + self.minute as u32 * 60 + self.second as u32
    }

    /// Field ranges only; does not check days-per-month
    pub const fn is_valid(&self) -> bool {
        self.month >= 1
            && self.month <= 12
            && self.day >= 1
            && self.day <= 31
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
    }
}

/// Clock source errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockError {
    /// Clock peripheral not initialized
    NotInitialized,
    /// Hardware read or write failed
    HardwareError,
    /// Value rejected by the hardware (out of range)
    InvalidTime,
}

impl core::fmt::Display for ClockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "clock not initialized"),
            Self::HardwareError => write!(f, "clock hardware error"),
            Self::InvalidTime => write!(f, "invalid time"),
        }
    }
}

impl core::error::Error for ClockError {}

/// Wall-clock time provider that survives power loss and deep sleep
pub trait WallClock {
    /// Read the current local time
    fn now(&mut self) -> Result<CivilTime, ClockError>;

    /// Overwrite the current local time
    fn set(&mut self, time: CivilTime) -> Result<(), ClockError>;
}

/// Millisecond uptime counter
///
/// Starts near zero on every boot; only differences are meaningful.
pub trait Monotonic {
    fn now_ms(&self) -> u64;
}

impl<T: Monotonic + ?Sized> Monotonic for &T {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

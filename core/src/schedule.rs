//! Duty-cycle scheduler
//!
//! Pure decision function from local wall-clock time to "stay awake" or
//! "sleep for N seconds". The caller performs the sleep; nothing here
//! touches hardware or mutates state.
//!
//! Three tiers, checked in order:
//! 1. Night mode: outside `[day_start_hour, day_end_hour)` sleep until the
//!    next `day_start_hour:00:00`. The last minute before `day_start_hour`
//!    falls through to the window logic instead, so a hub waking a few
//!    seconds early for the first window of the morning does not go back
//!    to sleep for another day.
//! 2. Windows: each mark opens `[mark, mark + window_minutes)`, wrapping
//!    across the hour boundary. Inside any window: stay awake.
//! 3. Nap: sleep until the next mark strictly after the current minute,
//!    floored at `min_nap_secs`.

use hal_abstractions::CivilTime;

use crate::config::WakeSchedule;

const SECONDS_PER_DAY: u32 = 86_400;

/// Scheduler verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Decision {
    /// Inside a wake window: keep the receiver on
    StayAwake,
    /// Power down for this many seconds
    SleepFor { secs: u32, reason: SleepReason },
}

/// Which tier produced a sleep decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepReason {
    Night,
    Nap,
}

/// Wall-clock aligned duty-cycle scheduler
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    schedule: WakeSchedule,
}

impl Scheduler {
    /// `schedule` must have passed [`WakeSchedule::validate`]
    pub fn new(schedule: WakeSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &WakeSchedule {
        &self.schedule
    }

    /// Decide what to do at local time `now`
    pub fn decide(&self, now: &CivilTime) -> Decision {
        if !self.is_day_hour(now.hour) && !self.in_pre_window_band(now) {
            let secs = self.secs_until_day_start(now.seconds_of_day());
            debug!(
                "night mode at {}:{}:{}, sleeping {} s",
                now.hour,
                now.minute,
                now.second,
                secs
            );
            return Decision::SleepFor {
                secs,
                reason: SleepReason::Night,
            };
        }

        if self.in_window(now.minute) {
            return Decision::StayAwake;
        }

        let minutes_ahead = self.minutes_to_next_mark(now.minute);
        let secs = (minutes_ahead * 60)
            .saturating_sub(now.second as u32)
            .max(self.schedule.min_nap_secs);
        Decision::SleepFor {
            secs,
            reason: SleepReason::Nap,
        }
    }

    /// True when `hour` lies in day mode
    pub fn is_day_hour(&self, hour: u8) -> bool {
        let start = self.schedule.day_start_hour;
        let end = self.schedule.day_end_hour;
        if start == end {
            // Night mode disabled
            true
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// True when `minute` lies inside any wake window
    pub fn in_window(&self, minute: u8) -> bool {
        let window = self.schedule.window_minutes as u32;
        self.schedule
            .marks
            .iter()
            .any(|&mark| (minute as u32 + 60 - mark as u32) % 60 < window)
    }

    fn in_pre_window_band(&self, now: &CivilTime) -> bool {
        let start = self.schedule.day_start_hour;
        now.hour == (start + 23) % 24 && now.minute == 59
    }

    fn secs_until_day_start(&self, seconds_of_day: u32) -> u32 {
        let target = self.schedule.day_start_hour as u32 * 3600;
        if seconds_of_day < target {
            target - seconds_of_day
        } else {
            SECONDS_PER_DAY - seconds_of_day + target
        }
    }

    /// Whole minutes from `minute` to the next mark strictly after it
    fn minutes_to_next_mark(&self, minute: u8) -> u32 {
        let minute = minute as u32;
        match self.schedule.marks.iter().find(|&&m| m as u32 > minute) {
            Some(&mark) => mark as u32 - minute,
            None => self.schedule.marks.first().map_or(60, |&m| m as u32) + 60 - minute,
        }
    }
}

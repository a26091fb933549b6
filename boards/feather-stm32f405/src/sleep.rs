#![deny(unsafe_code)]
#![deny(warnings)]
//! Standby entry with RTC wake-up
//!
//! Standby is the deepest mode the F405 has: SRAM and registers are lost,
//! only the backup domain (RTC, LSE) keeps running. The wake-up timer ticks
//! at 1 Hz from the RTC's synchronous prescaler output and raises EXTI line
//! 22, which brings the chip back through a full reset.

use cortex_m::peripheral::SCB;
use defmt::info;
use stm32_metapac as pac;

/// Longest nap the 16-bit wake-up counter can time at 1 Hz
pub const MAX_STANDBY_SECS: u32 = 65_535;

/// EXTI line wired to the RTC wake-up event
const RTC_WAKEUP_EXTI_LINE: usize = 22;

/// Wake-up clock selection: ck_spre (1 Hz)
const WUCKSEL_CK_SPRE: u8 = 0b100;

fn rtc_unlock() {
    pac::RTC.wpr().write(|w| w.set_key(0xCA));
    pac::RTC.wpr().write(|w| w.set_key(0x53));
}

fn rtc_lock() {
    pac::RTC.wpr().write(|w| w.set_key(0xFF));
}

/// Disarm a wake-up timer left running by the previous standby
///
/// Returns `true` when this boot is a wake from standby.
pub fn clear_wakeup() -> bool {
    let from_standby = pac::PWR.csr1().read().sbf();

    rtc_unlock();
    pac::RTC.cr().modify(|w| {
        w.set_wute(false);
        w.set_wutie(false);
    });
    pac::RTC.isr().modify(|w| w.set_wutf(false));
    rtc_lock();

    pac::EXTI
        .pr(0)
        .write(|w| w.set_line(RTC_WAKEUP_EXTI_LINE, true));
    pac::PWR.cr1().modify(|w| {
        w.set_csbf(true);
        w.set_cwuf(true);
    });

    from_standby
}

/// Arm the wake-up timer for `secs` and enter standby; never returns
///
/// `secs` is clamped to `1..=MAX_STANDBY_SECS`. The caller has already
/// powered the modem down and flushed its logs.
pub fn enter_standby(scb: &mut SCB, secs: u32) -> ! {
    let secs = secs.clamp(1, MAX_STANDBY_SECS);
    info!("entering standby for {} s", secs);

    // Step 1: stop the timer and wait until its reload register is writable
    rtc_unlock();
    pac::RTC.cr().modify(|w| w.set_wute(false));
    while !pac::RTC.isr().read().wutwf() {}

    // Step 2: program the reload value (the counter fires after WUT + 1 ticks)
    pac::RTC.wutr().write(|w| w.set_wut((secs - 1) as u16));
    pac::RTC
        .cr()
        .modify(|w| w.set_wucksel(pac::rtc::vals::Wucksel::from_bits(WUCKSEL_CK_SPRE)));

    // Step 3: start it, with the event routed to EXTI
    pac::RTC.isr().modify(|w| w.set_wutf(false));
    pac::RTC.cr().modify(|w| {
        w.set_wutie(true);
        w.set_wute(true);
    });
    rtc_lock();

    pac::EXTI
        .rtsr(0)
        .modify(|w| w.set_line(RTC_WAKEUP_EXTI_LINE, true));
    pac::EXTI
        .imr(0)
        .modify(|w| w.set_line(RTC_WAKEUP_EXTI_LINE, true));
    pac::EXTI
        .pr(0)
        .write(|w| w.set_line(RTC_WAKEUP_EXTI_LINE, true));

    // Step 4: select standby over stop and clear a stale wake-up flag
    pac::PWR.cr1().modify(|w| {
        w.set_pdds(pac::pwr::vals::Pdds::STANDBY_MODE);
        w.set_cwuf(true);
    });
    scb.set_sleepdeep();

    loop {
        cortex_m::asm::dsb();
        cortex_m::asm::wfi();
    }
}

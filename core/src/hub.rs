//! Upload orchestrator
//!
//! One cooperative loop iteration per [`Hub::step`]:
//!
//! 1. close an image transfer that has gone quiet
//! 2. upload a completed image; the buffer returns to the radio afterwards,
//!    whatever the outcome
//! 3. otherwise, when no image is in flight, upload pending telemetry
//! 4. otherwise, every `schedule_check_ms`, ask the scheduler whether to
//!    sleep; never while an image or a telemetry record is pending
//!
//! Radio traffic keeps arriving while the hub talks to the modem. Work that
//! shows up after the modem was powered down cancels the sleep, and nothing
//! is uploaded until the caller powers the modem back on and calls
//! [`Hub::boot`].
//!
//! Images outrank telemetry: they only arrive while the camera spoke is
//! awake, telemetry tolerates a short delay.

use hal_abstractions::{CivilTime, DelayNs, Monotonic, Read, WallClock, Write};

use crate::clock;
use crate::config::{ConfigError, HubConfig};
use crate::radio::{Inbox, RadioStats, TransferEvent};
use crate::schedule::{Decision, Scheduler, SleepReason};
use crate::uplink::{PayloadKind, UploadAttempt, Uplink, UplinkError};

/// Minimum gap between network time requests while the wall clock is unset
const CLOCK_RETRY_MS: u64 = 60_000;

/// What the caller should do after one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// An upload ran; step again immediately
    Busy,
    /// Nothing to do until radio traffic or the next schedule check
    Idle,
    /// Modem is down; enter deep sleep for `secs`
    Sleep { secs: u32, reason: SleepReason },
    /// Work arrived after the modem was powered down; power it back on,
    /// then call [`Hub::boot`]
    ModemDown,
}

/// Upload counters, reset on every boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UploadStats {
    pub telemetry_ok: u32,
    pub telemetry_failed: u32,
    pub images_ok: u32,
    pub images_failed: u32,
}

impl UploadStats {
    fn record(&mut self, attempt: &UploadAttempt) {
        let counter = match (attempt.kind, attempt.succeeded()) {
            (PayloadKind::Telemetry, true) => &mut self.telemetry_ok,
            (PayloadKind::Telemetry, false) => &mut self.telemetry_failed,
            (PayloadKind::Image, true) => &mut self.images_ok,
            (PayloadKind::Image, false) => &mut self.images_failed,
        };
        *counter += 1;
    }
}

/// The hub's main loop state
pub struct Hub<'h, 'a, const N: usize, IO, D, M, C> {
    config: HubConfig,
    scheduler: Scheduler,
    inbox: Inbox<'h, 'a, N>,
    uplink: Uplink<IO, D, M>,
    mono: M,
    wall_clock: C,
    last_schedule_check_ms: Option<u64>,
    last_clock_sync_ms: Option<u64>,
    stats: UploadStats,
    modem_down: bool,
}

impl<'h, 'a, const N: usize, IO, D, M, C> Hub<'h, 'a, N, IO, D, M, C>
where
    IO: Read + Write,
    D: DelayNs,
    M: Monotonic + Clone,
    C: WallClock,
{
    pub fn new(
        config: HubConfig,
        inbox: Inbox<'h, 'a, N>,
        modem: IO,
        delay: D,
        mono: M,
        wall_clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        config.image.check_capacity(N)?;
        Ok(Self {
            scheduler: Scheduler::new(config.schedule),
            uplink: Uplink::new(modem, delay, mono.clone(), &config)?,
            config,
            inbox,
            mono,
            wall_clock,
            last_schedule_check_ms: None,
            last_clock_sync_ms: None,
            stats: UploadStats::default(),
            modem_down: false,
        })
    }

    /// Bring the modem up and set the wall clock if it lost power
    ///
    /// Fails only when the modem does not answer at all.
    pub async fn boot(&mut self) -> Result<(), UplinkError> {
        self.uplink.probe().await?;
        self.modem_down = false;
        info!("modem responding");

        match self.wall_clock.now() {
            Ok(now) if clock::is_plausible(&now) => {
                info!("wall clock: {:?}", now);
            }
            Ok(now) => {
                warn!("wall clock reset to {:?}, syncing from network", now);
                self.sync_clock().await;
            }
            Err(e) => {
                warn!("wall clock unreadable ({:?}), syncing from network", e);
                self.sync_clock().await;
            }
        }
        Ok(())
    }

    /// Run one loop iteration
    pub async fn step(&mut self) -> Step {
        let now = self.mono.now_ms();

        match self.inbox.poll_transfer(now) {
            Some(TransferEvent::Completed { len }) => info!("image transfer complete: {} bytes", len),
            Some(TransferEvent::Discarded { len }) => {
                info!("discarding {} byte transfer as noise", len)
            }
            None => {}
        }

        if self.modem_down {
            return Step::ModemDown;
        }

        if let Some(image) = self.inbox.take_image() {
            let attempt = self.uplink.upload_image(image.bytes()).await;
            self.stats.record(&attempt);
            drop(image);
            return Step::Busy;
        }

        if !self.inbox.image_in_flight() {
            if let Some(record) = self.inbox.take_telemetry() {
                let attempt = self.uplink.upload_telemetry(&record).await;
                self.stats.record(&attempt);
                return Step::Busy;
            }
        }

        let due = self
            .last_schedule_check_ms
            .map_or(true, |last| now.saturating_sub(last) >= self.config.schedule_check_ms);
        if !due || self.work_pending() {
            return Step::Idle;
        }
        self.last_schedule_check_ms = Some(now);

        let Some(local) = self.local_time().await else {
            return Step::Idle;
        };
        match self.scheduler.decide(&local) {
            Decision::StayAwake => {
                debug!("{:?}: inside wake window", local);
                Step::Idle
            }
            Decision::SleepFor { secs, reason } => {
                // a clock sync may have taken long enough for traffic to arrive
                if self.work_pending() {
                    debug!("radio traffic arrived, not sleeping");
                    return Step::Busy;
                }
                info!("{:?}: {:?} sleep for {} s", local, reason, secs);
                self.prepare_sleep().await;
                if self.work_pending() {
                    warn!("radio traffic arrived during modem power-down");
                    self.modem_down = true;
                    return Step::ModemDown;
                }
                Step::Sleep { secs, reason }
            }
        }
    }

    fn work_pending(&self) -> bool {
        self.inbox.image_in_flight() || self.inbox.has_telemetry()
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    pub fn radio_stats(&self) -> RadioStats {
        self.inbox.stats()
    }

    /// Current local time, or `None` when it cannot be trusted for a sleep decision
    async fn local_time(&mut self) -> Option<CivilTime> {
        match self.wall_clock.now() {
            Ok(now) if clock::is_plausible(&now) => Some(now),
            Ok(now) => {
                warn!("wall clock implausible ({:?}), staying awake", now);
                let retry = self
                    .last_clock_sync_ms
                    .map_or(true, |last| self.mono.now_ms().saturating_sub(last) >= CLOCK_RETRY_MS);
                if retry && self.sync_clock().await {
                    self.wall_clock.now().ok()
                } else {
                    None
                }
            }
            Err(e) => {
                warn!("wall clock read failed: {:?}", e);
                None
            }
        }
    }

    /// Write network time into the wall clock; true on success
    async fn sync_clock(&mut self) -> bool {
        self.last_clock_sync_ms = Some(self.mono.now_ms());
        let utc = match self.uplink.network_time().await {
            Ok(utc) => utc,
            Err(e) => {
                warn!("network time unavailable: {:?}", e);
                return false;
            }
        };
        let local = clock::localize(&utc, self.config.utc_offset_minutes);
        match self.wall_clock.set(local) {
            Ok(()) => {
                info!("wall clock set to {:?}", local);
                true
            }
            Err(e) => {
                warn!("wall clock write failed: {:?}", e);
                false
            }
        }
    }

    async fn prepare_sleep(&mut self) {
        if let Err(e) = self.uplink.power_down().await {
            warn!("modem power-down failed: {:?}", e);
        }
        info!("uploads: {:?}", self.stats);
        info!("radio: {:?}", self.inbox.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;
    use crate::radio::{FrameKind, ImageBuffer, RadioLink};
    use crate::telemetry::TelemetryRecord;
    use crate::radio::RadioHandle;
    use crate::uplink::sim::{FakeClock, SimModem};
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use hal_abstractions::{ClockError, ErrorType};
    use std::cell::Cell;
    use std::rc::Rc;

    const CAPACITY: usize = 8_192;

    #[derive(Clone)]
    struct FakeWall {
        time: Rc<Cell<Option<CivilTime>>>,
    }

    impl FakeWall {
        fn at(time: Option<CivilTime>) -> Self {
            Self {
                time: Rc::new(Cell::new(time)),
            }
        }

        fn get(&self) -> Option<CivilTime> {
            self.time.get()
        }

        fn put(&self, time: CivilTime) {
            self.time.set(Some(time));
        }
    }

    impl WallClock for FakeWall {
        fn now(&mut self) -> Result<CivilTime, ClockError> {
            self.time.get().ok_or(ClockError::NotInitialized)
        }

        fn set(&mut self, time: CivilTime) -> Result<(), ClockError> {
            self.time.set(Some(time));
            Ok(())
        }
    }

    /// Modem port that delivers an image chunk over the radio as soon as
    /// the power-down command goes out
    struct ChunkOnPowerDown<'r, 'h, 'a> {
        sim: SimModem,
        radio: &'r RadioHandle<'h, 'a, CAPACITY>,
    }

    impl ErrorType for ChunkOnPowerDown<'_, '_, '_> {
        type Error = Infallible;
    }

    impl Read for ChunkOnPowerDown<'_, '_, '_> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.sim.read(buf).await
        }
    }

    impl Write for ChunkOnPowerDown<'_, '_, '_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            if buf.starts_with(b"AT+QPOWD") {
                self.radio.on_frame(&chunk(1_200), 0);
            }
            self.sim.write(buf).await
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            self.sim.flush().await
        }
    }

    fn config() -> HubConfig {
        HubConfig {
            token: "FARM_SEC",
            upload_url: "https://ingest.example.run.app",
            ..HubConfig::default()
        }
    }

    fn modem(overrides: impl FnOnce(SimModem) -> SimModem) -> SimModem {
        overrides(SimModem::new())
            .reply("AT+QHTTPSTOP", &["OK"])
            .reply("AT+QIACT?", &["+QIACT: 1,1,1,\"10.64.1.2\"", "OK"])
            .reply("AT+QHTTPCFG", &["OK"])
            .reply("AT+QSSLCFG", &["OK"])
            .reply_with_data("AT+QHTTPURL=", &["CONNECT"], &["OK"])
            .reply("AT+QHTTPGET=", &["OK", "+QHTTPGET: 0,200,27"])
            .reply_with_data("AT+QHTTPPOST=", &["CONNECT"], &["OK", "+QHTTPPOST: 0,200,27"])
            .reply(
                "AT+QHTTPREAD=",
                &["CONNECT", "{\"status\": \"success\"}", "OK", "+QHTTPREAD: 0"],
            )
            .reply("AT+QPOWD=1", &["OK", "POWERED DOWN"])
    }

    fn telemetry(id: i32) -> [u8; 12] {
        TelemetryRecord {
            node_id: id,
            moisture_pct: 42,
            battery_volts: 3.87,
        }
        .to_wire()
    }

    fn chunk(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn day(hour: u8, minute: u8, second: u8) -> Option<CivilTime> {
        Some(CivilTime::new(2026, 5, 12, hour, minute, second))
    }

    fn count(sim: &SimModem, prefix: &str) -> usize {
        sim.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    #[test]
    fn test_image_uploads_before_telemetry() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(day(14, 14, 0));
        let sim = modem(|m| m);
        let mut hub = Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall).unwrap();

        radio.on_frame(&telemetry(3), 0);
        radio.on_frame(&chunk(1_200), 0);
        clock.advance(3_001);

        assert_eq!(block_on(hub.step()), Step::Busy);
        assert_eq!(count(&sim, "AT+QHTTPPOST="), 1);
        assert_eq!(count(&sim, "AT+QHTTPGET="), 0);

        assert_eq!(block_on(hub.step()), Step::Busy);
        assert_eq!(count(&sim, "AT+QHTTPGET="), 1);

        assert_eq!(block_on(hub.step()), Step::Idle);
        assert_eq!(
            hub.stats(),
            UploadStats {
                telemetry_ok: 1,
                images_ok: 1,
                ..UploadStats::default()
            }
        );
    }

    #[test]
    fn test_telemetry_held_while_image_receiving() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(day(14, 5, 0));
        let sim = modem(|m| m);
        let mut hub = Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall).unwrap();

        radio.on_frame(&chunk(1_200), 0);
        radio.on_frame(&telemetry(3), 0);

        // Outside a wake window, yet neither upload nor sleep happens
        assert_eq!(block_on(hub.step()), Step::Idle);
        assert!(sim.commands().is_empty());

        clock.advance(3_001);
        assert_eq!(block_on(hub.step()), Step::Busy);
        assert_eq!(block_on(hub.step()), Step::Busy);
        assert_eq!(count(&sim, "AT+QHTTPPOST="), 1);
        assert_eq!(count(&sim, "AT+QHTTPGET="), 1);
    }

    #[test]
    fn test_failed_image_still_frees_the_buffer() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(day(14, 14, 0));
        let sim = modem(|m| m.reply("AT+QHTTPPOST=", &["ERROR"]));
        let mut hub = Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall).unwrap();

        radio.on_frame(&chunk(2_000), 0);
        clock.advance(3_001);
        assert_eq!(block_on(hub.step()), Step::Busy);
        assert_eq!(hub.stats().images_failed, 1);

        // No retry of the stale image, and the next transfer starts fresh
        assert_eq!(block_on(hub.step()), Step::Idle);
        assert_eq!(count(&sim, "AT+QHTTPPOST="), 1);
        assert_eq!(radio.on_frame(&chunk(200), clock.now_ms()), FrameKind::ImageChunk);
    }

    #[test]
    fn test_noise_transfer_is_not_uploaded() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(day(14, 14, 0));
        let sim = modem(|m| m);
        let mut hub = Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall).unwrap();

        radio.on_frame(&chunk(240), 0);
        clock.advance(3_001);
        assert_eq!(block_on(hub.step()), Step::Idle);
        assert!(sim.commands().is_empty());
        assert_eq!(hub.radio_stats().discarded_transfers, 1);
    }

    #[test]
    fn test_sleeps_outside_window_after_powering_down_modem() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(day(14, 14, 0));
        let sim = modem(|m| m);
        let mut hub =
            Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall.clone()).unwrap();

        assert_eq!(block_on(hub.step()), Step::Idle);

        // The scheduler is only consulted every few seconds
        wall.put(CivilTime::new(2026, 5, 12, 14, 5, 0));
        assert_eq!(block_on(hub.step()), Step::Idle);
        assert!(sim.commands().is_empty());

        clock.advance(5_000);
        assert_eq!(
            block_on(hub.step()),
            Step::Sleep {
                secs: 8 * 60,
                reason: SleepReason::Nap
            }
        );
        assert_eq!(sim.commands(), ["AT+QPOWD=1"]);
    }

    #[test]
    fn test_traffic_during_power_down_cancels_sleep() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (radio, inbox) = link.split();
        let clock = FakeClock::new();
        let sim = modem(|m| m).reply("AT", &["OK"]);
        let port = ChunkOnPowerDown {
            sim: sim.clone(),
            radio: &radio,
        };
        let mut hub =
            Hub::new(config(), inbox, port, clock.clone(), clock.clone(), FakeWall::at(day(14, 5, 0)))
                .unwrap();

        assert_eq!(block_on(hub.step()), Step::ModemDown);
        assert_eq!(hub.radio_stats().image_chunks, 1);

        // Nothing goes to a powered-down modem
        clock.advance(3_001);
        assert_eq!(block_on(hub.step()), Step::ModemDown);
        assert_eq!(count(&sim, "AT+QHTTPPOST="), 0);

        assert_eq!(block_on(hub.boot()), Ok(()));
        assert_eq!(block_on(hub.step()), Step::Busy);
        assert_eq!(count(&sim, "AT+QHTTPPOST="), 1);
        assert_eq!(hub.stats().images_ok, 1);
    }

    #[test]
    fn test_reassembly_buffer_must_hold_minimum_image() {
        let mut buffer = ImageBuffer::<512>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let result = Hub::new(config(), inbox, SimModem::new(), clock.clone(), clock, FakeWall::at(None));
        assert!(matches!(result, Err(ConfigError::MinImageLen(1_024))));
    }

    #[test]
    fn test_image_in_flight_suppresses_sleep() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(day(21, 0, 0));
        let sim = modem(|m| m);
        let mut hub = Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall).unwrap();

        radio.on_frame(&chunk(500), 0);
        for _ in 0..3 {
            clock.advance(1_000);
            radio.on_frame(&chunk(500), clock.now_ms());
            assert_eq!(block_on(hub.step()), Step::Idle);
        }
        assert_eq!(count(&sim, "AT+QPOWD"), 0);
    }

    #[test]
    fn test_unreadable_clock_never_sleeps() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let sim = modem(|m| m);
        let mut hub =
            Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), FakeWall::at(None))
                .unwrap();

        assert_eq!(block_on(hub.step()), Step::Idle);
        assert_eq!(count(&sim, "AT+QPOWD"), 0);
    }

    #[test]
    fn test_boot_syncs_reset_clock_from_network() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(Some(CivilTime::new(2000, 1, 1, 0, 0, 7)));
        let sim = SimModem::new()
            .reply("AT+CCLK?", &["+CCLK: \"26/03/14,07:45:10+22\"", "OK"])
            .reply("AT", &["OK"]);
        let mut hub =
            Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall.clone()).unwrap();

        assert_eq!(block_on(hub.boot()), Ok(()));
        // 02:15:10 UTC at +05:30
        assert_eq!(wall.get(), Some(CivilTime::new(2026, 3, 14, 7, 45, 10)));
        assert_eq!(sim.commands(), ["AT", "ATE0", "AT+CCLK?"]);
    }

    #[test]
    fn test_boot_keeps_plausible_clock() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(day(9, 0, 0));
        let sim = SimModem::new().reply("AT", &["OK"]);
        let mut hub =
            Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall.clone()).unwrap();

        assert_eq!(block_on(hub.boot()), Ok(()));
        assert_eq!(wall.get(), day(9, 0, 0));
        assert_eq!(count(&sim, "AT+CCLK"), 0);
    }

    #[test]
    fn test_boot_fails_on_silent_modem() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let mut hub = Hub::new(
            config(),
            inbox,
            SimModem::new(),
            clock.clone(),
            clock.clone(),
            FakeWall::at(day(9, 0, 0)),
        )
        .unwrap();

        assert_eq!(block_on(hub.boot()), Err(UplinkError::ProtocolTimeout));
    }

    #[test]
    fn test_reset_clock_is_resynced_before_sleeping() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let wall = FakeWall::at(Some(CivilTime::new(2000, 1, 1, 0, 0, 7)));
        // 08:35:00 UTC is 14:05:00 local
        let sim = modem(|m| m.reply("AT+CCLK?", &["+CCLK: \"26/05/12,08:35:00+00\"", "OK"]));
        let mut hub =
            Hub::new(config(), inbox, sim.clone(), clock.clone(), clock.clone(), wall.clone()).unwrap();

        assert!(matches!(
            block_on(hub.step()),
            Step::Sleep {
                reason: SleepReason::Nap,
                ..
            }
        ));
        assert_eq!(wall.get(), day(14, 5, 0));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut buffer = ImageBuffer::<CAPACITY>::new();
        let mut link = RadioLink::new(&mut buffer, ImageConfig::default());
        let (_radio, inbox) = link.split();
        let clock = FakeClock::new();
        let result = Hub::new(
            HubConfig::default(),
            inbox,
            SimModem::new(),
            clock.clone(),
            clock,
            FakeWall::at(None),
        );
        assert!(matches!(result, Err(ConfigError::EmptyToken)));
    }
}

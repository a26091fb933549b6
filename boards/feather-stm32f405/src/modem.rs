#![deny(unsafe_code)]
#![deny(warnings)]
//! Cellular modem serial port and power key
//!
//! The modem hangs off USART3 with both directions on DMA. Receive goes
//! through a ring buffer so bytes keep landing while the hub is busy
//! writing an image.

use defmt::{info, Format};
use embassy_stm32::mode::Async;
use embassy_stm32::usart::{self, RingBufferedUartRx, UartTx};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::{ErrorKind, ErrorType, Read, Write};

/// How long the power key is held to toggle the modem
const POWER_KEY_PULSE_MS: u32 = 600;
/// Time the modem needs after a toggle before it answers `AT`
const BOOT_SETTLE_MS: u32 = 10_000;

/// Modem UART errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum ModemPortError {
    /// Receive ring buffer overran; the bytes in it were lost
    Overrun,
    /// Framing, noise or parity error on the line
    Line,
}

impl core::fmt::Display for ModemPortError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Overrun => write!(f, "modem receive overrun"),
            Self::Line => write!(f, "modem line error"),
        }
    }
}

impl core::error::Error for ModemPortError {}

impl embedded_io_async::Error for ModemPortError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Overrun => ErrorKind::OutOfMemory,
            Self::Line => ErrorKind::InvalidData,
        }
    }
}

impl From<usart::Error> for ModemPortError {
    fn from(e: usart::Error) -> Self {
        match e {
            usart::Error::Overrun => Self::Overrun,
            _ => Self::Line,
        }
    }
}

/// Byte-stream view of the modem UART for the AT channel
pub struct ModemPort<'d> {
    tx: UartTx<'d, Async>,
    rx: RingBufferedUartRx<'d>,
}

impl<'d> ModemPort<'d> {
    pub fn new(tx: UartTx<'d, Async>, rx: RingBufferedUartRx<'d>) -> Self {
        Self { tx, rx }
    }
}

impl ErrorType for ModemPort<'_> {
    type Error = ModemPortError;
}

impl Read for ModemPort<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Ok(self.rx.read(buf).await?)
    }
}

impl Write for ModemPort<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.write(buf).await?;
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(self.tx.blocking_flush()?)
    }
}

/// Modem power key, driven through an inverting transistor
pub struct PowerKey<P> {
    pin: P,
}

impl<P: OutputPin> PowerKey<P> {
    pub fn new(mut pin: P) -> Self {
        pin.set_low().ok();
        Self { pin }
    }

    /// Toggle the modem's power state and wait for it to boot
    pub async fn toggle(&mut self, delay: &mut impl DelayNs) {
        info!("pulsing modem power key");
        self.pin.set_high().ok();
        delay.delay_ms(POWER_KEY_PULSE_MS).await;
        self.pin.set_low().ok();
        delay.delay_ms(BOOT_SETTLE_MS).await;
    }
}

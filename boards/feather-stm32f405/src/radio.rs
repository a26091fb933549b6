#![deny(unsafe_code)]
#![deny(warnings)]
//! Radio co-processor bridge on USART1
//!
//! Decodes the co-processor's length-prefixed frames and feeds each one to
//! the classifier, then wakes the hub task so uploads start without waiting
//! for its next idle poll.

use defmt::{trace, warn};
use embassy_stm32::mode::Async;
use embassy_stm32::usart::{self, RingBufferedUartRx, UartTx};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use hal_abstractions::Monotonic;
use hub_core::bridge::{self, FrameDecoder};
use hub_core::{FrameKind, RadioHandle};

use crate::time::MonoClock;

/// Raised whenever a frame lands in the inbox
pub type InboxSignal = Signal<CriticalSectionRawMutex, ()>;

pub static INBOX_SIGNAL: InboxSignal = InboxSignal::new();

pub struct RadioBridge<'d> {
    tx: UartTx<'d, Async>,
    rx: RingBufferedUartRx<'d>,
    decoder: FrameDecoder,
}

impl<'d> RadioBridge<'d> {
    pub fn new(tx: UartTx<'d, Async>, rx: RingBufferedUartRx<'d>) -> Self {
        Self {
            tx,
            rx,
            decoder: FrameDecoder::new(),
        }
    }

    /// Tune the co-processor to the spokes' channel
    pub async fn select_channel(&mut self, channel: u8) -> Result<(), usart::Error> {
        self.tx.write(&bridge::channel_select(channel)).await
    }

    /// Receive loop; never returns
    pub async fn run<const N: usize>(&mut self, radio: &RadioHandle<'_, '_, N>, wake: &InboxSignal) -> ! {
        let mut buf = [0u8; 64];
        loop {
            let n = match self.rx.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("radio bridge read error: {:?}", e);
                    self.decoder.reset();
                    continue;
                }
            };

            for &byte in &buf[..n] {
                let Some(frame) = self.decoder.push(byte) else {
                    continue;
                };
                let kind = radio.on_frame(frame, MonoClock.now_ms());
                trace!("radio frame: {} bytes, {:?}", frame.len(), kind);
                if kind != FrameKind::Ignored {
                    wake.signal(());
                }
            }
        }
    }
}

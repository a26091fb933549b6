//! Packet classifier, image reassembler and the receive-path handoff
//!
//! Frames arrive from the radio in interrupt (or highest-priority task)
//! context and are consumed by the orchestrator's cooperative loop.
//! [`RadioLink`] owns every piece of state the two sides share and hands
//! out exactly one producer handle and one consumer handle:
//!
//! - [`RadioHandle::on_frame`] only ever writes: copy a telemetry record into
//!   the single slot, or append an image chunk. Constant work, no blocking,
//!   no allocation.
//! - [`Inbox`] only ever reads-then-clears: every check-and-clear runs inside
//!   one critical section, so the producer can never observe a half-updated
//!   slot.
//!
//! Classification has no header to go on. A frame of exactly
//! [`WIRE_LEN`] bytes is telemetry; a frame longer than
//! `min_chunk_len` is an image chunk; anything else (spoke pings,
//! handshakes) is ignored. An image chunk that would overflow the buffer is
//! dropped whole, but still refreshes the idle timer so the transfer closes
//! on time.
//!
//! While an image is ready or being uploaded the buffer is owned by the
//! consumer ([`ImageLease`]) and further chunks are dropped. Telemetry keeps
//! flowing into its slot; a newer record replaces an unread one.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use heapless::Vec;

use crate::config::ImageConfig;
use crate::telemetry::{TelemetryRecord, WIRE_LEN};

/// Fixed-capacity byte buffer an image is reassembled into
#[derive(Debug)]
pub struct ImageBuffer<const N: usize> {
    data: Vec<u8, N>,
}

impl<const N: usize> ImageBuffer<N> {
    pub const fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    /// Append all of `chunk` or nothing
    fn try_append(&mut self, chunk: &[u8]) -> bool {
        self.data.extend_from_slice(chunk).is_ok()
    }
}

impl<const N: usize> Default for ImageBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// How a frame was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// Stored in the telemetry slot
    Telemetry,
    /// Appended to the open image transfer
    ImageChunk,
    /// Image chunk dropped: buffer full
    Overflow,
    /// Image chunk dropped: previous image not yet uploaded
    Busy,
    /// Too short to be anything we handle
    Ignored,
}

/// Result of polling the open transfer for completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferEvent {
    /// Idle timeout elapsed; image is ready for upload
    Completed { len: usize },
    /// Idle timeout elapsed on a transfer too short to be an image
    Discarded { len: usize },
}

/// Receive-path counters, reset on every boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RadioStats {
    pub telemetry_frames: u32,
    /// Unread telemetry records replaced by a newer frame
    pub telemetry_overwritten: u32,
    pub image_chunks: u32,
    pub overflow_chunks: u32,
    pub overflow_bytes: u32,
    pub busy_chunks: u32,
    pub ignored_frames: u32,
    pub completed_transfers: u32,
    pub discarded_transfers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Idle,
    Receiving { last_chunk_ms: u64 },
    Ready,
    Uploading,
}

struct ImageSlot<'a, const N: usize> {
    state: Transfer,
    /// `None` while leased to the uploader
    buffer: Option<&'a mut ImageBuffer<N>>,
}

/// State shared between the radio receive path and the orchestrator
pub struct RadioLink<'a, const N: usize> {
    config: ImageConfig,
    telemetry: Mutex<Cell<Option<TelemetryRecord>>>,
    image: Mutex<RefCell<ImageSlot<'a, N>>>,
    stats: Mutex<Cell<RadioStats>>,
}

impl<'a, const N: usize> RadioLink<'a, N> {
    pub fn new(buffer: &'a mut ImageBuffer<N>, config: ImageConfig) -> Self {
        buffer.clear();
        Self {
            config,
            telemetry: Mutex::new(Cell::new(None)),
            image: Mutex::new(RefCell::new(ImageSlot {
                state: Transfer::Idle,
                buffer: Some(buffer),
            })),
            stats: Mutex::new(Cell::new(RadioStats::default())),
        }
    }

    /// Split into the producer and consumer halves
    pub fn split(&mut self) -> (RadioHandle<'_, 'a, N>, Inbox<'_, 'a, N>) {
        let link = &*self;
        (RadioHandle { link }, Inbox { link })
    }

    fn update_stats(&self, cs: critical_section::CriticalSection<'_>, f: impl FnOnce(&mut RadioStats)) {
        let cell = self.stats.borrow(cs);
        let mut stats = cell.get();
        f(&mut stats);
        cell.set(stats);
    }
}

/// Producer half: the radio receive callback
pub struct RadioHandle<'h, 'a, const N: usize> {
    link: &'h RadioLink<'a, N>,
}

impl<'h, 'a, const N: usize> RadioHandle<'h, 'a, N> {
    /// Classify and store one inbound frame received at `now_ms`
    pub fn on_frame(&self, frame: &[u8], now_ms: u64) -> FrameKind {
        let link = self.link;

        if frame.len() == WIRE_LEN {
            if let Some(record) = TelemetryRecord::from_wire(frame) {
                critical_section::with(|cs| {
                    let replaced = link.telemetry.borrow(cs).replace(Some(record));
                    link.update_stats(cs, |s| {
                        s.telemetry_frames += 1;
                        if replaced.is_some() {
                            s.telemetry_overwritten += 1;
                        }
                    });
                });
                return FrameKind::Telemetry;
            }
        }

        if frame.len() <= link.config.min_chunk_len {
            critical_section::with(|cs| link.update_stats(cs, |s| s.ignored_frames += 1));
            return FrameKind::Ignored;
        }

        critical_section::with(|cs| {
            let mut slot = link.image.borrow(cs).borrow_mut();
            match slot.state {
                Transfer::Ready | Transfer::Uploading => {
                    link.update_stats(cs, |s| s.busy_chunks += 1);
                    return FrameKind::Busy;
                }
                Transfer::Idle => {
                    if let Some(buffer) = slot.buffer.as_mut() {
                        buffer.clear();
                    }
                }
                Transfer::Receiving { .. } => {}
            }

            // Timestamp refreshes even when the chunk does not fit
            slot.state = Transfer::Receiving {
                last_chunk_ms: now_ms,
            };
            let appended = slot
                .buffer
                .as_mut()
                .is_some_and(|buffer| buffer.try_append(frame));

            if appended {
                link.update_stats(cs, |s| s.image_chunks += 1);
                FrameKind::ImageChunk
            } else {
                link.update_stats(cs, |s| {
                    s.overflow_chunks += 1;
                    s.overflow_bytes += frame.len() as u32;
                });
                FrameKind::Overflow
            }
        })
    }
}

/// Consumer half: owned by the orchestrator
pub struct Inbox<'h, 'a, const N: usize> {
    link: &'h RadioLink<'a, N>,
}

impl<'h, 'a, const N: usize> Inbox<'h, 'a, N> {
    /// Move the pending telemetry record out, clearing the slot
    pub fn take_telemetry(&self) -> Option<TelemetryRecord> {
        critical_section::with(|cs| self.link.telemetry.borrow(cs).take())
    }

    pub fn has_telemetry(&self) -> bool {
        critical_section::with(|cs| self.link.telemetry.borrow(cs).get().is_some())
    }

    /// True from the first chunk of a transfer until its upload finishes
    pub fn image_in_flight(&self) -> bool {
        critical_section::with(|cs| {
            self.link.image.borrow(cs).borrow().state != Transfer::Idle
        })
    }

    /// Close the open transfer if no chunk arrived for longer than the idle timeout
    ///
    /// Returns an event exactly once per transfer.
    pub fn poll_transfer(&self, now_ms: u64) -> Option<TransferEvent> {
        let link = self.link;
        critical_section::with(|cs| {
            let mut slot = link.image.borrow(cs).borrow_mut();
            let Transfer::Receiving { last_chunk_ms } = slot.state else {
                return None;
            };
            if now_ms.saturating_sub(last_chunk_ms) <= link.config.idle_timeout_ms {
                return None;
            }

            let len = slot.buffer.as_ref().map_or(0, |b| b.len());
            if len < link.config.min_image_len {
                if let Some(buffer) = slot.buffer.as_mut() {
                    buffer.clear();
                }
                slot.state = Transfer::Idle;
                link.update_stats(cs, |s| s.discarded_transfers += 1);
                Some(TransferEvent::Discarded { len })
            } else {
                slot.state = Transfer::Ready;
                link.update_stats(cs, |s| s.completed_transfers += 1);
                Some(TransferEvent::Completed { len })
            }
        })
    }

    /// Take ownership of a completed image for upload
    ///
    /// The buffer returns to the receive path, emptied, when the lease drops.
    pub fn take_image(&self) -> Option<ImageLease<'h, 'a, N>> {
        let link = self.link;
        critical_section::with(|cs| {
            let mut slot = link.image.borrow(cs).borrow_mut();
            if slot.state != Transfer::Ready {
                return None;
            }
            let buffer = slot.buffer.take()?;
            slot.state = Transfer::Uploading;
            Some(ImageLease {
                link,
                buffer: Some(buffer),
            })
        })
    }

    pub fn stats(&self) -> RadioStats {
        critical_section::with(|cs| self.link.stats.borrow(cs).get())
    }
}

/// Exclusive access to a completed image while it is uploaded
pub struct ImageLease<'h, 'a, const N: usize> {
    link: &'h RadioLink<'a, N>,
    buffer: Option<&'a mut ImageBuffer<N>>,
}

impl<const N: usize> ImageLease<'_, '_, N> {
    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |b| b.as_slice())
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

impl<const N: usize> Drop for ImageLease<'_, '_, N> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            buffer.clear();
            critical_section::with(|cs| {
                let mut slot = self.link.image.borrow(cs).borrow_mut();
                slot.buffer = Some(buffer);
                slot.state = Transfer::Idle;
            });
        }
    }
}

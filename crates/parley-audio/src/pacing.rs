//! Real-time pacing of fixed-duration audio frames.
//!
//! Frame *i* of an utterance is released no earlier than
//! `start_time + i * frame_duration`. Deadlines are absolute, so a late
//! wake-up shortens the next sleep instead of accumulating. When the pacer
//! has fallen behind entirely, `start_time` slides forward by the lag rather
//! than releasing a catch-up burst the speaker would play too fast.

use crate::error::AudioError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep_until, Instant};

const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(60);
const DEFAULT_PREBUFFER_FRAMES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    /// Playback length of one Opus frame.
    pub frame_duration: Duration,
    /// Frames sent back-to-back before pacing starts, to fill the client's
    /// playback buffer.
    pub prebuffer_frames: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            frame_duration: DEFAULT_FRAME_DURATION,
            prebuffer_frames: DEFAULT_PREBUFFER_FRAMES,
        }
    }
}

/// Cooperative cancellation flag shared between a session and its pacer.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag so the next utterance can play.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-packet metadata handed to a [`FrameSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Session-wide sequence number, never reused.
    pub sequence: u32,
    /// Wall-clock milliseconds modulo 2^32.
    pub timestamp: u32,
}

/// Destination for paced frames: a WebSocket session or the MQTT gateway.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Bytes, meta: PacketMeta) -> Result<(), AudioError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaceOutcome {
    pub sent: usize,
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy)]
struct FlowControlState {
    start_time: Instant,
    packet_count: u32,
}

/// Wall-clock milliseconds truncated to 32 bits, matching an RTP-style
/// rollover.
pub fn wire_timestamp_ms() -> u32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    wrap_ms(millis)
}

/// Wall-clock milliseconds modulo 2^32.
fn wrap_ms(millis: u128) -> u32 {
    (millis & u128::from(u32::MAX)) as u32
}

/// Paces one session's outbound frames.
///
/// The flow state is created lazily on the first frame and discarded by
/// [`AudioPacer::reset`]; the sequence counter lives for the whole session.
#[derive(Debug)]
pub struct AudioPacer {
    config: PacingConfig,
    abort: AbortFlag,
    flow: Option<FlowControlState>,
    sequence: u32,
}

impl AudioPacer {
    pub fn new(config: PacingConfig, abort: AbortFlag) -> Self {
        Self {
            config,
            abort,
            flow: None,
            sequence: 0,
        }
    }

    pub fn config(&self) -> PacingConfig {
        self.config
    }

    /// Next sequence number to be assigned.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Frames sent since the flow state was created.
    pub fn packet_count(&self) -> u32 {
        self.flow.map_or(0, |flow| flow.packet_count)
    }

    pub fn abort_flag(&self) -> &AbortFlag {
        &self.abort
    }

    /// Ends the current utterance. The next frame starts a new flow.
    pub fn reset(&mut self) {
        self.flow = None;
    }

    /// Waits until the next frame is due and returns its metadata, or `None`
    /// once the abort flag is set.
    ///
    /// The caller must invoke [`AudioPacer::commit`] after the frame has
    /// actually been sent.
    pub async fn next_slot(&mut self) -> Option<PacketMeta> {
        if self.abort.is_aborted() {
            return None;
        }

        let now = Instant::now();
        let frame_duration = self.config.frame_duration;
        let prebuffer = self.config.prebuffer_frames;
        let flow = self.flow.get_or_insert(FlowControlState {
            start_time: now,
            packet_count: 0,
        });

        if flow.packet_count >= prebuffer {
            let expected = flow.start_time + frame_duration * flow.packet_count;
            if expected > now {
                sleep_until(expected).await;
                if self.abort.is_aborted() {
                    return None;
                }
            } else {
                let lag = now - expected;
                flow.start_time += lag;
                if !lag.is_zero() {
                    tracing::trace!(
                        lag_ms = lag.as_millis() as u64,
                        packet = flow.packet_count,
                        "pacer behind schedule, shifting start time"
                    );
                }
            }
        }

        Some(PacketMeta {
            sequence: self.sequence,
            timestamp: wire_timestamp_ms(),
        })
    }

    /// Records that the frame obtained from the last
    /// [`AudioPacer::next_slot`] was sent.
    pub fn commit(&mut self) {
        if let Some(flow) = self.flow.as_mut() {
            flow.packet_count += 1;
        }
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Sends every frame into `sink` at real-time cadence.
    ///
    /// Stops without flushing the remainder when the abort flag is set.
    ///
    /// # Errors
    ///
    /// Propagates the first sink error; frames already sent stay counted.
    pub async fn send_all<I, S>(&mut self, frames: I, sink: &mut S) -> Result<PaceOutcome, AudioError>
    where
        I: IntoIterator<Item = Bytes>,
        S: FrameSink + ?Sized,
    {
        let mut outcome = PaceOutcome::default();
        for frame in frames {
            let Some(meta) = self.next_slot().await else {
                outcome.aborted = true;
                tracing::debug!(sent = outcome.sent, "audio playback aborted");
                break;
            };
            sink.send_frame(frame, meta).await?;
            self.commit();
            outcome.sent += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn prebuffer_frames_are_not_delayed() {
        let config = PacingConfig {
            frame_duration: Duration::from_millis(60),
            prebuffer_frames: 3,
        };
        let mut pacer = AudioPacer::new(config, AbortFlag::new());
        let start = Instant::now();

        for _ in 0..3 {
            pacer.next_slot().await.expect("not aborted");
            pacer.commit();
        }
        assert_eq!(Instant::now() - start, Duration::ZERO);

        pacer.next_slot().await.expect("not aborted");
        assert_eq!(Instant::now() - start, Duration::from_millis(180));
        pacer.commit();
        assert_eq!(pacer.sequence(), 4);
        assert_eq!(pacer.packet_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_continues_across_utterances() {
        let mut pacer = AudioPacer::new(PacingConfig::default(), AbortFlag::new());
        for _ in 0..5 {
            pacer.next_slot().await.expect("not aborted");
            pacer.commit();
        }
        pacer.reset();
        assert_eq!(pacer.packet_count(), 0);

        let meta = pacer.next_slot().await.expect("not aborted");
        assert_eq!(meta.sequence, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_flag_stops_before_next_frame() {
        let abort = AbortFlag::new();
        let mut pacer = AudioPacer::new(PacingConfig::default(), abort.clone());
        assert!(pacer.next_slot().await.is_some());
        pacer.commit();

        abort.abort();
        assert!(pacer.next_slot().await.is_none());
        assert_eq!(pacer.sequence(), 1);

        abort.clear();
        assert!(pacer.next_slot().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn falling_behind_shifts_start_instead_of_bursting() {
        let config = PacingConfig {
            frame_duration: Duration::from_millis(60),
            prebuffer_frames: 0,
        };
        let mut pacer = AudioPacer::new(config, AbortFlag::new());

        pacer.next_slot().await.expect("not aborted");
        pacer.commit();

        // Stall well past the next two deadlines.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stalled = Instant::now();
        pacer.next_slot().await.expect("not aborted");
        assert_eq!(Instant::now(), stalled, "late frame goes out immediately");
        pacer.commit();

        pacer.next_slot().await.expect("not aborted");
        assert_eq!(
            Instant::now() - stalled,
            Duration::from_millis(60),
            "the frame after a stall keeps normal spacing"
        );
    }

    #[test]
    fn wire_timestamp_wraps_at_u32() {
        assert_eq!(wrap_ms(5), 5);
        assert_eq!(wrap_ms(u128::from(u32::MAX)), u32::MAX);
        assert_eq!(wrap_ms(1u128 << 32), 0);
        assert_eq!(wrap_ms((1u128 << 32) + 5), 5);
        assert_eq!(wrap_ms((3u128 << 32) + 1_234), 1_234);
    }
}

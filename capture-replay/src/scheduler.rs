//! Playback scheduling.
//!
//! The [`Scheduler`] owns the playback cursor and a virtual clock measured in
//! capture milliseconds. While playing it reveals packets in timer-driven
//! bursts: each wake computes a look-ahead boundary, crosses every packet at or
//! before it, publishes the new cursor and arms a single one-shot wake for the
//! next unrevealed packet.
//!
//! Cursor values are published on a [`watch`] channel. Subscribers only ever
//! need the latest value because each one delivers the whole range between its
//! own progress and the cursor it observes.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use crate::capture::PacketStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Constructed, never started.
    Idle,
    /// Started at some point, currently at speed zero.
    Paused,
    Advancing,
    /// Every packet revealed. Terminal.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub cursor: usize,
    pub len: usize,
    pub virtual_clock_ms: u64,
    pub speed: u32,
    pub state: PlaybackState,
}

impl PlaybackStatus {
    pub fn progress_percent(&self) -> f64 {
        if self.len == 0 {
            100.0
        } else {
            self.cursor as f64 / self.len as f64 * 100.0
        }
    }
}

/// Read side of playback handed to delivery agents: cursor notifications plus
/// the packets they index into.
#[derive(Debug, Clone)]
pub struct PlaybackFeed {
    pub store: Arc<PacketStore>,
    pub cursor: watch::Receiver<usize>,
}

struct Clock {
    cursor: usize,
    virtual_clock_ms: u64,
    speed: u32,
    last_interval_ms: u64,
    last_advance: Instant,
    wake_at: Option<Instant>,
    started: bool,
}

impl Clock {
    fn new(cursor: usize) -> Self {
        Self {
            cursor,
            virtual_clock_ms: 0,
            speed: 0,
            last_interval_ms: 0,
            last_advance: Instant::now(),
            wake_at: None,
            started: false,
        }
    }

    fn state(&self, len: usize) -> PlaybackState {
        if self.cursor >= len {
            PlaybackState::Completed
        } else if self.speed > 0 {
            PlaybackState::Advancing
        } else if self.started {
            PlaybackState::Paused
        } else {
            PlaybackState::Idle
        }
    }

    /// One advance step. Reveals everything due before the look-ahead
    /// boundary and arms the next wake, or leaves none armed once complete.
    fn advance(&mut self, store: &PacketStore, now: Instant, cursor_tx: &watch::Sender<usize>) {
        self.wake_at = None;
        if self.speed == 0 {
            return;
        }

        let speed = u64::from(self.speed);
        let stop_before = self
            .virtual_clock_ms
            .saturating_add(self.last_interval_ms.saturating_mul(speed))
            .saturating_add(speed);

        let previous = self.cursor;
        while let Some(packet) = store.get(self.cursor) {
            if packet.timestamp > stop_before {
                break;
            }
            self.virtual_clock_ms = self.virtual_clock_ms.max(packet.timestamp);
            self.cursor += 1;
        }
        self.last_advance = now;
        trace!("Virtual clock at {} ms (boundary {})", self.virtual_clock_ms, stop_before);

        if self.cursor > previous {
            cursor_tx.send_replace(self.cursor);
            debug!("Cursor advanced {} -> {}", previous, self.cursor);
        }

        let Some(next) = store.get(self.cursor) else {
            info!(
                "Playback complete: {} packets revealed, virtual clock {} ms",
                self.cursor, self.virtual_clock_ms
            );
            return;
        };

        let wait_ms = next.timestamp.saturating_sub(self.virtual_clock_ms) / speed;
        debug!("Waiting {} ms until virtual time {}", wait_ms, next.timestamp);
        self.last_interval_ms = wait_ms;
        self.wake_at = Some(now + Duration::from_millis(wait_ms));
    }

    /// Fold real time elapsed since the last advance into the virtual clock,
    /// never moving it past the next unrevealed packet.
    fn fold_elapsed(&mut self, store: &PacketStore, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_advance).as_millis() as u64;
        let folded = self
            .virtual_clock_ms
            .saturating_add(elapsed_ms.saturating_mul(u64::from(self.speed)));
        let ceiling = store
            .get(self.cursor)
            .map_or(folded, |next| next.timestamp.max(self.virtual_clock_ms));
        self.virtual_clock_ms = folded.min(ceiling);
        self.last_advance = now;
    }
}

struct Shared {
    store: Arc<PacketStore>,
    clock: Mutex<Clock>,
    rearm: Notify,
    cursor_tx: watch::Sender<usize>,
}

impl Shared {
    /// Timer expiry. Stale deadlines (disarmed or replaced by a later
    /// start/pause) are ignored.
    fn fire(&self) {
        let now = Instant::now();
        let mut clock = self.clock.lock();
        if clock.wake_at.is_some_and(|at| at <= now) {
            clock.advance(&self.store, now, &self.cursor_tx);
        }
    }
}

/// Shared playback cursor over a [`PacketStore`].
///
/// Must be created inside a tokio runtime: construction spawns the task that
/// sleeps until each armed wake. Dropping the scheduler stops that task.
pub struct Scheduler {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(store: PacketStore) -> Self {
        let skipped = store.leading_zero_count();
        if skipped > 0 {
            debug!("Skipping {} packets stamped at time zero", skipped);
        }

        let (cursor_tx, _) = watch::channel(skipped);
        let shared = Arc::new(Shared {
            store: Arc::new(store),
            clock: Mutex::new(Clock::new(skipped)),
            rearm: Notify::new(),
            cursor_tx,
        });
        let driver = tokio::spawn(drive(shared.clone()));

        Self { shared, driver }
    }

    /// Play at `speed` times real time. Zero pauses.
    ///
    /// Every call with a non-zero speed resumes advancing, whether playback was
    /// idle, paused or already running. Calling it after completion does
    /// nothing.
    pub fn start(&self, speed: u32) {
        if speed == 0 {
            self.pause();
            return;
        }

        let now = Instant::now();
        {
            let mut clock = self.shared.clock.lock();
            if clock.cursor >= self.shared.store.len() {
                debug!("Playback already complete, ignoring start at {}x", speed);
                return;
            }
            if clock.speed > 0 {
                clock.fold_elapsed(&self.shared.store, now);
            }
            info!("Playback at {}x from packet {}", speed, clock.cursor);
            clock.speed = speed;
            clock.started = true;
            clock.last_interval_ms = 0;
            clock.advance(&self.shared.store, now, &self.shared.cursor_tx);
        }
        self.shared.rearm.notify_one();
    }

    /// Start at `speed` only if playback has never been started. Returns
    /// whether this call started it.
    pub fn start_if_idle(&self, speed: u32) -> bool {
        let idle = {
            let clock = self.shared.clock.lock();
            !clock.started && clock.state(self.shared.store.len()) == PlaybackState::Idle
        };
        if idle && speed > 0 {
            self.start(speed);
            return true;
        }
        false
    }

    pub fn pause(&self) {
        {
            let mut clock = self.shared.clock.lock();
            if clock.speed == 0 {
                return;
            }
            clock.fold_elapsed(&self.shared.store, Instant::now());
            clock.speed = 0;
            clock.last_interval_ms = 0;
            clock.wake_at = None;
            info!(
                "Playback paused at packet {}, virtual clock {} ms",
                clock.cursor, clock.virtual_clock_ms
            );
        }
        self.shared.rearm.notify_one();
    }

    pub fn current_index(&self) -> usize {
        self.shared.clock.lock().cursor
    }

    /// Payload at `index`. Panics when `index` is out of range.
    pub fn packet_at(&self, index: usize) -> &[u8] {
        self.shared.store.payload(index)
    }

    pub fn len(&self) -> usize {
        self.shared.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store.is_empty()
    }

    pub fn store(&self) -> &Arc<PacketStore> {
        &self.shared.store
    }

    pub fn status(&self) -> PlaybackStatus {
        let clock = self.shared.clock.lock();
        PlaybackStatus {
            cursor: clock.cursor,
            len: self.shared.store.len(),
            virtual_clock_ms: clock.virtual_clock_ms,
            speed: clock.speed,
            state: clock.state(self.shared.store.len()),
        }
    }

    pub fn subscribe(&self) -> PlaybackFeed {
        PlaybackFeed {
            store: self.shared.store.clone(),
            cursor: self.shared.cursor_tx.subscribe(),
        }
    }

    #[cfg(test)]
    fn next_wake(&self) -> Option<Instant> {
        self.shared.clock.lock().wake_at
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Sleeps until the armed wake, re-reading the deadline whenever start or
/// pause changes it.
async fn drive(shared: Arc<Shared>) {
    loop {
        let wake_at = shared.clock.lock().wake_at;
        match wake_at {
            Some(at) => {
                tokio::select! {
                    () = time::sleep_until(at) => shared.fire(),
                    () = shared.rearm.notified() => {}
                }
            }
            None => shared.rearm.notified().await,
        }
    }
}

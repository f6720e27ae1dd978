//! Between-songs countdown.
//!
//! When a song ends with autoplay on and another entry waiting, the
//! controller opens a fixed window (10 s by default) and ticks it down,
//! broadcasting the room state each second. At zero it either advances
//! the queue, or — when the next entry belongs to a different singer
//! than the one who just finished — stalls and waits for an admin
//! `play_next` or `skip`.
//!
//! Queue mutations re-validate the armed target through
//! [`CountdownController::revalidate`]; a generation counter makes stale
//! timer tasks abandon themselves instead of firing twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use okeproto::CountdownSnapshot;
use okequeue::QueueStore;
use tracing::debug;

use crate::room::RoomContext;

struct ActiveCountdown {
    seconds_remaining: u32,
    next_entry_id: String,
    next_singer: String,
    prior_singer: String,
    requires_approval: bool,
    generation: u64,
}

pub struct CountdownController {
    duration_secs: u32,
    state: Mutex<Option<ActiveCountdown>>,
    generation: AtomicU64,
}

impl CountdownController {
    pub fn new(duration_secs: u32) -> Self {
        Self {
            duration_secs,
            state: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> CountdownSnapshot {
        match self.state.lock().unwrap().as_ref() {
            Some(active) => CountdownSnapshot {
                active: true,
                seconds_remaining: active.seconds_remaining,
                next_entry_id: Some(active.next_entry_id.clone()),
                next_singer: Some(active.next_singer.clone()),
                requires_approval: active.requires_approval,
            },
            None => CountdownSnapshot::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Cancels any in-flight countdown. Stale timer tasks notice the
    /// generation bump and exit.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = None;
    }

    /// Arms the countdown after a song by `prior_singer` ended.
    ///
    /// Does nothing (returns false) when autoplay is off or no upcoming
    /// entry exists.
    pub fn arm(&self, ctx: RoomContext, prior_singer: &str) -> bool {
        if !ctx.queue.autoplay() {
            return false;
        }
        let snapshot = ctx.queue.snapshot();
        let Some(next) = snapshot.next_up() else {
            return false;
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let active = ActiveCountdown {
            seconds_remaining: self.duration_secs,
            next_entry_id: next.entry_id.clone(),
            next_singer: next.added_by.clone(),
            prior_singer: prior_singer.to_string(),
            requires_approval: next.added_by != prior_singer,
            generation,
        };
        debug!(
            next = %active.next_entry_id,
            requires_approval = active.requires_approval,
            "Countdown armed"
        );
        *self.state.lock().unwrap() = Some(active);

        tokio::spawn(run_ticks(ctx, generation));
        true
    }

    /// Recomputes the armed target after a queue mutation.
    ///
    /// The countdown deactivates when no upcoming entry remains (or
    /// autoplay was switched off); a different next entry just retargets
    /// without restarting the clock.
    pub fn revalidate(&self, queue: &QueueStore) {
        let mut state = self.state.lock().unwrap();
        let Some(active) = state.as_mut() else {
            return;
        };

        let snapshot = queue.snapshot();
        if !snapshot.autoplay {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = None;
            return;
        }

        match snapshot.next_up() {
            None => {
                debug!("Countdown target vanished, deactivating");
                self.generation.fetch_add(1, Ordering::SeqCst);
                *state = None;
            }
            Some(next) if next.entry_id != active.next_entry_id => {
                active.next_entry_id = next.entry_id.clone();
                active.next_singer = next.added_by.clone();
                active.requires_approval = next.added_by != active.prior_singer;
            }
            Some(_) => {}
        }
    }
}

enum TickStep {
    Tick,
    Stall,
    Advance,
    Dead,
}

async fn run_ticks(ctx: RoomContext, generation: u64) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let step = {
            let mut state = ctx.countdown.state.lock().unwrap();
            match state.as_mut() {
                Some(active) if active.generation == generation => {
                    if active.seconds_remaining > 1 {
                        active.seconds_remaining -= 1;
                        TickStep::Tick
                    } else {
                        active.seconds_remaining = 0;
                        if active.requires_approval {
                            TickStep::Stall
                        } else {
                            *state = None;
                            TickStep::Advance
                        }
                    }
                }
                _ => TickStep::Dead,
            }
        };

        match step {
            TickStep::Tick => ctx.broadcast_state().await,
            TickStep::Stall => {
                // Next singer differs from the previous one: hold at zero
                // until an admin starts or skips the song.
                ctx.broadcast_state().await;
                return;
            }
            TickStep::Advance => {
                ctx.advance_to_next_song().await;
                return;
            }
            TickStep::Dead => return,
        }
    }
}

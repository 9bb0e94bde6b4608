//! In-memory observer store with polling cursors.
//!
//! An observer is a subscription identity that reads a session's event
//! timeline by cursor polling. Each observer owns a circular buffer of
//! capacity `max_events`; when full, the oldest entries are evicted while
//! indices keep increasing, so a polling cursor stays valid across eviction.
//!
//! Cursor semantics (`get_since`): only events with index strictly greater
//! than the supplied cursor are returned. A fresh consumer polls with `-1`
//! to receive the timeline from index 0. When nothing new exists, the
//! *current last index* comes back — never one-past-the-end — so a cursor
//! can never race ahead of the timeline.
//!
//! A background reaper removes observers that have been idle longer than the
//! configured horizon.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agentmesh::event::{Event, EventListener};

/// Lifecycle state of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverStatus {
    /// Receiving events and pollable.
    Active,
    /// Session closed; retained briefly for final polls.
    Closed,
}

struct ObserverSlot {
    session_id: String,
    events: VecDeque<(i64, Event)>,
    /// Index assigned to the next appended event. Monotonic across eviction.
    next_index: i64,
    created_at: Instant,
    last_activity: Instant,
    status: ObserverStatus,
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct Poll {
    /// `(index, event)` pairs with index strictly greater than the cursor.
    pub events: Vec<(i64, Event)>,
    /// The caller's next cursor value.
    pub last_index: i64,
    /// Whether the observer exists at all.
    pub exists: bool,
}

/// Mutex-guarded observer registry; the hot path is append plus a bounded
/// slice copy.
pub struct ObserverStore {
    slots: Mutex<HashMap<String, ObserverSlot>>,
    max_events: usize,
}

/// Mint a fresh observer id: `observer_` plus 16 hex characters.
pub fn new_observer_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("observer_{}", &hex[..16])
}

impl ObserverStore {
    /// Create a store whose per-observer rings hold `max_events` entries.
    pub fn new(max_events: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_events: max_events.max(1),
        }
    }

    /// Create an empty slot bound to a session.
    pub fn init_observer(&self, observer_id: &str, session_id: &str) {
        let now = Instant::now();
        self.slots.lock().expect("observer slots poisoned").insert(
            observer_id.to_string(),
            ObserverSlot {
                session_id: session_id.to_string(),
                events: VecDeque::new(),
                next_index: 0,
                created_at: now,
                last_activity: now,
                status: ObserverStatus::Active,
            },
        );
    }

    /// Erase an observer.
    pub fn remove_observer(&self, observer_id: &str) {
        self.slots
            .lock()
            .expect("observer slots poisoned")
            .remove(observer_id);
    }

    /// Mark an observer closed (kept for final polls until the reaper runs).
    pub fn close_observer(&self, observer_id: &str) {
        if let Some(slot) = self
            .slots
            .lock()
            .expect("observer slots poisoned")
            .get_mut(observer_id)
        {
            slot.status = ObserverStatus::Closed;
        }
    }

    /// Append an event to every active observer of its session.
    pub fn append(&self, event: &Event) {
        let mut slots = self.slots.lock().expect("observer slots poisoned");
        for slot in slots.values_mut() {
            if slot.session_id != event.session_id || slot.status != ObserverStatus::Active {
                continue;
            }
            let index = slot.next_index;
            slot.next_index += 1;
            slot.events.push_back((index, event.clone()));
            while slot.events.len() > self.max_events {
                slot.events.pop_front();
            }
        }
    }

    /// Return events strictly after `since`, plus the caller's next cursor.
    ///
    /// Polling counts as activity for the idle reaper.
    pub fn get_since(&self, observer_id: &str, since: i64) -> Poll {
        let mut slots = self.slots.lock().expect("observer slots poisoned");
        let slot = match slots.get_mut(observer_id) {
            Some(slot) => slot,
            None => {
                return Poll {
                    events: Vec::new(),
                    last_index: since,
                    exists: false,
                }
            }
        };
        slot.last_activity = Instant::now();

        if slot.next_index == 0 {
            // Nothing emitted yet; hand the cursor back unchanged.
            return Poll {
                events: Vec::new(),
                last_index: since,
                exists: true,
            };
        }

        let last_index = slot.next_index - 1;
        let events: Vec<(i64, Event)> = slot
            .events
            .iter()
            .filter(|(index, _)| *index > since)
            .cloned()
            .collect();

        Poll {
            events,
            last_index,
            exists: true,
        }
    }

    /// How long an observer has been idle; `None` if it does not exist.
    pub fn idle_for(&self, observer_id: &str) -> Option<Duration> {
        let slots = self.slots.lock().expect("observer slots poisoned");
        slots
            .get(observer_id)
            .map(|slot| slot.last_activity.elapsed())
    }

    /// Remove observers idle longer than `horizon`; returns how many went.
    pub fn reap_idle(&self, horizon: Duration) -> usize {
        let mut slots = self.slots.lock().expect("observer slots poisoned");
        let stale: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.last_activity.elapsed() > horizon)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            slots.remove(id);
        }
        stale.len()
    }

    /// Observer ids bound to a session.
    pub fn observers_for_session(&self, session_id: &str) -> Vec<String> {
        let slots = self.slots.lock().expect("observer slots poisoned");
        slots
            .iter()
            .filter(|(_, slot)| slot.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Age of an observer since creation (diagnostics).
    pub fn age_of(&self, observer_id: &str) -> Option<Duration> {
        let slots = self.slots.lock().expect("observer slots poisoned");
        slots.get(observer_id).map(|slot| slot.created_at.elapsed())
    }

    /// Spawn the background reaper; it stops when `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        horizon: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = store.reap_idle(horizon);
                        if reaped > 0 {
                            log::debug!("reaped {} idle observers", reaped);
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl EventListener for ObserverStore {
    async fn on_event(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.append(event);
        Ok(())
    }

    fn name(&self) -> &str {
        "observer_store"
    }
}

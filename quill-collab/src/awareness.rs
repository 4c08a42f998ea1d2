//! Ephemeral per-peer presence state: cursors, display identity.
//!
//! Awareness is broadcast out-of-band from document content and is never
//! persisted. Entries are keyed by *peer id* — one entry per connected
//! replica, so a user with two editor sessions open appears twice.
//!
//! Lifecycle: an entry is created on the first awareness broadcast after a
//! peer subscribes, updated in place on subsequent broadcasts, and removed
//! when the transport reports the peer left the channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use uuid::Uuid;

/// Display identity attached to a peer's awareness entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    /// CSS-style hex color used for cursor/selection rendering.
    pub color: String,
}

/// A cursor selection in document coordinates.
///
/// `anchor == head` is a collapsed caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(position: u32) -> Self {
        Self {
            anchor: position,
            head: position,
        }
    }
}

/// One peer's full awareness state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: UserInfo,
    pub cursor: Option<CursorRange>,
}

/// Change set handed to awareness observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessChange {
    pub added: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl AwarenessChange {
    fn added(peer: Uuid) -> Self {
        Self {
            added: vec![peer],
            ..Self::default()
        }
    }

    fn updated(peer: Uuid) -> Self {
        Self {
            updated: vec![peer],
            ..Self::default()
        }
    }

    fn removed(peer: Uuid) -> Self {
        Self {
            removed: vec![peer],
            ..Self::default()
        }
    }
}

type ObserverFn = Arc<dyn Fn(&AwarenessChange) + Send + Sync>;

/// Tracks awareness entries for the local peer and all remote peers in a
/// document channel.
///
/// Observers are registered explicitly and handed an unsubscribe handle;
/// there is no hidden shared callback state.
pub struct AwarenessTracker {
    local_peer: Uuid,
    local_user: UserInfo,
    entries: RwLock<HashMap<Uuid, AwarenessState>>,
    observers: Mutex<HashMap<u64, ObserverFn>>,
    next_observer_id: AtomicU64,
}

impl AwarenessTracker {
    /// Create a tracker seeded with the local peer's entry (no cursor yet).
    pub fn new(local_peer: Uuid, local_user: UserInfo) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            local_peer,
            AwarenessState {
                user: local_user.clone(),
                cursor: None,
            },
        );
        Self {
            local_peer,
            local_user,
            entries: RwLock::new(entries),
            observers: Mutex::new(HashMap::new()),
            next_observer_id: AtomicU64::new(0),
        }
    }

    pub fn local_peer(&self) -> Uuid {
        self.local_peer
    }

    /// The local peer's current awareness state.
    pub fn local_state(&self) -> AwarenessState {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&self.local_peer).cloned())
            .unwrap_or(AwarenessState {
                user: self.local_user.clone(),
                cursor: None,
            })
    }

    /// Merge a cursor change into the local entry, returning the new state.
    pub fn set_local_cursor(&self, cursor: Option<CursorRange>) -> AwarenessState {
        let state = AwarenessState {
            user: self.local_user.clone(),
            cursor,
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(self.local_peer, state.clone());
        }
        self.notify(&AwarenessChange::updated(self.local_peer));
        state
    }

    /// Upsert a remote peer's entry. Self-sent states are ignored.
    pub fn apply_remote(&self, peer: Uuid, state: AwarenessState) {
        if peer == self.local_peer {
            return;
        }
        let change = {
            let mut entries = match self.entries.write() {
                Ok(entries) => entries,
                Err(_) => return,
            };
            match entries.insert(peer, state) {
                Some(_) => AwarenessChange::updated(peer),
                None => AwarenessChange::added(peer),
            }
        };
        self.notify(&change);
    }

    /// Evict a peer's entry after the transport reported it left.
    ///
    /// Returns whether an entry was actually removed.
    pub fn remove(&self, peer: Uuid) -> bool {
        if peer == self.local_peer {
            return false;
        }
        let removed = self
            .entries
            .write()
            .map(|mut entries| entries.remove(&peer).is_some())
            .unwrap_or(false);
        if removed {
            self.notify(&AwarenessChange::removed(peer));
        }
        removed
    }

    /// All current entries, local peer included.
    pub fn snapshot(&self) -> HashMap<Uuid, AwarenessState> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Number of tracked peers, local peer included.
    pub fn peer_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Register an observer for awareness changes.
    ///
    /// Dropping the returned handle (or calling `unsubscribe`) detaches
    /// the observer.
    pub fn observe<F>(self: &Arc<Self>, callback: F) -> AwarenessSubscription
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.observers.lock() {
            observers.insert(id, Arc::new(callback));
        }
        AwarenessSubscription {
            id,
            tracker: Arc::downgrade(self),
        }
    }

    fn notify(&self, change: &AwarenessChange) {
        let observers: Vec<ObserverFn> = match self.observers.lock() {
            Ok(observers) => observers.values().cloned().collect(),
            Err(_) => return,
        };
        for observer in observers {
            observer(change);
        }
    }

    fn detach(&self, id: u64) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.remove(&id);
        }
    }
}

/// Handle returned by [`AwarenessTracker::observe`].
///
/// The observer stays registered until this handle is dropped or
/// explicitly unsubscribed.
pub struct AwarenessSubscription {
    id: u64,
    tracker: Weak<AwarenessTracker>,
}

impl AwarenessSubscription {
    pub fn unsubscribe(self) {
        // Drop does the detach.
    }
}

impl Drop for AwarenessSubscription {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.detach(self.id);
        }
    }
}

/// Derive a stable, visually distinct display color from a peer id.
///
/// High-saturation HSL keyed on the id hash, so the same peer renders the
/// same color on every replica without coordination.
pub fn color_for(peer_id: Uuid) -> String {
    let hash = peer_id.as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0) as u8,
        (g * 255.0) as u8,
        (b * 255.0) as u8
    )
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

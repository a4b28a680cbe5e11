use std::collections::BTreeMap;

use foundation::ids::TileId;
use foundation::time::Timestamp;
use parking_lot::Mutex;

/// A request to re-evaluate (and optionally redraw) one tile.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub tile: TileId,
    pub redraw: bool,
}

#[derive(Debug, Default)]
struct NotifierState {
    ready: Vec<ChangeEvent>,
    delayed: BTreeMap<(Timestamp, u64), ChangeEvent>,
    next_seq: u64,
    emitted: u64,
}

/// Collects "this tile needs another look" notifications for a view.
///
/// Fetch completions notify immediately; retry backoff notifies at a due
/// time. The view drains the notifier once per frame, so nothing needs to
/// poll tiles that are waiting on a timer.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    state: Mutex<NotifierState>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_change(&self, tile: TileId, redraw: bool) {
        let mut state = self.state.lock();
        state.emitted += 1;
        state.ready.push(ChangeEvent { tile, redraw });
    }

    /// Schedules a notification that becomes visible once `due` has passed.
    pub fn notify_change_at(&self, due: Timestamp, tile: TileId, redraw: bool) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.insert((due, seq), ChangeEvent { tile, redraw });
    }

    /// Returns every notification due at `now`, one per tile.
    ///
    /// Duplicate notifications for a tile are merged; the merged event
    /// redraws if any of them asked to.
    pub fn drain_due(&self, now: Timestamp) -> Vec<ChangeEvent> {
        let mut state = self.state.lock();

        let later = state.delayed.split_off(&(now.add_millis(1), 0));
        let due = std::mem::replace(&mut state.delayed, later);
        state.emitted += due.len() as u64;

        let mut events = std::mem::take(&mut state.ready);
        events.extend(due.into_values());

        let mut merged: Vec<ChangeEvent> = Vec::with_capacity(events.len());
        for event in events {
            match merged.iter_mut().find(|e| e.tile == event.tile) {
                Some(existing) => existing.redraw |= event.redraw,
                None => merged.push(event),
            }
        }
        merged
    }

    pub fn pending_delayed(&self) -> usize {
        self.state.lock().delayed.len()
    }

    /// Total notifications that have become visible so far.
    pub fn emitted(&self) -> u64 {
        self.state.lock().emitted
    }
}

use foundation::ids::LayerId;
use runtime::work_queue::WeightedQueue;
use serde::Serialize;
use tracing::debug;

use crate::command::Command;

/// Lifecycle counters of one host queue.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounters {
    pub pending: usize,
    pub executing: usize,
    pub executed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CounterKind {
    Pending,
    Executing,
    Executed,
    Failed,
    Cancelled,
}

impl QueueCounters {
    pub fn get(&self, kind: CounterKind) -> usize {
        match kind {
            CounterKind::Pending => self.pending,
            CounterKind::Executing => self.executing,
            CounterKind::Executed => self.executed,
            CounterKind::Failed => self.failed,
            CounterKind::Cancelled => self.cancelled,
        }
    }

    /// Zeroes one counter, returning its previous value.
    pub fn reset(&mut self, kind: CounterKind) -> usize {
        let slot = match kind {
            CounterKind::Pending => &mut self.pending,
            CounterKind::Executing => &mut self.executing,
            CounterKind::Executed => &mut self.executed,
            CounterKind::Failed => &mut self.failed,
            CounterKind::Cancelled => &mut self.cancelled,
        };
        std::mem::take(slot)
    }

    pub(crate) fn merge(&mut self, other: &QueueCounters) {
        self.pending += other.pending;
        self.executing += other.executing;
        self.executed += other.executed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

/// Pending commands of one host, bucketed per layer.
///
/// A thin wrapper over `runtime::WeightedQueue`: the layer's priority is the
/// bucket weight, the command's priority and timestamp order the bucket.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: WeightedQueue<LayerId, Command>,
    pub(crate) counters: QueueCounters,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    pub fn queue(&mut self, command: Command) {
        let layer = command.layer.id;
        let weight = command.layer.priority;
        let priority = command.priority;
        let timestamp = command.timestamp.as_millis();
        self.inner.push(layer, weight, priority, timestamp, command);
        self.counters.pending += 1;
    }

    /// Pops the next command to execute, cancelling early-dropped ones on
    /// the way.
    pub fn dequeue(&mut self) -> Option<Command> {
        loop {
            let (_, _, mut command) = self.inner.pop_next()?;
            self.counters.pending = self.counters.pending.saturating_sub(1);
            if command.should_drop() {
                if command.cancel() {
                    self.counters.cancelled += 1;
                    debug!(command = %command.id, requester = %command.requester, "dropped before execution");
                }
                continue;
            }
            return Some(command);
        }
    }

    /// Takes every pending command of `layer` matching `pred`.
    pub fn take_where(&mut self, layer: LayerId, pred: impl FnMut(&Command) -> bool) -> Vec<Command> {
        let taken = self.inner.extract_where(&layer, pred);
        self.counters.pending = self.counters.pending.saturating_sub(taken.len());
        taken
    }

    /// Cancels everything still pending. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let mut n = 0;
        for mut command in self.inner.drain_all() {
            if command.cancel() {
                n += 1;
            }
        }
        self.counters.pending = 0;
        self.counters.cancelled += n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandQueue, CounterKind};
    use crate::command::{Command, CommandError, CommandId, DownloadTarget, LayerSource};
    use foundation::extent::{Extent, TileCoord};
    use foundation::ids::{LayerId, TileId};
    use foundation::time::Timestamp;
    use runtime::event_bus::ChangeNotifier;
    use std::sync::Arc;

    fn armed(layer: &Arc<LayerSource>, id: u64, priority: i32) -> (Command, crate::command::CommandReceiver) {
        let mut cmd = Command::new(
            Arc::new(ChangeNotifier::new()),
            layer.clone(),
            TileId(id as u32),
            DownloadTarget::new(TileCoord::new(0, 0, 0), Extent::wgs84()),
        )
        .with_priority(priority);
        let rx = cmd.arm(CommandId(id), Timestamp(id));
        (cmd, rx)
    }

    #[test]
    fn dequeue_skips_and_cancels_dropped_commands() {
        let layer = Arc::new(LayerSource::new(LayerId(1), "tms"));
        let mut q = CommandQueue::new();

        let (keep, _keep_rx) = armed(&layer, 1, 0);
        let (doomed, mut doomed_rx) = armed(&layer, 2, 10);
        q.queue(keep);
        q.queue(doomed.with_early_drop(|_| true));
        assert_eq!(q.counters().pending, 2);

        let next = q.dequeue().map(|c| c.id);
        assert_eq!(next, Some(CommandId(1)));
        assert_eq!(q.counters().pending, 0);
        assert_eq!(q.counters().cancelled, 1);
        assert!(matches!(
            doomed_rx.try_recv(),
            Ok(Err(CommandError::Cancelled(CommandId(2))))
        ));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn cancel_all_rejects_every_pending_command() {
        let layer = Arc::new(LayerSource::new(LayerId(1), "tms"));
        let mut q = CommandQueue::new();
        let mut receivers = Vec::new();
        for id in 0..3 {
            let (cmd, rx) = armed(&layer, id, 0);
            q.queue(cmd);
            receivers.push(rx);
        }
        assert_eq!(q.cancel_all(), 3);
        assert!(q.is_empty());
        assert_eq!(q.counters.reset(CounterKind::Cancelled), 3);
        assert_eq!(q.counters().cancelled, 0);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv(), Ok(Err(CommandError::Cancelled(_)))));
        }
    }
}

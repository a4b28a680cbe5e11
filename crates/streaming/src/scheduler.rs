//! Per-host command scheduling.
//!
//! Commands are grouped by the `scheme://authority` of their layer url. Each
//! host gets its own [`CommandQueue`] and at most
//! [`SchedulerConfig::max_commands_per_host`] commands running at once.
//! Commands a provider can serve from resident data take a fast path that
//! bypasses both the queue and the cap.
//!
//! The scheduler is single-threaded and frame-driven: [`Scheduler::tick`]
//! polls in-flight fetches and admits queued commands into free slots.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::task::{Context, Poll};

use foundation::ids::LayerId;
use foundation::time::{Clock, Timestamp};
use futures_util::FutureExt;
use futures_util::task::noop_waker_ref;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandError, CommandId, CommandOutcome, CommandReceiver, LayerSource};
use crate::provider::{FetchFuture, Provider, ProviderContext, ProviderError};
use crate::queue::{CommandQueue, CounterKind, QueueCounters};

/// Failures past this count are still counted but no longer logged.
const FAILURE_LOG_LIMIT: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent non-resident commands allowed per host.
    pub max_commands_per_host: usize,

    /// Fail commands still running after this long. `None` waits forever.
    pub command_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_commands_per_host: 6,
            command_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    UnknownProtocol { protocol: String, layer: LayerId },
    InvalidProvider { protocol: String, reason: &'static str },
    Preprocess { layer: LayerId, source: ProviderError },
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::UnknownProtocol { protocol, layer } => {
                write!(f, "no provider registered for protocol {protocol:?} ({layer})")
            }
            SchedulerError::InvalidProvider { protocol, reason } => {
                write!(f, "invalid provider for protocol {protocol:?}: {reason}")
            }
            SchedulerError::Preprocess { layer, source } => {
                write!(f, "failed to prepare {layer}: {source}")
            }
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchedulerError::Preprocess { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What one [`Scheduler::tick`] did.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub settled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Queue of layers without a distinguishable host.
    pub default: QueueCounters,
    pub hosts: BTreeMap<String, QueueCounters>,
    pub total: QueueCounters,
}

struct InFlight {
    command: Command,
    future: FetchFuture,
    started: Timestamp,
    fast_path: bool,
}

#[derive(Default)]
struct HostQueue {
    queue: CommandQueue,
    in_flight: Vec<InFlight>,
    /// Slots may be free and the queue non-empty.
    dirty: bool,
}

struct Env<'a> {
    providers: &'a BTreeMap<String, Rc<dyn Provider>>,
    context: &'a ProviderContext,
    config: &'a SchedulerConfig,
    failures: &'a mut u64,
    now: Timestamp,
}

impl Env<'_> {
    fn timed_out(&self, started: Timestamp) -> Option<u64> {
        let limit = self.config.command_timeout_ms?;
        let elapsed = self.now.millis_since(started);
        (elapsed >= limit).then_some(elapsed)
    }
}

impl HostQueue {
    fn step(&mut self, env: &mut Env<'_>, report: &mut TickReport) {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut freed: BTreeSet<LayerId> = BTreeSet::new();

        let mut i = 0;
        while i < self.in_flight.len() {
            let entry = &mut self.in_flight[i];
            let outcome = match entry.future.poll_unpin(&mut cx) {
                Poll::Ready(result) => Some(result.map_err(CommandError::Provider)),
                Poll::Pending => env.timed_out(entry.started).map(|after_ms| {
                    Err(CommandError::TimedOut {
                        id: entry.command.id,
                        after_ms,
                    })
                }),
            };
            let Some(outcome) = outcome else {
                i += 1;
                continue;
            };
            // Dropping the future aborts a timed-out fetch.
            let entry = self.in_flight.remove(i);
            if !entry.fast_path {
                freed.insert(entry.command.layer.id);
            }
            self.settle(entry.command, entry.fast_path, outcome, env);
            report.settled += 1;
        }

        if self.dirty || !freed.is_empty() {
            self.dirty = false;
            while self.running() < env.config.max_commands_per_host {
                let Some(command) = self.queue.dequeue() else {
                    break;
                };
                let layer = command.layer.id;
                report.started += 1;
                if self.start(command, false, env) {
                    freed.insert(layer);
                    report.settled += 1;
                }
            }
        }

        for layer in freed {
            self.promote_resident(layer, env, report);
        }
    }

    /// Queued-path commands still in flight. Admission counts these rather
    /// than the `executing` counter, which callers may reset.
    fn running(&self) -> usize {
        self.in_flight.iter().filter(|f| !f.fast_path).count()
    }

    /// Moves queued commands of `layer` that became resident (typically
    /// because a just-finished fetch filled the cache) onto the fast path.
    fn promote_resident(&mut self, layer: LayerId, env: &mut Env<'_>, report: &mut TickReport) {
        let providers = env.providers;
        let context = env.context;
        let resident = self.queue.take_where(layer, |command| {
            providers
                .get(&command.layer.protocol)
                .is_some_and(|p| p.is_resident(command, context))
        });
        for mut command in resident {
            if command.should_drop() {
                if command.cancel() {
                    self.queue.counters.cancelled += 1;
                }
                continue;
            }
            debug!(command = %command.id, layer = %layer, "promoted to fast path");
            report.started += 1;
            if self.start(command, true, env) {
                report.settled += 1;
            }
        }
    }

    /// Hands `command` to its provider. Returns `true` if it settled
    /// synchronously.
    fn start(&mut self, mut command: Command, fast_path: bool, env: &mut Env<'_>) -> bool {
        command.mark_executing();
        if !fast_path {
            self.queue.counters.executing += 1;
        }

        let Some(provider) = env.providers.get(&command.layer.protocol).cloned() else {
            let err = ProviderError::Unsupported(format!("protocol {:?}", command.layer.protocol));
            self.settle(command, fast_path, Err(CommandError::Provider(err)), env);
            return true;
        };

        let mut future = provider.execute_command(&command, env.context);
        let mut cx = Context::from_waker(noop_waker_ref());
        match future.poll_unpin(&mut cx) {
            Poll::Ready(result) => {
                self.settle(command, fast_path, result.map_err(CommandError::Provider), env);
                true
            }
            Poll::Pending => {
                self.in_flight.push(InFlight {
                    command,
                    future,
                    started: env.now,
                    fast_path,
                });
                false
            }
        }
    }

    fn settle(&mut self, mut command: Command, fast_path: bool, outcome: CommandOutcome, env: &mut Env<'_>) {
        let counters = &mut self.queue.counters;
        if !fast_path {
            counters.executing = counters.executing.saturating_sub(1);
        }
        match &outcome {
            Ok(_) => counters.executed += 1,
            Err(err) => {
                counters.failed += 1;
                *env.failures += 1;
                if *env.failures <= FAILURE_LOG_LIMIT {
                    warn!(
                        command = %command.id,
                        layer = %command.layer.id,
                        requester = %command.requester,
                        error = %err,
                        "command failed"
                    );
                    if *env.failures == FAILURE_LOG_LIMIT {
                        warn!("further command failures will not be logged");
                    }
                }
            }
        }
        command.view.notify_change(command.requester, command.redraw);
        command.finish(outcome);
    }
}

/// Routes layer commands to protocol providers under a per-host
/// concurrency cap.
pub struct Scheduler {
    config: SchedulerConfig,
    context: ProviderContext,
    providers: BTreeMap<String, Rc<dyn Provider>>,
    default_queue: HostQueue,
    hosts: BTreeMap<String, HostQueue>,
    attached: BTreeSet<LayerId>,
    next_id: u64,
    failures: u64,
}

impl Scheduler {
    pub fn new(mut config: SchedulerConfig, context: ProviderContext) -> Self {
        config.max_commands_per_host = config.max_commands_per_host.max(1);
        Self {
            config,
            context,
            providers: BTreeMap::new(),
            default_queue: HostQueue::default(),
            hosts: BTreeMap::new(),
            attached: BTreeSet::new(),
            next_id: 1,
            failures: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn context(&self) -> &ProviderContext {
        &self.context
    }

    pub fn add_protocol_provider(
        &mut self,
        protocol: impl Into<String>,
        provider: Rc<dyn Provider>,
    ) -> Result<(), SchedulerError> {
        let protocol = protocol.into();
        if protocol.trim().is_empty() {
            return Err(SchedulerError::InvalidProvider {
                protocol,
                reason: "protocol name is empty",
            });
        }
        if self.providers.contains_key(&protocol) {
            return Err(SchedulerError::InvalidProvider {
                protocol,
                reason: "protocol already has a provider",
            });
        }
        info!(protocol = %protocol, "registered provider");
        self.providers.insert(protocol, provider);
        Ok(())
    }

    pub fn protocol_provider(&self, protocol: &str) -> Option<Rc<dyn Provider>> {
        self.providers.get(protocol).cloned()
    }

    /// Runs the provider's one-time layer setup. Attaching twice is a no-op.
    pub fn attach_layer(&mut self, layer: &LayerSource) -> Result<Rc<dyn Provider>, SchedulerError> {
        let provider = self.provider_for(layer)?;
        if self.attached.contains(&layer.id) {
            return Ok(provider);
        }
        provider
            .preprocess_data_layer(layer)
            .map_err(|source| SchedulerError::Preprocess {
                layer: layer.id,
                source,
            })?;
        self.attached.insert(layer.id);
        debug!(layer = %layer.id, protocol = %layer.protocol, "layer attached");
        Ok(provider)
    }

    /// Submits a command. The receiver settles exactly once: with the
    /// provider's result, a failure, or a cancellation.
    pub fn execute(&mut self, mut command: Command) -> Result<CommandReceiver, SchedulerError> {
        let provider = self.provider_for(&command.layer)?;
        let now = self.context.clock.now();
        let id = CommandId(self.next_id);
        self.next_id += 1;
        let rx = command.arm(id, now);
        let resident = provider.is_resident(&command, &self.context);

        let Scheduler {
            config,
            context,
            providers,
            default_queue,
            hosts,
            failures,
            ..
        } = self;
        let queue = match command.layer.host() {
            Some(host) => hosts.entry(host).or_default(),
            None => default_queue,
        };
        if resident {
            let mut env = Env {
                providers,
                context,
                config,
                failures,
                now,
            };
            debug!(command = %id, layer = %command.layer.id, "served from resident data");
            queue.start(command, true, &mut env);
        } else {
            queue.queue.queue(command);
            queue.dirty = true;
        }
        Ok(rx)
    }

    /// Polls running commands and starts queued ones in free slots.
    pub fn tick(&mut self) -> TickReport {
        let now = self.context.clock.now();
        let mut report = TickReport::default();
        let Scheduler {
            config,
            context,
            providers,
            default_queue,
            hosts,
            failures,
            ..
        } = self;
        let mut env = Env {
            providers,
            context,
            config,
            failures,
            now,
        };
        for queue in std::iter::once(default_queue).chain(hosts.values_mut()) {
            queue.step(&mut env, &mut report);
        }
        report
    }

    /// Cancels every queued command. Running commands are left alone.
    pub fn cancel_pending(&mut self) -> usize {
        std::iter::once(&mut self.default_queue)
            .chain(self.hosts.values_mut())
            .map(|q| q.queue.cancel_all())
            .sum()
    }

    pub fn commands_waiting_execution_count(&self) -> usize {
        self.queues().map(|q| q.queue.counters.pending).sum()
    }

    pub fn commands_running_count(&self) -> usize {
        self.queues().map(|q| q.queue.counters.executing).sum()
    }

    /// Zeroes one counter on every host, returning the summed old value.
    pub fn reset_commands_count(&mut self, kind: CounterKind) -> usize {
        std::iter::once(&mut self.default_queue)
            .chain(self.hosts.values_mut())
            .map(|q| q.queue.counters.reset(kind))
            .sum()
    }

    /// Counters of one host, or of the default queue for `None`.
    pub fn queue_counters(&self, host: Option<&str>) -> Option<QueueCounters> {
        match host {
            Some(host) => self.hosts.get(host).map(|q| q.queue.counters),
            None => Some(self.default_queue.queue.counters),
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut snapshot = SchedulerSnapshot {
            default: self.default_queue.queue.counters,
            ..SchedulerSnapshot::default()
        };
        snapshot.total.merge(&snapshot.default);
        for (host, q) in &self.hosts {
            snapshot.hosts.insert(host.clone(), q.queue.counters);
            snapshot.total.merge(&q.queue.counters);
        }
        snapshot
    }

    fn queues(&self) -> impl Iterator<Item = &HostQueue> {
        std::iter::once(&self.default_queue).chain(self.hosts.values())
    }

    fn provider_for(&self, layer: &LayerSource) -> Result<Rc<dyn Provider>, SchedulerError> {
        self.providers
            .get(&layer.protocol)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownProtocol {
                protocol: layer.protocol.clone(),
                layer: layer.id,
            })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("protocols", &self.providers.keys().collect::<Vec<_>>())
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("waiting", &self.commands_waiting_execution_count())
            .field("running", &self.commands_running_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Scheduler, SchedulerConfig, SchedulerError};
    use crate::command::{
        Command, CommandError, CommandReceiver, CommandResult, DownloadTarget, LayerSource,
    };
    use crate::provider::{FetchFuture, Provider, ProviderContext, ProviderError};
    use crate::queue::CounterKind;
    use foundation::extent::{Extent, TileCoord};
    use foundation::ids::{LayerId, TileId};
    use foundation::time::{Clock, ManualClock, Timestamp};
    use futures_util::future::poll_fn;
    use gpu::textures::{TexelData, Texture, TexturePitch};
    use pretty_assertions::assert_eq;
    use runtime::event_bus::ChangeNotifier;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeSet;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::Poll;

    /// Fetches stay pending until their requester is released.
    #[derive(Default)]
    struct Scripted {
        started: RefCell<Vec<TileId>>,
        released: Rc<RefCell<BTreeSet<TileId>>>,
        failing: RefCell<BTreeSet<TileId>>,
        resident: RefCell<BTreeSet<TileId>>,
        preprocessed: Cell<usize>,
    }

    impl Scripted {
        fn release(&self, tile: u32) {
            self.released.borrow_mut().insert(TileId(tile));
        }

        fn started(&self) -> Vec<u32> {
            self.started.borrow().iter().map(|t| t.0).collect()
        }
    }

    fn texture() -> CommandResult {
        CommandResult::Texture(TexturePitch::whole(Texture::shared(1, 1, TexelData::Unavailable)))
    }

    impl Provider for Scripted {
        fn preprocess_data_layer(&self, _layer: &LayerSource) -> Result<(), ProviderError> {
            self.preprocessed.set(self.preprocessed.get() + 1);
            Ok(())
        }

        fn execute_command(&self, command: &Command, _ctx: &ProviderContext) -> FetchFuture {
            let tile = command.requester;
            self.started.borrow_mut().push(tile);
            let fail = self.failing.borrow().contains(&tile);
            let resident = self.resident.borrow().contains(&tile);
            let released = self.released.clone();
            Box::pin(poll_fn(move |_| {
                if resident || released.borrow().contains(&tile) {
                    Poll::Ready(if fail {
                        Err(ProviderError::NotFound)
                    } else {
                        Ok(texture())
                    })
                } else {
                    Poll::Pending
                }
            }))
        }

        fn is_resident(&self, command: &Command, _ctx: &ProviderContext) -> bool {
            self.resident.borrow().contains(&command.requester)
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        view: Arc<ChangeNotifier>,
        provider: Rc<Scripted>,
        scheduler: Scheduler,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
        let mut scheduler = Scheduler::new(config, ProviderContext::new(clock.clone()));
        let provider = Rc::new(Scripted::default());
        scheduler
            .add_protocol_provider("tms", provider.clone())
            .expect("register");
        Harness {
            clock,
            view: Arc::new(ChangeNotifier::new()),
            provider,
            scheduler,
        }
    }

    fn layer(id: u64, url: &str) -> Arc<LayerSource> {
        Arc::new(LayerSource::new(LayerId(id), "tms").with_url(url))
    }

    impl Harness {
        fn command(&self, layer: &Arc<LayerSource>, tile: u32) -> Command {
            Command::new(
                self.view.clone(),
                layer.clone(),
                TileId(tile),
                DownloadTarget::new(TileCoord::new(0, 0, 0), Extent::wgs84()),
            )
        }

        fn submit(&mut self, command: Command) -> CommandReceiver {
            self.scheduler.execute(command).expect("execute")
        }
    }

    #[test]
    fn caps_running_commands_per_host() {
        let mut h = harness(SchedulerConfig::default());
        let a = layer(1, "https://a.example.com/{z}/{x}/{y}.png");
        let mut receivers = Vec::new();
        for tile in 0..10 {
            let cmd = h.command(&a, tile);
            receivers.push(h.submit(cmd));
        }
        assert_eq!(h.scheduler.commands_waiting_execution_count(), 10);
        assert_eq!(h.scheduler.commands_running_count(), 0);

        h.scheduler.tick();
        assert_eq!(h.scheduler.commands_running_count(), 6);
        assert_eq!(h.scheduler.commands_waiting_execution_count(), 4);

        let first_two: Vec<u32> = h.provider.started()[..2].to_vec();
        for tile in &first_two {
            h.provider.release(*tile);
        }
        let report = h.scheduler.tick();
        assert_eq!(report.settled, 2);
        assert_eq!(report.started, 2);
        assert_eq!(h.scheduler.commands_running_count(), 6);
        assert_eq!(h.scheduler.commands_waiting_execution_count(), 2);

        for tile in 0..10 {
            h.provider.release(tile);
        }
        h.scheduler.tick();
        h.scheduler.tick();
        assert_eq!(h.scheduler.commands_running_count(), 0);
        assert_eq!(h.scheduler.snapshot().total.executed, 10);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv(), Ok(Ok(CommandResult::Texture(_)))));
        }
    }

    #[test]
    fn resetting_executing_counter_keeps_the_cap() {
        let mut h = harness(SchedulerConfig::default());
        let a = layer(1, "https://a.example.com/{z}/{x}/{y}.png");
        let mut receivers = Vec::new();
        for tile in 0..6 {
            let cmd = h.command(&a, tile);
            receivers.push(h.submit(cmd));
        }
        h.scheduler.tick();
        assert_eq!(h.provider.started().len(), 6);

        assert_eq!(h.scheduler.reset_commands_count(CounterKind::Executing), 6);
        for tile in 6..12 {
            let cmd = h.command(&a, tile);
            receivers.push(h.submit(cmd));
        }
        let report = h.scheduler.tick();
        assert_eq!(report.started, 0);
        assert_eq!(h.provider.started().len(), 6);
        assert_eq!(h.scheduler.commands_waiting_execution_count(), 6);

        h.provider.release(0);
        let report = h.scheduler.tick();
        assert_eq!((report.settled, report.started), (1, 1));
        assert_eq!(h.provider.started().len(), 7);
    }

    #[test]
    fn hosts_have_independent_caps() {
        let mut h = harness(SchedulerConfig::default());
        let a = layer(1, "https://a.example.com/t");
        let b = layer(2, "https://b.example.com/t");
        let mut receivers = Vec::new();
        for tile in 0..8 {
            let cmd = h.command(&a, tile);
            receivers.push(h.submit(cmd));
            let cmd = h.command(&b, 100 + tile);
            receivers.push(h.submit(cmd));
        }
        h.scheduler.tick();
        let snapshot = h.scheduler.snapshot();
        assert_eq!(snapshot.hosts["https://a.example.com"].executing, 6);
        assert_eq!(snapshot.hosts["https://b.example.com"].executing, 6);
        assert_eq!(snapshot.total.pending, 4);
    }

    #[test]
    fn dropped_commands_are_cancelled_not_run() {
        let mut h = harness(SchedulerConfig {
            max_commands_per_host: 1,
            ..SchedulerConfig::default()
        });
        let a = layer(1, "https://a.example.com/t");
        let cmd = h.command(&a, 1);
        let _first = h.submit(cmd);
        h.scheduler.tick();

        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let cmd = h
            .command(&a, 2)
            .with_early_drop(move |_| !flag.load(Ordering::Relaxed));
        let mut doomed = h.submit(cmd);

        alive.store(false, Ordering::Relaxed);
        h.provider.release(1);
        h.scheduler.tick();

        assert!(matches!(doomed.try_recv(), Ok(Err(ref e)) if e.is_cancellation()));
        assert_eq!(h.provider.started(), vec![1]);
        assert_eq!(h.scheduler.reset_commands_count(CounterKind::Cancelled), 1);
        assert_eq!(h.scheduler.reset_commands_count(CounterKind::Cancelled), 0);
    }

    #[test]
    fn resident_commands_bypass_cap() {
        let mut h = harness(SchedulerConfig::default());
        let a = layer(1, "https://a.example.com/t");
        for tile in 0..6 {
            let cmd = h.command(&a, tile);
            let _ = h.submit(cmd);
        }
        h.scheduler.tick();
        assert_eq!(h.scheduler.commands_running_count(), 6);

        h.provider.resident.borrow_mut().insert(TileId(42));
        let cmd = h.command(&a, 42);
        let mut rx = h.submit(cmd);
        assert!(matches!(rx.try_recv(), Ok(Ok(_))));
        assert_eq!(h.scheduler.commands_running_count(), 6);
        assert_eq!(h.scheduler.commands_waiting_execution_count(), 0);
    }

    #[test]
    fn finished_fetch_promotes_resident_commands() {
        let mut h = harness(SchedulerConfig {
            max_commands_per_host: 1,
            ..SchedulerConfig::default()
        });
        let a = layer(1, "https://a.example.com/t");
        for (tile, priority) in [(0, 10), (1, 5), (2, 1), (3, 1)] {
            let cmd = h.command(&a, tile).with_priority(priority);
            let _ = h.submit(cmd);
        }
        h.scheduler.tick();
        assert_eq!(h.provider.started(), vec![0]);

        // Tile 0's download also covers tiles 2 and 3.
        h.provider.resident.borrow_mut().extend([TileId(2), TileId(3)]);
        h.provider.release(0);
        h.scheduler.tick();

        let mut started = h.provider.started();
        started[2..].sort();
        assert_eq!(started, vec![0, 1, 2, 3]);
        assert_eq!(h.scheduler.commands_running_count(), 1);
        assert_eq!(h.scheduler.commands_waiting_execution_count(), 0);
        assert_eq!(h.scheduler.snapshot().total.executed, 3);
    }

    #[test]
    fn higher_priority_then_newer_first() {
        let mut h = harness(SchedulerConfig {
            max_commands_per_host: 1,
            ..SchedulerConfig::default()
        });
        let a = layer(1, "https://a.example.com/t");
        for (tile, priority) in [(1, 1), (2, 5), (3, 5)] {
            let cmd = h.command(&a, tile).with_priority(priority);
            let _ = h.submit(cmd);
            h.clock.advance(10);
        }
        for _ in 0..3 {
            h.scheduler.tick();
            let last = *h.provider.started().last().expect("started");
            h.provider.release(last);
        }
        assert_eq!(h.provider.started(), vec![3, 2, 1]);
    }

    #[test]
    fn failures_reject_and_notify() {
        let mut h = harness(SchedulerConfig::default());
        let a = layer(1, "https://a.example.com/t");
        h.provider.failing.borrow_mut().insert(TileId(7));
        h.provider.release(7);
        let cmd = h.command(&a, 7).with_redraw(false);
        let mut rx = h.submit(cmd);
        h.scheduler.tick();

        assert!(matches!(
            rx.try_recv(),
            Ok(Err(CommandError::Provider(ProviderError::NotFound)))
        ));
        assert_eq!(h.scheduler.snapshot().total.failed, 1);
        let events = h.view.drain_due(h.clock.now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tile, TileId(7));
        assert!(!events[0].redraw);
    }

    #[test]
    fn timed_out_commands_fail_and_free_their_slot() {
        let mut h = harness(SchedulerConfig {
            max_commands_per_host: 1,
            command_timeout_ms: Some(100),
        });
        let a = layer(1, "https://a.example.com/t");
        let cmd = h.command(&a, 1).with_priority(1);
        let mut stuck = h.submit(cmd);
        let cmd = h.command(&a, 2);
        let _next = h.submit(cmd);
        h.scheduler.tick();

        h.clock.advance(99);
        h.scheduler.tick();
        assert!(stuck.try_recv().is_err());

        h.clock.advance(1);
        h.scheduler.tick();
        assert!(matches!(
            stuck.try_recv(),
            Ok(Err(CommandError::TimedOut { after_ms: 100, .. }))
        ));
        assert_eq!(h.provider.started(), vec![1, 2]);
    }

    #[test]
    fn registry_rejects_bad_registrations() {
        let mut h = harness(SchedulerConfig::default());
        let again = h
            .scheduler
            .add_protocol_provider("tms", Rc::new(Scripted::default()));
        assert!(matches!(again, Err(SchedulerError::InvalidProvider { .. })));
        let empty = h
            .scheduler
            .add_protocol_provider(" ", Rc::new(Scripted::default()));
        assert!(matches!(empty, Err(SchedulerError::InvalidProvider { .. })));

        let unknown = Arc::new(LayerSource::new(LayerId(9), "wfs"));
        let cmd = h.command(&unknown, 1);
        assert!(matches!(
            h.scheduler.execute(cmd),
            Err(SchedulerError::UnknownProtocol { .. })
        ));
    }

    #[test]
    fn attach_preprocesses_once() {
        let mut h = harness(SchedulerConfig::default());
        let a = layer(1, "https://a.example.com/t");
        h.scheduler.attach_layer(&a).expect("attach");
        h.scheduler.attach_layer(&a).expect("attach again");
        assert_eq!(h.provider.preprocessed.get(), 1);
    }

    #[test]
    fn config_from_partial_json() {
        let config = SchedulerConfig::from_json(r#"{ "command_timeout_ms": 2500 }"#).expect("parse");
        assert_eq!(
            config,
            SchedulerConfig {
                max_commands_per_host: 6,
                command_timeout_ms: Some(2500),
            }
        );
    }
}

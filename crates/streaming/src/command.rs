use std::sync::Arc;

use foundation::extent::{Extent, TileCoord};
use foundation::ids::{LayerId, TileId};
use foundation::pitch::Pitch;
use foundation::time::Timestamp;
use gpu::textures::TexturePitch;
use runtime::event_bus::ChangeNotifier;
use tokio::sync::oneshot;

use crate::provider::ProviderError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// What the scheduler needs to know about a layer to route its commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSource {
    pub id: LayerId,
    /// Provider registry key, e.g. `"tms"` or `"wmts"`.
    pub protocol: String,
    pub url: Option<String>,
    /// Round-robin weight of the layer's bucket.
    pub priority: u32,
}

impl LayerSource {
    pub fn new(id: LayerId, protocol: impl Into<String>) -> Self {
        Self {
            id,
            protocol: protocol.into(),
            url: None,
            priority: 1,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority.max(1);
        self
    }

    /// `scheme://authority` of the url, the unit the concurrency cap applies to.
    ///
    /// Relative or scheme-less urls have no distinguishable origin and share
    /// the default queue.
    pub fn host(&self) -> Option<String> {
        let url = self.url.as_deref()?;
        let (scheme, rest) = url.split_once("://")?;
        let authority = rest.split(['/', '?', '#']).next()?;
        let authority = authority.rsplit('@').next()?;
        if scheme.is_empty() || authority.is_empty() {
            return None;
        }
        Some(format!("{}://{}", scheme.to_ascii_lowercase(), authority.to_ascii_lowercase()))
    }
}

/// Descriptor of what a command should download, produced by the layer's
/// texture source and interpreted by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTarget {
    pub coord: TileCoord,
    pub extent: Extent,
    /// Part of the downloaded image that covers the requesting tile.
    pub pitch: Pitch,
    pub url: Option<String>,
}

impl DownloadTarget {
    pub fn new(coord: TileCoord, extent: Extent) -> Self {
        Self {
            coord,
            extent,
            pitch: Pitch::IDENTITY,
            url: None,
        }
    }
}

/// Elevation samples delivered as plain numbers rather than a texture.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleGrid {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

/// Texture-like outcome of a successful command.
#[derive(Debug, Clone)]
pub enum CommandResult {
    Texture(TexturePitch),
    Samples { grid: SampleGrid, pitch: Pitch },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Dropped before execution; not a failure.
    Cancelled(CommandId),
    Provider(ProviderError),
    TimedOut { id: CommandId, after_ms: u64 },
    /// The scheduler went away before settling the command.
    Abandoned,
}

impl CommandError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CommandError::Cancelled(_))
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Cancelled(id) => write!(f, "{id} cancelled"),
            CommandError::Provider(err) => write!(f, "provider failed: {err}"),
            CommandError::TimedOut { id, after_ms } => {
                write!(f, "{id} timed out after {after_ms}ms")
            }
            CommandError::Abandoned => write!(f, "command abandoned by scheduler"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Provider(err) => Some(err),
            _ => None,
        }
    }
}

pub type CommandOutcome = Result<CommandResult, CommandError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Executing,
    Cancelled,
    Executed,
    Failed,
}

pub type EarlyDrop = Box<dyn Fn(&Command) -> bool>;

/// One unit of fetch work.
///
/// Built by a layer, owned by the scheduler until it settles. The deferred
/// result is a one-shot channel: it is settled exactly once, and settling a
/// command twice is a no-op.
pub struct Command {
    pub id: CommandId,
    pub view: Arc<ChangeNotifier>,
    pub layer: Arc<LayerSource>,
    pub requester: TileId,
    /// Larger runs earlier.
    pub priority: i32,
    pub timestamp: Timestamp,
    pub to_download: DownloadTarget,
    pub redraw: bool,
    early_drop: Option<EarlyDrop>,
    state: CommandState,
    deferred: Option<oneshot::Sender<CommandOutcome>>,
}

/// Receiving half of a command's deferred result.
pub type CommandReceiver = oneshot::Receiver<CommandOutcome>;

impl Command {
    pub fn new(
        view: Arc<ChangeNotifier>,
        layer: Arc<LayerSource>,
        requester: TileId,
        to_download: DownloadTarget,
    ) -> Self {
        Self {
            id: CommandId(0),
            view,
            layer,
            requester,
            priority: 0,
            timestamp: Timestamp::ZERO,
            to_download,
            redraw: true,
            early_drop: None,
            state: CommandState::Pending,
            deferred: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_redraw(mut self, redraw: bool) -> Self {
        self.redraw = redraw;
        self
    }

    pub fn with_early_drop(mut self, f: impl Fn(&Command) -> bool + 'static) -> Self {
        self.early_drop = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        self.deferred.is_none()
    }

    /// Evaluates the early-drop predicate. Commands without one never drop.
    pub fn should_drop(&self) -> bool {
        self.early_drop.as_ref().is_some_and(|f| f(self))
    }

    pub(crate) fn arm(&mut self, id: CommandId, timestamp: Timestamp) -> CommandReceiver {
        let (tx, rx) = oneshot::channel();
        self.id = id;
        self.timestamp = timestamp;
        self.state = CommandState::Pending;
        self.deferred = Some(tx);
        rx
    }

    pub(crate) fn mark_executing(&mut self) {
        self.state = CommandState::Executing;
    }

    /// Moves a pending command to `Cancelled` and rejects it.
    ///
    /// Returns `false` (and does nothing) if the command was not pending.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.state != CommandState::Pending {
            return false;
        }
        self.state = CommandState::Cancelled;
        self.settle(Err(CommandError::Cancelled(self.id)));
        true
    }

    pub(crate) fn finish(&mut self, outcome: CommandOutcome) {
        self.state = match outcome {
            Ok(_) => CommandState::Executed,
            Err(_) => CommandState::Failed,
        };
        self.settle(outcome);
    }

    fn settle(&mut self, outcome: CommandOutcome) {
        if let Some(tx) = self.deferred.take() {
            // The receiver may be gone if the requester was destroyed.
            let _ = tx.send(outcome);
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("layer", &self.layer.id)
            .field("requester", &self.requester)
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, CommandError, CommandId, CommandState, DownloadTarget, LayerSource};
    use foundation::extent::{Extent, TileCoord};
    use foundation::ids::{LayerId, TileId};
    use foundation::time::Timestamp;
    use runtime::event_bus::ChangeNotifier;
    use std::sync::Arc;

    fn command() -> Command {
        Command::new(
            Arc::new(ChangeNotifier::new()),
            Arc::new(LayerSource::new(LayerId(1), "tms")),
            TileId(0),
            DownloadTarget::new(TileCoord::new(0, 0, 0), Extent::wgs84()),
        )
    }

    #[test]
    fn host_is_scheme_and_authority() {
        let src = LayerSource::new(LayerId(1), "tms");
        assert_eq!(src.host(), None);
        let src = src.with_url("https://Tiles.Example.com:8443/{z}/{x}/{y}.png?key=1");
        assert_eq!(src.host().as_deref(), Some("https://tiles.example.com:8443"));
        let src = LayerSource::new(LayerId(1), "tms").with_url("tiles/{z}/{x}/{y}.png");
        assert_eq!(src.host(), None);
        let src = LayerSource::new(LayerId(1), "tms").with_url("http://user@host.io/a");
        assert_eq!(src.host().as_deref(), Some("http://host.io"));
    }

    #[test]
    fn cancel_settles_once() {
        let mut cmd = command();
        let mut rx = cmd.arm(CommandId(4), Timestamp(1));

        assert!(cmd.cancel());
        assert_eq!(cmd.state(), CommandState::Cancelled);
        assert!(!cmd.cancel());
        assert!(cmd.is_settled());

        match rx.try_recv() {
            Ok(Err(CommandError::Cancelled(id))) => assert_eq!(id, CommandId(4)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn early_drop_defaults_to_keep() {
        let cmd = command();
        assert!(!cmd.should_drop());
        let cmd = command().with_early_drop(|c| c.priority < 0).with_priority(-1);
        assert!(cmd.should_drop());
    }
}

use std::sync::Arc;

use foundation::ids::{LayerId, TileId};
use foundation::time::Timestamp;
use gpu::material::MaterialError;
use runtime::event_bus::ChangeNotifier;
use scene::tree::TileTree;
use serde::{Deserialize, Serialize};
use streaming::command::LayerSource;
use streaming::scheduler::{Scheduler, SchedulerError};

use crate::interpretation::DecodeError;

/// User-facing knobs of a layer.
///
/// Setters report what changed so the host can decide what to refresh; an
/// assignment that leaves the value untouched reports nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerProperties {
    visible: bool,
    opacity: f32,
    frozen: bool,
}

impl Default for LayerProperties {
    fn default() -> Self {
        Self {
            visible: true,
            opacity: 1.0,
            frozen: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum LayerChange {
    Visible(bool),
    Opacity { from: f32, to: f32 },
    Frozen(bool),
}

impl LayerProperties {
    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// A frozen layer keeps its textures but issues no new commands.
    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_visible(&mut self, visible: bool) -> Option<LayerChange> {
        if self.visible == visible {
            return None;
        }
        self.visible = visible;
        Some(LayerChange::Visible(visible))
    }

    pub fn set_opacity(&mut self, opacity: f32) -> Option<LayerChange> {
        let to = opacity.clamp(0.0, 1.0);
        if self.opacity == to {
            return None;
        }
        let from = std::mem::replace(&mut self.opacity, to);
        Some(LayerChange::Opacity { from, to })
    }

    pub fn set_frozen(&mut self, frozen: bool) -> Option<LayerChange> {
        if self.frozen == frozen {
            return None;
        }
        self.frozen = frozen;
        Some(LayerChange::Frozen(frozen))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerError {
    Scheduler(SchedulerError),
    Material(MaterialError),
    /// A payload the layer can never decode. `report` holds the counts of
    /// the pass that hit it, including results applied before and after.
    Decode {
        tile: TileId,
        source: DecodeError,
        report: ProcessReport,
    },
}

impl LayerError {
    /// Counts of the interrupted processing pass, when there was one.
    pub fn report(&self) -> Option<&ProcessReport> {
        match self {
            LayerError::Decode { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl std::fmt::Display for LayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerError::Scheduler(err) => write!(f, "scheduler: {err}"),
            LayerError::Material(err) => write!(f, "material: {err}"),
            LayerError::Decode { tile, source, .. } => write!(f, "decoding elevation of {tile}: {source}"),
        }
    }
}

impl std::error::Error for LayerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LayerError::Scheduler(err) => Some(err),
            LayerError::Material(err) => Some(err),
            LayerError::Decode { source, .. } => Some(source),
        }
    }
}

impl From<SchedulerError> for LayerError {
    fn from(err: SchedulerError) -> Self {
        LayerError::Scheduler(err)
    }
}

impl From<MaterialError> for LayerError {
    fn from(err: MaterialError) -> Self {
        LayerError::Material(err)
    }
}

/// Everything a layer touches during one update pass.
pub struct UpdateContext<'a> {
    pub tree: &'a mut TileTree,
    pub scheduler: &'a mut Scheduler,
    pub view: Arc<ChangeNotifier>,
    pub now: Timestamp,
}

/// What [`Layer::update`] decided for a tile.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Tile hidden, layer frozen or invisible, or tile unknown.
    Skipped,
    /// A fetch is running or the backoff window is still open.
    Waiting,
    /// The current texture is as good as it gets for now.
    UpToDate,
    /// Outside coverage; an ancestor's texture stands in for good.
    Inherited,
    /// The layer will never serve this tile.
    Terminal,
    /// A command was handed to the scheduler.
    Requested,
}

/// Outcome counts of one [`Layer::process_results`] pass.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub applied: usize,
    pub cancelled: usize,
    pub failed: usize,
}

impl ProcessReport {
    pub fn absorb(&mut self, other: &ProcessReport) {
        self.applied += other.applied;
        self.cancelled += other.cancelled;
        self.failed += other.failed;
    }
}

pub trait Layer {
    fn id(&self) -> LayerId;

    fn source(&self) -> &Arc<LayerSource>;

    fn properties(&self) -> &LayerProperties;

    fn properties_mut(&mut self) -> &mut LayerProperties;

    /// Runs one refinement step of `tile` for this layer.
    fn update(&mut self, ctx: &mut UpdateContext<'_>, tile: TileId) -> Result<UpdateOutcome, LayerError>;

    /// Applies every command result that settled since the last call.
    fn process_results(&mut self, ctx: &mut UpdateContext<'_>) -> Result<ProcessReport, LayerError>;

    /// Commands issued and not yet processed.
    fn pending_fetches(&self) -> usize;

    /// Removes the layer's slot and retry state from every tile.
    fn detach(&mut self, tree: &mut TileTree);
}

#[cfg(test)]
mod tests {
    use super::{LayerChange, LayerProperties};

    #[test]
    fn setters_report_only_real_changes() {
        let mut p = LayerProperties::default();
        assert_eq!(p.set_visible(true), None);
        assert_eq!(p.set_visible(false), Some(LayerChange::Visible(false)));
        assert_eq!(p.set_opacity(3.0), None);
        assert_eq!(
            p.set_opacity(0.25),
            Some(LayerChange::Opacity { from: 1.0, to: 0.25 })
        );
        assert_eq!(p.set_frozen(true), Some(LayerChange::Frozen(true)));
        assert_eq!(p.set_frozen(true), None);
        assert!(!p.visible() && p.frozen());
    }

    #[test]
    fn properties_load_from_partial_json() {
        let p: LayerProperties = serde_json::from_str(r#"{ "opacity": 0.5 }"#).expect("parse");
        assert!(p.visible());
        assert_eq!(p.opacity(), 0.5);
    }
}

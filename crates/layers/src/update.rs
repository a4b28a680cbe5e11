//! The per-tile refinement cycle shared by color and elevation layers.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use foundation::ids::{LayerId, TileId};
use gpu::material::{SlotKind, TextureInfo};
use gpu::textures::TexturePitch;
use scene::tree::TileTree;
use streaming::command::{Command, CommandError, CommandOutcome, CommandReceiver, DownloadTarget, LayerSource};
use streaming::provider::{Improvement, ImprovementQuery, Provider, ProviderError};
use streaming::scheduler::Scheduler;
use streaming::update_state::{FailureParams, RetryPolicy};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, warn};

use crate::layer::{LayerError, LayerProperties, UpdateContext, UpdateOutcome};

/// Texture for `tile` borrowed from the nearest ancestor that owns one.
///
/// Ancestors that themselves inherit are skipped so offsets never compound
/// across several hops.
pub fn inherited_texture(tree: &TileTree, tile: TileId, layer: LayerId) -> Option<TexturePitch> {
    let extent = tree.get(tile)?.extent;
    for ancestor_id in tree.ancestors(tile) {
        let Some(ancestor) = tree.get(ancestor_id) else {
            continue;
        };
        if !ancestor.material.owns_texture(layer) {
            continue;
        }
        let owned = ancestor.material.layer_texture(layer)?;
        let pitch = owned.pitch.compose(extent.offset_to_parent(&ancestor.extent));
        return Some(TexturePitch::new(owned.texture, pitch));
    }
    None
}

struct PendingFetch {
    tile: TileId,
    level: u8,
    receiver: CommandReceiver,
}

pub(crate) struct Settled {
    pub tile: TileId,
    pub level: u8,
    pub outcome: CommandOutcome,
}

/// Layer state common to every layer kind: its source, provider, knobs and
/// the commands it is waiting on.
pub(crate) struct LayerDriver {
    pub source: Arc<LayerSource>,
    pub properties: LayerProperties,
    pub retry: RetryPolicy,
    provider: Rc<dyn Provider>,
    kind: SlotKind,
    pending: Vec<PendingFetch>,
    /// Cleared on detach so commands still queued are dropped unstarted.
    attached: Arc<AtomicBool>,
}

impl LayerDriver {
    pub fn new(source: LayerSource, kind: SlotKind, scheduler: &mut Scheduler) -> Result<Self, LayerError> {
        let source = Arc::new(source);
        let provider = scheduler.attach_layer(&source)?;
        Ok(Self {
            source,
            properties: LayerProperties::default(),
            retry: RetryPolicy::default(),
            provider,
            kind,
            pending: Vec::new(),
            attached: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn id(&self) -> LayerId {
        self.source.id
    }

    pub fn pending_fetches(&self) -> usize {
        self.pending.len()
    }

    /// One refinement step. `setup` configures the material slot the first
    /// time the tile meets this layer.
    pub fn update(
        &mut self,
        ctx: &mut UpdateContext<'_>,
        tile_id: TileId,
        setup: impl FnOnce(&mut TextureInfo),
    ) -> Result<UpdateOutcome, LayerError> {
        let layer = self.id();
        let provider = self.provider.clone();
        let texture_source = provider.texture_source();

        let Some(tile) = ctx.tree.get(tile_id) else {
            return Ok(UpdateOutcome::Skipped);
        };
        let first_visit = !tile.material.has_layer(layer);
        let needs_placeholder = tile.material.layer_texture(layer).is_none();
        let descriptor = tile.descriptor();
        let placeholder = if needs_placeholder {
            inherited_texture(ctx.tree, tile_id, layer)
        } else {
            None
        };

        let Some(tile) = ctx.tree.get_mut(tile_id) else {
            return Ok(UpdateOutcome::Skipped);
        };
        if first_visit {
            let extent = tile.extent;
            setup(tile.material.push_layer(layer, self.kind, extent));
            tile.layer_state_mut(layer, self.retry);
        }
        let inherited = placeholder.is_some();
        if let Some(texture) = placeholder {
            tile.material.set_layer_textures(layer, texture, true)?;
        }
        if first_visit {
            let inside = texture_source.is_none_or(|ts| ts.tile_inside_limit(&descriptor, &self.source));
            if !inside {
                tile.layer_state_mut(layer, self.retry).no_more_update_possible();
                debug!(layer = %layer, tile = %tile_id, inherited, "tile outside layer coverage");
                return Ok(if inherited {
                    UpdateOutcome::Inherited
                } else {
                    UpdateOutcome::Terminal
                });
            }
        }

        tile.material.set_layer_visibility(layer, self.properties.visible())?;
        tile.material.set_layer_opacity(layer, self.properties.opacity())?;
        if !tile.visible || self.properties.frozen() || !self.properties.visible() {
            return Ok(UpdateOutcome::Skipped);
        }

        let state = tile.layer_state_mut(layer, self.retry);
        if state.has_finished() {
            return Ok(UpdateOutcome::Terminal);
        }
        if !state.can_try_update(ctx.now) {
            return Ok(UpdateOutcome::Waiting);
        }
        let failure: FailureParams = *state.failure_params();

        let owns = tile.material.owns_texture(layer);
        let improvement = match texture_source {
            Some(ts) => {
                let current = tile.material.layer_texture(layer);
                ts.possible_texture_improvements(
                    &self.source,
                    &ImprovementQuery {
                        tile: descriptor,
                        current: current.as_ref(),
                        current_level: owns.then_some(descriptor.coord.z),
                        failure: &failure,
                    },
                )
            }
            None if owns => Improvement::AlreadyOptimal,
            None => Improvement::Available(DownloadTarget::new(descriptor.coord, descriptor.extent)),
        };

        let target = match improvement {
            Improvement::Unavailable => {
                tile.layer_state_mut(layer, self.retry).no_more_update_possible();
                return Ok(UpdateOutcome::Terminal);
            }
            Improvement::NotYetAvailable => return Ok(UpdateOutcome::Waiting),
            Improvement::AlreadyOptimal => return Ok(UpdateOutcome::UpToDate),
            Improvement::Available(target) => target,
        };

        if let Some(ts) = texture_source {
            let count = ts.tile_texture_count(&descriptor, &self.source);
            tile.material.set_layer_texture_count(layer, count)?;
        }
        let level = target.coord.z;
        let alive = tile.alive_flag();
        let attached = self.attached.clone();
        let command = Command::new(ctx.view.clone(), self.source.clone(), tile_id, target)
            .with_priority(tile.priority)
            .with_early_drop(move |_| !alive.load(Ordering::Acquire) || !attached.load(Ordering::Acquire));
        let receiver = ctx.scheduler.execute(command)?;
        tile.layer_state_mut(layer, self.retry).new_try(ctx.now, None);
        self.pending.push(PendingFetch {
            tile: tile_id,
            level,
            receiver,
        });
        Ok(UpdateOutcome::Requested)
    }

    /// Takes the outcomes that settled since the last call.
    pub fn drain_settled(&mut self) -> Vec<Settled> {
        let mut settled = Vec::new();
        self.pending.retain_mut(|fetch| {
            let outcome = match fetch.receiver.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Closed) => Err(CommandError::Abandoned),
            };
            settled.push(Settled {
                tile: fetch.tile,
                level: fetch.level,
                outcome,
            });
            false
        });
        settled
    }

    /// Success and cancellation both leave the tile ready for its next try.
    pub fn record_success(&self, ctx: &mut UpdateContext<'_>, tile: TileId) {
        if let Some(tile) = ctx.tree.get_mut(tile) {
            tile.layer_state_mut(self.id(), self.retry).success();
        }
    }

    /// Books a failed attempt and, unless it was the last one, asks the view
    /// to revisit the tile once the backoff expires.
    pub fn record_failure(
        &self,
        ctx: &mut UpdateContext<'_>,
        tile_id: TileId,
        level: u8,
        error: &dyn std::fmt::Display,
        definitive: bool,
    ) {
        let layer = self.id();
        warn!(layer = %layer, tile = %tile_id, error = %error, "tile update failed");
        let Some(tile) = ctx.tree.get_mut(tile_id) else {
            return;
        };
        let state = tile.layer_state_mut(layer, self.retry);
        if state.failure(ctx.now, definitive, Some(FailureParams::at_level(level))) {
            debug!(layer = %layer, tile = %tile_id, errors = state.error_count(), "giving up on tile");
            return;
        }
        let due = ctx.now.add_secs_f64(state.seconds_until_next_try());
        ctx.view.notify_change_at(due, tile_id, false);
    }

    pub fn detach(&mut self, tree: &mut TileTree) {
        let layer = self.id();
        for tile in tree.iter_mut() {
            tile.material.remove_layer(layer);
            tile.layer_states.remove(&layer);
        }
        self.pending.clear();
        self.attached.store(false, Ordering::Release);
        self.attached = Arc::new(AtomicBool::new(true));
    }
}

/// Provider failures no retry can fix.
pub(crate) fn is_definitive(error: &CommandError) -> bool {
    matches!(error, CommandError::Provider(ProviderError::Unsupported(_)))
}

#[cfg(test)]
mod tests {
    use super::inherited_texture;
    use foundation::extent::{Extent, TileCoord};
    use foundation::ids::LayerId;
    use foundation::pitch::Pitch;
    use gpu::material::SlotKind;
    use gpu::textures::{TexelData, Texture, TexturePitch};
    use scene::tree::TileTree;

    #[test]
    fn inherits_from_nearest_owning_ancestor() {
        let layer = LayerId(1);
        let mut tree = TileTree::default();
        let root = tree.add_root(TileCoord::new(0, 0, 0), Extent::new(0.0, 0.0, 4.0, 4.0));
        let l1 = tree.subdivide(root).expect("l1");
        let l2 = tree.subdivide(l1[3]).expect("l2");

        let texture = Texture::shared(8, 8, TexelData::Unavailable);
        {
            let r = tree.get_mut(root).expect("root");
            r.material.push_layer(layer, SlotKind::Color, r.extent);
            r.material
                .set_layer_textures(layer, TexturePitch::whole(texture.clone()), false)
                .expect("set");
        }
        // The intermediate tile only inherits, so it must be skipped.
        {
            let mid = tree.get_mut(l1[3]).expect("mid");
            mid.material.push_layer(layer, SlotKind::Color, mid.extent);
            let placeholder = TexturePitch::new(texture.clone(), Pitch::new(0.5, 0.5, 0.5, 0.5));
            mid.material.set_layer_textures(layer, placeholder, true).expect("set");
        }

        // SE quadrant of the SE quadrant: last sixteenth of the root texture.
        let got = inherited_texture(&tree, l2[3], layer).expect("inherited");
        assert_eq!(got.texture.id, texture.id);
        assert_eq!(got.pitch, Pitch::new(0.75, 0.75, 0.25, 0.25));

        assert!(inherited_texture(&tree, root, layer).is_none());
        assert!(inherited_texture(&tree, l2[0], LayerId(2)).is_none());
    }
}

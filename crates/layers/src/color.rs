use std::sync::Arc;

use foundation::ids::{LayerId, TileId};
use gpu::material::SlotKind;
use scene::tree::TileTree;
use streaming::command::{CommandResult, LayerSource};
use streaming::scheduler::Scheduler;
use streaming::update_state::RetryPolicy;

use crate::layer::{Layer, LayerError, LayerProperties, ProcessReport, UpdateContext, UpdateOutcome};
use crate::update::{LayerDriver, is_definitive};

/// Imagery drawn into the tile's color atlas.
pub struct ColorLayer {
    driver: LayerDriver,
    tint: Option<[f32; 3]>,
    elevation_range: Option<(f32, f32)>,
}

impl ColorLayer {
    pub fn new(source: LayerSource, scheduler: &mut Scheduler) -> Result<Self, LayerError> {
        Ok(Self {
            driver: LayerDriver::new(source, SlotKind::Color, scheduler)?,
            tint: None,
            elevation_range: None,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.driver.retry = retry;
        self
    }

    pub fn with_properties(mut self, properties: LayerProperties) -> Self {
        self.driver.properties = properties;
        self
    }

    pub fn with_tint(mut self, tint: [f32; 3]) -> Self {
        self.tint = Some(tint);
        self
    }

    /// Only draw where the terrain lies inside `[min, max]`.
    pub fn with_elevation_range(mut self, min: f32, max: f32) -> Self {
        self.elevation_range = Some((min.min(max), max.max(min)));
        self
    }
}

impl Layer for ColorLayer {
    fn id(&self) -> LayerId {
        self.driver.id()
    }

    fn source(&self) -> &Arc<LayerSource> {
        &self.driver.source
    }

    fn properties(&self) -> &LayerProperties {
        &self.driver.properties
    }

    fn properties_mut(&mut self) -> &mut LayerProperties {
        &mut self.driver.properties
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>, tile: TileId) -> Result<UpdateOutcome, LayerError> {
        let (tint, range) = (self.tint, self.elevation_range);
        self.driver.update(ctx, tile, |slot| {
            slot.tint = tint;
            slot.elevation_range = range;
        })
    }

    fn process_results(&mut self, ctx: &mut UpdateContext<'_>) -> Result<ProcessReport, LayerError> {
        let layer = self.id();
        let mut report = ProcessReport::default();
        for settled in self.driver.drain_settled() {
            match settled.outcome {
                Ok(CommandResult::Texture(texture)) => {
                    if let Some(tile) = ctx.tree.get_mut(settled.tile)
                        && tile.material.has_layer(layer)
                    {
                        tile.material.set_layer_textures(layer, texture, false)?;
                    }
                    self.driver.record_success(ctx, settled.tile);
                    report.applied += 1;
                }
                Ok(CommandResult::Samples { .. }) => {
                    self.driver.record_failure(
                        ctx,
                        settled.tile,
                        settled.level,
                        &"sample grid where a texture was expected",
                        true,
                    );
                    report.failed += 1;
                }
                Err(err) if err.is_cancellation() => {
                    self.driver.record_success(ctx, settled.tile);
                    report.cancelled += 1;
                }
                Err(err) => {
                    let definitive = is_definitive(&err);
                    self.driver
                        .record_failure(ctx, settled.tile, settled.level, &err, definitive);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn pending_fetches(&self) -> usize {
        self.driver.pending_fetches()
    }

    fn detach(&mut self, tree: &mut TileTree) {
        self.driver.detach(tree);
    }
}

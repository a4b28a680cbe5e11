use std::sync::Arc;

use foundation::ids::{LayerId, TileId};
use gpu::material::SlotKind;
use gpu::textures::{TexelData, Texture, TexturePitch};
use scene::tree::TileTree;
use streaming::command::{CommandResult, LayerSource};
use streaming::scheduler::Scheduler;
use streaming::update_state::RetryPolicy;
use tracing::debug;

use crate::colormap::ColorMap;
use crate::interpretation::{DecodeError, ElevationEncoding, decode};
use crate::layer::{Layer, LayerError, LayerProperties, ProcessReport, UpdateContext, UpdateOutcome};
use crate::update::{LayerDriver, is_definitive};

/// Terrain heights feeding the tile's elevation slot and bounding volumes.
///
/// Each decoded tile gets its own Z range. The layer also keeps the union
/// of everything decoded so far; tiles without their own data are given
/// that range so culling never clips terrain it has not seen yet.
pub struct ElevationLayer {
    driver: LayerDriver,
    encoding: ElevationEncoding,
    no_data: Option<f32>,
    range: Option<(f32, f32)>,
    colormap: Option<ColorMap>,
}

impl ElevationLayer {
    pub fn new(source: LayerSource, encoding: ElevationEncoding, scheduler: &mut Scheduler) -> Result<Self, LayerError> {
        Ok(Self {
            driver: LayerDriver::new(source, SlotKind::Elevation, scheduler)?,
            encoding,
            no_data: None,
            range: None,
            colormap: None,
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

    /// Samples equal to `value` are ignored when computing min/max.
    pub fn with_no_data(mut self, value: f32) -> Self {
        self.no_data = Some(value);
        self
    }

    pub fn with_colormap(mut self, colormap: ColorMap) -> Self {
        self.colormap = Some(colormap);
        self
    }

    pub fn encoding(&self) -> &ElevationEncoding {
        &self.encoding
    }

    /// Union of every tile range decoded so far.
    pub fn elevation_range(&self) -> Option<(f32, f32)> {
        self.range
    }

    /// Color of `elevation` on the layer's color map.
    pub fn color_at(&self, elevation: f32) -> Option<[u8; 4]> {
        self.colormap.as_ref().map(|m| m.sample(elevation))
    }

    fn widen_range(&mut self, tree: &mut TileTree, min: f32, max: f32) {
        let widened = match self.range {
            Some((lo, hi)) => (lo.min(min), hi.max(max)),
            None => (min, max),
        };
        if self.range == Some(widened) {
            return;
        }
        self.range = Some(widened);
        if let Some(map) = self.colormap.take() {
            self.colormap = Some(map.with_range(widened.0, widened.1));
        }
        let changed = tree.apply_elevation_range(widened.0 as f64, widened.1 as f64);
        debug!(
            layer = %self.id(),
            min = widened.0,
            max = widened.1,
            tiles = changed,
            "elevation range widened"
        );
    }
}

impl Layer for ElevationLayer {
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
        let outcome = self.driver.update(ctx, tile, |_| {})?;
        if let Some((min, max)) = self.range
            && let Some(node) = ctx.tree.get_mut(tile)
            && !node.has_own_elevation()
        {
            node.bbox.set_z_range(min as f64, max as f64);
        }
        Ok(outcome)
    }

    fn process_results(&mut self, ctx: &mut UpdateContext<'_>) -> Result<ProcessReport, LayerError> {
        let layer = self.id();
        let mut report = ProcessReport::default();
        let mut first_error = None;

        for settled in self.driver.drain_settled() {
            let result = match settled.outcome {
                Ok(result) => result,
                Err(err) if err.is_cancellation() => {
                    self.driver.record_success(ctx, settled.tile);
                    report.cancelled += 1;
                    continue;
                }
                Err(err) => {
                    let definitive = is_definitive(&err);
                    self.driver
                        .record_failure(ctx, settled.tile, settled.level, &err, definitive);
                    report.failed += 1;
                    continue;
                }
            };

            let grid = match decode(&self.encoding, &result) {
                Ok(grid) => grid,
                Err(source) => {
                    // A short grid may be a truncated transfer; a wrong format never heals.
                    let definitive = matches!(source, DecodeError::UnsupportedFormat { .. });
                    self.driver
                        .record_failure(ctx, settled.tile, settled.level, &source, definitive);
                    report.failed += 1;
                    if definitive {
                        first_error.get_or_insert((settled.tile, source));
                    }
                    continue;
                }
            };
            let texture = match result {
                CommandResult::Texture(texture) => texture,
                CommandResult::Samples { grid, pitch } => TexturePitch::new(
                    Texture::shared(grid.width, grid.height, TexelData::F32(grid.values)),
                    pitch,
                ),
            };
            let min_max = grid.and_then(|g| g.min_max(texture.pitch, self.no_data));

            if let Some(tile) = ctx.tree.get_mut(settled.tile)
                && tile.material.has_layer(layer)
            {
                tile.material.set_layer_textures(layer, texture, false)?;
                if let Some((min, max)) = min_max {
                    tile.set_own_elevation(min as f64, max as f64);
                }
            }
            if let Some((min, max)) = min_max {
                self.widen_range(ctx.tree, min, max);
            }
            self.driver.record_success(ctx, settled.tile);
            report.applied += 1;
        }

        match first_error {
            Some((tile, source)) => Err(LayerError::Decode { tile, source, report }),
            None => Ok(report),
        }
    }

    fn pending_fetches(&self) -> usize {
        self.driver.pending_fetches()
    }

    fn detach(&mut self, tree: &mut TileTree) {
        self.driver.detach(tree);
    }
}

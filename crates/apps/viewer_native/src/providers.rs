//! Synthetic data sources so the viewer runs without a network.

use std::sync::Arc;
use std::task::Poll;

use foundation::extent::{Extent, TileCoord};
use foundation::pitch::Pitch;
use futures_util::future::{poll_fn, ready};
use gpu::textures::{TexelData, Texture, TexturePitch};
use streaming::cache::Cache;
use streaming::command::{Command, CommandResult, DownloadTarget, LayerSource, SampleGrid};
use streaming::provider::{
    FetchFuture, Improvement, ImprovementQuery, Provider, ProviderContext, ProviderError, TextureSource,
    TileDescriptor, resource_key,
};

/// Resolves after `polls` pending polls and stores successes in the cache.
fn delayed(
    polls: u32,
    cache: Arc<Cache<CommandResult>>,
    key: String,
    result: Result<CommandResult, ProviderError>,
) -> FetchFuture {
    let mut remaining = polls;
    let mut result = Some(result);
    Box::pin(poll_fn(move |_| {
        if remaining > 0 {
            remaining -= 1;
            return Poll::Pending;
        }
        match result.take() {
            Some(Ok(value)) => {
                cache.insert(key.clone(), value.clone());
                Poll::Ready(Ok(value))
            }
            Some(Err(err)) => Poll::Ready(Err(err)),
            None => Poll::Pending,
        }
    }))
}

/// 4x4 RGBA tiles colored by their coordinate.
pub struct CheckerImagery {
    latency_polls: u32,
    fail_every: Option<u32>,
}

impl CheckerImagery {
    pub fn new(latency_polls: u32) -> Self {
        Self {
            latency_polls,
            fail_every: None,
        }
    }

    /// Every n-th column answers with HTTP 503.
    pub fn failing_every(mut self, n: u32) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    fn texture(coord: TileCoord) -> CommandResult {
        let r = (coord.x.wrapping_mul(64) % 256) as u8;
        let g = (coord.y.wrapping_mul(64) % 256) as u8;
        let b = coord.z.wrapping_mul(40);
        let mut texels = Vec::with_capacity(4 * 4 * 4);
        for i in 0..16u8 {
            let dark = (i / 4 + i % 4) % 2 == 0;
            let shade = if dark { 2 } else { 1 };
            texels.extend_from_slice(&[r / shade, g / shade, b / shade, 255]);
        }
        CommandResult::Texture(TexturePitch::whole(Texture::shared(4, 4, TexelData::Rgba8(texels))))
    }
}

impl Provider for CheckerImagery {
    fn preprocess_data_layer(&self, layer: &LayerSource) -> Result<(), ProviderError> {
        match layer.url {
            Some(_) => Ok(()),
            None => Err(ProviderError::Unsupported(
                "checker imagery needs a url template".into(),
            )),
        }
    }

    fn execute_command(&self, command: &Command, ctx: &ProviderContext) -> FetchFuture {
        let coord = command.to_download.coord;
        let key = resource_key(command.layer.id, coord);
        if let Some(hit) = ctx.cache.get(&key) {
            return Box::pin(ready(Ok(hit)));
        }
        let result = match self.fail_every {
            Some(n) if coord.x % n == 0 && coord.z > 0 => Err(ProviderError::Network {
                status: Some(503),
                message: "service unavailable".into(),
            }),
            _ => Ok(Self::texture(coord)),
        };
        delayed(self.latency_polls, ctx.cache.clone(), key, result)
    }

    fn is_resident(&self, command: &Command, ctx: &ProviderContext) -> bool {
        ctx.cache
            .contains(&resource_key(command.layer.id, command.to_download.coord))
    }
}

/// Numeric height grids of an analytic surface, available down to
/// `max_level`.
pub struct SyntheticTerrain {
    latency_polls: u32,
    max_level: u8,
    size: u32,
}

impl SyntheticTerrain {
    pub fn new(latency_polls: u32, max_level: u8) -> Self {
        Self {
            latency_polls,
            max_level,
            size: 8,
        }
    }

    fn height(lon: f64, lat: f64) -> f32 {
        (2000.0 * (lon.to_radians() * 3.0).sin() * (lat.to_radians() * 2.0).cos() + 500.0) as f32
    }

    fn grid(&self, extent: &Extent) -> SampleGrid {
        let n = self.size;
        let mut values = Vec::with_capacity((n * n) as usize);
        for row in 0..n {
            let lat = extent.north - (row as f64 + 0.5) / n as f64 * extent.height();
            for col in 0..n {
                let lon = extent.west + (col as f64 + 0.5) / n as f64 * extent.width();
                values.push(Self::height(lon, lat));
            }
        }
        SampleGrid {
            width: n,
            height: n,
            values,
        }
    }
}

impl Provider for SyntheticTerrain {
    fn preprocess_data_layer(&self, _layer: &LayerSource) -> Result<(), ProviderError> {
        Ok(())
    }

    fn execute_command(&self, command: &Command, ctx: &ProviderContext) -> FetchFuture {
        let target = &command.to_download;
        let key = resource_key(command.layer.id, target.coord);
        if let Some(hit) = ctx.cache.get(&key) {
            return Box::pin(ready(Ok(hit)));
        }
        let result = CommandResult::Samples {
            grid: self.grid(&target.extent),
            pitch: target.pitch,
        };
        delayed(self.latency_polls, ctx.cache.clone(), key, Ok(result))
    }

    fn is_resident(&self, command: &Command, ctx: &ProviderContext) -> bool {
        ctx.cache
            .contains(&resource_key(command.layer.id, command.to_download.coord))
    }

    fn texture_source(&self) -> Option<&dyn TextureSource> {
        Some(self)
    }
}

impl TextureSource for SyntheticTerrain {
    fn tile_inside_limit(&self, _tile: &TileDescriptor, _layer: &LayerSource) -> bool {
        true
    }

    /// Below `max_level` the deepest available ancestor grid is fetched and
    /// cropped to the tile.
    fn possible_texture_improvements(&self, _layer: &LayerSource, query: &ImprovementQuery<'_>) -> Improvement {
        let tile = &query.tile;
        let level = tile.coord.z.min(self.max_level);
        if query.current_level.is_some_and(|current| current >= level) {
            return Improvement::AlreadyOptimal;
        }
        if query.failure.lowest_level_error.is_some_and(|failed| failed <= level) {
            return Improvement::Unavailable;
        }

        let mut coord = tile.coord;
        let mut extent = tile.extent;
        let mut pitch = Pitch::IDENTITY;
        while coord.z > level {
            let Some(parent) = coord.parent() else {
                break;
            };
            let parent_extent = parent_extent(&extent, coord);
            pitch = extent.offset_to_parent(&parent_extent).compose(pitch);
            coord = parent;
            extent = parent_extent;
        }
        let mut target = DownloadTarget::new(coord, extent);
        target.pitch = pitch;
        Improvement::Available(target)
    }
}

/// Extent of the parent of `coord`, given the child's own extent.
fn parent_extent(extent: &Extent, coord: TileCoord) -> Extent {
    let (w, h) = (extent.width(), extent.height());
    let west = if coord.x % 2 == 0 { extent.west } else { extent.west - w };
    let north = if coord.y % 2 == 0 { extent.north } else { extent.north + h };
    Extent::new(west, north - 2.0 * h, west + 2.0 * w, north)
}

//! The contract between the scheduler and protocol-specific fetchers.
//!
//! A provider turns a [`Command`] into a future that resolves to a
//! texture-like [`CommandResult`]. Providers that know the layout of their
//! data source also expose a [`TextureSource`], which layers consult to
//! decide what (if anything) is worth downloading for a tile.

use std::sync::Arc;

use foundation::extent::{Extent, TileCoord};
use foundation::ids::{LayerId, TileId};
use foundation::time::Clock;
use futures_util::future::LocalBoxFuture;
use gpu::textures::TexturePitch;

use crate::cache::Cache;
use crate::command::{Command, CommandResult, DownloadTarget, LayerSource};
use crate::update_state::FailureParams;

pub type FetchFuture = LocalBoxFuture<'static, Result<CommandResult, ProviderError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    Network { status: Option<u16>, message: String },
    Decode(String),
    NotFound,
    Unsupported(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Network {
                status: Some(status),
                message,
            } => write!(f, "network error (HTTP {status}): {message}"),
            ProviderError::Network {
                status: None,
                message,
            } => write!(f, "network error: {message}"),
            ProviderError::Decode(msg) => write!(f, "decode error: {msg}"),
            ProviderError::NotFound => write!(f, "resource not found"),
            ProviderError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Shared services handed to every provider call.
#[derive(Clone)]
pub struct ProviderContext {
    pub cache: Arc<Cache<CommandResult>>,
    pub clock: Arc<dyn Clock>,
}

impl ProviderContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Arc::new(Cache::with_clock(clock.clone())),
            clock,
        }
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Cache key for a layer resource at a tile coordinate.
pub fn resource_key(layer: LayerId, coord: TileCoord) -> String {
    format!("{}/{}/{}/{}", layer.0, coord.z, coord.x, coord.y)
}

pub trait Provider {
    /// One-time setup when a layer using this provider is attached.
    fn preprocess_data_layer(&self, layer: &LayerSource) -> Result<(), ProviderError>;

    /// Starts the fetch/decode for `command`.
    fn execute_command(&self, command: &Command, ctx: &ProviderContext) -> FetchFuture;

    /// True if `command` can be served without I/O (cache hit or already
    /// loaded). Resident commands skip the priority queue.
    fn is_resident(&self, _command: &Command, _ctx: &ProviderContext) -> bool {
        false
    }

    fn texture_source(&self) -> Option<&dyn TextureSource> {
        None
    }
}

/// Tile facts a texture source may look at.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TileDescriptor {
    pub id: TileId,
    pub coord: TileCoord,
    pub extent: Extent,
}

/// Answer to "can this tile get a better texture than the one it holds?".
#[derive(Debug, Clone, PartialEq)]
pub enum Improvement {
    /// The source can never serve this tile.
    Unavailable,
    /// Nothing to fetch right now; ask again later.
    NotYetAvailable,
    /// The current texture is already the best one.
    AlreadyOptimal,
    Available(DownloadTarget),
}

#[derive(Debug, Clone)]
pub struct ImprovementQuery<'a> {
    pub tile: TileDescriptor,
    pub current: Option<&'a TexturePitch>,
    /// Zoom level the current texture was fetched at, when the tile owns it.
    pub current_level: Option<u8>,
    pub failure: &'a FailureParams,
}

/// Optional provider capability describing data coverage.
pub trait TextureSource {
    fn tile_inside_limit(&self, tile: &TileDescriptor, layer: &LayerSource) -> bool;

    fn possible_texture_improvements(
        &self,
        layer: &LayerSource,
        query: &ImprovementQuery<'_>,
    ) -> Improvement;

    fn tile_texture_count(&self, _tile: &TileDescriptor, _layer: &LayerSource) -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::{ProviderError, resource_key};
    use foundation::extent::TileCoord;
    use foundation::ids::LayerId;

    #[test]
    fn resource_keys_share_layer_prefix() {
        let key = resource_key(LayerId(3), TileCoord::new(4, 5, 6));
        assert_eq!(key, "3/4/5/6");
        assert!(key.starts_with("3/"));
    }

    #[test]
    fn network_errors_mention_status() {
        let err = ProviderError::Network {
            status: Some(503),
            message: "busy".into(),
        };
        assert_eq!(err.to_string(), "network error (HTTP 503): busy");
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use foundation::bounds::Aabb3;
use foundation::extent::{Extent, TileCoord};
use foundation::ids::{LayerId, TileId};
use gpu::material::LayeredMaterial;
use streaming::provider::TileDescriptor;
use streaming::update_state::{LayerUpdateState, RetryPolicy};

/// One tile of the quadtree.
///
/// A tile carries everything the layer update cycle touches: its material,
/// one retry state per attached layer and a bounding volume whose Z range
/// follows the elevation data.
#[derive(Debug)]
pub struct TileNode {
    pub id: TileId,
    pub coord: TileCoord,
    pub extent: Extent,
    pub parent: Option<TileId>,
    pub children: Vec<TileId>,
    pub material: LayeredMaterial,
    pub layer_states: BTreeMap<LayerId, LayerUpdateState>,
    /// Culling result for the current frame.
    pub visible: bool,
    /// Refinement urgency (e.g. screen-space error); larger first.
    pub priority: i32,
    pub bbox: Aabb3,
    own_elevation: bool,
    alive: Arc<AtomicBool>,
}

impl TileNode {
    pub(crate) fn new(
        id: TileId,
        coord: TileCoord,
        extent: Extent,
        parent: Option<TileId>,
        max_atlas_size: u32,
    ) -> Self {
        Self {
            id,
            coord,
            extent,
            parent,
            children: Vec::new(),
            material: LayeredMaterial::new(max_atlas_size),
            layer_states: BTreeMap::new(),
            visible: true,
            priority: 0,
            bbox: Aabb3::from_footprint(extent.footprint()),
            own_elevation: false,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn level(&self) -> u8 {
        self.coord.z
    }

    pub fn descriptor(&self) -> TileDescriptor {
        TileDescriptor {
            id: self.id,
            coord: self.coord,
            extent: self.extent,
        }
    }

    /// Shared flag cleared when the tile leaves the tree. Commands capture it
    /// in their early-drop predicate.
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn layer_state(&self, layer: LayerId) -> Option<&LayerUpdateState> {
        self.layer_states.get(&layer)
    }

    /// State of `layer` on this tile, created on first visit.
    pub fn layer_state_mut(&mut self, layer: LayerId, policy: RetryPolicy) -> &mut LayerUpdateState {
        self.layer_states
            .entry(layer)
            .or_insert_with(|| LayerUpdateState::new(policy))
    }

    pub fn has_own_elevation(&self) -> bool {
        self.own_elevation
    }

    /// Records elevation decoded for this very tile. Its Z range no longer
    /// follows the layer-wide range.
    pub fn set_own_elevation(&mut self, min: f64, max: f64) {
        self.own_elevation = true;
        self.bbox.set_z_range(min, max);
    }
}

use foundation::extent::{Extent, TileCoord};
use foundation::ids::TileId;
use gpu::material::DEFAULT_MAX_ATLAS_SIZE;

use crate::node::TileNode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    UnknownTile(TileId),
    MaxDepth(TileId),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::UnknownTile(id) => write!(f, "unknown {id}"),
            TreeError::MaxDepth(id) => write!(f, "{id} is at the deepest level"),
        }
    }
}

impl std::error::Error for TreeError {}

/// Slot storage for the tile quadtree.
///
/// Ordering contract:
/// - Tile ids are slot indices and are never reused, so iteration in
///   ascending id order is creation order.
#[derive(Debug)]
pub struct TileTree {
    slots: Vec<Option<TileNode>>,
    roots: Vec<TileId>,
    max_atlas_size: u32,
}

impl Default for TileTree {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATLAS_SIZE)
    }
}

impl TileTree {
    pub fn new(max_atlas_size: u32) -> Self {
        Self {
            slots: Vec::new(),
            roots: Vec::new(),
            max_atlas_size,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn roots(&self) -> &[TileId] {
        &self.roots
    }

    pub fn add_root(&mut self, coord: TileCoord, extent: Extent) -> TileId {
        let id = self.insert(coord, extent, None);
        self.roots.push(id);
        id
    }

    /// Splits `id` into its four quadrants (NW, NE, SW, SE). Subdividing a
    /// tile that already has children returns the existing ones.
    pub fn subdivide(&mut self, id: TileId) -> Result<[TileId; 4], TreeError> {
        let tile = self.get(id).ok_or(TreeError::UnknownTile(id))?;
        if let [a, b, c, d] = tile.children[..] {
            return Ok([a, b, c, d]);
        }
        if tile.coord.z > TileCoord::MAX_SPLIT_LEVEL {
            return Err(TreeError::MaxDepth(id));
        }
        let coords = tile.coord.children();
        let extents = tile.extent.quadrants();

        let mut ids = [TileId(0); 4];
        for (slot, (coord, extent)) in ids.iter_mut().zip(coords.into_iter().zip(extents)) {
            *slot = self.insert(coord, extent, Some(id));
        }
        if let Some(parent) = self.get_mut(id) {
            parent.children = ids.to_vec();
        }
        Ok(ids)
    }

    pub fn get(&self, id: TileId) -> Option<&TileNode> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: TileId) -> Option<&mut TileNode> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: TileId) -> bool {
        self.get(id).is_some()
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: TileId) -> Vec<TileId> {
        let mut out = Vec::new();
        let mut cursor = self.get(id).and_then(|t| t.parent);
        while let Some(parent) = cursor {
            out.push(parent);
            cursor = self.get(parent).and_then(|t| t.parent);
        }
        out
    }

    pub fn ids(&self) -> Vec<TileId> {
        self.iter().map(|t| t.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TileNode> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TileNode> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Removes `id` and all its descendants. Removed tiles are flagged dead,
    /// which lets the scheduler drop their queued commands.
    pub fn remove_subtree(&mut self, id: TileId) -> usize {
        let Some(parent) = self.get(id).map(|t| t.parent) else {
            return 0;
        };
        match parent.and_then(|p| self.get_mut(p)) {
            Some(parent) => parent.children.retain(|c| *c != id),
            None => self.roots.retain(|r| *r != id),
        }

        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(tile) = self.slots.get_mut(next.index()).and_then(Option::take) else {
                continue;
            };
            tile.detach();
            stack.extend(tile.children.iter().copied());
            removed += 1;
        }
        removed
    }

    /// Drops the children of `id`, keeping the tile itself.
    pub fn collapse(&mut self, id: TileId) -> usize {
        let children = self.get(id).map(|t| t.children.clone()).unwrap_or_default();
        children.into_iter().map(|c| self.remove_subtree(c)).sum()
    }

    /// Sets the Z range of every tile that has no elevation of its own.
    /// Returns how many tiles changed.
    pub fn apply_elevation_range(&mut self, min: f64, max: f64) -> usize {
        let mut changed = 0;
        for tile in self.iter_mut() {
            if tile.has_own_elevation() || tile.bbox.z_range() == (min, max) {
                continue;
            }
            tile.bbox.set_z_range(min, max);
            changed += 1;
        }
        changed
    }

    fn insert(&mut self, coord: TileCoord, extent: Extent, parent: Option<TileId>) -> TileId {
        let id = TileId(self.slots.len() as u32);
        self.slots.push(Some(TileNode::new(
            id,
            coord,
            extent,
            parent,
            self.max_atlas_size,
        )));
        id
    }
}

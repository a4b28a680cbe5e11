//! Texture atlas bin packing.
//!
//! Guillotine packer over a binary tree of rectangles: every placement marks
//! a free node as used and splits the leftover space into a `right` node
//! (beside the block) and a `down` node (below it). Packing is incremental:
//! images already placed in a previous atlas keep their rectangle, because
//! tiles hold offsets into it.

use std::collections::BTreeMap;

use foundation::pitch::Pitch;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    rect: Rect,
    used: bool,
    right: Option<usize>,
    down: Option<usize>,
}

impl Node {
    fn free(rect: Rect) -> Self {
        Self {
            rect,
            used: false,
            right: None,
            down: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AtlasImage<K> {
    pub key: K,
    pub width: u32,
    pub height: u32,
}

impl<K> AtlasImage<K> {
    pub fn new(key: K, width: u32, height: u32) -> Self {
        Self { key, width, height }
    }
}

/// Result of a packing pass. Node 0 is the root anchored at (0, 0).
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasInfo<K: Ord> {
    nodes: Vec<Node>,
    fits: BTreeMap<K, Rect>,
    max_x: u32,
    max_y: u32,
    max_size: u32,
}

impl<K: Ord> AtlasInfo<K> {
    fn empty(max_size: u32) -> Self {
        Self {
            nodes: vec![Node::free(Rect::new(0, 0, max_size, max_size))],
            fits: BTreeMap::new(),
            max_x: 0,
            max_y: 0,
            max_size,
        }
    }

    pub fn fit(&self, key: &K) -> Option<Rect> {
        self.fits.get(key).copied()
    }

    pub fn fits(&self) -> impl Iterator<Item = (&K, &Rect)> {
        self.fits.iter()
    }

    pub fn len(&self) -> usize {
        self.fits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fits.is_empty()
    }

    /// Bounding width every placed rectangle fits in.
    pub fn max_x(&self) -> u32 {
        self.max_x
    }

    pub fn max_y(&self) -> u32 {
        self.max_y
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    // First free node large enough, visiting `right` subtrees before `down`.
    fn find_node(&self, w: u32, h: u32) -> Option<usize> {
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.used {
                if let Some(down) = node.down {
                    stack.push(down);
                }
                if let Some(right) = node.right {
                    stack.push(right);
                }
            } else if w <= node.rect.w && h <= node.rect.h {
                return Some(idx);
            }
        }
        None
    }

    fn split_node(&mut self, idx: usize, w: u32, h: u32) -> Rect {
        let r = self.nodes[idx].rect;
        let down = Node::free(Rect::new(r.x, r.y + h, r.w, r.h - h));
        let right = Node::free(Rect::new(r.x + w, r.y, r.w - w, h));

        let down_idx = self.nodes.len();
        self.nodes.push(down);
        let right_idx = self.nodes.len();
        self.nodes.push(right);

        let node = &mut self.nodes[idx];
        node.used = true;
        node.down = Some(down_idx);
        node.right = Some(right_idx);
        Rect::new(r.x, r.y, w, h)
    }
}

/// Packs `images` into an atlas of at most `max_size × max_size`.
///
/// Images whose key is already placed in `previous` are skipped and keep
/// their rectangle. The others are placed largest side first. An image that
/// does not fit gets no entry; the caller has to sample it outside the atlas.
pub fn pack<K: Ord + Clone>(
    max_size: u32,
    images: &[AtlasImage<K>],
    previous: Option<&AtlasInfo<K>>,
) -> AtlasInfo<K> {
    let mut atlas = match previous {
        Some(prev) => prev.clone(),
        None => AtlasInfo::empty(max_size),
    };

    let mut blocks: Vec<&AtlasImage<K>> = images
        .iter()
        .filter(|img| !atlas.fits.contains_key(&img.key))
        .collect();
    blocks.sort_by(|a, b| b.width.max(b.height).cmp(&a.width.max(a.height)));

    for block in blocks {
        let Some(idx) = atlas.find_node(block.width, block.height) else {
            continue;
        };
        let rect = atlas.split_node(idx, block.width, block.height);
        atlas.max_x = atlas.max_x.max(rect.right());
        atlas.max_y = atlas.max_y.max(rect.bottom());
        atlas.fits.insert(block.key.clone(), rect);
    }

    atlas
}

/// Maps an image's own pitch into atlas texture space.
///
/// `rect` is where the image sits in an atlas of `atlas_width × atlas_height`
/// texels. Recompute whenever the atlas grows: normalized offsets shift
/// even though `rect` does not move.
pub fn update_offset_scale(
    rect: Rect,
    atlas_width: u32,
    atlas_height: u32,
    original: Pitch,
) -> Pitch {
    if original.is_degenerate() || atlas_width == 0 || atlas_height == 0 {
        return original;
    }
    let aw = atlas_width as f64;
    let ah = atlas_height as f64;
    let placement = Pitch::new(
        rect.x as f64 / aw,
        rect.y as f64 / ah,
        rect.w as f64 / aw,
        rect.h as f64 / ah,
    );
    placement.compose(original)
}

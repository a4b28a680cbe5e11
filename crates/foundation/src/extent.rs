use crate::bounds::Aabb2;
use crate::pitch::Pitch;

/// Tile coordinate in ZXY scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Deepest level whose children still fit `u32` column/row indices.
    pub const MAX_SPLIT_LEVEL: u8 = 31;

    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    pub fn parent(&self) -> Option<TileCoord> {
        if self.z == 0 {
            return None;
        }
        Some(TileCoord::new(self.z - 1, self.x / 2, self.y / 2))
    }

    /// The four children in reading order (NW, NE, SW, SE).
    ///
    /// Only valid up to [`TileCoord::MAX_SPLIT_LEVEL`].
    pub fn children(&self) -> [TileCoord; 4] {
        let (z, x, y) = (self.z + 1, self.x * 2, self.y * 2);
        [
            TileCoord::new(z, x, y),
            TileCoord::new(z, x + 1, y),
            TileCoord::new(z, x, y + 1),
            TileCoord::new(z, x + 1, y + 1),
        ]
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Geographic rectangle in the layer CRS (`north` is the top edge).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Extent {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Extent {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Whole-world extent in degrees.
    pub fn wgs84() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn intersects(&self, other: &Extent) -> bool {
        self.west < other.east
            && other.west < self.east
            && self.south < other.north
            && other.south < self.north
    }

    pub fn contains(&self, other: &Extent) -> bool {
        self.west <= other.west
            && self.east >= other.east
            && self.south <= other.south
            && self.north >= other.north
    }

    /// Splits into four quadrants in the same order as [`TileCoord::children`].
    pub fn quadrants(&self) -> [Extent; 4] {
        let mx = (self.west + self.east) * 0.5;
        let my = (self.south + self.north) * 0.5;
        [
            Extent::new(self.west, my, mx, self.north),
            Extent::new(mx, my, self.east, self.north),
            Extent::new(self.west, self.south, mx, my),
            Extent::new(mx, self.south, self.east, my),
        ]
    }

    /// Where `self` sits inside `parent`, as a pitch over the parent's
    /// texture space.
    pub fn offset_to_parent(&self, parent: &Extent) -> Pitch {
        let pw = parent.width();
        let ph = parent.height();
        if pw == 0.0 || ph == 0.0 {
            return Pitch::IDENTITY;
        }
        Pitch {
            offset_x: (self.west - parent.west) / pw,
            offset_y: (parent.north - self.north) / ph,
            scale_x: self.width() / pw,
            scale_y: self.height() / ph,
        }
    }

    pub fn footprint(&self) -> Aabb2 {
        Aabb2::new([self.west, self.south], [self.east, self.north])
    }
}

#[cfg(test)]
mod tests {
    use super::{Extent, TileCoord};
    use crate::pitch::Pitch;

    #[test]
    fn quadrant_offsets() {
        let parent = Extent::new(0.0, 0.0, 2.0, 2.0);
        let [nw, ne, sw, se] = parent.quadrants();
        assert_eq!(nw.offset_to_parent(&parent), Pitch::new(0.0, 0.0, 0.5, 0.5));
        assert_eq!(ne.offset_to_parent(&parent), Pitch::new(0.5, 0.0, 0.5, 0.5));
        assert_eq!(sw.offset_to_parent(&parent), Pitch::new(0.0, 0.5, 0.5, 0.5));
        assert_eq!(se.offset_to_parent(&parent), Pitch::new(0.5, 0.5, 0.5, 0.5));
    }

    #[test]
    fn coord_children_round_trip_to_parent() {
        let c = TileCoord::new(3, 5, 2);
        for child in c.children() {
            assert_eq!(child.parent(), Some(c));
        }
        assert_eq!(TileCoord::new(0, 0, 0).parent(), None);
    }

    #[test]
    fn intersection_excludes_touching_edges() {
        let a = Extent::new(0.0, 0.0, 1.0, 1.0);
        let b = Extent::new(1.0, 0.0, 2.0, 1.0);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&Extent::new(0.5, 0.5, 3.0, 3.0)));
        assert!(Extent::wgs84().contains(&a));
    }
}

/// Axis-aligned bounding boxes
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb2 {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb3 {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Aabb2 {
    pub fn new(min: [f64; 2], max: [f64; 2]) -> Self {
        Aabb2 { min, max }
    }
}

impl Aabb3 {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Aabb3 { min, max }
    }

    /// Flat box over a 2D footprint.
    pub fn from_footprint(footprint: Aabb2) -> Self {
        Aabb3 {
            min: [footprint.min[0], footprint.min[1], 0.0],
            max: [footprint.max[0], footprint.max[1], 0.0],
        }
    }

    /// Replaces the vertical extent. Culling depends on it, so it is
    /// always set as a pair.
    pub fn set_z_range(&mut self, min_z: f64, max_z: f64) {
        self.min[2] = min_z.min(max_z);
        self.max[2] = max_z.max(min_z);
    }

    pub fn z_range(&self) -> (f64, f64) {
        (self.min[2], self.max[2])
    }
}

#[cfg(test)]
mod tests {
    use super::{Aabb2, Aabb3};

    #[test]
    fn z_range_is_ordered() {
        let mut b = Aabb3::from_footprint(Aabb2::new([0.0, 0.0], [1.0, 1.0]));
        b.set_z_range(40.0, -3.0);
        assert_eq!(b.z_range(), (-3.0, 40.0));
    }
}

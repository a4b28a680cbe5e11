/// Offset/scale mapping a tile's full extent onto a sub-rectangle of a
/// texture, in normalized texture coordinates (origin top-left).
///
/// A sampler reads texel `offset + uv * scale` for tile-local `uv` in `[0, 1]`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Pitch {
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Pitch {
    pub const IDENTITY: Pitch = Pitch {
        offset_x: 0.0,
        offset_y: 0.0,
        scale_x: 1.0,
        scale_y: 1.0,
    };

    pub const fn new(offset_x: f64, offset_y: f64, scale_x: f64, scale_y: f64) -> Self {
        Self {
            offset_x,
            offset_y,
            scale_x,
            scale_y,
        }
    }

    /// Applies `inner` inside the region described by `self`.
    ///
    /// If `self` maps a parent onto a texture and `inner` maps a child onto
    /// its parent, the result maps the child onto the texture.
    pub fn compose(self, inner: Pitch) -> Pitch {
        Pitch {
            offset_x: self.offset_x + inner.offset_x * self.scale_x,
            offset_y: self.offset_y + inner.offset_y * self.scale_y,
            scale_x: self.scale_x * inner.scale_x,
            scale_y: self.scale_y * inner.scale_y,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.scale_x == 0.0 || self.scale_y == 0.0
    }
}

impl Default for Pitch {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::Pitch;

    #[test]
    fn compose_with_identity_is_noop() {
        let p = Pitch::new(0.25, 0.5, 0.5, 0.25);
        assert_eq!(Pitch::IDENTITY.compose(p), p);
        assert_eq!(p.compose(Pitch::IDENTITY), p);
    }

    #[test]
    fn compose_nests_quadrants() {
        // Lower-right quadrant of the lower-right quadrant.
        let q = Pitch::new(0.5, 0.5, 0.5, 0.5);
        assert_eq!(q.compose(q), Pitch::new(0.75, 0.75, 0.25, 0.25));
    }
}

use serde::{Deserialize, Serialize};

/// Linear color ramp over an elevation interval.
///
/// `colors` are evenly spaced stops from `min` to `max`; values outside the
/// interval clamp to the end stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorMap {
    pub min: f32,
    pub max: f32,
    pub colors: Vec<[u8; 4]>,
}

impl ColorMap {
    pub fn new(min: f32, max: f32, colors: Vec<[u8; 4]>) -> Self {
        Self { min, max, colors }
    }

    /// Blue-green-brown ramp for terrain.
    pub fn terrain(min: f32, max: f32) -> Self {
        Self::new(
            min,
            max,
            vec![
                [24, 70, 160, 255],
                [60, 140, 70, 255],
                [200, 180, 120, 255],
                [120, 80, 50, 255],
                [250, 250, 250, 255],
            ],
        )
    }

    /// Keeps the stops, moves the interval (e.g. when the layer-wide
    /// elevation range grows).
    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn sample(&self, value: f32) -> [u8; 4] {
        match self.colors.len() {
            0 => return [0, 0, 0, 0],
            1 => return self.colors[0],
            _ => {}
        }
        let span = self.max - self.min;
        let t = if span > 0.0 && value.is_finite() {
            ((value - self.min) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let pos = t * (self.colors.len() - 1) as f32;
        let i = (pos.floor() as usize).min(self.colors.len() - 2);
        let f = pos - i as f32;
        let (a, b) = (self.colors[i], self.colors[i + 1]);
        let mut out = [0u8; 4];
        for c in 0..4 {
            out[c] = (a[c] as f32 + (b[c] as f32 - a[c] as f32) * f).round() as u8;
        }
        out
    }

    /// RGBA8 texels for a row-major grid of heights.
    pub fn colorize(&self, values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| self.sample(*v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::ColorMap;
    use pretty_assertions::assert_eq;

    fn ramp() -> ColorMap {
        ColorMap::new(0.0, 100.0, vec![[0, 0, 0, 255], [200, 100, 0, 255]])
    }

    #[test]
    fn samples_interpolate_and_clamp() {
        let map = ramp();
        assert_eq!(map.sample(-5.0), [0, 0, 0, 255]);
        assert_eq!(map.sample(50.0), [100, 50, 0, 255]);
        assert_eq!(map.sample(100.0), [200, 100, 0, 255]);
        assert_eq!(map.sample(1e9), [200, 100, 0, 255]);
        assert_eq!(map.sample(f32::NAN), [0, 0, 0, 255]);
    }

    #[test]
    fn multi_stop_ramp_hits_inner_stops() {
        let map = ColorMap::terrain(0.0, 400.0);
        assert_eq!(map.sample(100.0), [60, 140, 70, 255]);
        assert_eq!(map.sample(400.0), [250, 250, 250, 255]);
    }

    #[test]
    fn colorize_emits_rgba_per_value() {
        let map = ramp().with_range(0.0, 10.0);
        assert_eq!(map.colorize(&[0.0, 10.0]), vec![0, 0, 0, 255, 200, 100, 0, 255]);
    }
}

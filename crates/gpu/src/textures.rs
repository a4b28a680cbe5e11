use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foundation::pitch::Pitch;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureId(pub u64);

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// CPU-side texel payload. The backend uploads it; the core only reads it
/// to derive statistics such as elevation min/max.
#[derive(Debug, Clone, PartialEq)]
pub enum TexelData {
    /// Data already lives on the GPU (or was never read back).
    Unavailable,
    Rgba8(Vec<u8>),
    R8(Vec<u8>),
    F32(Vec<f32>),
}

impl TexelData {
    pub fn kind(&self) -> &'static str {
        match self {
            TexelData::Unavailable => "unavailable",
            TexelData::Rgba8(_) => "rgba8",
            TexelData::R8(_) => "r8",
            TexelData::F32(_) => "f32",
        }
    }
}

/// Texture handle shared between tiles.
///
/// Tiles never own texture memory: a parent texture is borrowed by its
/// children through `Arc`, and the backend frees it when the last tile
/// lets go.
#[derive(Debug, PartialEq)]
pub struct Texture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub data: TexelData,
}

impl Texture {
    pub fn new(width: u32, height: u32, data: TexelData) -> Self {
        Self {
            id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
            width,
            height,
            data,
        }
    }

    pub fn shared(width: u32, height: u32, data: TexelData) -> Arc<Self> {
        Arc::new(Self::new(width, height, data))
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A texture plus the part of it that covers a tile.
#[derive(Debug, Clone)]
pub struct TexturePitch {
    pub texture: Arc<Texture>,
    pub pitch: Pitch,
}

impl TexturePitch {
    pub fn new(texture: Arc<Texture>, pitch: Pitch) -> Self {
        Self { texture, pitch }
    }

    pub fn whole(texture: Arc<Texture>) -> Self {
        Self::new(texture, Pitch::IDENTITY)
    }
}

#[cfg(test)]
mod tests {
    use super::{TexelData, Texture};

    #[test]
    fn textures_get_distinct_ids() {
        let a = Texture::new(1, 1, TexelData::Unavailable);
        let b = Texture::new(1, 1, TexelData::Unavailable);
        assert_ne!(a.id, b.id);
        assert_eq!(Texture::new(4, 2, TexelData::R8(vec![0; 8])).texel_count(), 8);
    }
}

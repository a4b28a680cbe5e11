use std::sync::Arc;

use foundation::extent::Extent;
use foundation::ids::LayerId;
use foundation::pitch::Pitch;
use tracing::debug;

use crate::atlas::{AtlasImage, AtlasInfo, Rect, pack, update_offset_scale};
use crate::textures::{Texture, TextureId, TexturePitch};

/// Largest atlas side, in texels.
pub const DEFAULT_MAX_ATLAS_SIZE: u32 = 4096;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Color,
    Elevation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialError {
    UnknownLayer(LayerId),
    KindMismatch { layer: LayerId, expected: SlotKind },
}

impl std::fmt::Display for MaterialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaterialError::UnknownLayer(layer) => write!(f, "{layer} is not attached to material"),
            MaterialError::KindMismatch { layer, expected } => {
                write!(f, "{layer} slot is not a {expected:?} slot")
            }
        }
    }
}

impl std::error::Error for MaterialError {}

/// Per-layer texture slot of a tile material.
#[derive(Debug, Clone)]
pub struct TextureInfo {
    pub layer: LayerId,
    pub kind: SlotKind,
    pub extent: Extent,
    texture: Option<Arc<Texture>>,
    /// Pitch the shader uses: atlas space when packed, else `original_pitch`.
    pitch: Pitch,
    original_pitch: Pitch,
    atlas_rect: Option<Rect>,
    inherited: bool,
    pub opacity: f32,
    pub visible: bool,
    pub tint: Option<[f32; 3]>,
    /// Only draw where the terrain lies inside this range.
    pub elevation_range: Option<(f32, f32)>,
    pub texture_count: u32,
}

impl TextureInfo {
    fn new(layer: LayerId, kind: SlotKind, extent: Extent) -> Self {
        Self {
            layer,
            kind,
            extent,
            texture: None,
            pitch: Pitch::IDENTITY,
            original_pitch: Pitch::IDENTITY,
            atlas_rect: None,
            inherited: false,
            opacity: 1.0,
            visible: true,
            tint: None,
            elevation_range: None,
            texture_count: 1,
        }
    }

    pub fn texture(&self) -> Option<&Arc<Texture>> {
        self.texture.as_ref()
    }

    pub fn pitch(&self) -> Pitch {
        self.pitch
    }

    pub fn original_pitch(&self) -> Pitch {
        self.original_pitch
    }

    pub fn atlas_rect(&self) -> Option<Rect> {
        self.atlas_rect
    }

    /// True when the texture is borrowed from an ancestor tile.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// Whether the slot contributes at a given terrain height.
    pub fn covers_elevation(&self, elevation: f32) -> bool {
        match self.elevation_range {
            Some((min, max)) => elevation >= min && elevation <= max,
            None => true,
        }
    }
}

/// What the backend must redraw after an atlas update.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasRepaint {
    pub width: u32,
    pub height: u32,
    pub placements: Vec<(LayerId, TextureId, Rect)>,
    /// Layers too large for the atlas; sampled from their own texture.
    pub bypassed: Vec<LayerId>,
    pub full_repack: bool,
}

/// Color + elevation texture compositing for one tile.
///
/// Color layers share one atlas texture; the elevation layer has its own
/// slot. Texture changes only mark the atlas dirty: the packing runs in
/// [`LayeredMaterial::update_atlas`], called once before rendering.
#[derive(Debug, Clone)]
pub struct LayeredMaterial {
    color_layers: Vec<TextureInfo>,
    elevation: Option<TextureInfo>,
    atlas: Option<AtlasInfo<LayerId>>,
    needs_repaint: bool,
    needs_full_repack: bool,
    max_atlas_size: u32,
    pub visible: bool,
}

impl Default for LayeredMaterial {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATLAS_SIZE)
    }
}

impl LayeredMaterial {
    pub fn new(max_atlas_size: u32) -> Self {
        Self {
            color_layers: Vec::new(),
            elevation: None,
            atlas: None,
            needs_repaint: false,
            needs_full_repack: false,
            max_atlas_size,
            visible: true,
        }
    }

    /// Attaches a slot for `layer`. Attaching twice keeps the existing slot.
    pub fn push_layer(&mut self, layer: LayerId, kind: SlotKind, extent: Extent) -> &mut TextureInfo {
        match kind {
            SlotKind::Color => {
                let idx = match self.color_layers.iter().position(|s| s.layer == layer) {
                    Some(idx) => idx,
                    None => {
                        self.color_layers.push(TextureInfo::new(layer, kind, extent));
                        self.color_layers.len() - 1
                    }
                };
                &mut self.color_layers[idx]
            }
            SlotKind::Elevation => {
                let replace = self.elevation.as_ref().map(|s| s.layer != layer).unwrap_or(true);
                if replace {
                    self.elevation = Some(TextureInfo::new(layer, kind, extent));
                }
                self.elevation.get_or_insert_with(|| TextureInfo::new(layer, kind, extent))
            }
        }
    }

    pub fn remove_layer(&mut self, layer: LayerId) -> bool {
        if let Some(idx) = self.color_layers.iter().position(|s| s.layer == layer) {
            self.color_layers.remove(idx);
            self.needs_full_repack = true;
            self.needs_repaint = true;
            return true;
        }
        if self.elevation.as_ref().is_some_and(|s| s.layer == layer) {
            self.elevation = None;
            return true;
        }
        false
    }

    pub fn has_layer(&self, layer: LayerId) -> bool {
        self.slot(layer).is_some()
    }

    pub fn slot(&self, layer: LayerId) -> Option<&TextureInfo> {
        self.color_layers
            .iter()
            .find(|s| s.layer == layer)
            .or_else(|| self.elevation.as_ref().filter(|s| s.layer == layer))
    }

    fn slot_mut(&mut self, layer: LayerId) -> Result<&mut TextureInfo, MaterialError> {
        if let Some(idx) = self.color_layers.iter().position(|s| s.layer == layer) {
            return Ok(&mut self.color_layers[idx]);
        }
        match self.elevation.as_mut() {
            Some(slot) if slot.layer == layer => Ok(slot),
            _ => Err(MaterialError::UnknownLayer(layer)),
        }
    }

    pub fn color_layers(&self) -> &[TextureInfo] {
        &self.color_layers
    }

    pub fn elevation_layer(&self) -> Option<&TextureInfo> {
        self.elevation.as_ref()
    }

    /// The layer's texture with its tile pitch (not the atlas pitch).
    pub fn layer_texture(&self, layer: LayerId) -> Option<TexturePitch> {
        let slot = self.slot(layer)?;
        let texture = slot.texture.clone()?;
        Some(TexturePitch::new(texture, slot.original_pitch))
    }

    /// True when the slot holds a texture fetched for this very tile.
    pub fn owns_texture(&self, layer: LayerId) -> bool {
        self.slot(layer)
            .is_some_and(|s| s.texture.is_some() && !s.inherited)
    }

    pub fn set_layer_textures(
        &mut self,
        layer: LayerId,
        result: TexturePitch,
        inherited: bool,
    ) -> Result<(), MaterialError> {
        let slot = self.slot_mut(layer)?;
        let kind = slot.kind;
        let resized = match (&slot.texture, slot.atlas_rect) {
            (Some(_), Some(rect)) => {
                rect.w != result.texture.width || rect.h != result.texture.height
            }
            _ => false,
        };

        slot.texture = Some(result.texture);
        slot.original_pitch = result.pitch;
        slot.pitch = result.pitch;
        slot.inherited = inherited;

        if kind == SlotKind::Color {
            self.needs_repaint = true;
            if resized {
                self.needs_full_repack = true;
            }
        }
        Ok(())
    }

    pub fn set_layer_visibility(&mut self, layer: LayerId, visible: bool) -> Result<(), MaterialError> {
        self.slot_mut(layer)?.visible = visible;
        Ok(())
    }

    pub fn set_layer_opacity(&mut self, layer: LayerId, opacity: f32) -> Result<(), MaterialError> {
        self.slot_mut(layer)?.opacity = opacity.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn set_layer_tint(&mut self, layer: LayerId, tint: Option<[f32; 3]>) -> Result<(), MaterialError> {
        self.slot_mut(layer)?.tint = tint;
        Ok(())
    }

    pub fn set_layer_elevation_range(
        &mut self,
        layer: LayerId,
        range: Option<(f32, f32)>,
    ) -> Result<(), MaterialError> {
        let slot = self.slot_mut(layer)?;
        if slot.kind != SlotKind::Color {
            return Err(MaterialError::KindMismatch {
                layer,
                expected: SlotKind::Color,
            });
        }
        slot.elevation_range = range;
        Ok(())
    }

    pub fn set_layer_texture_count(&mut self, layer: LayerId, count: u32) -> Result<(), MaterialError> {
        self.slot_mut(layer)?.texture_count = count.max(1);
        Ok(())
    }

    pub fn needs_repaint(&self) -> bool {
        self.needs_repaint
    }

    pub fn atlas(&self) -> Option<&AtlasInfo<LayerId>> {
        self.atlas.as_ref()
    }

    /// Repacks the color atlas if anything changed since the last call.
    ///
    /// Existing placements are kept unless a layer was removed or a texture
    /// changed size; then the whole atlas is rebuilt. Every slot's pitch is
    /// re-derived since the atlas bounds may have grown.
    pub fn update_atlas(&mut self) -> Option<AtlasRepaint> {
        if !self.needs_repaint {
            return None;
        }
        self.needs_repaint = false;

        let images: Vec<AtlasImage<LayerId>> = self
            .color_layers
            .iter()
            .filter_map(|s| {
                let t = s.texture.as_ref()?;
                Some(AtlasImage::new(s.layer, t.width, t.height))
            })
            .collect();

        let full_repack = self.needs_full_repack || self.atlas.is_none();
        self.needs_full_repack = false;
        let previous = if full_repack { None } else { self.atlas.as_ref() };
        let atlas = pack(self.max_atlas_size, &images, previous);

        let (width, height) = (atlas.max_x(), atlas.max_y());
        let mut placements = Vec::new();
        let mut bypassed = Vec::new();
        for slot in self.color_layers.iter_mut() {
            let Some(texture) = slot.texture.as_ref() else {
                slot.atlas_rect = None;
                continue;
            };
            match atlas.fit(&slot.layer) {
                Some(rect) => {
                    slot.atlas_rect = Some(rect);
                    slot.pitch = update_offset_scale(rect, width, height, slot.original_pitch);
                    placements.push((slot.layer, texture.id, rect));
                }
                None => {
                    slot.atlas_rect = None;
                    slot.pitch = slot.original_pitch;
                    bypassed.push(slot.layer);
                }
            }
        }
        self.atlas = Some(atlas);

        debug!(
            "atlas repaint {width}x{height}: {} placed, {} bypassed, full={full_repack}",
            placements.len(),
            bypassed.len()
        );
        Some(AtlasRepaint {
            width,
            height,
            placements,
            bypassed,
            full_repack,
        })
    }
}

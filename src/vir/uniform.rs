// This module holds the uniform pool: the table of lane-uniform 32-bit values the driver
// fills into the uniform stream, one entry per distinct request. Entries are described by
// UniformContents (a literal constant, a UBO or SSBO address, a texture or image config
// word, a size query, a viewport or clip-plane parameter, the shared and spill bases, and
// so on) and are deduplicated through a hashbrown map so that every LdUnif of the same
// contents references the same UniformId. Ordering of the stream itself is the order of
// LdUnif instructions in the final block layout; the pool only names the values.

//! Uniform pool.

use hashbrown::HashMap;
use std::fmt;

/// Index into a [`UniformPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformId(pub u32);

/// Texture or image dimension queried by a size uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeQuery {
    Width,
    Height,
    Depth,
    ArraySize,
    Levels,
}

impl SizeQuery {
    pub fn name(self) -> &'static str {
        match self {
            SizeQuery::Width => "width",
            SizeQuery::Height => "height",
            SizeQuery::Depth => "depth",
            SizeQuery::ArraySize => "array_size",
            SizeQuery::Levels => "levels",
        }
    }
}

/// What the driver must place in a uniform slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformContents {
    Constant(u32),
    /// Direct slot of the default uniform block, in words.
    Uniform(u32),
    /// Address of a uniform buffer; index 0 is the default block.
    UboAddr { index: u32, offset: u32 },
    SsboOffset(u32),
    SsboSize(u32),
    /// Texture sampling config word.
    TexConfig { texture: u32, sampler: u32, flags: u32 },
    /// Image access config word.
    ImageConfig { image: u32, flags: u32 },
    TextureSize { texture: u32, query: SizeQuery },
    ImageSize { image: u32, query: SizeQuery },
    /// TLB read/write config word.
    TlbConfig(u32),
    UserClipPlane(u32),
    ViewportXScale,
    ViewportYScale,
    ViewportZScale,
    ViewportZOffset,
    AlphaRef,
    FbLayers,
    NumWorkGroups(u8),
    SharedOffset,
    SpillOffset,
    SpillSizePerThread,
}

impl fmt::Display for UniformContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniformContents::Constant(v) => write!(f, "{v:#x}"),
            UniformContents::Uniform(slot) => write!(f, "uniform[{slot}]"),
            UniformContents::UboAddr { index, offset } => write!(f, "ubo_addr({index}, {offset})"),
            UniformContents::SsboOffset(i) => write!(f, "ssbo_offset({i})"),
            UniformContents::SsboSize(i) => write!(f, "ssbo_size({i})"),
            UniformContents::TexConfig {
                texture,
                sampler,
                flags,
            } => write!(f, "tex_config({texture}, {sampler}, {flags:#x})"),
            UniformContents::ImageConfig { image, flags } => {
                write!(f, "image_config({image}, {flags:#x})")
            }
            UniformContents::TextureSize { texture, query } => {
                write!(f, "texture_{}({texture})", query.name())
            }
            UniformContents::ImageSize { image, query } => {
                write!(f, "image_{}({image})", query.name())
            }
            UniformContents::TlbConfig(v) => write!(f, "tlb_config({v:#x})"),
            UniformContents::UserClipPlane(i) => write!(f, "user_clip_plane({i})"),
            UniformContents::ViewportXScale => f.write_str("viewport_x_scale"),
            UniformContents::ViewportYScale => f.write_str("viewport_y_scale"),
            UniformContents::ViewportZScale => f.write_str("viewport_z_scale"),
            UniformContents::ViewportZOffset => f.write_str("viewport_z_offset"),
            UniformContents::AlphaRef => f.write_str("alpha_ref"),
            UniformContents::FbLayers => f.write_str("fb_layers"),
            UniformContents::NumWorkGroups(i) => write!(f, "num_work_groups({i})"),
            UniformContents::SharedOffset => f.write_str("shared_offset"),
            UniformContents::SpillOffset => f.write_str("spill_offset"),
            UniformContents::SpillSizePerThread => f.write_str("spill_size_per_thread"),
        }
    }
}

/// Deduplicated uniform table.
#[derive(Debug, Clone, Default)]
pub struct UniformPool {
    entries: Vec<UniformContents>,
    index: HashMap<UniformContents, UniformId>,
}

impl UniformPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or add an entry.
    pub fn add(&mut self, contents: UniformContents) -> UniformId {
        if let Some(&id) = self.index.get(&contents) {
            return id;
        }
        let id = UniformId(self.entries.len() as u32);
        self.entries.push(contents);
        self.index.insert(contents, id);
        id
    }

    pub fn get(&self, id: UniformId) -> Option<&UniformContents> {
        self.entries.get(id.0 as usize)
    }

    /// Literal value of a constant entry.
    pub fn constant(&self, id: UniformId) -> Option<u32> {
        match self.get(id) {
            Some(UniformContents::Constant(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UniformId, &UniformContents)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, c)| (UniformId(i as u32), c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_deduplicates() {
        let mut pool = UniformPool::new();
        let a = pool.add(UniformContents::Constant(0x3f800000));
        let b = pool.add(UniformContents::UboAddr { index: 1, offset: 16 });
        let c = pool.add(UniformContents::Constant(0x3f800000));
        let d = pool.add(UniformContents::UboAddr { index: 1, offset: 20 });

        assert_eq!(a, c);
        assert_ne!(b, d);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.constant(a), Some(0x3f800000));
        assert_eq!(pool.constant(b), None);
    }

    #[test]
    fn test_contents_display() {
        assert_eq!(UniformContents::Constant(255).to_string(), "0xff");
        assert_eq!(
            UniformContents::UboAddr { index: 0, offset: 8 }.to_string(),
            "ubo_addr(0, 8)"
        );
        assert_eq!(
            UniformContents::TextureSize { texture: 2, query: SizeQuery::Levels }.to_string(),
            "texture_levels(2)"
        );
    }
}

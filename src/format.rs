//! Texel formats and the copy layout of their subresources in upload memory.

/// Row pitch alignment required for buffer-to-texture copies.
pub const ROW_PITCH_ALIGNMENT: u32 = 256;
/// Offset alignment of each subresource inside an upload buffer.
pub const PLACEMENT_ALIGNMENT: u64 = 512;
/// Largest width or height of a 2D texture.
pub const MAX_TEXTURE_DIMENSION: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba32Float,
    Rgba16Float,
    Rgba16Unorm,
    Rg32Float,
    Rgb10A2Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rg16Float,
    Rg16Unorm,
    R32Float,
    Rg8Unorm,
    R16Float,
    R16Unorm,
    R8Unorm,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Bc1Unorm,
    Bc1UnormSrgb,
    Bc2Unorm,
    Bc2UnormSrgb,
    Bc3Unorm,
    Bc3UnormSrgb,
    Bc4Unorm,
    Bc4Snorm,
    Bc5Unorm,
    Bc5Snorm,
    Bc6hUf16,
    Bc6hSf16,
    Bc7Unorm,
    Bc7UnormSrgb,
}

impl TextureFormat {
    const DXGI_TABLE: [(TextureFormat, u32); 30] = [
        (Self::Rgba32Float, 2),
        (Self::Rgba16Float, 10),
        (Self::Rgba16Unorm, 11),
        (Self::Rg32Float, 16),
        (Self::Rgb10A2Unorm, 24),
        (Self::Rgba8Unorm, 28),
        (Self::Rgba8UnormSrgb, 29),
        (Self::Rg16Float, 34),
        (Self::Rg16Unorm, 35),
        (Self::R32Float, 41),
        (Self::Rg8Unorm, 49),
        (Self::R16Float, 54),
        (Self::R16Unorm, 56),
        (Self::R8Unorm, 61),
        (Self::Bc1Unorm, 71),
        (Self::Bc1UnormSrgb, 72),
        (Self::Bc2Unorm, 74),
        (Self::Bc2UnormSrgb, 75),
        (Self::Bc3Unorm, 77),
        (Self::Bc3UnormSrgb, 78),
        (Self::Bc4Unorm, 80),
        (Self::Bc4Snorm, 81),
        (Self::Bc5Unorm, 83),
        (Self::Bc5Snorm, 84),
        (Self::Bgra8Unorm, 87),
        (Self::Bgra8UnormSrgb, 91),
        (Self::Bc6hUf16, 95),
        (Self::Bc6hSf16, 96),
        (Self::Bc7Unorm, 98),
        (Self::Bc7UnormSrgb, 99),
    ];

    /// Numeric `DXGI_FORMAT` value.
    pub fn dxgi(self) -> u32 {
        Self::DXGI_TABLE
            .iter()
            .find(|(format, _)| *format == self)
            .map(|(_, code)| *code)
            .unwrap_or(0)
    }

    pub fn from_dxgi(code: u32) -> Option<Self> {
        Self::DXGI_TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(format, _)| *format)
    }

    pub fn is_block_compressed(self) -> bool {
        self.block_bytes().is_some()
    }

    /// Bytes per 4x4 block for BC formats.
    pub fn block_bytes(self) -> Option<u32> {
        use TextureFormat::*;
        match self {
            Bc1Unorm | Bc1UnormSrgb | Bc4Unorm | Bc4Snorm => Some(8),
            Bc2Unorm | Bc2UnormSrgb | Bc3Unorm | Bc3UnormSrgb | Bc5Unorm | Bc5Snorm | Bc6hUf16 | Bc6hSf16
            | Bc7Unorm | Bc7UnormSrgb => Some(16),
            _ => None,
        }
    }

    /// Bytes per texel for uncompressed formats.
    pub fn texel_bytes(self) -> Option<u32> {
        use TextureFormat::*;
        match self {
            Rgba32Float => Some(16),
            Rgba16Float | Rgba16Unorm | Rg32Float => Some(8),
            Rgb10A2Unorm | Rgba8Unorm | Rgba8UnormSrgb | Rg16Float | Rg16Unorm | R32Float | Bgra8Unorm
            | Bgra8UnormSrgb => Some(4),
            Rg8Unorm | R16Float | R16Unorm => Some(2),
            R8Unorm => Some(1),
            _ => None,
        }
    }

    /// Short tag shown next to texture sizes.
    pub fn short_name(self) -> &'static str {
        use TextureFormat::*;
        match self {
            Rgba32Float => "RGBA32F",
            Rgba16Float => "RGBA16F",
            Rgba16Unorm => "RGBA16",
            Rg32Float => "RG32F",
            Rgb10A2Unorm => "RGB10A2",
            Rgba8Unorm | Rgba8UnormSrgb => "RGBA8",
            Rg16Float => "RG16F",
            Rg16Unorm => "RG16",
            R32Float => "R32F",
            Rg8Unorm => "RG8",
            R16Float => "R16F",
            R16Unorm => "R16",
            R8Unorm => "R8",
            Bgra8Unorm | Bgra8UnormSrgb => "BGRA8",
            Bc1Unorm | Bc1UnormSrgb => "BC1",
            Bc2Unorm | Bc2UnormSrgb => "BC2",
            Bc3Unorm | Bc3UnormSrgb => "BC3",
            Bc4Unorm | Bc4Snorm => "BC4",
            Bc5Unorm | Bc5Snorm => "BC5",
            Bc6hUf16 | Bc6hSf16 => "BC6H",
            Bc7Unorm | Bc7UnormSrgb => "BC7",
        }
    }

    /// Tightly packed `(row_bytes, rows)` of one mip level, or `None` if a
    /// row does not fit in 32 bits.
    pub fn packed_extent(self, width: u32, height: u32) -> Option<(u32, u32)> {
        let (columns, rows, unit) = match self.block_bytes() {
            Some(block) => (width.div_ceil(4).max(1), height.div_ceil(4).max(1), block),
            None => (width, height, self.texel_bytes().unwrap_or(4)),
        };
        let row_bytes = u32::try_from(u64::from(columns) * u64::from(unit)).ok()?;
        Some((row_bytes, rows))
    }
}

pub fn mip_extent(base: u32, level: u32) -> u32 {
    base.checked_shr(level).unwrap_or(0).max(1)
}

/// Length of the full mip chain of a `width` x `height` surface.
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    (32 - width.max(height).leading_zeros()).max(1)
}

/// Placement of one subresource inside an upload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceFootprint {
    pub offset: u64,
    /// Copy width in texels, padded to whole blocks for BC formats.
    pub width: u32,
    pub height: u32,
    pub row_pitch: u32,
    pub row_bytes: u32,
    pub rows: u32,
}

impl SubresourceFootprint {
    pub fn packed_bytes(&self) -> u64 {
        self.row_bytes as u64 * self.rows as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyLayout {
    pub footprints: Vec<SubresourceFootprint>,
    /// Size of the upload buffer holding every subresource.
    pub total_bytes: u64,
    /// Size of the same data with no row or placement padding.
    pub packed_bytes: u64,
}

impl CopyLayout {
    /// Layout of `mip_levels` mips, or `None` when the surface exceeds
    /// [`MAX_TEXTURE_DIMENSION`], asks for more mips than its full chain, or
    /// its sizes overflow.
    pub fn new(format: TextureFormat, width: u32, height: u32, mip_levels: u32) -> Option<Self> {
        if width > MAX_TEXTURE_DIMENSION || height > MAX_TEXTURE_DIMENSION {
            return None;
        }
        let mip_levels = mip_levels.max(1);
        if mip_levels > full_mip_count(width, height) {
            return None;
        }
        let block = format.is_block_compressed();
        let mut footprints = Vec::with_capacity(mip_levels as usize);
        let mut offset = 0u64;
        let mut packed_bytes = 0u64;

        for level in 0..mip_levels {
            let w = mip_extent(width, level);
            let h = mip_extent(height, level);
            let (row_bytes, rows) = format.packed_extent(w, h)?;
            let row_pitch = row_bytes.checked_next_multiple_of(ROW_PITCH_ALIGNMENT)?;
            offset = offset.checked_next_multiple_of(PLACEMENT_ALIGNMENT)?;
            let footprint = SubresourceFootprint {
                offset,
                width: if block { w.next_multiple_of(4) } else { w },
                height: if block { h.next_multiple_of(4) } else { h },
                row_pitch,
                row_bytes,
                rows,
            };
            offset = offset.checked_add(u64::from(row_pitch) * u64::from(rows))?;
            packed_bytes += footprint.packed_bytes();
            footprints.push(footprint);
        }

        Some(Self {
            footprints,
            total_bytes: offset,
            packed_bytes,
        })
    }

    /// Re-pitches tightly packed mip data into the upload layout.
    /// Returns `None` when `packed` is shorter than the layout needs.
    pub fn stage(&self, packed: &[u8]) -> Option<Vec<u8>> {
        if (packed.len() as u64) < self.packed_bytes {
            return None;
        }
        let mut staging = vec![0u8; self.total_bytes as usize];
        let mut src = 0usize;
        for fp in &self.footprints {
            let row_bytes = fp.row_bytes as usize;
            for row in 0..fp.rows as usize {
                let dst = fp.offset as usize + row * fp.row_pitch as usize;
                staging[dst..dst + row_bytes].copy_from_slice(&packed[src..src + row_bytes]);
                src += row_bytes;
            }
        }
        Some(staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TextureFormat::Bc1Unorm, 1024, 1024, 2048, 256)]
    #[case(TextureFormat::Bc7Unorm, 1024, 1024, 4096, 256)]
    #[case(TextureFormat::Rgba8Unorm, 100, 10, 400, 10)]
    #[case(TextureFormat::Bc1Unorm, 2, 2, 8, 1)]
    fn packed_extent_of_top_level(
        #[case] format: TextureFormat,
        #[case] width: u32,
        #[case] height: u32,
        #[case] row_bytes: u32,
        #[case] rows: u32,
    ) {
        assert_eq!(format.packed_extent(width, height), Some((row_bytes, rows)));
    }

    #[test]
    fn footprints_are_aligned() {
        let layout = CopyLayout::new(TextureFormat::Rgba8Unorm, 100, 60, 7).unwrap();
        assert_eq!(layout.footprints.len(), 7);
        for fp in &layout.footprints {
            assert_eq!(fp.row_pitch % ROW_PITCH_ALIGNMENT, 0);
            assert_eq!(fp.offset % PLACEMENT_ALIGNMENT, 0);
            assert!(fp.row_pitch >= fp.row_bytes);
        }
        let last = layout.footprints.last().unwrap();
        assert_eq!((last.width, last.height), (1, 1));
        assert_eq!(layout.total_bytes, last.offset + last.row_pitch as u64);
    }

    #[test]
    fn bc_footprints_pad_to_blocks() {
        let layout = CopyLayout::new(TextureFormat::Bc1Unorm, 8, 8, 4).unwrap();
        let dims: Vec<_> = layout.footprints.iter().map(|fp| (fp.width, fp.height, fp.rows)).collect();
        assert_eq!(dims, vec![(8, 8, 2), (4, 4, 1), (4, 4, 1), (4, 4, 1)]);
        assert_eq!(layout.packed_bytes, 32 + 8 + 8 + 8);
    }

    #[test]
    fn stage_repitches_rows() {
        let layout = CopyLayout::new(TextureFormat::Rgba8Unorm, 2, 2, 1).unwrap();
        let packed: Vec<u8> = (0..16).collect();
        let staged = layout.stage(&packed).unwrap();
        assert_eq!(staged.len(), 512);
        assert_eq!(&staged[0..8], &packed[0..8]);
        assert_eq!(&staged[256..264], &packed[8..16]);
        assert!(layout.stage(&packed[..15]).is_none());
    }

    #[rstest]
    #[case(TextureFormat::Rgba32Float, 0x4000_0000, 1, 1)]
    #[case(TextureFormat::Bc7Unorm, u32::MAX, u32::MAX, 1)]
    #[case(TextureFormat::Rgba8Unorm, MAX_TEXTURE_DIMENSION + 1, 4, 1)]
    #[case(TextureFormat::Rgba8Unorm, 4, 4, 4)]
    #[case(TextureFormat::Bc1Unorm, 8, 8, u32::MAX)]
    fn oversize_surfaces_have_no_layout(
        #[case] format: TextureFormat,
        #[case] width: u32,
        #[case] height: u32,
        #[case] mip_levels: u32,
    ) {
        assert_eq!(CopyLayout::new(format, width, height, mip_levels), None);
    }

    #[test]
    fn largest_surface_fits() {
        let layout = CopyLayout::new(
            TextureFormat::Rgba32Float,
            MAX_TEXTURE_DIMENSION,
            MAX_TEXTURE_DIMENSION,
            full_mip_count(MAX_TEXTURE_DIMENSION, MAX_TEXTURE_DIMENSION),
        )
        .unwrap();
        assert_eq!(layout.footprints.len(), 15);
        assert_eq!(layout.footprints[0].row_bytes, MAX_TEXTURE_DIMENSION * 16);
        assert!(layout.total_bytes > u64::from(u32::MAX));
        assert_eq!(TextureFormat::Rgba8Unorm.packed_extent(u32::MAX, 1), None);
        assert_eq!(mip_extent(7, 40), 1);
    }

    #[test]
    fn dxgi_codes_round_trip() {
        assert_eq!(TextureFormat::Bc7UnormSrgb.dxgi(), 99);
        assert_eq!(TextureFormat::from_dxgi(71), Some(TextureFormat::Bc1Unorm));
        assert_eq!(TextureFormat::from_dxgi(1), None);
        assert_eq!(TextureFormat::Rgba8UnormSrgb.short_name(), "RGBA8");
    }
}

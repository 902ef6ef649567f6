//! Reader for the DirectDraw Surface container.
//!
//! Only single 2D textures are accepted (no cube maps, volumes or arrays).
//! Surface data is returned as stored: mips tightly packed, largest first.

use crate::asset::AssetError;
use crate::format::{CopyLayout, MAX_TEXTURE_DIMENSION, TextureFormat, full_mip_count};
use std::path::Path;

const MAGIC: &[u8; 4] = b"DDS ";
const HEADER_SIZE: usize = 124;
const DX10_HEADER_SIZE: usize = 20;

const DDPF_ALPHAPIXELS: u32 = 0x1;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;
const DDSCAPS2_CUBEMAP: u32 = 0x200;
const DDSCAPS2_VOLUME: u32 = 0x20_0000;
const DX10_DIMENSION_TEXTURE2D: u32 = 3;

#[derive(Debug)]
pub struct DdsImage<'a> {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub data: &'a [u8],
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

impl<'a> DdsImage<'a> {
    pub fn parse(path: &Path, bytes: &'a [u8]) -> Result<Self, AssetError> {
        if bytes.len() < 4 + HEADER_SIZE {
            return Err(AssetError::malformed(path, "truncated DDS header"));
        }
        if &bytes[..4] != MAGIC {
            return Err(AssetError::malformed(path, "missing DDS magic"));
        }
        let header = &bytes[4..4 + HEADER_SIZE];
        if read_u32(header, 0) as usize != HEADER_SIZE {
            return Err(AssetError::malformed(path, "bad DDS header size"));
        }

        let height = read_u32(header, 8);
        let width = read_u32(header, 12);
        if width == 0 || height == 0 {
            return Err(AssetError::malformed(path, "zero-sized surface"));
        }
        if width > MAX_TEXTURE_DIMENSION || height > MAX_TEXTURE_DIMENSION {
            return Err(AssetError::unsupported(
                path,
                format!("{width}x{height} surface, limit is {MAX_TEXTURE_DIMENSION}"),
            ));
        }
        let mip_levels = read_u32(header, 24).clamp(1, full_mip_count(width, height));

        let caps2 = read_u32(header, 108);
        if caps2 & (DDSCAPS2_CUBEMAP | DDSCAPS2_VOLUME) != 0 {
            return Err(AssetError::unsupported(path, "cube map or volume texture"));
        }

        let pf_flags = read_u32(header, 76);
        let fourcc = &header[80..84];
        let mut data_offset = 4 + HEADER_SIZE;

        let format = if pf_flags & DDPF_FOURCC != 0 && fourcc == b"DX10" {
            if bytes.len() < data_offset + DX10_HEADER_SIZE {
                return Err(AssetError::malformed(path, "truncated DX10 header"));
            }
            let ext = &bytes[data_offset..data_offset + DX10_HEADER_SIZE];
            data_offset += DX10_HEADER_SIZE;
            let dxgi = read_u32(ext, 0);
            if read_u32(ext, 4) != DX10_DIMENSION_TEXTURE2D || read_u32(ext, 12) > 1 {
                return Err(AssetError::unsupported(path, "texture array or non-2D resource"));
            }
            TextureFormat::from_dxgi(dxgi)
                .ok_or_else(|| AssetError::unsupported(path, format!("DXGI format {dxgi}")))?
        } else if pf_flags & DDPF_FOURCC != 0 {
            format_from_fourcc(fourcc).ok_or_else(|| {
                AssetError::unsupported(path, format!("FourCC {}", String::from_utf8_lossy(fourcc)))
            })?
        } else if pf_flags & DDPF_RGB != 0 {
            let masks = [
                read_u32(header, 88),
                read_u32(header, 92),
                read_u32(header, 96),
                if pf_flags & DDPF_ALPHAPIXELS != 0 { read_u32(header, 100) } else { 0 },
            ];
            format_from_masks(read_u32(header, 84), masks)
                .ok_or_else(|| AssetError::unsupported(path, "uncompressed pixel layout"))?
        } else {
            return Err(AssetError::unsupported(path, "pixel format flags"));
        };

        let layout = CopyLayout::new(format, width, height, mip_levels)
            .ok_or_else(|| AssetError::malformed(path, "surface size overflows"))?;
        let data = &bytes[data_offset..];
        if (data.len() as u64) < layout.packed_bytes {
            return Err(AssetError::malformed(
                path,
                format!("surface data is {} bytes, expected {}", data.len(), layout.packed_bytes),
            ));
        }

        Ok(Self {
            width,
            height,
            mip_levels,
            format,
            data: &data[..layout.packed_bytes as usize],
        })
    }
}

fn format_from_fourcc(fourcc: &[u8]) -> Option<TextureFormat> {
    use TextureFormat::*;
    Some(match fourcc {
        b"DXT1" => Bc1Unorm,
        b"DXT2" | b"DXT3" => Bc2Unorm,
        b"DXT4" | b"DXT5" => Bc3Unorm,
        b"ATI1" | b"BC4U" => Bc4Unorm,
        b"BC4S" => Bc4Snorm,
        b"ATI2" | b"BC5U" => Bc5Unorm,
        b"BC5S" => Bc5Snorm,
        _ => match u32::from_le_bytes([fourcc[0], fourcc[1], fourcc[2], fourcc[3]]) {
            // D3DFMT codes stored in the FourCC field.
            36 => Rgba16Unorm,
            111 => R16Float,
            112 => Rg16Float,
            113 => Rgba16Float,
            114 => R32Float,
            115 => Rg32Float,
            116 => Rgba32Float,
            _ => return None,
        },
    })
}

fn format_from_masks(bits: u32, [r, g, b, a]: [u32; 4]) -> Option<TextureFormat> {
    match (bits, r, g, b, a) {
        (32, 0xff, 0xff00, 0xff_0000, _) => Some(TextureFormat::Rgba8Unorm),
        (32, 0xff_0000, 0xff00, 0xff, _) => Some(TextureFormat::Bgra8Unorm),
        (32, 0x3ff, 0xf_fc00, 0x3ff0_0000, _) => Some(TextureFormat::Rgb10A2Unorm),
        (32, 0xffff, 0xffff_0000, 0, 0) => Some(TextureFormat::Rg16Unorm),
        (16, 0xff, 0xff00, 0, 0) => Some(TextureFormat::Rg8Unorm),
        (16, 0xffff, 0, 0, 0) => Some(TextureFormat::R16Unorm),
        (8, 0xff, 0, 0, 0) => Some(TextureFormat::R8Unorm),
        _ => None,
    }
}

//! Sampled 2D textures and their three creation paths.

use crate::asset::{self, AssetError};
use crate::dds::DdsImage;
use crate::device::GraphicsDevice;
use crate::format::{CopyLayout, MAX_TEXTURE_DIMENSION, SubresourceFootprint, TextureFormat};
use crate::frame::FrameState;
use crate::gpu::{DescriptorSlot, DeviceError, GpuDescriptorHandle, ResourceDesc, ResourceId, ResourceState};
use crate::resource::{self, Residency, ResidencyState};
use log::{debug, warn};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

/// Failure of a file-backed texture load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Turns an asset failure into `None` (logged), keeping device failures fatal.
pub fn recover<T>(result: Result<T, LoadError>) -> Result<Option<T>, DeviceError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(LoadError::Asset(e)) => {
            warn!("{e}");
            Ok(None)
        }
        Err(LoadError::Device(e)) => Err(e),
    }
}

/// Raw texel data for [`Texture::from_pixels`]. Mips are tightly packed,
/// largest first.
#[derive(Debug, Clone, Copy)]
pub struct TextureParams<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub data: &'a [u8],
}

pub struct Texture {
    name: String,
    width: u32,
    height: u32,
    mip_levels: u32,
    format: TextureFormat,
    footprints: Vec<SubresourceFootprint>,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
    residency: RefCell<Residency>,
}

impl Texture {
    pub fn from_pixels(device: &mut GraphicsDevice, params: &TextureParams<'_>) -> Result<Rc<Self>, DeviceError> {
        Self::create(device, params, 0)
    }

    /// Decodes a PNG/JPEG/BMP/TGA file to RGBA8. Asset failures are logged
    /// and yield `None`.
    pub fn from_file(device: &mut GraphicsDevice, path: &Path) -> Result<Option<Rc<Self>>, DeviceError> {
        recover(Self::try_from_file(device, path))
    }

    pub fn try_from_file(device: &mut GraphicsDevice, path: &Path) -> Result<Rc<Self>, LoadError> {
        let bytes = asset::read_file(path)?;
        let image = image::load_from_memory(&bytes)
            .map_err(|source| AssetError::Decode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgba8();
        if image.width() > MAX_TEXTURE_DIMENSION || image.height() > MAX_TEXTURE_DIMENSION {
            return Err(AssetError::unsupported(
                path,
                format!("{}x{} image, limit is {MAX_TEXTURE_DIMENSION}", image.width(), image.height()),
            )
            .into());
        }
        let name = asset::display_name(path);
        let params = TextureParams {
            name: &name,
            width: image.width(),
            height: image.height(),
            mip_levels: 1,
            format: TextureFormat::Rgba8Unorm,
            data: image.as_raw(),
        };
        Ok(Self::create(device, &params, bytes.len() as u64)?)
    }

    /// Loads every mip of a DDS file as stored.
    pub fn from_dds(device: &mut GraphicsDevice, path: &Path) -> Result<Option<Rc<Self>>, DeviceError> {
        recover(Self::try_from_dds(device, path))
    }

    pub fn try_from_dds(device: &mut GraphicsDevice, path: &Path) -> Result<Rc<Self>, LoadError> {
        let bytes = asset::read_file(path)?;
        let dds = DdsImage::parse(path, &bytes)?;
        let name = asset::display_name(path);
        let params = TextureParams {
            name: &name,
            width: dds.width,
            height: dds.height,
            mip_levels: dds.mip_levels,
            format: dds.format,
            data: dds.data,
        };
        Ok(Self::create(device, &params, bytes.len() as u64)?)
    }

    /// Picks the loader from the file extension.
    pub fn load(device: &mut GraphicsDevice, path: &Path) -> Result<Option<Rc<Self>>, DeviceError> {
        let is_dds = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("dds"));
        if is_dds {
            Self::from_dds(device, path)
        } else {
            Self::from_file(device, path)
        }
    }

    fn create(device: &mut GraphicsDevice, params: &TextureParams<'_>, compressed_bytes: u64) -> Result<Rc<Self>, DeviceError> {
        if params.width == 0 || params.height == 0 {
            return Err(DeviceError::InvalidArgument(format!("{}: zero-sized texture", params.name)));
        }
        let mip_levels = params.mip_levels.max(1);
        let layout = CopyLayout::new(params.format, params.width, params.height, mip_levels).ok_or_else(|| {
            DeviceError::InvalidArgument(format!(
                "{}: {}x{} with {mip_levels} mips exceeds the {MAX_TEXTURE_DIMENSION} texel limit or its mip chain",
                params.name, params.width, params.height
            ))
        })?;
        let staging = layout.stage(params.data).ok_or_else(|| {
            DeviceError::InvalidArgument(format!(
                "{}: {} bytes of texel data, expected {}",
                params.name,
                params.data.len(),
                layout.packed_bytes
            ))
        })?;

        let desc = ResourceDesc::Texture2D {
            width: params.width,
            height: params.height,
            mip_levels,
            format: params.format,
        };
        let upload = resource::stage(device, &desc, params.name, &staging)?;
        let texture = Rc::new(Self {
            name: params.name.to_owned(),
            width: params.width,
            height: params.height,
            mip_levels,
            format: params.format,
            footprints: layout.footprints,
            uncompressed_bytes: layout.total_bytes,
            compressed_bytes,
            residency: RefCell::new(Residency::Pending(upload)),
        });

        let queued = Rc::clone(&texture);
        device.enqueue(Box::new(move |device| queued.upload(device)));
        Ok(texture)
    }

    /// Records the copy of every subresource and creates the view. Does
    /// nothing once the texture is resident.
    pub fn upload(&self, device: &mut GraphicsDevice) -> Result<(), DeviceError> {
        let mut residency = self.residency.borrow_mut();
        let Residency::Pending(upload) = *residency else {
            return Ok(());
        };
        device.expect_phase(FrameState::Recording, "Texture::upload")?;

        let backend = device.backend_mut();
        for (subresource, footprint) in self.footprints.iter().enumerate() {
            backend.copy_texture_region(upload.resource, subresource as u32, upload.staging, footprint, self.format);
        }
        backend.transition_resource(upload.resource, ResourceState::CopyDest, ResourceState::PixelShaderResource);
        backend.create_texture_view(upload.resource, self.format, self.mip_levels, upload.slot.cpu)?;
        residency.finish_upload(device, upload);
        debug!(
            "uploaded {} ({}x{}, {} mips, {})",
            self.name,
            self.width,
            self.height,
            self.mip_levels,
            self.format.short_name()
        );
        Ok(())
    }

    pub(crate) fn release(&self, device: &mut GraphicsDevice) {
        self.residency.borrow_mut().release(device);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn format_tag(&self) -> &'static str {
        self.format.short_name()
    }

    /// Bytes occupied by all mips in upload layout.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }

    /// Size of the source file; zero for in-memory textures.
    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes
    }

    pub fn state(&self) -> ResidencyState {
        self.residency.borrow().state()
    }

    pub fn is_resident(&self) -> bool {
        self.state() == ResidencyState::Resident
    }

    pub fn descriptor(&self) -> Option<GpuDescriptorHandle> {
        self.residency.borrow().descriptor()
    }

    pub fn slot(&self) -> Option<DescriptorSlot> {
        self.residency.borrow().slot()
    }

    pub fn resource(&self) -> Option<ResourceId> {
        self.residency.borrow().resource()
    }

    pub fn staging_bytes(&self) -> u64 {
        self.residency.borrow().staging_bytes()
    }
}

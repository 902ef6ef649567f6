//! Shader programs, their declared bindings and per-draw constants.

use crate::device::GraphicsDevice;
use crate::gpu::{
    AddressMode, BindingLayoutDesc, BindingParameter, DescriptorKind, DescriptorSlot, DeviceError, GpuDescriptorHandle,
    LayoutId, MemoryKind, ResourceDesc, ResourceId, SamplerFilter, ShaderError, ShaderId, ShaderSource, StaticSampler,
};
use bytemuck::{Pod, Zeroable};
use log::{info, warn};
use std::collections::HashMap;
use std::rc::Rc;

pub const FULL_SCREEN_SHADER: &str = "FullScreenRect.hlsl";

const LINEAR_WRAP: StaticSampler = StaticSampler {
    register: 0,
    filter: SamplerFilter::Linear,
    address: AddressMode::Wrap,
};

/// Per-draw constants shared by every pixel shader, padded to one 256-byte
/// constant buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ViewConstants {
    pub scale: f32,
    pub intensity: f32,
    pub light_position: f32,
    pub metalness: f32,
    _padding: [[f32; 4]; 15],
}

impl Default for ViewConstants {
    fn default() -> Self {
        Self {
            scale: 1.0,
            intensity: 2.5,
            light_position: 0.0,
            metalness: 0.0,
            _padding: [[0.0; 4]; 15],
        }
    }
}

pub const CONSTANT_BUFFER_SIZE: u32 = std::mem::size_of::<ViewConstants>() as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    FullScreenVertex,
    StandardPixel,
    NeuralPixel,
    NeuralPixelLight,
}

/// Everything needed to compile a shader and lay out its bindings.
#[derive(Debug, Clone, Copy)]
pub struct ShaderDecl {
    pub file: &'static str,
    pub entry_point: &'static str,
    pub target: &'static str,
    pub defines: &'static [(&'static str, &'static str)],
    pub srvs: &'static [&'static str],
    pub cbvs: &'static [&'static str],
    pub uavs: &'static [&'static str],
    pub samplers: &'static [StaticSampler],
}

impl ShaderKind {
    pub fn decl(self) -> ShaderDecl {
        const PIXEL: ShaderDecl = ShaderDecl {
            file: FULL_SCREEN_SHADER,
            entry_point: "PSMain",
            target: "ps_5_0",
            defines: &[],
            srvs: &["AlbedoTexture", "NormalsTexture", "AOTexture", "RoughnessTexture"],
            cbvs: &["ConstantBuffer"],
            uavs: &[],
            samplers: &[
                LINEAR_WRAP,
                StaticSampler {
                    register: 1,
                    ..LINEAR_WRAP
                },
            ],
        };
        const NEURAL_SRVS: &[&str] = &[
            "FeatureGrid0",
            "FeatureGrid1",
            "FeatureGrid2",
            "FeatureGrid3",
            "WeightBuffer",
            "BiasBuffer",
        ];

        match self {
            ShaderKind::FullScreenVertex => ShaderDecl {
                file: FULL_SCREEN_SHADER,
                entry_point: "VSMain",
                target: "vs_5_0",
                defines: &[],
                srvs: &[],
                cbvs: &[],
                uavs: &[],
                samplers: &[],
            },
            ShaderKind::StandardPixel => PIXEL,
            ShaderKind::NeuralPixel => ShaderDecl {
                defines: &[("USE_NEURAL_TEXTURES", "1")],
                srvs: NEURAL_SRVS,
                samplers: &[LINEAR_WRAP],
                ..PIXEL
            },
            ShaderKind::NeuralPixelLight => ShaderDecl {
                defines: &[("USE_NEURAL_TEXTURES", "1"), ("LIGHT_WEIGHT_NN", "1")],
                srvs: NEURAL_SRVS,
                samplers: &[LINEAR_WRAP],
                ..PIXEL
            },
        }
    }

    pub fn is_pixel(self) -> bool {
        self != ShaderKind::FullScreenVertex
    }

    /// Layer widths of the decoder compiled into the pixel shader.
    pub fn decoder_topology(self) -> Option<&'static [u32]> {
        match self {
            ShaderKind::NeuralPixel => Some(&[16, 64, 64, 8]),
            ShaderKind::NeuralPixelLight => Some(&[16, 32, 32, 8]),
            _ => None,
        }
    }
}

impl ShaderDecl {
    /// Root parameter kinds in layout order.
    pub fn parameter_kinds(&self) -> impl Iterator<Item = DescriptorKind> + '_ {
        std::iter::repeat_n(DescriptorKind::Srv, self.srvs.len())
            .chain(std::iter::repeat_n(DescriptorKind::Cbv, self.cbvs.len()))
            .chain(std::iter::repeat_n(DescriptorKind::Uav, self.uavs.len()))
    }

    /// One descriptor table per binding: SRVs, then CBVs, then UAVs, each
    /// range counting registers from zero.
    pub fn binding_layout(&self) -> BindingLayoutDesc {
        let ranges = [
            (DescriptorKind::Srv, self.srvs),
            (DescriptorKind::Cbv, self.cbvs),
            (DescriptorKind::Uav, self.uavs),
        ];
        let parameters = ranges
            .iter()
            .flat_map(|(kind, names)| {
                names.iter().enumerate().map(move |(register, name)| BindingParameter {
                    name: (*name).to_owned(),
                    kind: *kind,
                    register: register as u32,
                })
            })
            .collect();
        BindingLayoutDesc {
            parameters,
            samplers: self.samplers.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantBuffer {
    resource: ResourceId,
    slot: DescriptorSlot,
}

/// A compiled program. Pixel shaders also own their binding layout and a
/// constant buffer. A shader that failed to compile stays unusable.
#[derive(Debug)]
pub struct Shader {
    kind: ShaderKind,
    program: Option<ShaderId>,
    layout: Option<LayoutId>,
    constants: Option<ConstantBuffer>,
}

impl Shader {
    pub(crate) fn compile(device: &mut GraphicsDevice, kind: ShaderKind) -> Result<Self, DeviceError> {
        let decl = kind.decl();
        let path = device.config().shader_dir.join(decl.file);
        let compiled = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let defines: Vec<(&str, &str)> = decl.defines.to_vec();
                let name = path.display().to_string();
                device.backend_mut().compile_shader(&ShaderSource {
                    name: &name,
                    text: &text,
                    entry_point: decl.entry_point,
                    target: decl.target,
                    defines: &defines,
                })
            }
            Err(_) => Err(ShaderError::Missing(path.clone())),
        };
        let program = match compiled {
            Ok(program) => program,
            Err(e) => {
                warn!("{kind:?} unusable: {e}");
                return Ok(Self {
                    kind,
                    program: None,
                    layout: None,
                    constants: None,
                });
            }
        };

        let (layout, constants) = if kind.is_pixel() {
            let layout = device.backend_mut().create_binding_layout(&decl.binding_layout())?;
            let resource = device.backend_mut().create_resource(
                &ResourceDesc::Buffer {
                    size: CONSTANT_BUFFER_SIZE as u64,
                    memory: MemoryKind::Upload,
                },
                &format!("{kind:?} constants"),
            )?;
            let slot = device.allocate_descriptor()?;
            device
                .backend_mut()
                .create_constant_view(resource, CONSTANT_BUFFER_SIZE, slot.cpu)?;
            (Some(layout), Some(ConstantBuffer { resource, slot }))
        } else {
            (None, None)
        };

        info!("compiled {kind:?} ({} {})", decl.entry_point, decl.target);
        Ok(Self {
            kind,
            program: Some(program),
            layout,
            constants,
        })
    }

    pub fn kind(&self) -> ShaderKind {
        self.kind
    }

    pub fn is_usable(&self) -> bool {
        self.program.is_some()
    }

    pub fn program(&self) -> Option<ShaderId> {
        self.program
    }

    pub fn layout(&self) -> Option<LayoutId> {
        self.layout
    }

    /// Constant buffer resource and its view slot, for pixel shaders.
    pub(crate) fn constant_buffer(&self) -> Option<(ResourceId, DescriptorSlot)> {
        self.constants.map(|c| (c.resource, c.slot))
    }

    /// Writes the constants and returns the descriptor to bind them with.
    pub fn write_constants(
        &self,
        device: &mut GraphicsDevice,
        constants: &ViewConstants,
    ) -> Result<Option<GpuDescriptorHandle>, DeviceError> {
        let Some(buffer) = self.constants else {
            return Ok(None);
        };
        device
            .backend_mut()
            .write_resource(buffer.resource, 0, bytemuck::bytes_of(constants))?;
        Ok(Some(buffer.slot.gpu))
    }
}

/// Compiled shaders by kind, owned by the device.
#[derive(Default)]
pub struct ShaderCache {
    shaders: HashMap<ShaderKind, Rc<Shader>>,
}

impl ShaderCache {
    pub fn get(&self, kind: ShaderKind) -> Option<Rc<Shader>> {
        self.shaders.get(&kind).cloned()
    }

    pub fn insert(&mut self, shader: Shader) -> Rc<Shader> {
        let shader = Rc::new(shader);
        self.shaders.insert(shader.kind(), Rc::clone(&shader));
        shader
    }

    /// Empties the cache, handing back every shader it held.
    pub fn drain(&mut self) -> impl Iterator<Item = Rc<Shader>> + '_ {
        self.shaders.drain().map(|(_, shader)| shader)
    }
}

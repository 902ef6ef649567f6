//! Native command surface driven by [`crate::device::GraphicsDevice`].
//!
//! The device never touches D3D12 objects directly. It addresses GPU memory,
//! compiled programs, binding layouts and pipeline states through opaque
//! handles and records work through [`GpuBackend`]. `Dx12Backend` is the real
//! implementation; `HeadlessBackend` simulates the queue timeline so the frame
//! logic runs without a GPU.

pub mod descriptor;
#[cfg(windows)]
pub mod dx12;
pub mod headless;

use crate::format::{SubresourceFootprint, TextureFormat};
use std::path::PathBuf;
use thiserror::Error;

pub use descriptor::{DescriptorError, DescriptorHeapAllocator, DescriptorSlot};

/// Number of swapchain buffers and command allocators.
pub const FRAME_COUNT: usize = 2;

/// Handle to a committed resource (texture, buffer or staging memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u64);

/// Handle to a compiled shader program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderId(pub(crate) u64);

/// Handle to a binding layout (root signature).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutId(pub(crate) u64);

/// Handle to a pipeline state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle(pub u64);

/// Shape of the shader-visible descriptor heap, as reported by the backend.
#[derive(Debug, Clone, Copy)]
pub struct HeapInfo {
    pub capacity: u32,
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: GpuDescriptorHandle,
    pub increment: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Default heap, GPU-only.
    DeviceLocal,
    /// Upload heap, CPU-writable through a mapping.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer {
        size: u64,
        memory: MemoryKind,
    },
    Texture2D {
        width: u32,
        height: u32,
        mip_levels: u32,
        format: TextureFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    CopyDest,
    PixelShaderResource,
    RenderTarget,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Srv,
    Cbv,
    Uav,
}

/// One descriptor-table root parameter holding a single descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingParameter {
    pub name: String,
    pub kind: DescriptorKind,
    pub register: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerFilter {
    Linear,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Wrap,
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticSampler {
    pub register: u32,
    pub filter: SamplerFilter,
    pub address: AddressMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingLayoutDesc {
    pub parameters: Vec<BindingParameter>,
    pub samplers: Vec<StaticSampler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub semantic: &'static str,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    pub vertex_shader: ShaderId,
    pub pixel_shader: ShaderId,
    pub layout: LayoutId,
    pub input_layout: &'a [VertexAttribute],
    pub render_target_format: TextureFormat,
}

/// Source text handed to the runtime compiler.
#[derive(Debug, Clone, Copy)]
pub struct ShaderSource<'a> {
    pub name: &'a str,
    pub text: &'a str,
    pub entry_point: &'a str,
    pub target: &'a str,
    pub defines: &'a [(&'a str, &'a str)],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBinding {
    pub vertex_buffer: ResourceId,
    pub vertex_stride: u32,
    pub vertex_bytes: u32,
    pub index_buffer: ResourceId,
    pub index_bytes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Occluded,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    /// A native construction or recording call failed. Indicates device or
    /// driver misconfiguration rather than bad input.
    #[error("{call} failed: {message}")]
    Native { call: &'static str, message: String },
    #[error("GPU device lost: {reason}")]
    DeviceLost { reason: String },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("{operation} called while {actual:?}, expected {expected:?}")]
    InvalidPhase {
        operation: &'static str,
        expected: crate::frame::FrameState,
        actual: crate::frame::FrameState,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("shader '{0}' is not usable")]
    ShaderUnusable(String),
    #[error("resource '{0}' has no view yet")]
    NotResident(String),
}

impl DeviceError {
    pub fn native(call: &'static str, message: impl Into<String>) -> Self {
        Self::Native {
            call,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("shader source {0} not found")]
    Missing(PathBuf),
    #[error("failed to compile {file}:\n{diagnostics}")]
    Compile { file: String, diagnostics: String },
}

/// The native operations the device needs, one call per D3D12 concept.
///
/// Recording calls are only valid between [`GpuBackend::reset_commands`] and
/// [`GpuBackend::execute`]; implementations may reject or ignore them
/// otherwise.
pub trait GpuBackend {
    fn name(&self) -> &'static str;

    /// The shader-visible CBV/SRV/UAV heap.
    fn descriptor_heap(&self) -> HeapInfo;

    fn back_buffer_format(&self) -> TextureFormat;

    fn create_resource(&mut self, desc: &ResourceDesc, label: &str) -> Result<ResourceId, DeviceError>;

    /// Copies `data` into upload memory at `offset` through a CPU mapping.
    fn write_resource(&mut self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn release_resource(&mut self, resource: ResourceId);

    fn create_texture_view(
        &mut self,
        resource: ResourceId,
        format: TextureFormat,
        mip_levels: u32,
        slot: CpuDescriptorHandle,
    ) -> Result<(), DeviceError>;

    fn create_buffer_view(
        &mut self,
        resource: ResourceId,
        element_size: u32,
        element_count: u32,
        slot: CpuDescriptorHandle,
    ) -> Result<(), DeviceError>;

    fn create_constant_view(&mut self, resource: ResourceId, size: u32, slot: CpuDescriptorHandle) -> Result<(), DeviceError>;

    fn compile_shader(&mut self, source: &ShaderSource<'_>) -> Result<ShaderId, ShaderError>;

    fn create_binding_layout(&mut self, desc: &BindingLayoutDesc) -> Result<LayoutId, DeviceError>;

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineId, DeviceError>;

    fn completed_fence_value(&self) -> u64;

    fn signal_fence(&mut self, value: u64) -> Result<(), DeviceError>;

    /// Blocks until the fence reaches `value`. Never times out.
    fn wait_for_fence(&mut self, value: u64) -> Result<(), DeviceError>;

    fn current_back_buffer(&self) -> usize;

    /// Resets command allocator `allocator` and reopens the command list on it.
    fn reset_commands(&mut self, allocator: usize) -> Result<(), DeviceError>;

    fn transition_back_buffer(&mut self, index: usize, before: ResourceState, after: ResourceState);

    fn transition_resource(&mut self, resource: ResourceId, before: ResourceState, after: ResourceState);

    fn set_render_target(&mut self, back_buffer: usize);

    fn clear_render_target(&mut self, back_buffer: usize, color: [f32; 4]);

    fn bind_descriptor_heap(&mut self);

    fn copy_buffer(&mut self, dst: ResourceId, src: ResourceId, size: u64);

    fn copy_texture_region(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        src: ResourceId,
        footprint: &SubresourceFootprint,
        format: TextureFormat,
    );

    fn set_pipeline(&mut self, pipeline: PipelineId);

    fn set_binding_layout(&mut self, layout: LayoutId);

    fn set_descriptor_table(&mut self, parameter: u32, handle: GpuDescriptorHandle);

    fn set_geometry(&mut self, geometry: &GeometryBinding);

    fn set_viewport(&mut self, width: u32, height: u32);

    fn draw_indexed(&mut self, index_count: u32);

    /// Closes the command list and submits it to the queue.
    fn execute(&mut self) -> Result<(), DeviceError>;

    fn present(&mut self, sync_interval: u32) -> Result<PresentStatus, DeviceError>;

    /// Releases the back buffers, resizes them and recreates their views.
    /// The caller guarantees the GPU is idle.
    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<(), DeviceError>;
}

//! Simulated D3D12 command surface.
//!
//! Nothing is rendered. Resources, views and pipeline objects are tracked in
//! maps, recorded commands are appended to a log, and the queue timeline is
//! modelled by a fence that only advances when the CPU waits on it (or after
//! a configurable number of polls). A [`HeadlessProbe`] shares the state so
//! callers can inspect what the device asked for.

use super::*;
use log::trace;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

const CPU_HEAP_START: usize = 0x1_0000;
const GPU_HEAP_START: u64 = 0x8000_0000;
const DESCRIPTOR_INCREMENT: u32 = 32;

/// One recorded or submitted operation, in the order the device issued it.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reset { allocator: usize },
    TransitionBackBuffer { index: usize, before: ResourceState, after: ResourceState },
    Transition { resource: ResourceId, before: ResourceState, after: ResourceState },
    SetRenderTarget(usize),
    Clear { back_buffer: usize, color: [f32; 4] },
    BindHeap,
    CopyBuffer { dst: ResourceId, src: ResourceId, size: u64 },
    CopyTexture { dst: ResourceId, subresource: u32, src: ResourceId },
    SetPipeline(PipelineId),
    SetLayout(LayoutId),
    SetTable { parameter: u32, handle: GpuDescriptorHandle },
    SetGeometry(GeometryBinding),
    Viewport { width: u32, height: u32 },
    DrawIndexed(u32),
    Execute,
    Signal(u64),
    Present { sync_interval: u32 },
    Resize { width: u32, height: u32 },
}

/// What a descriptor slot currently describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewRecord {
    Texture { resource: ResourceId, format: TextureFormat, mip_levels: u32 },
    Buffer { resource: ResourceId, element_size: u32, element_count: u32 },
    Constants { resource: ResourceId, size: u32 },
}

/// An allocator reset together with the fence state at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorReset {
    pub allocator: usize,
    pub completed: u64,
    /// Fence value signaled after the allocator's previous submission.
    pub required: u64,
}

impl AllocatorReset {
    pub fn is_premature(&self) -> bool {
        self.completed < self.required
    }
}

#[derive(Debug)]
struct SimResource {
    desc: ResourceDesc,
    label: String,
    data: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    capacity: u32,
    width: u32,
    height: u32,
    back_buffer: usize,
    next_id: u64,
    resources: HashMap<u64, SimResource>,
    views: HashMap<usize, ViewRecord>,
    shaders: HashSet<u64>,
    layouts: HashMap<u64, BindingLayoutDesc>,
    pipelines: HashSet<u64>,
    commands: Vec<Command>,
    recording: Option<usize>,
    submitted_allocator: Option<usize>,
    allocator_fences: [u64; FRAME_COUNT],
    resets: Vec<AllocatorReset>,
    completed: u64,
    signaled: u64,
    polls_per_completion: Option<u32>,
    polls: u32,
    lose_device_at_present: Option<String>,
    occluded: bool,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, command: Command) {
        if self.recording.is_none() {
            log::warn!("headless: {command:?} recorded on a closed command list");
        }
        trace!("headless: {command:?}");
        self.commands.push(command);
    }
}

pub struct HeadlessBackend {
    state: Rc<RefCell<SimState>>,
}

impl HeadlessBackend {
    pub fn new(width: u32, height: u32, descriptor_capacity: u32) -> Self {
        let state = SimState {
            capacity: descriptor_capacity,
            width,
            height,
            back_buffer: 0,
            next_id: 0,
            resources: HashMap::new(),
            views: HashMap::new(),
            shaders: HashSet::new(),
            layouts: HashMap::new(),
            pipelines: HashSet::new(),
            commands: Vec::new(),
            recording: None,
            submitted_allocator: None,
            allocator_fences: [0; FRAME_COUNT],
            resets: Vec::new(),
            completed: 0,
            signaled: 0,
            polls_per_completion: None,
            polls: 0,
            lose_device_at_present: None,
            occluded: false,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    #[cfg(test)]
    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: Rc::clone(&self.state),
        }
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn descriptor_heap(&self) -> HeapInfo {
        HeapInfo {
            capacity: self.state.borrow().capacity,
            cpu_start: CpuDescriptorHandle(CPU_HEAP_START),
            gpu_start: GpuDescriptorHandle(GPU_HEAP_START),
            increment: DESCRIPTOR_INCREMENT,
        }
    }

    fn back_buffer_format(&self) -> TextureFormat {
        TextureFormat::Rgba8Unorm
    }

    fn create_resource(&mut self, desc: &ResourceDesc, label: &str) -> Result<ResourceId, DeviceError> {
        let data = match desc {
            ResourceDesc::Buffer { size: 0, .. } => {
                return Err(DeviceError::native("CreateCommittedResource", format!("zero-sized buffer '{label}'")));
            }
            ResourceDesc::Buffer {
                size,
                memory: MemoryKind::Upload,
            } => vec![0; *size as usize],
            _ => Vec::new(),
        };
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        state.resources.insert(
            id,
            SimResource {
                desc: *desc,
                label: label.to_owned(),
                data,
            },
        );
        Ok(ResourceId(id))
    }

    fn write_resource(&mut self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let entry = state
            .resources
            .get_mut(&resource.0)
            .ok_or_else(|| DeviceError::native("Map", format!("unknown resource {resource:?}")))?;
        if !matches!(entry.desc, ResourceDesc::Buffer { memory: MemoryKind::Upload, .. }) {
            return Err(DeviceError::native("Map", format!("'{}' is not CPU-visible", entry.label)));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > entry.data.len() {
            return Err(DeviceError::native("Map", format!("write past the end of '{}'", entry.label)));
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn release_resource(&mut self, resource: ResourceId) {
        let mut state = self.state.borrow_mut();
        if state.resources.remove(&resource.0).is_none() {
            log::warn!("headless: release of unknown resource {resource:?}");
        }
        state.views.retain(|_, view| match view {
            ViewRecord::Texture { resource: r, .. }
            | ViewRecord::Buffer { resource: r, .. }
            | ViewRecord::Constants { resource: r, .. } => *r != resource,
        });
    }

    fn create_texture_view(
        &mut self,
        resource: ResourceId,
        format: TextureFormat,
        mip_levels: u32,
        slot: CpuDescriptorHandle,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if !state.resources.contains_key(&resource.0) {
            return Err(DeviceError::native("CreateShaderResourceView", format!("unknown resource {resource:?}")));
        }
        state.views.insert(slot.0, ViewRecord::Texture { resource, format, mip_levels });
        Ok(())
    }

    fn create_buffer_view(
        &mut self,
        resource: ResourceId,
        element_size: u32,
        element_count: u32,
        slot: CpuDescriptorHandle,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if !state.resources.contains_key(&resource.0) {
            return Err(DeviceError::native("CreateShaderResourceView", format!("unknown resource {resource:?}")));
        }
        state.views.insert(
            slot.0,
            ViewRecord::Buffer {
                resource,
                element_size,
                element_count,
            },
        );
        Ok(())
    }

    fn create_constant_view(&mut self, resource: ResourceId, size: u32, slot: CpuDescriptorHandle) -> Result<(), DeviceError> {
        if size % 256 != 0 {
            return Err(DeviceError::native("CreateConstantBufferView", format!("size {size} is not 256-aligned")));
        }
        let mut state = self.state.borrow_mut();
        state.views.insert(slot.0, ViewRecord::Constants { resource, size });
        Ok(())
    }

    fn compile_shader(&mut self, source: &ShaderSource<'_>) -> Result<ShaderId, ShaderError> {
        // Stand-in for the compiler: the entry point must be defined in the text.
        let signature = format!("{}(", source.entry_point);
        if !source.text.contains(&signature) {
            return Err(ShaderError::Compile {
                file: source.name.to_owned(),
                diagnostics: format!("error X3501: '{}': entrypoint not found", source.entry_point),
            });
        }
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        state.shaders.insert(id);
        Ok(ShaderId(id))
    }

    fn create_binding_layout(&mut self, desc: &BindingLayoutDesc) -> Result<LayoutId, DeviceError> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        state.layouts.insert(id, desc.clone());
        Ok(LayoutId(id))
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineId, DeviceError> {
        let mut state = self.state.borrow_mut();
        let known = state.shaders.contains(&desc.vertex_shader.0)
            && state.shaders.contains(&desc.pixel_shader.0)
            && state.layouts.contains_key(&desc.layout.0);
        if !known {
            return Err(DeviceError::native("CreateGraphicsPipelineState", "unknown shader or layout"));
        }
        let id = state.next_id();
        state.pipelines.insert(id);
        Ok(PipelineId(id))
    }

    fn completed_fence_value(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        if let Some(per) = state.polls_per_completion {
            state.polls += 1;
            if state.polls >= per && state.completed < state.signaled {
                state.polls = 0;
                state.completed += 1;
            }
        }
        state.completed
    }

    fn signal_fence(&mut self, value: u64) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if value <= state.signaled {
            return Err(DeviceError::native("Signal", format!("fence value {value} is not increasing")));
        }
        state.signaled = value;
        if let Some(allocator) = state.submitted_allocator.take() {
            state.allocator_fences[allocator] = value;
        }
        state.commands.push(Command::Signal(value));
        Ok(())
    }

    fn wait_for_fence(&mut self, value: u64) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if value > state.signaled {
            // A real wait would never return.
            return Err(DeviceError::native(
                "WaitForSingleObject",
                format!("waiting for fence value {value}, last signaled {}", state.signaled),
            ));
        }
        state.completed = state.completed.max(value);
        Ok(())
    }

    fn current_back_buffer(&self) -> usize {
        self.state.borrow().back_buffer
    }

    fn reset_commands(&mut self, allocator: usize) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if state.recording.is_some() {
            return Err(DeviceError::native("Reset", "command list is still open"));
        }
        let reset = AllocatorReset {
            allocator,
            completed: state.completed,
            required: state.allocator_fences[allocator % FRAME_COUNT],
        };
        if reset.is_premature() {
            log::error!("headless: allocator {allocator} reset while GPU is at {}", reset.completed);
        }
        state.resets.push(reset);
        state.recording = Some(allocator % FRAME_COUNT);
        state.commands.push(Command::Reset { allocator });
        Ok(())
    }

    fn transition_back_buffer(&mut self, index: usize, before: ResourceState, after: ResourceState) {
        self.state
            .borrow_mut()
            .record(Command::TransitionBackBuffer { index, before, after });
    }

    fn transition_resource(&mut self, resource: ResourceId, before: ResourceState, after: ResourceState) {
        self.state
            .borrow_mut()
            .record(Command::Transition { resource, before, after });
    }

    fn set_render_target(&mut self, back_buffer: usize) {
        self.state.borrow_mut().record(Command::SetRenderTarget(back_buffer));
    }

    fn clear_render_target(&mut self, back_buffer: usize, color: [f32; 4]) {
        self.state.borrow_mut().record(Command::Clear { back_buffer, color });
    }

    fn bind_descriptor_heap(&mut self) {
        self.state.borrow_mut().record(Command::BindHeap);
    }

    fn copy_buffer(&mut self, dst: ResourceId, src: ResourceId, size: u64) {
        self.state.borrow_mut().record(Command::CopyBuffer { dst, src, size });
    }

    fn copy_texture_region(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        src: ResourceId,
        _footprint: &SubresourceFootprint,
        _format: TextureFormat,
    ) {
        self.state
            .borrow_mut()
            .record(Command::CopyTexture { dst, subresource, src });
    }

    fn set_pipeline(&mut self, pipeline: PipelineId) {
        self.state.borrow_mut().record(Command::SetPipeline(pipeline));
    }

    fn set_binding_layout(&mut self, layout: LayoutId) {
        self.state.borrow_mut().record(Command::SetLayout(layout));
    }

    fn set_descriptor_table(&mut self, parameter: u32, handle: GpuDescriptorHandle) {
        self.state
            .borrow_mut()
            .record(Command::SetTable { parameter, handle });
    }

    fn set_geometry(&mut self, geometry: &GeometryBinding) {
        self.state.borrow_mut().record(Command::SetGeometry(*geometry));
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.state.borrow_mut().record(Command::Viewport { width, height });
    }

    fn draw_indexed(&mut self, index_count: u32) {
        self.state.borrow_mut().record(Command::DrawIndexed(index_count));
    }

    fn execute(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let allocator = state
            .recording
            .take()
            .ok_or_else(|| DeviceError::native("Close", "command list is not open"))?;
        state.submitted_allocator = Some(allocator);
        state.commands.push(Command::Execute);
        Ok(())
    }

    fn present(&mut self, sync_interval: u32) -> Result<PresentStatus, DeviceError> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.lose_device_at_present.take() {
            return Err(DeviceError::DeviceLost { reason });
        }
        state.commands.push(Command::Present { sync_interval });
        if state.occluded {
            return Ok(PresentStatus::Occluded);
        }
        state.back_buffer = (state.back_buffer + 1) % FRAME_COUNT;
        Ok(PresentStatus::Presented)
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if state.recording.is_some() {
            return Err(DeviceError::native("ResizeBuffers", "command list is still open"));
        }
        if state.completed < state.signaled {
            return Err(DeviceError::native("ResizeBuffers", "back buffers are still referenced by the GPU"));
        }
        state.width = width;
        state.height = height;
        state.back_buffer = 0;
        state.commands.push(Command::Resize { width, height });
        Ok(())
    }
}

/// Shared view into a [`HeadlessBackend`] after it has been handed to a device.
#[cfg(test)]
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Rc<RefCell<SimState>>,
}

#[cfg(test)]
impl HeadlessProbe {
    pub fn commands(&self) -> Vec<Command> {
        self.state.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    pub fn allocator_resets(&self) -> Vec<AllocatorReset> {
        self.state.borrow().resets.clone()
    }

    pub fn view_at(&self, slot: CpuDescriptorHandle) -> Option<ViewRecord> {
        self.state.borrow().views.get(&slot.0).copied()
    }

    pub fn is_alive(&self, resource: ResourceId) -> bool {
        self.state.borrow().resources.contains_key(&resource.0)
    }

    pub fn live_resources(&self) -> usize {
        self.state.borrow().resources.len()
    }

    pub fn resource_label(&self, resource: ResourceId) -> Option<String> {
        self.state.borrow().resources.get(&resource.0).map(|r| r.label.clone())
    }

    /// Contents of an upload buffer.
    pub fn resource_data(&self, resource: ResourceId) -> Option<Vec<u8>> {
        self.state.borrow().resources.get(&resource.0).map(|r| r.data.clone())
    }

    pub fn layout(&self, layout: LayoutId) -> Option<BindingLayoutDesc> {
        self.state.borrow().layouts.get(&layout.0).cloned()
    }

    pub fn pipeline_count(&self) -> usize {
        self.state.borrow().pipelines.len()
    }

    pub fn swapchain_size(&self) -> (u32, u32) {
        let state = self.state.borrow();
        (state.width, state.height)
    }

    pub fn completed(&self) -> u64 {
        self.state.borrow().completed
    }

    pub fn signaled(&self) -> u64 {
        self.state.borrow().signaled
    }

    /// Lets the simulated GPU finish one signal every `polls` fence queries
    /// instead of only on explicit waits.
    pub fn complete_after_polls(&self, polls: u32) {
        self.state.borrow_mut().polls_per_completion = Some(polls.max(1));
    }

    pub fn lose_device_at_next_present(&self, reason: &str) {
        self.state.borrow_mut().lose_device_at_present = Some(reason.to_owned());
    }

    pub fn set_occluded(&self, occluded: bool) {
        self.state.borrow_mut().occluded = occluded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premature_allocator_reset_is_reported() {
        let mut backend = HeadlessBackend::new(64, 64, 8);
        let probe = backend.probe();
        backend.reset_commands(0).unwrap();
        backend.execute().unwrap();
        backend.signal_fence(1).unwrap();
        // No wait: the GPU has not reached 1 yet.
        backend.reset_commands(0).unwrap();
        let resets = probe.allocator_resets();
        assert!(!resets[0].is_premature());
        assert!(resets[1].is_premature());
    }

    #[test]
    fn waits_advance_the_timeline() {
        let mut backend = HeadlessBackend::new(64, 64, 8);
        backend.signal_fence(1).unwrap();
        backend.signal_fence(2).unwrap();
        assert_eq!(backend.completed_fence_value(), 0);
        backend.wait_for_fence(1).unwrap();
        assert_eq!(backend.completed_fence_value(), 1);
        assert!(backend.wait_for_fence(3).is_err());
        assert!(backend.signal_fence(2).is_err());
    }

    #[test]
    fn polling_completes_signals_gradually() {
        let mut backend = HeadlessBackend::new(64, 64, 8);
        backend.probe().complete_after_polls(2);
        backend.signal_fence(1).unwrap();
        assert_eq!(backend.completed_fence_value(), 0);
        assert_eq!(backend.completed_fence_value(), 1);
        assert_eq!(backend.completed_fence_value(), 1);
    }

    #[test]
    fn shader_without_entry_point_fails_to_compile() {
        let mut backend = HeadlessBackend::new(64, 64, 8);
        let source = ShaderSource {
            name: "Test.hlsl",
            text: "float4 PSMain(float4 p : SV_Position) : SV_Target { return p; }",
            entry_point: "VSMain",
            target: "vs_5_0",
            defines: &[],
        };
        assert!(matches!(
            backend.compile_shader(&source),
            Err(ShaderError::Compile { .. })
        ));
        let source = ShaderSource {
            entry_point: "PSMain",
            target: "ps_5_0",
            ..source
        };
        assert!(backend.compile_shader(&source).is_ok());
    }

    #[test]
    fn upload_writes_are_bounds_checked() {
        let mut backend = HeadlessBackend::new(64, 64, 8);
        let probe = backend.probe();
        let staging = backend
            .create_resource(
                &ResourceDesc::Buffer {
                    size: 8,
                    memory: MemoryKind::Upload,
                },
                "staging",
            )
            .unwrap();
        backend.write_resource(staging, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(probe.resource_data(staging).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(backend.write_resource(staging, 6, &[0; 4]).is_err());
        backend.release_resource(staging);
        assert!(!probe.is_alive(staging));
    }
}

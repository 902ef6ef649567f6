//! The per-process graphics device and its frame state machine.
//!
//! A frame is `pre_render` → `render` → any number of `draw_full_screen` →
//! `present` → `post_render`. Calls out of that order fail with
//! [`DeviceError::InvalidPhase`] and leave the device untouched.

use crate::format::TextureFormat;
use crate::frame::{FramePacer, FrameState};
use crate::geometry::FullScreenGeometry;
use crate::gpu::{
    DescriptorHeapAllocator, DescriptorSlot, DeviceError, GpuBackend, PresentStatus, ResourceId, ResourceState,
};
use crate::material::Material;
use crate::render_queue::RenderQueue;
use crate::retire::{Retiree, RetirementQueue};
use crate::shader::{Shader, ShaderCache, ShaderKind, ViewConstants};
use crate::structured_buffer::StructuredBuffer;
use crate::texture::{Texture, TextureParams};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::rc::Rc;

/// Deferred unit of GPU work, run once on the open command list.
pub type RenderCommand = Box<dyn FnOnce(&mut GraphicsDevice) -> Result<(), DeviceError>>;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub width: u32,
    pub height: u32,
    pub descriptor_capacity: u32,
    pub vsync: bool,
    pub clear_color: [f32; 4],
    pub shader_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            descriptor_capacity: 128,
            vsync: false,
            clear_color: [1.0, 1.0, 1.0, 1.0],
            shader_dir: PathBuf::from("Shaders"),
        }
    }
}

pub struct GraphicsDevice {
    backend: Box<dyn GpuBackend>,
    config: DeviceConfig,
    descriptors: DescriptorHeapAllocator,
    queue: RenderQueue<RenderCommand>,
    retirement: RetirementQueue,
    pacer: FramePacer,
    state: FrameState,
    back_buffer: usize,
    pending_resize: Option<(u32, u32)>,
    occluded: bool,
    geometry: FullScreenGeometry,
    shaders: ShaderCache,
    white: Option<Rc<Texture>>,
    black: Option<Rc<Texture>>,
    view_constants: ViewConstants,
    frames: u64,
    shut_down: bool,
}

impl GraphicsDevice {
    pub fn new(mut backend: Box<dyn GpuBackend>, config: DeviceConfig) -> Result<Self, DeviceError> {
        let descriptors = DescriptorHeapAllocator::new(backend.descriptor_heap())?;
        let geometry = FullScreenGeometry::new(backend.as_mut())?;
        let back_buffer = backend.current_back_buffer();

        let mut device = Self {
            backend,
            config,
            descriptors,
            queue: RenderQueue::new(),
            retirement: RetirementQueue::new(),
            pacer: FramePacer::new(),
            state: FrameState::Idle,
            back_buffer,
            pending_resize: None,
            occluded: false,
            geometry,
            shaders: ShaderCache::default(),
            white: None,
            black: None,
            view_constants: ViewConstants::default(),
            frames: 0,
            shut_down: false,
        };
        device.white = Some(device.solid_texture("DefaultWhite", [0xff; 4])?);
        device.black = Some(device.solid_texture("DefaultBlack", [0, 0, 0, 0xff])?);

        info!(
            "graphics device ready: {} backend, {}x{}, {} descriptors",
            device.backend.name(),
            device.config.width,
            device.config.height,
            device.descriptors.capacity()
        );
        Ok(device)
    }

    fn solid_texture(&mut self, name: &str, rgba: [u8; 4]) -> Result<Rc<Texture>, DeviceError> {
        Texture::from_pixels(
            self,
            &TextureParams {
                name,
                width: 1,
                height: 1,
                mip_levels: 1,
                format: TextureFormat::Rgba8Unorm,
                data: &rgba,
            },
        )
    }

    pub(crate) fn expect_phase(&self, expected: FrameState, operation: &'static str) -> Result<(), DeviceError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DeviceError::InvalidPhase {
                operation,
                expected,
                actual: self.state,
            })
        }
    }

    /// Waits for the allocator about to be reused, reopens the command list
    /// and prepares the back buffer for drawing.
    pub fn pre_render(&mut self) -> Result<(), DeviceError> {
        self.expect_phase(FrameState::Idle, "pre_render")?;
        if let Some((width, height)) = self.pending_resize.take() {
            self.resize_now(width, height)?;
        }
        self.state = FrameState::PreRendering;

        self.back_buffer = self.backend.current_back_buffer();
        let required = self.pacer.required_for(self.back_buffer);
        if self.backend.completed_fence_value() < required {
            self.backend.wait_for_fence(required)?;
        }
        self.collect_retired();

        let backend = self.backend.as_mut();
        backend.reset_commands(self.back_buffer)?;
        backend.transition_back_buffer(self.back_buffer, ResourceState::Present, ResourceState::RenderTarget);
        backend.set_render_target(self.back_buffer);
        backend.clear_render_target(self.back_buffer, self.config.clear_color);
        backend.bind_descriptor_heap();

        self.state = FrameState::Recording;
        Ok(())
    }

    /// Runs every queued command in enqueue order.
    pub fn render(&mut self) -> Result<(), DeviceError> {
        self.expect_phase(FrameState::Recording, "render")?;
        while let Some(command) = self.queue.next() {
            command(self)?;
        }
        debug_assert!(self.queue.is_empty());
        Ok(())
    }

    /// Draws the full-screen triangle with `material`. A material whose
    /// shaders failed to compile is skipped.
    pub fn draw_full_screen(&mut self, material: &Material) -> Result<(), DeviceError> {
        self.expect_phase(FrameState::Recording, "draw_full_screen")?;
        let pipeline = match material.pipeline(self) {
            Ok(pipeline) => pipeline,
            Err(e @ DeviceError::ShaderUnusable(_)) => {
                material.note_skipped(&e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(layout) = material.pixel_shader().layout() else {
            return Ok(());
        };

        let geometry = self.geometry.binding();
        self.backend.set_pipeline(pipeline);
        self.backend.set_binding_layout(layout);
        self.backend.set_geometry(&geometry);
        material.bind_parameters(self)?;
        self.backend.set_viewport(self.config.width, self.config.height);
        self.backend.draw_indexed(self.geometry.index_count());
        Ok(())
    }

    /// Submits the frame, presents it and signals the fence.
    pub fn present(&mut self) -> Result<(), DeviceError> {
        self.expect_phase(FrameState::Recording, "present")?;
        self.state = FrameState::Presenting;

        self.backend
            .transition_back_buffer(self.back_buffer, ResourceState::RenderTarget, ResourceState::Present);
        self.backend.execute()?;

        let sync_interval = u32::from(self.config.vsync);
        match self.backend.present(sync_interval) {
            Ok(status) => self.occluded = status == PresentStatus::Occluded,
            Err(DeviceError::DeviceLost { reason }) => {
                error!("device lost during present: {reason}");
                return Err(DeviceError::DeviceLost { reason });
            }
            Err(e) => return Err(e),
        }

        let value = self.pacer.submit(self.back_buffer);
        self.backend.signal_fence(value)
    }

    /// Waits for the frame just submitted and releases what it retired.
    pub fn post_render(&mut self) -> Result<(), DeviceError> {
        self.expect_phase(FrameState::Presenting, "post_render")?;
        self.backend.wait_for_fence(self.pacer.last_submitted())?;
        self.collect_retired();
        self.state = FrameState::Idle;
        self.frames += 1;
        Ok(())
    }

    /// Resizes the swapchain now, or at the next `pre_render` when called
    /// mid-frame. Zero or unchanged sizes are ignored.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        if self.state != FrameState::Idle {
            self.pending_resize = Some((width, height));
            return Ok(());
        }
        self.resize_now(width, height)
    }

    fn resize_now(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        if (width, height) == (self.config.width, self.config.height) {
            return Ok(());
        }
        self.wait_idle()?;
        self.backend.resize_swapchain(width, height)?;
        self.config.width = width;
        self.config.height = height;
        self.back_buffer = self.backend.current_back_buffer();
        info!("swapchain resized to {width}x{height}");
        Ok(())
    }

    /// Blocks until all submitted work has completed.
    pub fn wait_idle(&mut self) -> Result<(), DeviceError> {
        let last = self.pacer.last_submitted();
        if self.backend.completed_fence_value() < last {
            self.backend.wait_for_fence(last)?;
        }
        Ok(())
    }

    /// Drains the GPU and releases everything waiting for retirement.
    pub fn shutdown(&mut self) -> Result<(), DeviceError> {
        if self.shut_down {
            return Ok(());
        }
        self.wait_idle()?;
        for texture in [self.white.take(), self.black.take()].into_iter().flatten() {
            self.release_texture(&texture);
        }
        let constants: Vec<_> = self.shaders.drain().filter_map(|s| s.constant_buffer()).collect();
        for (resource, slot) in constants {
            self.retire(vec![resource], Some(slot), 0);
        }
        for retiree in self.retirement.drain_all() {
            self.release_retiree(retiree);
        }
        self.geometry.release(self.backend.as_mut());
        let in_use = self.descriptors.capacity() - self.descriptors.free_count();
        if in_use > 0 {
            warn!("{in_use} descriptors still in use at shutdown");
        }
        self.shut_down = true;
        info!("graphics device shut down after {} frames", self.frames);
        Ok(())
    }

    pub fn enqueue(&mut self, command: RenderCommand) {
        self.queue.push(command);
    }

    pub fn allocate_descriptor(&mut self) -> Result<DescriptorSlot, DeviceError> {
        Ok(self.descriptors.alloc()?)
    }

    /// Queues GPU objects for release once the frame being recorded (or the
    /// next one, between frames) has completed on the GPU.
    pub(crate) fn retire(&mut self, resources: Vec<ResourceId>, slot: Option<DescriptorSlot>, staging_bytes: u64) {
        let fence_value = self.pacer.pending_value();
        debug!(
            "retiring {} resources at fence {fence_value} ({staging_bytes} staging bytes)",
            resources.len()
        );
        self.retirement.push(Retiree {
            fence_value,
            resources,
            slot,
            staging_bytes,
        });
    }

    fn collect_retired(&mut self) {
        let completed = self.backend.completed_fence_value();
        for retiree in self.retirement.collect(completed) {
            self.release_retiree(retiree);
        }
    }

    fn release_retiree(&mut self, retiree: Retiree) {
        for resource in retiree.resources {
            self.backend.release_resource(resource);
        }
        if let Some(slot) = retiree.slot {
            if let Err(e) = self.descriptors.free(slot) {
                error!("releasing descriptor: {e}");
            }
        }
    }

    pub fn release_texture(&mut self, texture: &Texture) {
        texture.release(self);
    }

    pub fn release_buffer(&mut self, buffer: &StructuredBuffer) {
        buffer.release(self);
    }

    /// Compiled shader of `kind`, compiling it on first request.
    pub fn shader(&mut self, kind: ShaderKind) -> Result<Rc<Shader>, DeviceError> {
        if let Some(shader) = self.shaders.get(kind) {
            return Ok(shader);
        }
        let shader = Shader::compile(self, kind)?;
        Ok(self.shaders.insert(shader))
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn GpuBackend {
        self.backend.as_mut()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Bound in place of textures that are missing, disabled or not yet
    /// resident.
    pub fn fallback_texture(&self) -> Option<&Rc<Texture>> {
        self.white.as_ref()
    }

    pub fn view_constants(&self) -> &ViewConstants {
        &self.view_constants
    }

    pub fn view_constants_mut(&mut self) -> &mut ViewConstants {
        &mut self.view_constants
    }

    pub fn vsync(&self) -> bool {
        self.config.vsync
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.config.vsync = vsync;
    }

    pub fn back_buffer_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    pub fn frame_state(&self) -> FrameState {
        self.state
    }

    pub fn is_occluded(&self) -> bool {
        self.occluded
    }

    pub fn completed_fence_value(&self) -> u64 {
        self.backend.completed_fence_value()
    }

    pub fn queued_commands(&self) -> usize {
        self.queue.len()
    }

    /// Upload memory handed to retirement that the GPU may still read.
    pub fn staging_bytes_in_flight(&self) -> u64 {
        self.retirement.staging_bytes()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gpu::DescriptorError;
    use crate::gpu::headless::{Command, HeadlessBackend, HeadlessProbe, ViewRecord};
    use crate::shader::FULL_SCREEN_SHADER;
    use tempfile::TempDir;

    pub(crate) fn headless_device_with(config: DeviceConfig) -> (GraphicsDevice, HeadlessProbe) {
        let backend = HeadlessBackend::new(config.width, config.height, config.descriptor_capacity);
        let probe = backend.probe();
        let device = GraphicsDevice::new(Box::new(backend), config).unwrap();
        (device, probe)
    }

    pub(crate) fn headless_device() -> (GraphicsDevice, HeadlessProbe) {
        headless_device_with(DeviceConfig {
            width: 640,
            height: 480,
            shader_dir: PathBuf::from("does-not-exist"),
            ..DeviceConfig::default()
        })
    }

    /// Device reading the real full-screen shader from a temp directory.
    pub(crate) fn device_with_shaders() -> (GraphicsDevice, HeadlessProbe, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(FULL_SCREEN_SHADER),
            include_str!("../Shaders/FullScreenRect.hlsl"),
        )
        .unwrap();
        let (device, probe) = headless_device_with(DeviceConfig {
            width: 640,
            height: 480,
            shader_dir: dir.path().to_path_buf(),
            ..DeviceConfig::default()
        });
        (device, probe, dir)
    }

    pub(crate) fn run_frame_with(
        device: &mut GraphicsDevice,
        draw: impl FnOnce(&mut GraphicsDevice) -> Result<(), DeviceError>,
    ) {
        device.pre_render().unwrap();
        device.render().unwrap();
        draw(device).unwrap();
        device.present().unwrap();
        device.post_render().unwrap();
    }

    fn run_frame(device: &mut GraphicsDevice) {
        run_frame_with(device, |_| Ok(()));
    }

    fn pixels(device: &mut GraphicsDevice, name: &str) -> Rc<Texture> {
        Texture::from_pixels(
            device,
            &TextureParams {
                name,
                width: 4,
                height: 4,
                mip_levels: 1,
                format: TextureFormat::Rgba8Unorm,
                data: &[0x80; 64],
            },
        )
        .unwrap()
    }

    #[test]
    fn four_textures_and_a_buffer_are_resident_after_one_frame() {
        let (mut device, probe) = headless_device();
        run_frame(&mut device);

        let textures: Vec<_> = (0..4).map(|i| pixels(&mut device, &format!("t{i}"))).collect();
        let buffer = StructuredBuffer::from_slice(&mut device, "weights", &[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(device.queued_commands(), 5);

        run_frame(&mut device);

        assert_eq!(device.queued_commands(), 0);
        for texture in &textures {
            assert!(texture.is_resident());
            assert_eq!(texture.staging_bytes(), 0);
            assert!(matches!(
                probe.view_at(texture.slot().unwrap().cpu),
                Some(ViewRecord::Texture { .. })
            ));
        }
        assert!(buffer.is_resident());
        assert_eq!(
            probe.view_at(buffer.slot().unwrap().cpu),
            Some(ViewRecord::Buffer {
                resource: buffer.resource().unwrap(),
                element_size: 4,
                element_count: 3,
            })
        );
        assert_eq!(device.staging_bytes_in_flight(), 0);
    }

    #[test]
    fn staging_buffers_are_released_after_the_fence() {
        let (mut device, probe) = headless_device();
        run_frame(&mut device);
        let texture = pixels(&mut device, "t");
        let alive = probe.live_resources();

        device.pre_render().unwrap();
        device.render().unwrap();
        // Copy recorded but not executed: staging must survive.
        assert_eq!(probe.live_resources(), alive);
        assert!(device.staging_bytes_in_flight() > 0);
        device.present().unwrap();
        device.post_render().unwrap();

        assert_eq!(probe.live_resources(), alive - 1);
        assert!(probe.is_alive(texture.resource().unwrap()));
    }

    #[test]
    fn allocators_are_never_reset_early() {
        let (mut device, probe) = headless_device();
        probe.complete_after_polls(3);
        for _ in 0..8 {
            run_frame(&mut device);
        }
        let resets = probe.allocator_resets();
        assert_eq!(resets.len(), 8);
        assert!(resets.iter().all(|r| !r.is_premature()));
        let allocators: Vec<_> = resets.iter().map(|r| r.allocator).collect();
        assert_eq!(allocators, vec![0, 1, 0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn frame_phases_must_run_in_order() {
        let (mut device, _probe) = headless_device();
        assert!(matches!(
            device.render(),
            Err(DeviceError::InvalidPhase { operation: "render", .. })
        ));
        assert!(matches!(device.present(), Err(DeviceError::InvalidPhase { .. })));
        assert!(matches!(device.post_render(), Err(DeviceError::InvalidPhase { .. })));
        device.pre_render().unwrap();
        assert!(matches!(device.pre_render(), Err(DeviceError::InvalidPhase { .. })));
        assert_eq!(device.frame_state(), FrameState::Recording);
        device.present().unwrap();
        assert_eq!(device.frame_state(), FrameState::Presenting);
        device.post_render().unwrap();
        assert_eq!(device.frame_state(), FrameState::Idle);
    }

    #[test]
    fn frame_records_in_native_order() {
        let (mut device, probe) = headless_device();
        run_frame(&mut device);
        probe.clear_commands();
        run_frame(&mut device);
        let commands = probe.commands();
        assert_eq!(
            commands,
            vec![
                Command::Reset { allocator: 1 },
                Command::TransitionBackBuffer {
                    index: 1,
                    before: ResourceState::Present,
                    after: ResourceState::RenderTarget,
                },
                Command::SetRenderTarget(1),
                Command::Clear {
                    back_buffer: 1,
                    color: [1.0; 4],
                },
                Command::BindHeap,
                Command::TransitionBackBuffer {
                    index: 1,
                    before: ResourceState::RenderTarget,
                    after: ResourceState::Present,
                },
                Command::Execute,
                Command::Present { sync_interval: 0 },
                Command::Signal(2),
            ]
        );
    }

    #[test]
    fn device_loss_at_present_is_fatal() {
        let (mut device, probe) = headless_device();
        probe.lose_device_at_next_present("DXGI_ERROR_DEVICE_HUNG");
        device.pre_render().unwrap();
        device.render().unwrap();
        match device.present() {
            Err(DeviceError::DeviceLost { reason }) => assert_eq!(reason, "DXGI_ERROR_DEVICE_HUNG"),
            other => panic!("expected device loss, got {other:?}"),
        }
    }

    #[test]
    fn occlusion_is_reported() {
        let (mut device, probe) = headless_device();
        probe.set_occluded(true);
        run_frame(&mut device);
        assert!(device.is_occluded());
        probe.set_occluded(false);
        run_frame(&mut device);
        assert!(!device.is_occluded());
    }

    #[test]
    fn vsync_sets_the_present_interval() {
        let (mut device, probe) = headless_device();
        device.set_vsync(true);
        run_frame(&mut device);
        assert!(probe.commands().contains(&Command::Present { sync_interval: 1 }));
    }

    #[test]
    fn resize_mid_frame_is_deferred() {
        let (mut device, probe) = headless_device();
        device.pre_render().unwrap();
        device.resize(800, 600).unwrap();
        assert_eq!(probe.swapchain_size(), (640, 480));
        device.present().unwrap();
        device.post_render().unwrap();
        assert_eq!(device.back_buffer_size(), (640, 480));

        device.pre_render().unwrap();
        assert_eq!(probe.swapchain_size(), (800, 600));
        assert_eq!(device.back_buffer_size(), (800, 600));
        device.present().unwrap();
        device.post_render().unwrap();
    }

    #[test]
    fn zero_or_unchanged_resize_is_ignored() {
        let (mut device, probe) = headless_device();
        device.resize(0, 600).unwrap();
        device.resize(640, 480).unwrap();
        assert!(!probe.commands().iter().any(|c| matches!(c, Command::Resize { .. })));
        device.resize(1024, 768).unwrap();
        assert_eq!(probe.swapchain_size(), (1024, 768));
    }

    #[test]
    fn descriptor_exhaustion_is_deterministic() {
        let (mut device, _probe) = headless_device_with(DeviceConfig {
            descriptor_capacity: 3,
            shader_dir: PathBuf::from("does-not-exist"),
            ..DeviceConfig::default()
        });
        // White and black defaults hold two slots.
        let _third = pixels(&mut device, "fits");
        for _ in 0..2 {
            assert!(matches!(
                device.allocate_descriptor(),
                Err(DeviceError::Descriptor(DescriptorError::Exhausted { capacity: 3 }))
            ));
        }
    }

    #[test]
    fn released_slot_waits_for_the_fence() {
        let (mut device, _probe) = headless_device_with(DeviceConfig {
            descriptor_capacity: 3,
            shader_dir: PathBuf::from("does-not-exist"),
            ..DeviceConfig::default()
        });
        let texture = pixels(&mut device, "short-lived");
        run_frame(&mut device);
        let slot = texture.slot().unwrap();

        device.pre_render().unwrap();
        device.release_texture(&texture);
        assert!(device.allocate_descriptor().is_err());
        device.render().unwrap();
        device.present().unwrap();
        device.post_render().unwrap();

        assert_eq!(device.allocate_descriptor().unwrap(), slot);
    }

    #[test]
    fn release_before_upload_cancels_the_copy() {
        let (mut device, probe) = headless_device();
        let texture = pixels(&mut device, "never drawn");
        let resource = texture.resource().unwrap();
        device.release_texture(&texture);
        run_frame(&mut device);
        assert!(!probe.is_alive(resource));
        assert!(
            !probe
                .commands()
                .iter()
                .any(|c| matches!(c, Command::CopyTexture { dst, .. } if *dst == resource))
        );
    }

    #[test]
    fn shutdown_releases_everything_retired() {
        let (mut device, probe) = headless_device();
        let texture = pixels(&mut device, "t");
        run_frame(&mut device);
        let resource = texture.resource().unwrap();
        device.release_texture(&texture);
        device.shutdown().unwrap();
        assert!(!probe.is_alive(resource));
        assert_eq!(device.staging_bytes_in_flight(), 0);
        // Default textures are returned too.
        assert_eq!(device.descriptors.free_count(), device.descriptors.capacity());
        assert_eq!(probe.live_resources(), 0);
    }
}

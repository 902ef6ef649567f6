//! Shader pairs plus their texture bindings, drawn through one call site.

use crate::device::GraphicsDevice;
use crate::geometry::SCREEN_VERTEX_LAYOUT;
use crate::gpu::{DescriptorKind, DeviceError, GpuDescriptorHandle, PipelineDesc, PipelineId};
use crate::neural_model::NeuralModel;
use crate::shader::Shader;
use crate::structured_buffer::StructuredBuffer;
use crate::texture::Texture;
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub struct TextureSlot {
    name: String,
    texture: Option<Rc<Texture>>,
    pub enabled: bool,
}

impl TextureSlot {
    pub fn new(name: impl Into<String>, texture: Option<Rc<Texture>>) -> Self {
        Self {
            name: name.into(),
            texture,
            enabled: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn texture(&self) -> Option<&Rc<Texture>> {
        self.texture.as_ref()
    }

    /// Descriptor of the texture if it is enabled and resident.
    pub fn descriptor(&self) -> Option<GpuDescriptorHandle> {
        if !self.enabled {
            return None;
        }
        self.texture.as_ref().and_then(|t| t.descriptor())
    }
}

/// Tables collected for one draw. Nothing reaches the command list until
/// [`BindContext::commit`] has checked them against the pixel shader's layout.
pub struct BindContext<'a> {
    pub device: &'a mut GraphicsDevice,
    shader: &'a Shader,
    tables: Vec<(DescriptorKind, GpuDescriptorHandle)>,
}

impl<'a> BindContext<'a> {
    fn new(device: &'a mut GraphicsDevice, shader: &'a Shader) -> Self {
        Self {
            device,
            shader,
            tables: Vec::new(),
        }
    }

    /// Binds each slot, or the default white texture when the slot is
    /// disabled, empty or not yet uploaded.
    pub fn bind_texture_slots(&mut self, slots: &[TextureSlot]) -> Result<(), DeviceError> {
        for slot in slots {
            let handle = slot
                .descriptor()
                .or_else(|| self.device.fallback_texture().and_then(|t| t.descriptor()))
                .ok_or_else(|| DeviceError::NotResident(slot.name().to_owned()))?;
            self.tables.push((DescriptorKind::Srv, handle));
        }
        Ok(())
    }

    pub fn bind_buffer(&mut self, buffer: &StructuredBuffer) -> Result<(), DeviceError> {
        let handle = buffer
            .descriptor()
            .ok_or_else(|| DeviceError::NotResident(buffer.label().to_owned()))?;
        self.tables.push((DescriptorKind::Srv, handle));
        Ok(())
    }

    pub fn bind_constants(&mut self) -> Result<(), DeviceError> {
        let constants = *self.device.view_constants();
        if let Some(handle) = self.shader.write_constants(self.device, &constants)? {
            self.tables.push((DescriptorKind::Cbv, handle));
        }
        Ok(())
    }

    /// Records the collected tables, parameter `i` taking table `i`. Fails
    /// without recording anything unless every declared parameter gets a
    /// table of its kind.
    fn commit(self) -> Result<(), DeviceError> {
        let declared: Vec<DescriptorKind> = self.shader.kind().decl().parameter_kinds().collect();
        let bound: Vec<DescriptorKind> = self.tables.iter().map(|(kind, _)| *kind).collect();
        if bound != declared {
            return Err(DeviceError::InvalidArgument(format!(
                "{:?} declares {declared:?} but {bound:?} were bound",
                self.shader.kind()
            )));
        }
        let backend = self.device.backend_mut();
        for (parameter, (_, handle)) in self.tables.iter().enumerate() {
            backend.set_descriptor_table(parameter as u32, *handle);
        }
        Ok(())
    }
}

/// Binds a material's parameters for a draw.
pub trait ParameterBinder {
    fn bind(&self, slots: &[TextureSlot], ctx: &mut BindContext<'_>) -> Result<(), DeviceError>;

    /// Shader resource views this binder fills after the texture slots.
    fn buffer_count(&self) -> usize {
        0
    }

    /// Releases GPU objects the binder created for itself.
    fn release(&self, _device: &mut GraphicsDevice) {}
}

/// Texture tables, then the constant buffer.
pub struct StandardBinder;

impl ParameterBinder for StandardBinder {
    fn bind(&self, slots: &[TextureSlot], ctx: &mut BindContext<'_>) -> Result<(), DeviceError> {
        ctx.bind_texture_slots(slots)?;
        ctx.bind_constants()
    }
}

/// Feature grids, decoder weights and biases, then the constant buffer.
pub struct NeuralBinder {
    model: Rc<RefCell<NeuralModel>>,
}

impl NeuralBinder {
    pub fn new(model: Rc<RefCell<NeuralModel>>) -> Self {
        Self { model }
    }
}

impl ParameterBinder for NeuralBinder {
    fn bind(&self, slots: &[TextureSlot], ctx: &mut BindContext<'_>) -> Result<(), DeviceError> {
        ctx.bind_texture_slots(slots)?;
        let (weights, biases) = self.model.borrow_mut().gpu_buffers(ctx.device)?;
        ctx.bind_buffer(&weights)?;
        ctx.bind_buffer(&biases)?;
        ctx.bind_constants()
    }

    fn buffer_count(&self) -> usize {
        2
    }

    fn release(&self, device: &mut GraphicsDevice) {
        self.model.borrow_mut().release_gpu_buffers(device);
    }
}

pub struct Material {
    name: String,
    vertex_shader: Rc<Shader>,
    pixel_shader: Rc<Shader>,
    slots: Vec<TextureSlot>,
    binder: Box<dyn ParameterBinder>,
    pipeline: Cell<Option<PipelineId>>,
    skip_logged: Cell<bool>,
}

impl Material {
    pub fn new(
        name: &str,
        vertex_shader: Rc<Shader>,
        pixel_shader: Rc<Shader>,
        slots: Vec<TextureSlot>,
    ) -> Result<Self, DeviceError> {
        Self::with_binder(name, vertex_shader, pixel_shader, slots, Box::new(StandardBinder))
    }

    pub fn neural(
        name: &str,
        vertex_shader: Rc<Shader>,
        pixel_shader: Rc<Shader>,
        slots: Vec<TextureSlot>,
        model: Rc<RefCell<NeuralModel>>,
    ) -> Result<Self, DeviceError> {
        Self::with_binder(name, vertex_shader, pixel_shader, slots, Box::new(NeuralBinder::new(model)))
    }

    pub fn with_binder(
        name: &str,
        vertex_shader: Rc<Shader>,
        pixel_shader: Rc<Shader>,
        slots: Vec<TextureSlot>,
        binder: Box<dyn ParameterBinder>,
    ) -> Result<Self, DeviceError> {
        let decl = pixel_shader.kind().decl();
        let expected = decl.srvs.len().checked_sub(binder.buffer_count());
        if expected != Some(slots.len()) {
            return Err(DeviceError::InvalidArgument(format!(
                "material {name} has {} texture slots, {:?} declares {} shader resources",
                slots.len(),
                pixel_shader.kind(),
                decl.srvs.len()
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            vertex_shader,
            pixel_shader,
            slots,
            binder,
            pipeline: Cell::new(None),
            skip_logged: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[TextureSlot] {
        &self.slots
    }

    /// Flips the enable flag of slot `index`; returns the new state.
    pub fn toggle_slot(&mut self, index: usize) -> Option<bool> {
        let slot = self.slots.get_mut(index)?;
        slot.enabled = !slot.enabled;
        Some(slot.enabled)
    }

    pub fn pixel_shader(&self) -> &Shader {
        &self.pixel_shader
    }

    pub fn cached_pipeline(&self) -> Option<PipelineId> {
        self.pipeline.get()
    }

    /// Pipeline state for this shader pair, built on first use.
    pub(crate) fn pipeline(&self, device: &mut GraphicsDevice) -> Result<PipelineId, DeviceError> {
        if let Some(pipeline) = self.cached_pipeline() {
            return Ok(pipeline);
        }
        let (Some(vertex_shader), Some(pixel_shader), Some(layout)) = (
            self.vertex_shader.program(),
            self.pixel_shader.program(),
            self.pixel_shader.layout(),
        ) else {
            let unusable = if self.vertex_shader.is_usable() {
                &self.pixel_shader
            } else {
                &self.vertex_shader
            };
            return Err(DeviceError::ShaderUnusable(format!("{:?}", unusable.kind())));
        };

        let format = device.backend_mut().back_buffer_format();
        let pipeline = device.backend_mut().create_pipeline(&PipelineDesc {
            vertex_shader,
            pixel_shader,
            layout,
            input_layout: &SCREEN_VERTEX_LAYOUT,
            render_target_format: format,
        })?;
        debug!("built pipeline for {}", self.name);
        self.pipeline.set(Some(pipeline));
        Ok(pipeline)
    }

    pub(crate) fn bind_parameters(&self, device: &mut GraphicsDevice) -> Result<(), DeviceError> {
        let mut ctx = BindContext::new(device, &self.pixel_shader);
        self.binder.bind(&self.slots, &mut ctx)?;
        ctx.commit()
    }

    /// Retires the slot textures and any buffers the binder owns.
    pub fn release(&self, device: &mut GraphicsDevice) {
        for texture in self.slots.iter().filter_map(TextureSlot::texture) {
            device.release_texture(texture);
        }
        self.binder.release(device);
    }

    /// Logs a skipped draw the first time only.
    pub(crate) fn note_skipped(&self, reason: &DeviceError) {
        if !self.skip_logged.replace(true) {
            warn!("skipping draws of {}: {reason}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{device_with_shaders, run_frame_with};
    use crate::gpu::headless::{Command, HeadlessProbe};
    use crate::format::TextureFormat;
    use crate::shader::ShaderKind;
    use crate::texture::TextureParams;
    use rstest::rstest;
    use std::path::Path;

    fn solid(device: &mut GraphicsDevice, name: &str) -> Rc<Texture> {
        Texture::from_pixels(
            device,
            &TextureParams {
                name,
                width: 1,
                height: 1,
                mip_levels: 1,
                format: TextureFormat::Rgba8Unorm,
                data: &[10, 20, 30, 255],
            },
        )
        .unwrap()
    }

    fn bound_tables(commands: &[Command]) -> Vec<(u32, GpuDescriptorHandle)> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::SetTable { parameter, handle } => Some((*parameter, *handle)),
                _ => None,
            })
            .collect()
    }

    fn model() -> Rc<RefCell<NeuralModel>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decodermodel.json");
        std::fs::write(
            &path,
            r#"{"num_layers": 1, "layer0": {"name": "Conv2d", "in_channels": 2, "out_channels": 2,
                "weight": [1, 0, 0, 1], "bias": [0, 0]}}"#,
        )
        .unwrap();
        Rc::new(RefCell::new(NeuralModel::load(Path::new(&path)).unwrap()))
    }

    #[test]
    fn standard_material_binds_textures_then_constants() {
        let (mut device, probe, _dir) = device_with_shaders();
        let textures: Vec<_> = ["a", "b", "c", "d"].iter().map(|n| solid(&mut device, n)).collect();
        let slots = textures
            .iter()
            .zip(["Albedo", "Normal", "AO", "Roughness"])
            .map(|(t, name)| TextureSlot::new(name, Some(Rc::clone(t))))
            .collect();
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        let ps = device.shader(ShaderKind::StandardPixel).unwrap();
        let material = Material::new("standard", vs, ps, slots).unwrap();

        run_frame_with(&mut device, |device| device.draw_full_screen(&material));

        let tables = bound_tables(&probe.commands());
        assert_eq!(tables.len(), 5);
        for (i, texture) in textures.iter().enumerate() {
            assert_eq!(tables[i], (i as u32, texture.descriptor().unwrap()));
        }
        assert_eq!(tables[4].0, 4);
        assert!(material.cached_pipeline().is_some());
    }

    fn empty_slots(count: usize) -> Vec<TextureSlot> {
        (0..count).map(|i| TextureSlot::new(format!("Slot{i}"), None)).collect()
    }

    /// Kinds of the parameters set with `SetTable`, in recording order, next
    /// to the kinds the bound layout declares.
    fn bound_and_declared_kinds(probe: &HeadlessProbe) -> (Vec<(u32, DescriptorKind)>, Vec<DescriptorKind>) {
        let commands = probe.commands();
        let layout = commands
            .iter()
            .find_map(|c| match c {
                Command::SetLayout(layout) => Some(*layout),
                _ => None,
            })
            .unwrap();
        let declared: Vec<_> = probe.layout(layout).unwrap().parameters.iter().map(|p| p.kind).collect();
        let bound = bound_tables(&commands)
            .into_iter()
            .map(|(parameter, _)| (parameter, declared[parameter as usize]))
            .collect();
        (bound, declared)
    }

    #[test]
    fn pipeline_is_built_once() {
        let (mut device, probe, _dir) = device_with_shaders();
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        let ps = device.shader(ShaderKind::StandardPixel).unwrap();
        let material = Material::new("empty", vs, ps, empty_slots(4)).unwrap();
        for _ in 0..3 {
            run_frame_with(&mut device, |device| device.draw_full_screen(&material));
        }
        assert_eq!(probe.pipeline_count(), 1);
    }

    #[test]
    fn disabled_and_empty_slots_bind_the_white_texture() {
        let (mut device, probe, _dir) = device_with_shaders();
        let albedo = solid(&mut device, "albedo");
        let ao = solid(&mut device, "ao");
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        let ps = device.shader(ShaderKind::StandardPixel).unwrap();
        let mut material = Material::new(
            "partial",
            vs,
            ps,
            vec![
                TextureSlot::new("Albedo", Some(albedo)),
                TextureSlot::new("Normal", None),
                TextureSlot::new("AO", Some(Rc::clone(&ao))),
                TextureSlot::new("Roughness", None),
            ],
        )
        .unwrap();
        assert_eq!(material.toggle_slot(0), Some(false));
        assert_eq!(material.toggle_slot(7), None);

        run_frame_with(&mut device, |device| device.draw_full_screen(&material));

        let white = device.fallback_texture().unwrap().descriptor().unwrap();
        let tables = bound_tables(&probe.commands());
        assert_eq!(tables.len(), 5);
        assert_eq!(tables[0], (0, white));
        assert_eq!(tables[1], (1, white));
        assert_eq!(tables[2], (2, ao.descriptor().unwrap()));
        assert_eq!(tables[3], (3, white));
    }

    #[rstest]
    #[case(ShaderKind::StandardPixel, 3)]
    #[case(ShaderKind::StandardPixel, 5)]
    #[case(ShaderKind::NeuralPixel, 6)]
    #[case(ShaderKind::NeuralPixelLight, 2)]
    fn slot_count_must_match_declared_textures(#[case] kind: ShaderKind, #[case] count: usize) {
        let (mut device, _probe, _dir) = device_with_shaders();
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        let ps = device.shader(kind).unwrap();
        let result = if kind == ShaderKind::StandardPixel {
            Material::new("short", vs, ps, empty_slots(count))
        } else {
            Material::neural("short", vs, ps, empty_slots(count), model())
        };
        assert!(matches!(result, Err(DeviceError::InvalidArgument(_))));
    }

    #[rstest]
    #[case(ShaderKind::StandardPixel)]
    #[case(ShaderKind::NeuralPixel)]
    #[case(ShaderKind::NeuralPixelLight)]
    fn every_parameter_gets_a_table_of_its_declared_kind(#[case] kind: ShaderKind) {
        let (mut device, probe, _dir) = device_with_shaders();
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        let ps = device.shader(kind).unwrap();
        let material = if kind == ShaderKind::StandardPixel {
            Material::new("standard", vs, ps, empty_slots(4)).unwrap()
        } else {
            Material::neural("neural", vs, ps, empty_slots(4), model()).unwrap()
        };

        run_frame_with(&mut device, |device| device.draw_full_screen(&material));

        let (bound, declared) = bound_and_declared_kinds(&probe);
        let parameters: Vec<u32> = bound.iter().map(|(p, _)| *p).collect();
        assert_eq!(parameters, (0..declared.len() as u32).collect::<Vec<_>>());
        let bound_kinds: Vec<_> = bound.iter().map(|(_, k)| *k).collect();
        assert_eq!(bound_kinds, kind.decl().parameter_kinds().collect::<Vec<_>>());
        assert_eq!(declared.last(), Some(&DescriptorKind::Cbv));
        assert!(probe.commands().iter().any(|c| matches!(c, Command::DrawIndexed(_))));
    }

    /// Binds one texture fewer than the shader declares.
    struct ShortBinder;

    impl ParameterBinder for ShortBinder {
        fn bind(&self, slots: &[TextureSlot], ctx: &mut BindContext<'_>) -> Result<(), DeviceError> {
            ctx.bind_texture_slots(&slots[1..])?;
            ctx.bind_constants()
        }
    }

    #[test]
    fn mismatched_binding_records_no_tables_and_no_draw() {
        let (mut device, probe, _dir) = device_with_shaders();
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        let ps = device.shader(ShaderKind::StandardPixel).unwrap();
        let material = Material::with_binder("short", vs, ps, empty_slots(4), Box::new(ShortBinder)).unwrap();

        device.pre_render().unwrap();
        device.render().unwrap();
        let result = device.draw_full_screen(&material);

        assert!(matches!(result, Err(DeviceError::InvalidArgument(_))));
        assert!(bound_tables(&probe.commands()).is_empty());
        assert!(!probe.commands().iter().any(|c| matches!(c, Command::DrawIndexed(_))));
    }

    #[test]
    fn neural_material_binds_grids_weights_biases_constants() {
        let (mut device, probe, _dir) = device_with_shaders();
        let grids: Vec<_> = (0..4).map(|i| solid(&mut device, &format!("grid{i}"))).collect();
        let slots = grids
            .iter()
            .enumerate()
            .map(|(i, t)| TextureSlot::new(format!("FeatureGrid{i}"), Some(Rc::clone(t))))
            .collect();
        let model = model();
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        let ps = device.shader(ShaderKind::NeuralPixel).unwrap();
        let material = Material::neural("neural", vs, ps, slots, Rc::clone(&model)).unwrap();

        run_frame_with(&mut device, |device| device.draw_full_screen(&material));

        // Cached after the draw, so this does not record anything.
        let (weights, biases) = model.borrow_mut().gpu_buffers(&mut device).unwrap();
        assert!(weights.is_resident() && biases.is_resident());
        let tables = bound_tables(&probe.commands());
        let handles: Vec<_> = tables.iter().map(|(_, h)| *h).collect();
        let mut expected: Vec<_> = grids.iter().map(|g| g.descriptor().unwrap()).collect();
        expected.push(weights.descriptor().unwrap());
        expected.push(biases.descriptor().unwrap());
        assert_eq!(&handles[..6], &expected[..]);
        assert_eq!(tables.len(), 7);
        let parameters: Vec<_> = tables.iter().map(|(p, _)| *p).collect();
        assert_eq!(parameters, (0..7).collect::<Vec<u32>>());
    }

    #[test]
    fn unusable_shader_skips_the_draw() {
        let (mut device, probe, dir) = device_with_shaders();
        std::fs::remove_file(dir.path().join(crate::shader::FULL_SCREEN_SHADER)).unwrap();
        let vs = device.shader(ShaderKind::FullScreenVertex).unwrap();
        assert!(!vs.is_usable());
        let ps = device.shader(ShaderKind::StandardPixel).unwrap();
        let material = Material::new("broken", vs, ps, empty_slots(4)).unwrap();
        run_frame_with(&mut device, |device| device.draw_full_screen(&material));
        run_frame_with(&mut device, |device| device.draw_full_screen(&material));
        assert!(!probe.commands().iter().any(|c| matches!(c, Command::DrawIndexed(_))));
    }
}

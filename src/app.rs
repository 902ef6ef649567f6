use crate::device::GraphicsDevice;
use crate::gpu::DeviceError;
use crate::material::{Material, TextureSlot};
use crate::neural_model::NeuralModel;
use crate::shader::{ShaderKind, ViewConstants};
use crate::texture::Texture;
use log::{info, warn};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

const SURFACE_SLOTS: [&str; 4] = ["Albedo", "Normals", "AO", "Roughness"];
const FEATURE_SLOTS: [&str; 4] = ["FeatureGrid0", "FeatureGrid1", "FeatureGrid2", "FeatureGrid3"];

struct CatalogEntry {
    name: &'static str,
    pixel_shader: ShaderKind,
    textures: [&'static str; 4],
    model: Option<&'static str>,
}

/// Materials in display order. Paths are relative to the asset root.
const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "1K_DDS",
        pixel_shader: ShaderKind::StandardPixel,
        textures: [
            "textures/1K_DDS/PavingStones131_1K-Color.dds",
            "textures/1K_DDS/PavingStones131_1K-NormalDX.dds",
            "textures/1K_DDS/PavingStones131_1K-AO.dds",
            "textures/1K_DDS/PavingStones131_1K-Roughness.dds",
        ],
        model: None,
    },
    CatalogEntry {
        name: "1K_Neural",
        pixel_shader: ShaderKind::NeuralPixel,
        textures: [
            "textures/NeuralCompressed/v23/compressed0.dds",
            "textures/NeuralCompressed/v23/compressed1.dds",
            "textures/NeuralCompressed/v23/compressed2.dds",
            "textures/NeuralCompressed/v23/compressed3.dds",
        ],
        model: Some("textures/NeuralCompressed/v23/decodermodel.json"),
    },
    CatalogEntry {
        name: "1K_Neural_Light_32",
        pixel_shader: ShaderKind::NeuralPixelLight,
        textures: [
            "textures/NeuralCompressed/1024_32/compressed0.dds",
            "textures/NeuralCompressed/1024_32/compressed1.dds",
            "textures/NeuralCompressed/1024_32/compressed2.dds",
            "textures/NeuralCompressed/1024_32/compressed3.dds",
        ],
        model: Some("textures/NeuralCompressed/1024_32/decodermodel.json"),
    },
    CatalogEntry {
        name: "2K_Neural_Light_32",
        pixel_shader: ShaderKind::NeuralPixelLight,
        textures: [
            "textures/NeuralCompressed/2048_32/compressed0.dds",
            "textures/NeuralCompressed/2048_32/compressed1.dds",
            "textures/NeuralCompressed/2048_32/compressed2.dds",
            "textures/NeuralCompressed/2048_32/compressed3.dds",
        ],
        model: Some("textures/NeuralCompressed/2048_32/decodermodel.json"),
    },
    CatalogEntry {
        name: "4K_DDS",
        pixel_shader: ShaderKind::StandardPixel,
        textures: [
            "textures/4K_DDS/PavingStones131_4K-Color.dds",
            "textures/4K_DDS/PavingStones131_4K-NormalDX.dds",
            "textures/4K_DDS/PavingStones131_4K-AO.dds",
            "textures/4K_DDS/PavingStones131_4K-Roughness.dds",
        ],
        model: None,
    },
    CatalogEntry {
        name: "4K_PNG",
        pixel_shader: ShaderKind::StandardPixel,
        textures: [
            "textures/PavingStones131_4K-Color.png",
            "textures/PavingStones131_4K-NormalDX.png",
            "textures/PavingStones131_4K-AO.png",
            "textures/PavingStones131_4K-Roughness.png",
        ],
        model: None,
    },
];

const INITIAL_MATERIAL: &str = "4K_PNG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NextMaterial,
    PrevMaterial,
    ToggleVsync,
    ToggleSlot(usize),
    LightLeft,
    LightRight,
    ScaleUp,
    ScaleDown,
    IntensityUp,
    IntensityDown,
    MetalnessUp,
    MetalnessDown,
    Exit,
}

/// Frames counted over the last whole second.
pub struct FrameTimer {
    window_start: Instant,
    frames: u32,
    fps: f32,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            fps: 0.0,
        }
    }
}

impl FrameTimer {
    pub fn tick(&mut self) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            self.fps = self.frames as f32 / elapsed;
            self.frames = 0;
            self.window_start = Instant::now();
        }
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frame_time_ms(&self) -> f32 {
        if self.fps > 0.0 { 1000.0 / self.fps } else { 0.0 }
    }
}

pub struct AppState {
    materials: Vec<Material>,
    current: usize,
    timer: FrameTimer,
}

impl AppState {
    /// Loads every catalog material found under `asset_root`. Missing
    /// textures fall back to white; a material whose decoder model cannot
    /// be loaded is left out.
    pub fn new(device: &mut GraphicsDevice, asset_root: &Path) -> Result<Self, DeviceError> {
        let vertex_shader = device.shader(ShaderKind::FullScreenVertex)?;
        let mut materials = Vec::with_capacity(CATALOG.len());

        for entry in CATALOG {
            let model = match entry.model {
                Some(relative) => match load_model(&asset_root.join(relative), entry.pixel_shader) {
                    Some(model) => Some(model),
                    None => {
                        warn!("{}: decoder model unavailable, material omitted", entry.name);
                        continue;
                    }
                },
                None => None,
            };

            let slot_names = if model.is_some() { FEATURE_SLOTS } else { SURFACE_SLOTS };
            let mut slots = Vec::with_capacity(slot_names.len());
            for (slot_name, relative) in slot_names.iter().zip(entry.textures) {
                let texture = Texture::load(device, &asset_root.join(relative))?;
                slots.push(TextureSlot::new(*slot_name, texture));
            }

            let pixel_shader = device.shader(entry.pixel_shader)?;
            let material = match model {
                Some(model) => Material::neural(entry.name, Rc::clone(&vertex_shader), pixel_shader, slots, model)?,
                None => Material::new(entry.name, Rc::clone(&vertex_shader), pixel_shader, slots)?,
            };
            materials.push(material);
        }

        let current = materials
            .iter()
            .position(|m| m.name() == INITIAL_MATERIAL)
            .unwrap_or(0);
        let state = Self {
            materials,
            current,
            timer: FrameTimer::default(),
        };
        info!(
            "{} materials loaded from {}: {}",
            state.material_count(),
            asset_root.display(),
            state.material_names().collect::<Vec<_>>().join(", ")
        );
        Ok(state)
    }

    /// Retires every material's GPU objects. The state holds no materials
    /// afterwards.
    pub fn release(&mut self, device: &mut GraphicsDevice) {
        for material in self.materials.drain(..) {
            material.release(device);
        }
        self.current = 0;
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    pub fn material_names(&self) -> impl Iterator<Item = &str> {
        self.materials.iter().map(Material::name)
    }

    pub fn current_material(&self) -> Option<&Material> {
        self.materials.get(self.current)
    }

    pub fn next_material(&mut self) {
        if !self.materials.is_empty() {
            self.current = (self.current + 1) % self.materials.len();
        }
    }

    pub fn prev_material(&mut self) {
        if self.current == 0 {
            self.current = self.materials.len().saturating_sub(1);
        } else {
            self.current -= 1;
        }
    }

    /// Applies one input action. Returns `false` when the app should exit.
    pub fn apply(&mut self, action: Action, device: &mut GraphicsDevice) -> bool {
        match action {
            Action::NextMaterial => self.next_material(),
            Action::PrevMaterial => self.prev_material(),
            Action::ToggleVsync => {
                let vsync = !device.vsync();
                device.set_vsync(vsync);
                info!("vsync {}", if vsync { "on" } else { "off" });
            }
            Action::ToggleSlot(index) => {
                if let Some(material) = self.materials.get_mut(self.current) {
                    if let Some(enabled) = material.toggle_slot(index) {
                        info!("{} slot {index} {}", material.name(), if enabled { "enabled" } else { "disabled" });
                    }
                }
            }
            Action::Exit => return false,
            view => adjust_view(device.view_constants_mut(), view),
        }
        true
    }

    /// One full frame: drain pending uploads, draw the current material,
    /// present.
    pub fn render_frame(&mut self, device: &mut GraphicsDevice) -> Result<(), DeviceError> {
        device.pre_render()?;
        device.render()?;
        if let Some(material) = self.materials.get(self.current) {
            device.draw_full_screen(material)?;
        }
        device.present()?;
        device.post_render()?;
        self.timer.tick();
        Ok(())
    }

    pub fn timer(&self) -> &FrameTimer {
        &self.timer
    }

    /// Device counters for debug logging.
    pub fn frame_summary(&self, device: &GraphicsDevice) -> String {
        format!(
            "{} backend {:?}, fence {}, {} queued, {} staging bytes in flight{}",
            device.backend_name(),
            device.frame_state(),
            device.completed_fence_value(),
            device.queued_commands(),
            device.staging_bytes_in_flight(),
            if device.is_occluded() { ", occluded" } else { "" }
        )
    }

    pub fn window_title(&self, device: &GraphicsDevice) -> String {
        let mut title = String::from("neuraltex");
        if let Some(material) = self.current_material() {
            title.push_str(" | ");
            title.push_str(material.name());
            for slot in material.slots() {
                match slot.texture() {
                    Some(texture) if slot.enabled => title.push_str(&format!(
                        " | {} {}x{}({}) {:.2}MB",
                        slot.name(),
                        texture.width(),
                        texture.height(),
                        texture.format_tag(),
                        texture.uncompressed_bytes() as f64 / (1024.0 * 1024.0)
                    )),
                    Some(_) => title.push_str(&format!(" | {} off", slot.name())),
                    None => title.push_str(&format!(" | {} missing", slot.name())),
                }
            }
        }
        title.push_str(&format!(
            " | {:.1} FPS ({:.2}ms){}",
            self.timer.fps(),
            self.timer.frame_time_ms(),
            if device.vsync() { " vsync" } else { "" }
        ));
        title
    }
}

fn adjust_view(constants: &mut ViewConstants, action: Action) {
    match action {
        Action::LightLeft => constants.light_position = (constants.light_position - 0.05).clamp(-1.0, 1.0),
        Action::LightRight => constants.light_position = (constants.light_position + 0.05).clamp(-1.0, 1.0),
        Action::ScaleUp => constants.scale = (constants.scale + 0.05).clamp(0.2, 1.0),
        Action::ScaleDown => constants.scale = (constants.scale - 0.05).clamp(0.2, 1.0),
        Action::IntensityUp => constants.intensity = (constants.intensity + 0.25).clamp(0.0, 5.0),
        Action::IntensityDown => constants.intensity = (constants.intensity - 0.25).clamp(0.0, 5.0),
        Action::MetalnessUp => constants.metalness = (constants.metalness + 0.1).clamp(0.0, 1.0),
        Action::MetalnessDown => constants.metalness = (constants.metalness - 0.1).clamp(0.0, 1.0),
        _ => {}
    }
}

fn load_model(path: &Path, kind: ShaderKind) -> Option<Rc<RefCell<NeuralModel>>> {
    let model = match NeuralModel::load(path) {
        Ok(model) => model,
        Err(e) => {
            warn!("{e}");
            return None;
        }
    };
    if let Some(expected) = kind.decoder_topology() {
        if model.layer_sizes() != expected {
            warn!(
                "{}: decoder layers {:?} do not match the {:?} shader ({:?})",
                path.display(),
                model.layer_sizes(),
                kind,
                expected
            );
        }
    }
    Some(Rc::new(RefCell::new(model)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dds::fixture;
    use crate::device::tests::device_with_shaders;
    use rstest::rstest;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, bytes: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn model_json(sizes: &[usize]) -> Value {
        let mut root = json!({ "num_layers": sizes.len() - 1 });
        for (index, pair) in sizes.windows(2).enumerate() {
            root[format!("layer{index}")] = json!({
                "name": "Conv2d",
                "in_channels": pair[0],
                "out_channels": pair[1],
                "weight": vec![0.01f32; pair[0] * pair[1]],
                "bias": vec![0.0f32; pair[1]],
            });
        }
        root
    }

    /// A tiny asset tree: the 1K DDS set, the PNG set, and the v23 neural
    /// set with a matching decoder. The light-weight neural sets are absent.
    fn asset_root() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let bc1 = fixture::legacy(4, 4, 1, b"DXT1", &[0u8; 8]);
        for relative in CATALOG[0].textures.iter().chain(CATALOG[1].textures.iter()) {
            write(dir.path(), relative, &bc1);
        }
        for relative in CATALOG[5].textures {
            let path = dir.path().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            image::RgbaImage::new(8, 8).save(&path).unwrap();
        }
        let model = model_json(&[16, 64, 64, 8]);
        write(dir.path(), CATALOG[1].model.unwrap(), model.to_string().as_bytes());
        dir
    }

    #[test]
    fn catalog_skips_materials_without_a_model() {
        let (mut device, _probe, _shaders) = device_with_shaders();
        let assets = asset_root();
        let app = AppState::new(&mut device, assets.path()).unwrap();

        let names: Vec<_> = app.material_names().collect();
        assert_eq!(names, ["1K_DDS", "1K_Neural", "4K_DDS", "4K_PNG"]);
        assert_eq!(app.current_material().unwrap().name(), "4K_PNG");
    }

    #[test]
    fn missing_textures_leave_empty_slots() {
        let (mut device, _probe, _shaders) = device_with_shaders();
        let assets = asset_root();
        let mut app = AppState::new(&mut device, assets.path()).unwrap();

        app.prev_material();
        let material = app.current_material().unwrap();
        assert_eq!(material.name(), "4K_DDS");
        assert!(material.slots().iter().all(|slot| slot.texture().is_none()));
        assert!(app.window_title(&device).contains("Albedo missing"));
    }

    #[test]
    fn frames_draw_every_material() {
        let (mut device, _probe, _shaders) = device_with_shaders();
        let assets = asset_root();
        let mut app = AppState::new(&mut device, assets.path()).unwrap();

        for _ in 0..app.material_count() {
            app.render_frame(&mut device).unwrap();
            let material = app.current_material().unwrap();
            assert!(material.cached_pipeline().is_some(), "{} not drawn", material.name());
            assert!(material
                .slots()
                .iter()
                .filter_map(TextureSlot::texture)
                .all(|texture| texture.is_resident()));
            app.next_material();
        }
        assert_eq!(device.queued_commands(), 0);
        assert_eq!(device.frames_rendered(), 4);
    }

    #[test]
    fn teardown_releases_every_gpu_object() {
        let (mut device, probe, _shaders) = device_with_shaders();
        let assets = asset_root();
        let mut app = AppState::new(&mut device, assets.path()).unwrap();
        for _ in 0..app.material_count() {
            app.render_frame(&mut device).unwrap();
            app.next_material();
        }
        assert!(app.frame_summary(&device).starts_with("headless backend Idle"));

        app.release(&mut device);
        assert_eq!(app.material_count(), 0);
        device.shutdown().unwrap();
        assert_eq!(probe.live_resources(), 0);
        assert_eq!(device.staging_bytes_in_flight(), 0);
    }

    #[test]
    fn mismatched_decoder_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decodermodel.json");
        std::fs::write(&path, model_json(&[16, 32, 8]).to_string()).unwrap();
        let model = load_model(&path, ShaderKind::NeuralPixel).unwrap();
        assert_eq!(model.borrow().layer_sizes(), [16, 32, 8]);
        assert!(load_model(&dir.path().join("absent.json"), ShaderKind::NeuralPixel).is_none());
    }

    #[rstest]
    #[case(Action::ScaleUp, 20, |c: &ViewConstants| c.scale == 1.0)]
    #[case(Action::ScaleDown, 20, |c: &ViewConstants| c.scale == 0.2)]
    #[case(Action::LightLeft, 50, |c: &ViewConstants| c.light_position == -1.0)]
    #[case(Action::IntensityUp, 30, |c: &ViewConstants| c.intensity == 5.0)]
    #[case(Action::MetalnessUp, 15, |c: &ViewConstants| c.metalness == 1.0)]
    fn view_controls_clamp(#[case] action: Action, #[case] repeats: usize, #[case] check: fn(&ViewConstants) -> bool) {
        let (mut device, _probe, _shaders) = device_with_shaders();
        let assets = asset_root();
        let mut app = AppState::new(&mut device, assets.path()).unwrap();
        for _ in 0..repeats {
            assert!(app.apply(action, &mut device));
        }
        assert!(check(device.view_constants()), "{:?}", device.view_constants());
    }

    #[test]
    fn material_cycling_wraps_and_toggles() {
        let (mut device, _probe, _shaders) = device_with_shaders();
        let assets = asset_root();
        let mut app = AppState::new(&mut device, assets.path()).unwrap();

        app.apply(Action::NextMaterial, &mut device);
        assert_eq!(app.current_material().unwrap().name(), "1K_DDS");
        app.apply(Action::PrevMaterial, &mut device);
        assert_eq!(app.current_material().unwrap().name(), "4K_PNG");

        app.apply(Action::ToggleSlot(0), &mut device);
        assert!(!app.current_material().unwrap().slots()[0].enabled);
        assert!(app.window_title(&device).contains("Albedo off"));

        assert!(!device.vsync());
        app.apply(Action::ToggleVsync, &mut device);
        assert!(device.vsync());
        assert!(!app.apply(Action::Exit, &mut device));
    }
}

use crate::app::{Action, AppState};
use crate::config::HarnessConfig;
use crate::device::GraphicsDevice;
use crate::gpu::DeviceError;
use crate::gpu::dx12::Dx12Backend;
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use raw_window_handle::{HasWindowHandle, RawWindowHandle};
use windows::core::w;
use windows::Win32::Foundation::HWND;
use windows::Win32::System::LibraryLoader::LoadLibraryW;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

/// Frames between window title refreshes.
const TITLE_INTERVAL: u64 = 30;

struct App {
    config: HarnessConfig,
    window: Option<Window>,
    device: Option<GraphicsDevice>,
    app_state: Option<AppState>,
    failure: Option<DeviceError>,
}

impl App {
    fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            window: None,
            device: None,
            app_state: None,
            failure: None,
        }
    }

    fn init(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let hwnd = match window.window_handle()?.as_raw() {
            RawWindowHandle::Win32(h) => HWND(h.hwnd.get() as *mut _),
            _ => return Err(anyhow!("unsupported window handle type")),
        };

        let backend = Dx12Backend::new(hwnd, size.width, size.height, self.config.descriptor_capacity)?;
        let mut device = GraphicsDevice::new(Box::new(backend), self.config.device_config(size.width, size.height))?;
        let app_state = AppState::new(&mut device, &self.config.asset_root)?;
        self.device = Some(device);
        self.app_state = Some(app_state);
        Ok(())
    }

    fn render(&mut self) -> Result<(), DeviceError> {
        let (Some(device), Some(app_state)) = (self.device.as_mut(), self.app_state.as_mut()) else {
            return Ok(());
        };
        app_state.render_frame(device)?;

        if device.frames_rendered() % TITLE_INTERVAL == 0 {
            if let Some(window) = &self.window {
                window.set_title(&app_state.window_title(device));
            }
            debug!("{}", app_state.frame_summary(device));
        }
        Ok(())
    }
}

fn action_for(key: &Key) -> Option<Action> {
    let action = match key {
        Key::Named(NamedKey::PageDown) => Action::NextMaterial,
        Key::Named(NamedKey::PageUp) => Action::PrevMaterial,
        Key::Named(NamedKey::ArrowLeft) => Action::LightLeft,
        Key::Named(NamedKey::ArrowRight) => Action::LightRight,
        Key::Named(NamedKey::ArrowUp) => Action::ScaleUp,
        Key::Named(NamedKey::ArrowDown) => Action::ScaleDown,
        Key::Named(NamedKey::Escape) => Action::Exit,
        Key::Character(c) => match c.as_str() {
            "v" | "V" => Action::ToggleVsync,
            "+" | "=" => Action::IntensityUp,
            "-" => Action::IntensityDown,
            "]" => Action::MetalnessUp,
            "[" => Action::MetalnessDown,
            "1" => Action::ToggleSlot(0),
            "2" => Action::ToggleSlot(1),
            "3" => Action::ToggleSlot(2),
            "4" => Action::ToggleSlot(3),
            _ => return None,
        },
        _ => return None,
    };
    Some(action)
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attrs = Window::default_attributes()
            .with_title("neuraltex")
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = match event_loop.create_window(window_attrs) {
            Ok(window) => window,
            Err(e) => {
                error!("failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };
        if let Err(e) = self.init(&window) {
            error!("failed to initialize: {e:#}");
            event_loop.exit();
            return;
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(device) = &mut self.device {
                    if let Err(e) = device.resize(size.width, size.height) {
                        warn!("resize to {}x{} failed: {e}", size.width, size.height);
                    }
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                let (Some(action), Some(device), Some(app_state)) =
                    (action_for(&logical_key), self.device.as_mut(), self.app_state.as_mut())
                else {
                    return;
                };
                if !app_state.apply(action, device) {
                    event_loop.exit();
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render() {
                    error!("render error: {e}");
                    self.failure = Some(e);
                    event_loop.exit();
                    return;
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

/// Loads the PIX GPU capturer so captures can be taken from the PIX UI.
/// Must run before the D3D12 device is created.
pub fn load_pix_capturer() {
    match unsafe { LoadLibraryW(w!("WinPixGpuCapturer.dll")) } {
        Ok(_) => info!("PIX GPU capturer loaded"),
        Err(e) => warn!("could not load WinPixGpuCapturer.dll: {}", e.message()),
    }
}

pub fn run(config: HarnessConfig) -> Result<()> {
    if config.pix {
        load_pix_capturer();
    }

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Drain the GPU before the window goes away.
    if let Some(mut device) = app.device.take() {
        if let Some(mut app_state) = app.app_state.take() {
            app_state.release(&mut device);
        }
        device.shutdown()?;
    }
    match app.failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

mod app;
mod asset;
mod config;
mod dds;
mod device;
mod format;
mod frame;
mod geometry;
mod gpu;
mod material;
mod neural_model;
mod render_queue;
mod resource;
mod retire;
mod shader;
mod structured_buffer;
mod texture;
#[cfg(windows)]
mod window;

use anyhow::Result;
use app::AppState;
use config::HarnessConfig;
use device::GraphicsDevice;
use gpu::headless::HeadlessBackend;
use log::{debug, info};

/// Drives the full frame loop without a window, cycling through the
/// catalog one material per frame.
fn run_headless(config: &HarnessConfig, frames: u32) -> Result<()> {
    let backend = HeadlessBackend::new(config.width, config.height, config.descriptor_capacity);
    let mut device = GraphicsDevice::new(Box::new(backend), config.device_config(config.width, config.height))?;
    let mut app_state = AppState::new(&mut device, &config.asset_root)?;

    for _ in 0..frames {
        app_state.render_frame(&mut device)?;
        info!("{}", app_state.window_title(&device));
        debug!("{}", app_state.frame_summary(&device));
        app_state.next_material();
    }

    app_state.release(&mut device);
    device.shutdown()?;
    info!("headless run finished after {} frames", device.frames_rendered());
    Ok(())
}

#[cfg(windows)]
fn run_windowed(config: HarnessConfig) -> Result<()> {
    window::run(config)
}

#[cfg(not(windows))]
fn run_windowed(_config: HarnessConfig) -> Result<()> {
    anyhow::bail!("the windowed harness needs Direct3D 12; run with --headless")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HarnessConfig::from_env();
    match config.headless_frames {
        Some(frames) => run_headless(&config, frames),
        None => run_windowed(config),
    }
}

//! Harness settings built from defaults plus command-line tokens.
//!
//! Tokens are matched one by one; anything unrecognized is ignored so the
//! harness can be launched by tools that append their own flags.

use crate::device::DeviceConfig;
use std::path::PathBuf;

pub const DEFAULT_HEADLESS_FRAMES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub width: u32,
    pub height: u32,
    pub descriptor_capacity: u32,
    pub clear_color: [f32; 4],
    pub vsync: bool,
    /// Load the PIX GPU capturer before the device is created.
    pub pix: bool,
    /// Run this many frames without a window, then exit.
    pub headless_frames: Option<u32>,
    pub asset_root: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let device = DeviceConfig::default();
        Self {
            width: device.width,
            height: device.height,
            descriptor_capacity: device.descriptor_capacity,
            clear_color: device.clear_color,
            vsync: device.vsync,
            pix: false,
            headless_frames: None,
            asset_root: PathBuf::from("."),
        }
    }
}

impl HarnessConfig {
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            if arg == "-pix" {
                config.pix = true;
            } else if arg == "--headless" {
                config.headless_frames = Some(DEFAULT_HEADLESS_FRAMES);
            } else if let Some(count) = arg.strip_prefix("--headless=") {
                match count.parse() {
                    Ok(n) => config.headless_frames = Some(n),
                    Err(_) => log::warn!("ignoring '{arg}': frame count is not a number"),
                }
            } else if let Some(dir) = arg.strip_prefix("--assets=") {
                config.asset_root = PathBuf::from(dir);
            } else {
                log::debug!("ignoring unrecognized argument '{arg}'");
            }
        }
        config
    }

    /// Process arguments, skipping the executable name.
    pub fn from_env() -> Self {
        Self::from_args(std::env::args().skip(1))
    }

    pub fn shader_dir(&self) -> PathBuf {
        self.asset_root.join("Shaders")
    }

    pub fn device_config(&self, width: u32, height: u32) -> DeviceConfig {
        DeviceConfig {
            width,
            height,
            descriptor_capacity: self.descriptor_capacity,
            vsync: self.vsync,
            clear_color: self.clear_color,
            shader_dir: self.shader_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_without_arguments() {
        let config = HarnessConfig::from_args(Vec::<String>::new());
        assert_eq!(config, HarnessConfig::default());
        assert_eq!((config.width, config.height), (1920, 1080));
        assert_eq!(config.descriptor_capacity, 128);
        assert!(!config.vsync);
        assert_eq!(config.shader_dir(), PathBuf::from("./Shaders"));
    }

    #[rstest]
    #[case(&["--headless"], Some(3))]
    #[case(&["--headless=10"], Some(10))]
    #[case(&["--headless=ten"], None)]
    #[case(&["-headless"], None)]
    fn headless_frame_count(#[case] args: &[&str], #[case] expected: Option<u32>) {
        assert_eq!(HarnessConfig::from_args(args).headless_frames, expected);
    }

    #[test]
    fn mixed_tokens() {
        let config = HarnessConfig::from_args(["--unknown", "-pix", "--assets=/data/neural", "stray"]);
        assert!(config.pix);
        assert_eq!(config.asset_root, PathBuf::from("/data/neural"));
        assert_eq!(config.headless_frames, None);

        let device = config.device_config(800, 600);
        assert_eq!((device.width, device.height), (800, 600));
        assert_eq!(device.shader_dir, PathBuf::from("/data/neural/Shaders"));
        assert_eq!(device.descriptor_capacity, 128);
    }
}

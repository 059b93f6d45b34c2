//! Client display metrics: console width and graphics surface size.
//!
//! These are captured at suspend time and reapplied on resume so the session
//! renders for the same display geometry the client last reported.

use crate::interpreter::Interpreter;
use crate::settings::Settings;

const CONSOLE_WIDTH: &str = "console_width";
const GRAPHICS_WIDTH: &str = "graphics_width";
const GRAPHICS_HEIGHT: &str = "graphics_height";
const DEVICE_PIXEL_RATIO: &str = "device_pixel_ratio";

pub const DEFAULT_CONSOLE_WIDTH: i64 = 80;
pub const DEFAULT_GRAPHICS_WIDTH: f64 = 640.0;
pub const DEFAULT_GRAPHICS_HEIGHT: f64 = 480.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientMetrics {
    pub console_width: i64,
    pub graphics_width: f64,
    pub graphics_height: f64,
    pub device_pixel_ratio: f64,
}

impl Default for ClientMetrics {
    fn default() -> ClientMetrics {
        ClientMetrics {
            console_width: DEFAULT_CONSOLE_WIDTH,
            graphics_width: DEFAULT_GRAPHICS_WIDTH,
            graphics_height: DEFAULT_GRAPHICS_HEIGHT,
            device_pixel_ratio: 1.0,
        }
    }
}

impl ClientMetrics {
    pub fn save(&self, settings: &mut Settings) -> std::io::Result<()> {
        settings.set_int(CONSOLE_WIDTH, self.console_width)?;
        settings.set_double(GRAPHICS_WIDTH, self.graphics_width)?;
        settings.set_double(GRAPHICS_HEIGHT, self.graphics_height)?;
        settings.set_double(DEVICE_PIXEL_RATIO, self.device_pixel_ratio)?;
        Ok(())
    }

    pub fn load(settings: &Settings) -> ClientMetrics {
        let defaults = ClientMetrics::default();
        ClientMetrics {
            console_width: settings.get_int(CONSOLE_WIDTH, defaults.console_width),
            graphics_width: settings.get_double(GRAPHICS_WIDTH, defaults.graphics_width),
            graphics_height: settings.get_double(GRAPHICS_HEIGHT, defaults.graphics_height),
            device_pixel_ratio: settings.get_double(DEVICE_PIXEL_RATIO, defaults.device_pixel_ratio),
        }
    }

    /// Apply the metrics to a live interpreter. If setting the console width
    /// fails the previous width option is restored, so a half-applied metric
    /// set never leaves the interpreter inconsistent.
    pub fn apply(&self, interp: &mut dyn Interpreter) -> Result<(), String> {
        let previous = interp.get_option("width");
        if let Err(err) = interp.set_option("width", &self.console_width.to_string()) {
            if let Some(prev) = previous {
                let _ = interp.set_option("width", &prev);
            }
            return Err(format!("error setting console width: {err}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedInterpreter;
    use tempfile::TempDir;

    #[test]
    fn metrics_round_trip_through_settings() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings");
        let mut settings = Settings::open(&path).expect("open settings");
        let metrics = ClientMetrics {
            console_width: 120,
            graphics_width: 1024.0,
            graphics_height: 768.0,
            device_pixel_ratio: 2.0,
        };
        metrics.save(&mut settings).expect("save metrics");

        let reloaded = Settings::open(&path).expect("reopen settings");
        assert_eq!(ClientMetrics::load(&reloaded), metrics);
    }

    #[test]
    fn load_uses_defaults_when_unset() {
        let dir = TempDir::new().expect("tempdir");
        let settings = Settings::open(&dir.path().join("settings")).expect("open settings");
        assert_eq!(ClientMetrics::load(&settings), ClientMetrics::default());
    }

    #[test]
    fn apply_sets_width_option() {
        let mut interp = ScriptedInterpreter::new();
        let metrics = ClientMetrics {
            console_width: 100,
            ..ClientMetrics::default()
        };
        metrics.apply(&mut interp).expect("apply metrics");
        assert_eq!(interp.get_option("width").as_deref(), Some("100"));
    }
}

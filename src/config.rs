use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ControllerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// IP of the controller host inside the lighting network.
    pub local_ip: String,
    /// Unicast destination for ArtPoll.
    pub node_ip: String,
    pub dmx_fps: f64,
    pub poll_interval: f64,
    /// Run the sender without pacing when `dmx_fps <= 0` instead of
    /// rejecting the config.
    pub allow_unpaced: bool,
    pub universe_count: u16,
    pub scenes_path: PathBuf,
    pub runtime_settings_path: PathBuf,
    pub fixture_plan_path: PathBuf,
    /// Atmosphere overlay addresses, 1-based; channel 0 disables.
    pub fog_flash_universe: u16,
    pub fog_flash_channel: u16,
    pub haze_universe: u16,
    pub haze_channel: u16,
    /// Hex SHA-256 of the 4-digit operator PIN.
    pub operator_pin_hash: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_ip: "2.0.0.30".to_string(),
            node_ip: "2.0.0.10".to_string(),
            dmx_fps: 30.0,
            poll_interval: 5.0,
            allow_unpaced: false,
            universe_count: 1,
            scenes_path: PathBuf::from("./scenes"),
            runtime_settings_path: PathBuf::from("./settings.runtime.json"),
            fixture_plan_path: PathBuf::from("./fixture_plan.active.json"),
            fog_flash_universe: 1,
            fog_flash_channel: 0,
            haze_universe: 1,
            haze_channel: 0,
            // SHA-256 of "0815"
            operator_pin_hash: "c57a5df4f97ed6914116e5fd1348406064834f22503d890eb571af442ac4b4c3"
                .to_string(),
        }
    }
}

fn env_var<T: FromStr>(key: &str, current: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(value) => *current = value,
            Err(_) => warn!("ignoring unparseable env var {key}={raw:?}"),
        }
    }
}

impl Settings {
    /// Environment-derived settings: defaults overridden by env vars, then
    /// by the runtime settings file.
    pub fn load() -> Self {
        let mut settings = Self::default();
        env_var("LOCAL_IP", &mut settings.local_ip);
        env_var("NODE_IP", &mut settings.node_ip);
        env_var("DMX_FPS", &mut settings.dmx_fps);
        env_var("POLL_INTERVAL", &mut settings.poll_interval);
        env_var("ALLOW_UNPACED", &mut settings.allow_unpaced);
        env_var("UNIVERSE_COUNT", &mut settings.universe_count);
        env_var("SCENES_PATH", &mut settings.scenes_path);
        env_var("RUNTIME_SETTINGS_PATH", &mut settings.runtime_settings_path);
        env_var("FIXTURE_PLAN_PATH", &mut settings.fixture_plan_path);
        env_var("FOG_FLASH_UNIVERSE", &mut settings.fog_flash_universe);
        env_var("FOG_FLASH_CHANNEL", &mut settings.fog_flash_channel);
        env_var("HAZE_UNIVERSE", &mut settings.haze_universe);
        env_var("HAZE_CHANNEL", &mut settings.haze_channel);
        env_var("OPERATOR_PIN_HASH", &mut settings.operator_pin_hash);
        if settings.universe_count < 1 {
            warn!("universe_count < 1, falling back to 1");
            settings.universe_count = 1;
        }
        settings.load_runtime_overlay();
        settings
    }

    /// Overlay the four mutable keys from the runtime settings file.
    /// Missing or unreadable files are ignored with a warning.
    pub fn load_runtime_overlay(&mut self) {
        let path = self.runtime_settings_path.clone();
        if !path.exists() {
            return;
        }
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to read runtime settings {}: {err}", path.display());
                return;
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse runtime settings {}: {err}", path.display());
                return;
            }
        };
        let Some(map) = value.as_object() else {
            warn!("runtime settings file {} is not an object, ignoring", path.display());
            return;
        };

        if let Some(node_ip) = map.get("node_ip").and_then(|v| v.as_str()) {
            self.node_ip = node_ip.to_string();
        }
        if let Some(fps) = map.get("dmx_fps").and_then(|v| v.as_f64()) {
            self.dmx_fps = fps;
        }
        if let Some(interval) = map.get("poll_interval").and_then(|v| v.as_f64()) {
            self.poll_interval = interval;
        }
        if let Some(count) = map.get("universe_count").and_then(|v| v.as_u64()) {
            if count >= 1 && count <= u16::MAX as u64 {
                self.universe_count = count as u16;
            } else {
                warn!("runtime settings universe_count {count} out of range, ignoring");
            }
        }
    }

    /// Persist the mutable keys back to the runtime settings file.
    pub fn persist_runtime(&self) -> Result<(), ControllerError> {
        let payload = json!({
            "node_ip": self.node_ip,
            "dmx_fps": self.dmx_fps,
            "poll_interval": self.poll_interval,
            "universe_count": self.universe_count,
        });
        write_json_file(&self.runtime_settings_path, &payload)
    }

    pub fn stream_config(&self) -> artnet::StreamConfig {
        artnet::StreamConfig {
            local_ip: self.local_ip.clone(),
            node_ip: self.node_ip.clone(),
            fps: self.dmx_fps,
            poll_interval: std::time::Duration::from_secs_f64(self.poll_interval.max(0.0)),
            allow_unpaced: self.allow_unpaced,
        }
    }

    /// The mutable keys as an event payload / API view.
    pub fn runtime_view(&self) -> serde_json::Value {
        json!({
            "node_ip": self.node_ip,
            "dmx_fps": self.dmx_fps,
            "poll_interval": self.poll_interval,
            "universe_count": self.universe_count,
        })
    }
}

pub(crate) fn write_json_file(
    path: &Path,
    value: &impl Serialize,
) -> Result<(), ControllerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| ControllerError::Persistence(format!("{}: {err}", parent.display())))?;
    }
    let data = serde_json::to_string_pretty(value)
        .map_err(|err| ControllerError::Persistence(err.to_string()))?;
    std::fs::write(path, data)
        .map_err(|err| ControllerError::Persistence(format!("{}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.local_ip, "2.0.0.30");
        assert_eq!(settings.node_ip, "2.0.0.10");
        assert_eq!(settings.dmx_fps, 30.0);
        assert_eq!(settings.poll_interval, 5.0);
        assert_eq!(settings.universe_count, 1);
        assert_eq!(settings.haze_channel, 0);
        assert_eq!(settings.fog_flash_channel, 0);
    }

    #[test]
    fn runtime_overlay_round_trip() {
        let dir = tempdir().unwrap();
        let mut settings = Settings {
            runtime_settings_path: dir.path().join("settings.runtime.json"),
            ..Settings::default()
        };
        settings.node_ip = "10.0.0.99".to_string();
        settings.dmx_fps = 44.0;
        settings.universe_count = 4;
        settings.persist_runtime().unwrap();

        let mut fresh = Settings {
            runtime_settings_path: settings.runtime_settings_path.clone(),
            ..Settings::default()
        };
        fresh.load_runtime_overlay();
        assert_eq!(fresh.node_ip, "10.0.0.99");
        assert_eq!(fresh.dmx_fps, 44.0);
        assert_eq!(fresh.universe_count, 4);
        // Keys outside the runtime set are untouched.
        assert_eq!(fresh.local_ip, "2.0.0.30");
    }

    #[test]
    fn malformed_runtime_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.runtime.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let mut settings = Settings {
            runtime_settings_path: path,
            ..Settings::default()
        };
        settings.load_runtime_overlay();
        assert_eq!(settings.node_ip, "2.0.0.10");
    }
}

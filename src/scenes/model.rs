use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

pub const DMX_CHANNELS: usize = artnet::DMX_CHANNELS;

/// One universe's worth of channel values. Always validated to exactly
/// 512 entries before a scene is stored or played.
pub type UniversePayload = BTreeMap<u16, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SceneType {
    #[default]
    Static,
    // Older scene files used "animated"; we keep reading it but always
    // write "dynamic".
    #[serde(alias = "animated")]
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    #[default]
    Loop,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleColor {
    Amber,
    Red,
    Green,
    Blue,
    Purple,
    Cyan,
    White,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleVariant {
    Solid,
    Outline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleIcon {
    Bulb,
    Spot,
    Wash,
    Beam,
    Strobe,
    Haze,
    Star,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleEmphasis {
    Wide,
    Tall,
}

/// Cosmetic metadata for the operator UI. Validated against the closed
/// enumerations, never interpreted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SceneStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<StyleColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<StyleVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<StyleIcon>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emphasis: Vec<StyleEmphasis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimatedFrame {
    pub timestamp_ms: u64,
    pub universes: UniversePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub scene_type: SceneType,
    #[serde(default)]
    pub universes: UniversePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<SceneStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_mode: Option<PlaybackMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub animated_frames: Vec<AnimatedFrame>,
}

impl Scene {
    pub fn new_static(id: &str, name: &str, universes: UniversePayload) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            scene_type: SceneType::Static,
            universes,
            created_at: None,
            style: None,
            duration_ms: None,
            playback_mode: None,
            animated_frames: Vec::new(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.scene_type == SceneType::Dynamic
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        self.playback_mode.unwrap_or_default()
    }

    /// The payload a freshly selected scene starts from: the first frame
    /// for dynamic scenes, the full universe map for static ones.
    pub fn initial_payload(&self) -> UniversePayload {
        if self.is_dynamic() {
            if let Some(first) = self.animated_frames.first() {
                return first.universes.clone();
            }
        }
        self.universes.clone()
    }

    /// Normalize after load: fill `universes` from the first frame when
    /// empty, sort frames, pin the first frame to t=0 and append the
    /// synthetic terminal frame at `duration_ms` if absent.
    pub fn normalize(&mut self) {
        if !self.is_dynamic() {
            return;
        }
        if self.universes.is_empty() {
            if let Some(first) = self.animated_frames.first() {
                self.universes = first.universes.clone();
            }
        }
        if let Some(duration_ms) = self.duration_ms {
            self.animated_frames = normalize_frames(std::mem::take(&mut self.animated_frames), duration_ms);
        }
    }

    /// Structural validation run before every save and after every load.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.name.trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "scene name must not be empty".to_string(),
            ));
        }
        validate_payload(&self.universes)?;

        if self.is_dynamic() {
            let duration_ms = self.duration_ms.ok_or_else(|| {
                ControllerError::Invariant("dynamic scene is missing duration_ms".to_string())
            })?;
            if duration_ms < 1 {
                return Err(ControllerError::Invariant(
                    "duration_ms must be >= 1".to_string(),
                ));
            }
            if self.animated_frames.is_empty() {
                return Err(ControllerError::Invariant(
                    "dynamic scene has no frames".to_string(),
                ));
            }
            let keys: Vec<u16> = self.universes.keys().copied().collect();
            let mut last_ts = 0u64;
            for (index, frame) in self.animated_frames.iter().enumerate() {
                validate_payload(&frame.universes)?;
                let frame_keys: Vec<u16> = frame.universes.keys().copied().collect();
                if frame_keys != keys {
                    return Err(ControllerError::Invariant(format!(
                        "frame {index} universe set {frame_keys:?} differs from scene set {keys:?}"
                    )));
                }
                if index > 0 && frame.timestamp_ms < last_ts {
                    return Err(ControllerError::Invariant(format!(
                        "frame {index} timestamp {} is before {}",
                        frame.timestamp_ms, last_ts
                    )));
                }
                last_ts = frame.timestamp_ms;
            }
        } else if !self.animated_frames.is_empty() {
            return Err(ControllerError::Invariant(
                "static scene must not carry animated frames".to_string(),
            ));
        }
        Ok(())
    }

    /// Listing/event view without the frame data.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "type": self.scene_type,
            "duration_ms": self.duration_ms,
            "playback_mode": self.is_dynamic().then(|| self.playback_mode()),
            "frame_count": self.is_dynamic().then(|| self.animated_frames.len()),
            "universes": self.universes.keys().collect::<Vec<_>>(),
            "created_at": self.created_at,
            "style": self.style,
        })
    }
}

pub fn validate_payload(universes: &UniversePayload) -> Result<(), ControllerError> {
    for (universe, values) in universes {
        if values.len() != DMX_CHANNELS {
            return Err(ControllerError::Invariant(format!(
                "universe {universe} must have exactly {DMX_CHANNELS} values, got {}",
                values.len()
            )));
        }
    }
    Ok(())
}

/// Sort frames by timestamp, pin the first to t=0, drop frames past the
/// duration and make sure a terminal frame sits exactly on it.
pub fn normalize_frames(mut frames: Vec<AnimatedFrame>, duration_ms: u64) -> Vec<AnimatedFrame> {
    if frames.is_empty() {
        return frames;
    }
    frames.sort_by_key(|frame| frame.timestamp_ms);
    frames[0].timestamp_ms = 0;
    frames.retain(|frame| frame.timestamp_ms <= duration_ms);
    match frames.last() {
        Some(last) if last.timestamp_ms == duration_ms => {}
        Some(last) => {
            let universes = last.universes.clone();
            frames.push(AnimatedFrame {
                timestamp_ms: duration_ms,
                universes,
            });
        }
        None => {}
    }
    frames
}

/// Order-insensitive fingerprint of a payload, used to detect frame
/// changes without comparing full 512-byte arrays everywhere.
pub fn payload_signature(universes: &UniversePayload) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (universe, values) in universes {
        universe.hash(&mut hasher);
        values.hash(&mut hasher);
    }
    hasher.finish()
}

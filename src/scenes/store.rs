use std::collections::HashMap;
use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::write_json_file;
use crate::error::ControllerError;
use crate::scenes::delta::{self, CompactFrames};
use crate::scenes::model::{AnimatedFrame, PlaybackMode, Scene, SceneStyle, SceneType, UniversePayload};

const ORDER_FILE: &str = "_order.json";

/// On-disk scene document. Dynamic frames are stored compact; the legacy
/// uncompressed `animated_frames` field stays readable.
#[derive(Debug, Serialize, Deserialize)]
struct SceneFile {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type", default)]
    scene_type: SceneType,
    #[serde(default)]
    universes: UniversePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    style: Option<SceneStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    playback_mode: Option<PlaybackMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    animated_frames: Vec<AnimatedFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    animated_frames_compact: Option<CompactFrames>,
}

impl SceneFile {
    fn into_scene(self) -> Result<Scene, ControllerError> {
        let animated_frames = match self.animated_frames_compact {
            Some(compact) => delta::decode(&compact)?,
            None => self.animated_frames,
        };
        let mut scene = Scene {
            id: self.id,
            name: self.name,
            description: self.description,
            scene_type: self.scene_type,
            universes: self.universes,
            created_at: self.created_at,
            style: self.style,
            duration_ms: self.duration_ms,
            playback_mode: self.playback_mode,
            animated_frames,
        };
        scene.normalize();
        scene.validate()?;
        Ok(scene)
    }

    fn from_scene(scene: &Scene) -> Result<Self, ControllerError> {
        let compact = if scene.is_dynamic() {
            Some(delta::encode(&scene.animated_frames)?)
        } else {
            None
        };
        Ok(Self {
            id: scene.id.clone(),
            name: scene.name.clone(),
            description: scene.description.clone(),
            scene_type: scene.scene_type,
            universes: scene.universes.clone(),
            created_at: scene.created_at.clone(),
            style: scene.style.clone(),
            duration_ms: scene.duration_ms,
            playback_mode: scene.is_dynamic().then(|| scene.playback_mode()),
            animated_frames: Vec::new(),
            animated_frames_compact: compact,
        })
    }
}

/// File-backed scene store: one `<id>.json` per scene plus `_order.json`
/// holding the operator-chosen ordering.
pub struct SceneStore {
    dir: PathBuf,
}

impl SceneStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn scene_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn order_path(&self) -> PathBuf {
        self.dir.join(ORDER_FILE)
    }

    fn ensure_dir(&self) -> Result<(), ControllerError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|err| ControllerError::Persistence(format!("{}: {err}", self.dir.display())))
    }

    /// Ids of every scene file currently on disk, sorted.
    fn scene_ids(&self) -> Result<Vec<String>, ControllerError> {
        self.ensure_dir()?;
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|err| ControllerError::Persistence(format!("{}: {err}", self.dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if format!("{stem}.json") == ORDER_FILE {
                continue;
            }
            ids.push(stem.to_string());
        }
        ids.sort();
        Ok(ids)
    }

    fn load_order(&self) -> Vec<String> {
        let path = self.order_path();
        if !path.exists() {
            return Vec::new();
        }
        match std::fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|data| serde_json::from_str::<Vec<String>>(&data).map_err(|err| err.to_string()))
        {
            Ok(order) => order,
            Err(err) => {
                warn!("failed to read scene order file, ignoring: {err}");
                Vec::new()
            }
        }
    }

    fn save_order(&self, order: &[String]) -> Result<(), ControllerError> {
        write_json_file(&self.order_path(), &order)
    }

    /// Drop unknown ids from the stored order and append any scene files
    /// missing from it, in id-sorted order.
    fn normalize_order(&self) -> Result<Vec<String>, ControllerError> {
        let existing = self.scene_ids()?;
        let mut order: Vec<String> = self
            .load_order()
            .into_iter()
            .filter(|id| existing.contains(id))
            .collect();
        for id in &existing {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        self.save_order(&order)?;
        Ok(order)
    }

    pub fn list_scenes(&self) -> Result<Vec<Scene>, ControllerError> {
        let order = self.normalize_order()?;
        let mut scenes_by_id: HashMap<String, Scene> = HashMap::new();
        for id in &order {
            match self.read_scene_file(id) {
                Ok(Some(scene)) => {
                    scenes_by_id.insert(id.clone(), scene);
                }
                Ok(None) => {}
                Err(err) => warn!("skipping invalid scene file {id}.json: {err}"),
            }
        }
        Ok(order
            .iter()
            .filter_map(|id| scenes_by_id.remove(id))
            .collect())
    }

    pub fn get_scene(&self, id: &str) -> Option<Scene> {
        match self.read_scene_file(id) {
            Ok(scene) => scene,
            Err(err) => {
                warn!("failed to load scene {id}: {err}");
                None
            }
        }
    }

    fn read_scene_file(&self, id: &str) -> Result<Option<Scene>, ControllerError> {
        let path = self.scene_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|err| ControllerError::Persistence(format!("{}: {err}", path.display())))?;
        let file: SceneFile = serde_json::from_str(&data)
            .map_err(|err| ControllerError::Persistence(format!("{}: {err}", path.display())))?;
        Ok(Some(file.into_scene()?))
    }

    /// Validate and persist a scene. Fails with `Conflict` when another
    /// scene already uses the name (case-insensitive). Dynamic frames are
    /// checked to reconstruct losslessly before anything is written.
    pub fn save_scene(&self, scene: &mut Scene) -> Result<(), ControllerError> {
        scene.validate()?;
        self.ensure_unique_name(&scene.name, Some(&scene.id))?;

        if scene.created_at.is_none() {
            scene.created_at = Some(chrono::Utc::now().to_rfc3339());
        }

        let file = SceneFile::from_scene(scene)?;
        if let Some(compact) = &file.animated_frames_compact {
            // A scene that cannot be reconstructed must never reach disk.
            let decoded = delta::decode(compact)?;
            if decoded != scene.animated_frames {
                return Err(ControllerError::Invariant(format!(
                    "delta encoding for scene {} is not lossless",
                    scene.id
                )));
            }
        }

        self.ensure_dir()?;
        let is_new = !self.scene_path(&scene.id).exists();
        write_json_file(&self.scene_path(&scene.id), &file)?;

        if is_new {
            let mut order = self.normalize_order()?;
            if !order.contains(&scene.id) {
                order.push(scene.id.clone());
                self.save_order(&order)?;
            }
        }
        Ok(())
    }

    pub fn delete_scene(&self, id: &str) -> Result<(), ControllerError> {
        let path = self.scene_path(id);
        if !path.exists() {
            return Err(ControllerError::NotFound(format!("scene {id}")));
        }
        std::fs::remove_file(&path)
            .map_err(|err| ControllerError::Persistence(format!("{}: {err}", path.display())))?;
        let order: Vec<String> = self
            .normalize_order()?
            .into_iter()
            .filter(|existing| existing != id)
            .collect();
        self.save_order(&order)?;
        Ok(())
    }

    /// Reorder scenes. Ids in `scene_ids` keep their first-occurrence
    /// order; unknown ids are dropped and missing ones appended id-sorted.
    pub fn set_scene_order(&self, scene_ids: &[String]) -> Result<Vec<String>, ControllerError> {
        let existing = self.scene_ids()?;
        let mut ordered: Vec<String> = Vec::new();
        for id in scene_ids {
            if existing.contains(id) && !ordered.contains(id) {
                ordered.push(id.clone());
            }
        }
        for id in &existing {
            if !ordered.contains(id) {
                ordered.push(id.clone());
            }
        }
        self.save_order(&ordered)?;
        Ok(ordered)
    }

    /// Fail with `Conflict` when a different scene already uses `name`.
    pub fn ensure_unique_name(
        &self,
        name: &str,
        ignore_id: Option<&str>,
    ) -> Result<(), ControllerError> {
        let needle = name.trim().to_lowercase();
        for id in self.scene_ids()? {
            if Some(id.as_str()) == ignore_id {
                continue;
            }
            if let Some(scene) = self.get_scene(&id) {
                if scene.name.trim().to_lowercase() == needle {
                    return Err(ControllerError::Conflict(format!(
                        "scene name {name:?} is already used by {id}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Derive a fresh id from a name: slugified, `_2`/`_3`/... appended on
    /// collision with an existing file.
    pub fn allocate_id(&self, name: &str) -> Result<String, ControllerError> {
        let base = slugify(name);
        if !self.scene_path(&base).exists() {
            return Ok(base);
        }
        let mut counter = 2usize;
        loop {
            let candidate = format!("{base}_{counter}");
            if !self.scene_path(&candidate).exists() {
                return Ok(candidate);
            }
            counter += 1;
        }
    }
}

/// Lowercase `a-z0-9` slug; runs of anything else collapse to a single
/// underscore. Empty input falls back to "scene".
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.chars().flat_map(|ch| ch.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch);
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        "scene".to_string()
    } else {
        slug
    }
}

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use artnet::DmxStream;

use crate::auth;
use crate::config::Settings;
use crate::error::ControllerError;
use crate::events::{EventHub, EventSubscriber};
use crate::fixture_plan::{FixtureParameter, FixturePlanDetails, FixturePlanState, FixturePlanSummary};
use crate::groups::{derive_groups, GroupLayout};
use crate::mixer::{self, AtmosphereAddresses};
use crate::recording::RecordingSession;
use crate::scenes::model::{PlaybackMode, Scene, SceneStyle, SceneType, UniversePayload, DMX_CHANNELS};
use crate::scenes::store::SceneStore;

/// Reserved scene ids that never correspond to a stored scene.
pub const BLACKOUT_SCENE_ID: &str = "__blackout__";
pub const EDITOR_LIVE_SCENE_ID: &str = "__editor_live__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Panel,
    External,
}

impl FromStr for ControlMode {
    type Err = ControllerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "panel" => Ok(Self::Panel),
            "external" => Ok(Self::External),
            other => Err(ControllerError::InvalidInput(format!(
                "unknown control mode {other:?}"
            ))),
        }
    }
}

struct LiveEditor {
    scene_id: String,
    previous_payload: Option<UniversePayload>,
    previous_active_scene_id: Option<String>,
}

struct DynamicPlayback {
    scene_id: String,
    stop_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Process-wide playback state S. Everything in here is guarded by one
/// mutex; stream refreshes and event emissions happen after it is
/// released.
struct PlaybackState {
    base_payload: Option<UniversePayload>,
    active_scene_id: Option<String>,
    control_mode: ControlMode,
    master_dimmer_percent: u8,
    haze_percent: u8,
    fog_flash_active: bool,
    group_values: HashMap<String, u8>,
    group_muted: HashSet<String>,
    live_editor: Option<LiveEditor>,
    dynamic_playback: Option<DynamicPlayback>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            base_payload: None,
            active_scene_id: None,
            control_mode: ControlMode::Panel,
            master_dimmer_percent: 100,
            haze_percent: 0,
            fog_flash_active: false,
            group_values: HashMap::new(),
            group_muted: HashSet::new(),
            live_editor: None,
            dynamic_playback: None,
        }
    }
}

/// The controller: owns playback state, the outbound stream, the scene
/// store, the fixture plan and the event hub. Clones share everything,
/// so worker threads can carry one around.
#[derive(Clone)]
pub struct Controller {
    state: Arc<Mutex<PlaybackState>>,
    stream: Arc<DmxStream>,
    store: Arc<SceneStore>,
    plan: Arc<FixturePlanState>,
    settings: Arc<Mutex<Settings>>,
    events: EventHub,
    recording: Arc<Mutex<Option<RecordingSession>>>,
}

impl Controller {
    pub fn new(settings: Settings) -> Self {
        let store = SceneStore::new(&settings.scenes_path);
        let plan = FixturePlanState::load(&settings.fixture_plan_path);
        let controller = Self {
            state: Arc::new(Mutex::new(PlaybackState::default())),
            stream: Arc::new(DmxStream::default()),
            store: Arc::new(store),
            plan: Arc::new(plan),
            settings: Arc::new(Mutex::new(settings)),
            events: EventHub::default(),
            recording: Arc::new(Mutex::new(None)),
        };
        controller.reset_group_state();
        controller
    }

    // ------------------------------------------------------------------
    // Scene playback
    // ------------------------------------------------------------------

    /// Select a scene: install its initial payload as the stream base and
    /// start the dynamic playback worker for animated scenes.
    pub fn play_scene(&self, scene_id: &str) -> Result<(), ControllerError> {
        self.ensure_panel()?;
        self.ensure_no_recording()?;
        let scene = self
            .store
            .get_scene(scene_id)
            .ok_or_else(|| ControllerError::NotFound(format!("scene {scene_id}")))?;

        // The previous worker must be gone before the new base payload
        // lands, so frames from two scenes can never interleave.
        self.stop_dynamic_playback();
        {
            let mut state = self.state.lock().unwrap();
            state.live_editor = None;
            state.base_payload = Some(scene.initial_payload());
            state.active_scene_id = Some(scene.id.clone());
        }
        self.refresh_stream()?;
        if scene.is_dynamic() {
            self.spawn_dynamic_playback(&scene);
        }
        self.emit_status();
        Ok(())
    }

    /// All-zero payload on every configured universe.
    pub fn blackout(&self) -> Result<(), ControllerError> {
        self.ensure_panel()?;
        self.cancel_recording_internal(false);
        self.stop_dynamic_playback();
        let universe_count = self.settings.lock().unwrap().universe_count;
        {
            let mut state = self.state.lock().unwrap();
            state.live_editor = None;
            state.fog_flash_active = false;
            state.base_payload = Some(
                (0..universe_count)
                    .map(|universe| (universe, vec![0u8; DMX_CHANNELS]))
                    .collect(),
            );
            state.active_scene_id = Some(BLACKOUT_SCENE_ID.to_string());
        }
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    /// Tear down everything: live edit, recording, playback, stream.
    pub fn stop(&self) -> Result<(), ControllerError> {
        self.cancel_recording_internal(false);
        self.stop_dynamic_playback();
        {
            let mut state = self.state.lock().unwrap();
            state.live_editor = None;
            state.fog_flash_active = false;
            state.base_payload = None;
            state.active_scene_id = None;
        }
        self.stream.stop();
        self.emit_status();
        Ok(())
    }

    pub fn set_control_mode(&self, mode: ControlMode) -> Result<(), ControllerError> {
        let current = self.state.lock().unwrap().control_mode;
        if current == mode {
            return Ok(());
        }
        match mode {
            ControlMode::External => {
                // Handing the rig to an external desk clears every local
                // overlay and silences our stream.
                self.cancel_recording_internal(false);
                self.stop_dynamic_playback();
                {
                    let mut state = self.state.lock().unwrap();
                    state.control_mode = ControlMode::External;
                    state.live_editor = None;
                    state.fog_flash_active = false;
                    state.base_payload = None;
                    state.active_scene_id = None;
                }
                self.stream.stop();
            }
            ControlMode::Panel => {
                self.state.lock().unwrap().control_mode = ControlMode::Panel;
            }
        }
        self.emit_status();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mixing controls
    // ------------------------------------------------------------------

    pub fn set_master_dimmer(&self, percent: u8) -> Result<(), ControllerError> {
        check_percent(percent)?;
        self.state.lock().unwrap().master_dimmer_percent = percent;
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    pub fn set_haze(&self, percent: u8) -> Result<(), ControllerError> {
        check_percent(percent)?;
        self.state.lock().unwrap().haze_percent = percent;
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    pub fn set_fog_flash(&self, active: bool) -> Result<(), ControllerError> {
        self.state.lock().unwrap().fog_flash_active = active;
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    pub fn set_group_dimmer_value(&self, key: &str, percent: u8) -> Result<(), ControllerError> {
        check_percent(percent)?;
        self.ensure_group_op(key)?;
        self.state
            .lock()
            .unwrap()
            .group_values
            .insert(key.to_string(), percent);
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    pub fn set_group_dimmer_mute(&self, key: &str, muted: bool) -> Result<(), ControllerError> {
        self.ensure_group_op(key)?;
        {
            let mut state = self.state.lock().unwrap();
            if muted {
                state.group_muted.insert(key.to_string());
            } else {
                state.group_muted.remove(key);
            }
        }
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Live editor
    // ------------------------------------------------------------------

    /// Begin live-editing a static scene: the provided payload replaces
    /// the stream base while the previous state is parked for restore.
    pub fn live_editor_start(
        &self,
        scene_id: &str,
        universes: UniversePayload,
    ) -> Result<(), ControllerError> {
        self.ensure_panel()?;
        self.ensure_no_recording()?;
        if self.state.lock().unwrap().live_editor.is_some() {
            return Err(ControllerError::Conflict(
                "live editor is already active".to_string(),
            ));
        }
        let scene = self
            .store
            .get_scene(scene_id)
            .ok_or_else(|| ControllerError::NotFound(format!("scene {scene_id}")))?;
        if scene.is_dynamic() {
            return Err(ControllerError::InvalidInput(
                "live editor requires a static scene".to_string(),
            ));
        }
        check_layout(&scene.universes, &universes)?;

        self.stop_dynamic_playback();
        {
            let mut state = self.state.lock().unwrap();
            if state.live_editor.is_some() {
                return Err(ControllerError::Conflict(
                    "live editor is already active".to_string(),
                ));
            }
            state.live_editor = Some(LiveEditor {
                scene_id: scene.id.clone(),
                previous_payload: state.base_payload.clone(),
                previous_active_scene_id: state.active_scene_id.clone(),
            });
            state.base_payload = Some(universes);
            state.active_scene_id = Some(EDITOR_LIVE_SCENE_ID.to_string());
        }
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    /// Push the next edited payload. High-frequency path: no status event.
    pub fn live_editor_update(&self, universes: UniversePayload) -> Result<(), ControllerError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.live_editor.is_none() {
                return Err(ControllerError::Conflict(
                    "live editor is not active".to_string(),
                ));
            }
            let current = state.base_payload.clone().unwrap_or_default();
            check_layout(&current, &universes)?;
            state.base_payload = Some(universes);
        }
        self.refresh_stream()?;
        Ok(())
    }

    pub fn live_editor_stop(&self, restore_previous: bool) -> Result<(), ControllerError> {
        {
            let mut state = self.state.lock().unwrap();
            let editor = state.live_editor.take().ok_or_else(|| {
                ControllerError::Conflict("live editor is not active".to_string())
            })?;
            if restore_previous {
                state.base_payload = editor.previous_payload;
                state.active_scene_id = editor.previous_active_scene_id;
            }
        }
        self.refresh_stream()?;
        self.emit_status();
        Ok(())
    }

    pub fn live_editor_scene_id(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .live_editor
            .as_ref()
            .map(|editor| editor.scene_id.clone())
    }

    // ------------------------------------------------------------------
    // Snapshot and dynamic recording
    // ------------------------------------------------------------------

    /// Capture the rig's current output into a new static scene. The
    /// stream is stopped for the capture (port 6454 handover) and the
    /// prior payload/scene come back afterwards in panel mode.
    pub fn record_static_scene(
        &self,
        name: &str,
        description: &str,
        universes: &[u16],
        duration: Duration,
    ) -> Result<Scene, ControllerError> {
        self.ensure_no_recording()?;
        self.store.ensure_unique_name(name, None)?;

        let (prior_active, prior_mode, was_dynamic) = {
            let state = self.state.lock().unwrap();
            (
                state.active_scene_id.clone(),
                state.control_mode,
                state.dynamic_playback.is_some(),
            )
        };
        self.stop_dynamic_playback();
        self.stream.stop();

        let snapshot = match artnet::record_snapshots(universes, duration) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // Bring the stream back before reporting the failure.
                self.restore_playback(prior_mode, was_dynamic, prior_active.as_deref());
                return Err(err.into());
            }
        };

        let payload: UniversePayload = snapshot
            .into_iter()
            .map(|(universe, values)| (universe, values.to_vec()))
            .collect();
        let id = self.store.allocate_id(name)?;
        let mut scene = Scene::new_static(&id, name, payload);
        scene.description = description.to_string();
        let saved = self.store.save_scene(&mut scene);

        self.restore_playback(prior_mode, was_dynamic, prior_active.as_deref());
        saved?;
        self.emit_scenes();
        self.emit_status();
        Ok(scene)
    }

    /// Start a dynamic capture on every configured universe. The stream
    /// is silenced so the external source owns the rig for the take.
    pub fn start_dynamic_recording(&self) -> Result<(), ControllerError> {
        self.ensure_panel()?;
        self.ensure_no_recording()?;
        if self.state.lock().unwrap().live_editor.is_some() {
            return Err(ControllerError::Conflict(
                "live editor is active".to_string(),
            ));
        }

        let universe_count = self.settings.lock().unwrap().universe_count;
        let targets: Vec<u16> = (0..universe_count).collect();

        let (restore_payload, restore_scene_id) = {
            let state = self.state.lock().unwrap();
            (state.base_payload.clone(), state.active_scene_id.clone())
        };
        self.stop_dynamic_playback();
        {
            let mut state = self.state.lock().unwrap();
            state.base_payload = None;
            state.active_scene_id = None;
        }
        self.stream.stop();

        match RecordingSession::start(&targets, restore_payload.clone(), restore_scene_id.clone()) {
            Ok(session) => {
                *self.recording.lock().unwrap() = Some(session);
                self.emit_status();
                Ok(())
            }
            Err(err) => {
                // Failed to grab the port: put the previous state back.
                {
                    let mut state = self.state.lock().unwrap();
                    state.base_payload = restore_payload;
                    state.active_scene_id = restore_scene_id;
                }
                if let Err(refresh_err) = self.refresh_stream() {
                    warn!("stream restore after failed recording start: {refresh_err}");
                }
                Err(err)
            }
        }
    }

    /// Finish (or re-quantize) the running capture. Returns the recording
    /// status view so callers can inspect frame count and duration.
    pub fn stop_dynamic_recording(&self, bpm: Option<f64>) -> Result<Value, ControllerError> {
        let view = {
            let mut guard = self.recording.lock().unwrap();
            let session = guard.as_mut().ok_or_else(|| {
                ControllerError::Conflict("no dynamic recording in progress".to_string())
            })?;
            session.stop(bpm);
            session.status_view()
        };
        self.emit_status();
        Ok(view)
    }

    /// Persist the ready capture as a dynamic scene and restore the
    /// pre-recording playback state.
    pub fn save_dynamic_recording(
        &self,
        name: &str,
        description: &str,
        playback_mode: PlaybackMode,
    ) -> Result<Scene, ControllerError> {
        let (frames, duration_ms) = {
            let guard = self.recording.lock().unwrap();
            let session = guard.as_ref().ok_or_else(|| {
                ControllerError::Conflict("no dynamic recording in progress".to_string())
            })?;
            session.ready_frames()?
        };
        self.store.ensure_unique_name(name, None)?;

        let id = self.store.allocate_id(name)?;
        let mut scene = Scene {
            id,
            name: name.to_string(),
            description: description.to_string(),
            scene_type: SceneType::Dynamic,
            universes: frames[0].universes.clone(),
            created_at: None,
            style: None,
            duration_ms: Some(duration_ms),
            playback_mode: Some(playback_mode),
            animated_frames: frames,
        };
        // Save before consuming the session, so a persistence failure
        // leaves the capture available for another attempt.
        self.store.save_scene(&mut scene)?;

        let session = self.recording.lock().unwrap().take();
        if let Some(mut session) = session {
            session.cancel();
            self.restore_after_recording(session, true);
        }
        self.emit_scenes();
        self.emit_status();
        Ok(scene)
    }

    /// Drop the capture and restore the pre-recording state. No-op when
    /// nothing is recording.
    pub fn cancel_dynamic_recording(&self) -> Result<(), ControllerError> {
        self.cancel_recording_internal(true);
        self.emit_status();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scene management
    // ------------------------------------------------------------------

    pub fn list_scenes(&self) -> Result<Vec<Scene>, ControllerError> {
        self.store.list_scenes()
    }

    pub fn get_scene(&self, scene_id: &str) -> Option<Scene> {
        self.store.get_scene(scene_id)
    }

    pub fn create_static_scene(
        &self,
        name: &str,
        description: &str,
        universes: UniversePayload,
        style: Option<SceneStyle>,
    ) -> Result<Scene, ControllerError> {
        let id = self.store.allocate_id(name)?;
        let mut scene = Scene::new_static(&id, name, universes);
        scene.description = description.to_string();
        scene.style = style;
        self.store.save_scene(&mut scene)?;
        self.emit_scenes();
        Ok(scene)
    }

    /// Update name/description/style, optionally moving the scene to a
    /// new id. The active scene id follows a rename.
    pub fn update_scene_meta(
        &self,
        scene_id: &str,
        name: &str,
        description: &str,
        style: Option<SceneStyle>,
        new_id: Option<&str>,
    ) -> Result<Scene, ControllerError> {
        let mut scene = self
            .store
            .get_scene(scene_id)
            .ok_or_else(|| ControllerError::NotFound(format!("scene {scene_id}")))?;

        let target_id = new_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(scene_id);
        if target_id != scene_id && self.store.get_scene(target_id).is_some() {
            return Err(ControllerError::Conflict(format!(
                "target scene id {target_id} already exists"
            )));
        }
        self.store.ensure_unique_name(name, Some(scene_id))?;

        let original = scene.clone();
        scene.id = target_id.to_string();
        scene.name = name.to_string();
        scene.description = description.to_string();
        scene.style = style;

        // Remove the old file first so the rename does not collide with
        // its own name; put it back if the save fails.
        if target_id != scene_id {
            self.store.delete_scene(scene_id)?;
        }
        if let Err(err) = self.store.save_scene(&mut scene) {
            if target_id != scene_id {
                let mut rollback = original;
                if let Err(rollback_err) = self.store.save_scene(&mut rollback) {
                    warn!("failed to roll back rename of {scene_id}: {rollback_err}");
                }
            }
            return Err(err);
        }

        if target_id != scene_id {
            let mut state = self.state.lock().unwrap();
            if state.active_scene_id.as_deref() == Some(scene_id) {
                state.active_scene_id = Some(target_id.to_string());
            }
        }
        self.emit_scenes();
        self.emit_status();
        Ok(scene)
    }

    /// Delete a scene; deleting the active scene stops the stream.
    pub fn delete_scene(&self, scene_id: &str) -> Result<(), ControllerError> {
        self.store.delete_scene(scene_id)?;
        let was_active =
            self.state.lock().unwrap().active_scene_id.as_deref() == Some(scene_id);
        if was_active {
            self.stop()?;
        }
        self.emit_scenes();
        Ok(())
    }

    pub fn reorder_scenes(&self, scene_ids: &[String]) -> Result<Vec<String>, ControllerError> {
        let order = self.store.set_scene_order(scene_ids)?;
        self.emit_scenes();
        Ok(order)
    }

    // ------------------------------------------------------------------
    // Settings & fixture plan
    // ------------------------------------------------------------------

    /// Apply the runtime-mutable settings, persist them and restart the
    /// stream so the new pacing/node address take effect.
    pub fn update_runtime_settings(
        &self,
        node_ip: Option<String>,
        dmx_fps: Option<f64>,
        poll_interval: Option<f64>,
        universe_count: Option<u16>,
    ) -> Result<Value, ControllerError> {
        if let Some(count) = universe_count {
            if count < 1 {
                return Err(ControllerError::InvalidInput(
                    "universe_count must be >= 1".to_string(),
                ));
            }
        }
        if let Some(interval) = poll_interval {
            if !interval.is_finite() || interval <= 0.0 {
                return Err(ControllerError::InvalidInput(
                    "poll_interval must be positive".to_string(),
                ));
            }
        }
        if let Some(fps) = dmx_fps {
            if !fps.is_finite() {
                return Err(ControllerError::InvalidInput(
                    "dmx_fps must be a number".to_string(),
                ));
            }
        }

        let view = {
            let mut settings = self.settings.lock().unwrap();
            if let Some(node_ip) = node_ip {
                settings.node_ip = node_ip;
            }
            if let Some(fps) = dmx_fps {
                settings.dmx_fps = fps;
            }
            if let Some(interval) = poll_interval {
                settings.poll_interval = interval;
            }
            if let Some(count) = universe_count {
                settings.universe_count = count;
            }
            settings.persist_runtime()?;
            settings.runtime_view()
        };

        // Pacing and poll target only change across a restart.
        if self.stream.is_running() {
            self.stream.stop();
            self.refresh_stream()?;
        }
        self.events.broadcast("settings", view.clone());
        Ok(view)
    }

    pub fn settings_view(&self) -> Value {
        self.settings.lock().unwrap().runtime_view()
    }

    pub fn preview_fixture_plan(
        &self,
        xml: &str,
        source_filename: Option<&str>,
    ) -> Result<FixturePlanSummary, ControllerError> {
        self.plan.preview(xml, source_filename)
    }

    pub fn activate_fixture_plan(
        &self,
        xml: &str,
        source_filename: Option<&str>,
    ) -> Result<FixturePlanSummary, ControllerError> {
        let summary = self.plan.activate(xml, source_filename)?;
        self.reset_group_state();
        self.refresh_stream()?;
        self.emit_fixture_plan();
        self.emit_status();
        Ok(summary)
    }

    pub fn clear_fixture_plan(&self) -> Result<(), ControllerError> {
        self.plan.clear()?;
        self.reset_group_state();
        self.refresh_stream()?;
        self.emit_fixture_plan();
        self.emit_status();
        Ok(())
    }

    pub fn fixture_plan_summary(&self) -> FixturePlanSummary {
        self.plan.summary()
    }

    pub fn fixture_plan_details(&self) -> FixturePlanDetails {
        self.plan.details()
    }

    pub fn lookup_fixture_parameter(&self, universe: u16, channel: u16) -> Option<FixtureParameter> {
        self.plan.lookup_parameter(universe, channel)
    }

    pub fn verify_operator_pin(&self, pin: &str) -> Result<bool, ControllerError> {
        let hash = self.settings.lock().unwrap().operator_pin_hash.clone();
        auth::verify_pin(pin, &hash)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn subscribe_events(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_running()
    }

    pub fn base_payload(&self) -> Option<UniversePayload> {
        self.state.lock().unwrap().base_payload.clone()
    }

    pub fn active_scene_id(&self) -> Option<String> {
        self.state.lock().unwrap().active_scene_id.clone()
    }

    pub fn control_mode(&self) -> ControlMode {
        self.state.lock().unwrap().control_mode
    }

    pub fn status(&self) -> Value {
        let (
            active_scene_id,
            control_mode,
            master,
            haze,
            fog,
            live_editor_scene_id,
            playback_scene_id,
        ) = {
            let state = self.state.lock().unwrap();
            (
                state.active_scene_id.clone(),
                state.control_mode,
                state.master_dimmer_percent,
                state.haze_percent,
                state.fog_flash_active,
                state.live_editor.as_ref().map(|editor| editor.scene_id.clone()),
                state
                    .dynamic_playback
                    .as_ref()
                    .map(|playback| playback.scene_id.clone()),
            )
        };
        let recording = self
            .recording
            .lock()
            .unwrap()
            .as_ref()
            .map(|session| session.status_view());

        json!({
            "active_scene_id": active_scene_id,
            "control_mode": control_mode,
            "master_dimmer_percent": master,
            "haze_percent": haze,
            "fog_flash_active": fog,
            "group_dimmers": self.group_dimmer_views(),
            "live_editor_scene_id": live_editor_scene_id,
            "dynamic_playback_scene_id": playback_scene_id,
            "recording": recording,
            "streaming": self.stream.is_running(),
        })
    }

    pub fn group_dimmer_views(&self) -> Vec<Value> {
        let layouts = self.group_layouts();
        let (values, muted) = {
            let state = self.state.lock().unwrap();
            (state.group_values.clone(), state.group_muted.clone())
        };
        layouts
            .iter()
            .map(|group| {
                json!({
                    "key": group.key,
                    "name": group.name,
                    "fixture_count": group.fixture_count,
                    "channel_count": group.channel_count,
                    "value_percent": values.get(&group.key).copied().unwrap_or(100),
                    "muted": muted.contains(&group.key),
                })
            })
            .collect()
    }

    /// Orderly teardown for process exit.
    pub fn shutdown(&self) {
        self.cancel_recording_internal(false);
        self.stop_dynamic_playback();
        self.stream.stop();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_panel(&self) -> Result<(), ControllerError> {
        if self.state.lock().unwrap().control_mode != ControlMode::Panel {
            return Err(ControllerError::Conflict(
                "operation requires panel control mode".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_no_recording(&self) -> Result<(), ControllerError> {
        if self.recording.lock().unwrap().is_some() {
            return Err(ControllerError::Conflict(
                "dynamic recording in progress".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_group_op(&self, key: &str) -> Result<(), ControllerError> {
        self.ensure_panel()?;
        if !self.plan.is_active() {
            return Err(ControllerError::Conflict(
                "no active fixture plan".to_string(),
            ));
        }
        if !self.group_layouts().iter().any(|group| group.key == key) {
            return Err(ControllerError::NotFound(format!("group {key}")));
        }
        Ok(())
    }

    fn group_layouts(&self) -> Vec<GroupLayout> {
        self.plan
            .with_plan(|plan| plan.map(derive_groups).unwrap_or_default())
    }

    fn reset_group_state(&self) {
        let layouts = self.group_layouts();
        let mut state = self.state.lock().unwrap();
        state.group_values = layouts
            .iter()
            .map(|group| (group.key.clone(), 100u8))
            .collect();
        state.group_muted.clear();
    }

    /// Recompute the effective payload and push it to the stream. The
    /// stream runs exactly when the effective payload is non-empty.
    fn refresh_stream(&self) -> Result<(), ControllerError> {
        let (base, master, haze, fog, group_values, group_muted) = {
            let state = self.state.lock().unwrap();
            (
                state.base_payload.clone(),
                state.master_dimmer_percent,
                state.haze_percent,
                state.fog_flash_active,
                state.group_values.clone(),
                state.group_muted.clone(),
            )
        };
        let settings = self.settings.lock().unwrap().clone();

        let effective = match base {
            Some(base) if !base.is_empty() => mixer::mix(
                &base,
                master,
                &*self.plan,
                &group_values,
                &group_muted,
                haze,
                fog,
                &AtmosphereAddresses::from_settings(&settings),
            ),
            _ => UniversePayload::new(),
        };

        if effective.is_empty() {
            self.stream.stop();
            return Ok(());
        }
        if self.stream.is_running() {
            self.stream.update(effective);
            Ok(())
        } else {
            self.stream
                .start(effective, &settings.stream_config())
                .map_err(Into::into)
        }
    }

    fn spawn_dynamic_playback(&self, scene: &Scene) {
        let frames = scene.animated_frames.clone();
        let duration_ms = scene.duration_ms.unwrap_or(1).max(1);
        let mode = scene.playback_mode();
        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = {
            let controller = self.clone();
            let scene_id = scene.id.clone();
            thread::spawn(move || {
                dynamic_playback_loop(controller, scene_id, frames, duration_ms, mode, stop_rx)
            })
        };
        self.state.lock().unwrap().dynamic_playback = Some(DynamicPlayback {
            scene_id: scene.id.clone(),
            stop_tx,
            handle: Some(worker),
        });
    }

    /// Synchronously stop the playback worker, if any. Never called from
    /// the worker itself (that path is `finish_once_playback`).
    fn stop_dynamic_playback(&self) {
        let playback = self.state.lock().unwrap().dynamic_playback.take();
        if let Some(mut playback) = playback {
            let _ = playback.stop_tx.send(());
            if let Some(handle) = playback.handle.take() {
                let _ = handle.join();
            }
        }
    }

    /// Worker-side frame application. Returns false once the worker has
    /// been displaced and must exit.
    fn apply_dynamic_frame(&self, scene_id: &str, universes: &UniversePayload) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            let still_active = state
                .dynamic_playback
                .as_ref()
                .map(|playback| playback.scene_id == scene_id)
                .unwrap_or(false);
            if !still_active {
                return false;
            }
            state.base_payload = Some(universes.clone());
        }
        if let Err(err) = self.refresh_stream() {
            warn!("dynamic frame refresh failed: {err}");
        }
        true
    }

    /// Worker-side end of a play-once scene: the normal stop path, minus
    /// joining ourselves.
    fn finish_once_playback(&self, scene_id: &str) {
        {
            let mut state = self.state.lock().unwrap();
            let ours = state
                .dynamic_playback
                .as_ref()
                .map(|playback| playback.scene_id == scene_id)
                .unwrap_or(false);
            if !ours {
                return;
            }
            state.dynamic_playback = None;
            state.base_payload = None;
            state.active_scene_id = None;
            state.fog_flash_active = false;
        }
        self.stream.stop();
        self.emit_status();
    }

    fn cancel_recording_internal(&self, refresh: bool) {
        let session = self.recording.lock().unwrap().take();
        if let Some(mut session) = session {
            session.cancel();
            self.restore_after_recording(session, refresh);
        }
    }

    /// Put the pre-recording payload and scene back. Runs exactly once
    /// per session because the session is taken out of its slot first.
    fn restore_after_recording(&self, session: RecordingSession, refresh: bool) {
        let restore_scene_id = session.restore_scene_id.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.base_payload = session.restore_payload.clone();
            state.active_scene_id = restore_scene_id.clone();
        }
        if !refresh {
            return;
        }
        // A restored dynamic scene starts over from frame zero.
        if let Some(scene_id) = &restore_scene_id {
            if let Some(scene) = self.store.get_scene(scene_id) {
                if scene.is_dynamic() {
                    if let Err(err) = self.play_scene(scene_id) {
                        warn!("failed to resume scene {scene_id} after recording: {err}");
                    }
                    return;
                }
            }
        }
        if let Err(err) = self.refresh_stream() {
            warn!("stream restore after recording failed: {err}");
        }
    }

    /// Re-establish the pre-snapshot stream after a static capture.
    fn restore_playback(
        &self,
        prior_mode: ControlMode,
        was_dynamic: bool,
        prior_active: Option<&str>,
    ) {
        if prior_mode != ControlMode::Panel {
            return;
        }
        if was_dynamic {
            if let Some(scene_id) = prior_active {
                if let Err(err) = self.play_scene(scene_id) {
                    warn!("failed to resume scene {scene_id} after snapshot: {err}");
                }
                return;
            }
        }
        if let Err(err) = self.refresh_stream() {
            warn!("stream restore after snapshot failed: {err}");
        }
    }

    fn emit_status(&self) {
        self.events.broadcast("status", self.status());
    }

    fn emit_scenes(&self) {
        match self.store.list_scenes() {
            Ok(scenes) => {
                let summaries: Vec<Value> = scenes.iter().map(Scene::summary).collect();
                self.events.broadcast("scenes", json!(summaries));
            }
            Err(err) => warn!("failed to list scenes for event: {err}"),
        }
    }

    fn emit_fixture_plan(&self) {
        let summary = self.plan.summary();
        match serde_json::to_value(&summary) {
            Ok(value) => self.events.broadcast("fixture-plan", value),
            Err(err) => warn!("failed to serialize fixture plan summary: {err}"),
        }
    }
}

fn check_percent(percent: u8) -> Result<(), ControllerError> {
    if percent > 100 {
        return Err(ControllerError::InvalidInput(format!(
            "percent must be 0..=100, got {percent}"
        )));
    }
    Ok(())
}

/// The incoming payload must cover exactly the expected universes with
/// full 512-channel arrays.
fn check_layout(
    expected: &UniversePayload,
    provided: &UniversePayload,
) -> Result<(), ControllerError> {
    let expected_keys: Vec<u16> = expected.keys().copied().collect();
    let provided_keys: Vec<u16> = provided.keys().copied().collect();
    if expected_keys != provided_keys {
        return Err(ControllerError::InvalidInput(format!(
            "universe layout {provided_keys:?} does not match expected {expected_keys:?}"
        )));
    }
    for (universe, values) in provided {
        if values.len() != DMX_CHANNELS {
            return Err(ControllerError::InvalidInput(format!(
                "universe {universe} must have exactly {DMX_CHANNELS} values"
            )));
        }
    }
    Ok(())
}

fn dynamic_playback_loop(
    controller: Controller,
    scene_id: String,
    frames: Vec<crate::scenes::model::AnimatedFrame>,
    duration_ms: u64,
    mode: PlaybackMode,
    stop_rx: mpsc::Receiver<()>,
) {
    if frames.is_empty() {
        return;
    }
    let mut start = Instant::now();
    let mut last_applied: Option<usize> = None;

    loop {
        let mut elapsed = start.elapsed().as_millis() as u64;
        if elapsed >= duration_ms {
            match mode {
                PlaybackMode::Loop => {
                    // Shift the start point forward so elapsed keeps
                    // counting continuously inside the new cycle.
                    let wraps = elapsed / duration_ms;
                    start += Duration::from_millis(wraps * duration_ms);
                    elapsed = start.elapsed().as_millis() as u64;
                    last_applied = None;
                }
                PlaybackMode::Once => {
                    controller.finish_once_playback(&scene_id);
                    return;
                }
            }
        }

        let index = frames
            .iter()
            .rposition(|frame| frame.timestamp_ms <= elapsed)
            .unwrap_or(0);
        if last_applied != Some(index) {
            last_applied = Some(index);
            if !controller.apply_dynamic_frame(&scene_id, &frames[index].universes) {
                return;
            }
        }

        let next_boundary = frames
            .iter()
            .map(|frame| frame.timestamp_ms)
            .find(|&timestamp| timestamp > elapsed)
            .unwrap_or(duration_ms);
        let now = start.elapsed().as_millis() as u64;
        let until_next = next_boundary.saturating_sub(now).max(1);
        let wait = Duration::from_millis(until_next.min(50));
        match stop_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenes::model::AnimatedFrame;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn test_controller() -> (tempfile::TempDir, Controller) {
        let dir = tempdir().unwrap();
        let settings = Settings {
            local_ip: "127.0.0.1".to_string(),
            node_ip: "127.0.0.1".to_string(),
            dmx_fps: 60.0,
            poll_interval: 0.2,
            universe_count: 2,
            scenes_path: dir.path().join("scenes"),
            runtime_settings_path: dir.path().join("settings.runtime.json"),
            fixture_plan_path: dir.path().join("fixture_plan.active.json"),
            ..Settings::default()
        };
        (dir, Controller::new(settings))
    }

    fn payload(value: u8) -> UniversePayload {
        BTreeMap::from([(0u16, vec![value; DMX_CHANNELS])])
    }

    fn save_static(controller: &Controller, id: &str, name: &str, value: u8) {
        let mut scene = Scene::new_static(id, name, payload(value));
        controller.store.save_scene(&mut scene).unwrap();
    }

    fn save_dynamic(
        controller: &Controller,
        id: &str,
        name: &str,
        duration_ms: u64,
        mode: PlaybackMode,
    ) {
        let first = payload(10);
        let second = payload(200);
        let mut scene = Scene::new_static(id, name, first.clone());
        scene.scene_type = SceneType::Dynamic;
        scene.duration_ms = Some(duration_ms);
        scene.playback_mode = Some(mode);
        scene.animated_frames = vec![
            AnimatedFrame {
                timestamp_ms: 0,
                universes: first,
            },
            AnimatedFrame {
                timestamp_ms: duration_ms / 2,
                universes: second,
            },
        ];
        scene.normalize();
        controller.store.save_scene(&mut scene).unwrap();
    }

    #[test]
    fn play_static_scene_starts_stream() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 128);

        controller.play_scene("wash").unwrap();
        assert_eq!(controller.active_scene_id().as_deref(), Some("wash"));
        assert!(controller.is_streaming());
        assert_eq!(controller.base_payload().unwrap()[&0][0], 128);

        controller.stop().unwrap();
        assert!(!controller.is_streaming());
        assert!(controller.active_scene_id().is_none());
    }

    #[test]
    fn unknown_scene_is_not_found() {
        let (_dir, controller) = test_controller();
        assert!(matches!(
            controller.play_scene("ghost"),
            Err(ControllerError::NotFound(_))
        ));
    }

    #[test]
    fn external_mode_gates_panel_operations() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 128);
        controller.play_scene("wash").unwrap();

        controller.set_control_mode(ControlMode::External).unwrap();
        assert!(!controller.is_streaming());
        assert!(controller.active_scene_id().is_none());
        assert!(controller.base_payload().is_none());

        assert!(matches!(
            controller.play_scene("wash"),
            Err(ControllerError::Conflict(_))
        ));
        assert!(matches!(
            controller.blackout(),
            Err(ControllerError::Conflict(_))
        ));

        controller.set_control_mode(ControlMode::Panel).unwrap();
        controller.play_scene("wash").unwrap();
        assert!(controller.is_streaming());
        controller.stop().unwrap();
    }

    #[test]
    fn blackout_installs_zeros_on_every_universe() {
        let (_dir, controller) = test_controller();
        controller.blackout().unwrap();

        assert_eq!(
            controller.active_scene_id().as_deref(),
            Some(BLACKOUT_SCENE_ID)
        );
        let base = controller.base_payload().unwrap();
        assert_eq!(base.len(), 2);
        assert!(base[&0].iter().all(|&v| v == 0));
        assert!(base[&1].iter().all(|&v| v == 0));
        assert!(controller.is_streaming());
        controller.stop().unwrap();
    }

    #[test]
    fn master_dimmer_validates_input() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 200);
        controller.play_scene("wash").unwrap();

        assert!(matches!(
            controller.set_master_dimmer(101),
            Err(ControllerError::InvalidInput(_))
        ));
        controller.set_master_dimmer(50).unwrap();
        // The base payload stays unscaled; scaling happens in the mixer
        // on the way out.
        assert_eq!(controller.base_payload().unwrap()[&0][0], 200);
        controller.stop().unwrap();
    }

    #[test]
    fn group_operations_require_a_plan() {
        let (_dir, controller) = test_controller();
        assert!(matches!(
            controller.set_group_dimmer_value("spot", 50),
            Err(ControllerError::Conflict(_))
        ));

        let xml = r#"<ParameterListExport>
  <Parameter universe="1" number="1" fixture="Spot 1" name="Dimmer"/>
  <Parameter universe="1" number="7" fixture="Spot 2" name="Dimmer"/>
</ParameterListExport>"#;
        controller.activate_fixture_plan(xml, Some("rig.xml")).unwrap();

        controller.set_group_dimmer_value("spot", 40).unwrap();
        controller.set_group_dimmer_mute("spot", true).unwrap();
        assert!(matches!(
            controller.set_group_dimmer_value("ghost", 40),
            Err(ControllerError::NotFound(_))
        ));

        let views = controller.group_dimmer_views();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0]["value_percent"], 40);
        assert_eq!(views[0]["muted"], true);

        controller.clear_fixture_plan().unwrap();
        assert!(matches!(
            controller.set_group_dimmer_value("spot", 40),
            Err(ControllerError::Conflict(_))
        ));
    }

    #[test]
    fn live_editor_overlay_and_restore() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 100);
        controller.play_scene("wash").unwrap();

        controller.live_editor_start("wash", payload(30)).unwrap();
        assert_eq!(
            controller.active_scene_id().as_deref(),
            Some(EDITOR_LIVE_SCENE_ID)
        );
        assert_eq!(controller.live_editor_scene_id().as_deref(), Some("wash"));
        assert_eq!(controller.base_payload().unwrap()[&0][0], 30);

        // Second editor session conflicts.
        assert!(matches!(
            controller.live_editor_start("wash", payload(1)),
            Err(ControllerError::Conflict(_))
        ));

        controller.live_editor_update(payload(60)).unwrap();
        assert_eq!(controller.base_payload().unwrap()[&0][0], 60);

        // Wrong layout is rejected without touching state.
        let mut wrong = payload(5);
        wrong.insert(3, vec![0u8; DMX_CHANNELS]);
        assert!(matches!(
            controller.live_editor_update(wrong),
            Err(ControllerError::InvalidInput(_))
        ));
        assert_eq!(controller.base_payload().unwrap()[&0][0], 60);

        controller.live_editor_stop(true).unwrap();
        assert_eq!(controller.active_scene_id().as_deref(), Some("wash"));
        assert_eq!(controller.base_payload().unwrap()[&0][0], 100);
        controller.stop().unwrap();
    }

    #[test]
    fn live_editor_requires_static_scene() {
        let (_dir, controller) = test_controller();
        save_dynamic(&controller, "pulse", "Pulse", 1000, PlaybackMode::Loop);
        assert!(matches!(
            controller.live_editor_start("pulse", payload(1)),
            Err(ControllerError::InvalidInput(_))
        ));
        assert!(matches!(
            controller.live_editor_update(payload(1)),
            Err(ControllerError::Conflict(_))
        ));
    }

    #[test]
    fn dynamic_loop_wraps_to_the_matching_frame() {
        let (_dir, controller) = test_controller();
        save_dynamic(&controller, "pulse", "Pulse", 1000, PlaybackMode::Loop);

        controller.play_scene("pulse").unwrap();
        assert!(controller.is_streaming());

        // 1250 ms into a 1000 ms loop lands at 250 ms: still frame 0.
        thread::sleep(Duration::from_millis(1250));
        assert_eq!(controller.base_payload().unwrap()[&0][0], 10);

        // 1750 ms wraps to 750 ms: frame 1 applies.
        thread::sleep(Duration::from_millis(500));
        assert_eq!(controller.base_payload().unwrap()[&0][0], 200);

        controller.stop().unwrap();
    }

    #[test]
    fn play_once_stops_at_the_end() {
        let (_dir, controller) = test_controller();
        save_dynamic(&controller, "hit", "Hit", 200, PlaybackMode::Once);

        controller.play_scene("hit").unwrap();
        thread::sleep(Duration::from_millis(500));

        assert!(!controller.is_streaming());
        assert!(controller.active_scene_id().is_none());
        assert!(controller.base_payload().is_none());
    }

    #[test]
    fn replaying_replaces_the_worker() {
        let (_dir, controller) = test_controller();
        save_dynamic(&controller, "a", "A", 1000, PlaybackMode::Loop);
        save_dynamic(&controller, "b", "B", 1000, PlaybackMode::Loop);

        controller.play_scene("a").unwrap();
        controller.play_scene("b").unwrap();
        assert_eq!(controller.active_scene_id().as_deref(), Some("b"));

        // Exactly one worker: stopping clears it and the stream.
        controller.stop().unwrap();
        assert!(!controller.is_streaming());
    }

    #[test]
    fn delete_active_scene_stops_the_stream() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 10);
        controller.play_scene("wash").unwrap();

        controller.delete_scene("wash").unwrap();
        assert!(!controller.is_streaming());
        assert!(controller.active_scene_id().is_none());
    }

    #[test]
    fn rename_follows_active_scene() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 10);
        controller.play_scene("wash").unwrap();

        controller
            .update_scene_meta("wash", "Wash Warm", "", None, Some("wash_warm"))
            .unwrap();
        assert_eq!(controller.active_scene_id().as_deref(), Some("wash_warm"));
        assert!(controller.get_scene("wash").is_none());
        assert!(controller.get_scene("wash_warm").is_some());
        controller.stop().unwrap();
    }

    #[test]
    fn runtime_settings_update_validates_and_persists() {
        let (_dir, controller) = test_controller();
        assert!(matches!(
            controller.update_runtime_settings(None, None, None, Some(0)),
            Err(ControllerError::InvalidInput(_))
        ));
        assert!(matches!(
            controller.update_runtime_settings(None, None, Some(-1.0), None),
            Err(ControllerError::InvalidInput(_))
        ));

        let view = controller
            .update_runtime_settings(Some("10.1.1.1".to_string()), Some(25.0), None, Some(3))
            .unwrap();
        assert_eq!(view["node_ip"], "10.1.1.1");
        assert_eq!(view["dmx_fps"], 25.0);
        assert_eq!(view["universe_count"], 3);

        // Persisted: a fresh settings load sees the overlay.
        let path = controller
            .settings
            .lock()
            .unwrap()
            .runtime_settings_path
            .clone();
        let mut fresh = Settings {
            runtime_settings_path: path,
            ..Settings::default()
        };
        fresh.load_runtime_overlay();
        assert_eq!(fresh.universe_count, 3);
    }

    #[test]
    fn status_reflects_state() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 10);
        controller.play_scene("wash").unwrap();
        controller.set_haze(25).unwrap();

        let status = controller.status();
        assert_eq!(status["active_scene_id"], "wash");
        assert_eq!(status["control_mode"], "panel");
        assert_eq!(status["haze_percent"], 25);
        assert_eq!(status["streaming"], true);
        assert!(status["recording"].is_null());

        controller.stop().unwrap();
    }

    #[test]
    fn events_fire_on_transitions() {
        let (_dir, controller) = test_controller();
        save_static(&controller, "wash", "Wash", 10);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let mut subscriber = controller.subscribe_events();

        controller.play_scene("wash").unwrap();
        let message = runtime
            .block_on(subscriber.next_message_within(Duration::from_millis(200)))
            .unwrap();
        match message {
            crate::events::EventMessage::Event(event) => {
                assert_eq!(event.name, "status");
                assert_eq!(event.data["active_scene_id"], "wash");
            }
            other => panic!("expected status event, got {other:?}"),
        }
        controller.stop().unwrap();
    }

    #[test]
    fn control_mode_parsing() {
        assert_eq!("panel".parse::<ControlMode>().unwrap(), ControlMode::Panel);
        assert_eq!(
            "external".parse::<ControlMode>().unwrap(),
            ControlMode::External
        );
        assert!(matches!(
            "midi".parse::<ControlMode>(),
            Err(ControllerError::InvalidInput(_))
        ));
    }
}

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use serde::Serialize;

use artnet::protocol::parse_artdmx;

use crate::error::ControllerError;
use crate::scenes::model::{
    payload_signature, AnimatedFrame, UniversePayload, DMX_CHANNELS,
};

/// Hard cap on a capture; the worker stops itself at this point.
pub const MAX_DURATION_MS: u64 = 60_000;
/// Captures shorter than this are flagged `too_short` and cannot be saved.
pub const MIN_DURATION_MS: u64 = 1_500;

const RECV_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingPhase {
    Recording,
    Ready,
}

/// State shared with the receive worker.
struct Capture {
    accumulators: UniversePayload,
    frames_raw: Vec<AnimatedFrame>,
    last_signature: Option<u64>,
    auto_stopped: bool,
    elapsed_ms: u64,
}

/// One dynamic recording attempt: a worker draining UDP 6454 into
/// per-universe accumulators, then a `ready` result that can be
/// re-quantized and saved or discarded.
pub struct RecordingSession {
    phase: RecordingPhase,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    shared: Arc<Mutex<Capture>>,
    pub restore_payload: Option<UniversePayload>,
    pub restore_scene_id: Option<String>,
    pub frames: Vec<AnimatedFrame>,
    pub duration_ms: u64,
    raw_frames: Vec<AnimatedFrame>,
    raw_duration_ms: u64,
    pub auto_stopped: bool,
    pub too_short: bool,
    pub bpm_quantization: Option<f64>,
}

impl RecordingSession {
    /// Bind UDP 6454 and start capturing the given universes. Fails with
    /// `Conflict` when something else owns the port.
    pub fn start(
        universes: &[u16],
        restore_payload: Option<UniversePayload>,
        restore_scene_id: Option<String>,
    ) -> Result<Self, ControllerError> {
        let socket = artnet::bind_receiver(RECV_TIMEOUT)?;

        let accumulators: UniversePayload = universes
            .iter()
            .map(|universe| (*universe, vec![0u8; DMX_CHANNELS]))
            .collect();
        let shared = Arc::new(Mutex::new(Capture {
            accumulators,
            frames_raw: Vec::new(),
            last_signature: None,
            auto_stopped: false,
            elapsed_ms: 0,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let shared = shared.clone();
            let stop = stop.clone();
            thread::spawn(move || capture_loop(socket, shared, stop))
        };

        Ok(Self {
            phase: RecordingPhase::Recording,
            stop,
            worker: Some(worker),
            shared,
            restore_payload,
            restore_scene_id,
            frames: Vec::new(),
            duration_ms: 0,
            raw_frames: Vec::new(),
            raw_duration_ms: 0,
            auto_stopped: false,
            too_short: false,
            bpm_quantization: None,
        })
    }

    pub fn phase(&self) -> RecordingPhase {
        self.phase
    }

    /// Finish (or re-finish) the capture. The first call joins the worker
    /// and normalizes the raw frames; later calls re-quantize from the
    /// preserved raw data, so an operator can try different BPM values.
    pub fn stop(&mut self, bpm: Option<f64>) {
        if self.phase == RecordingPhase::Recording {
            self.stop_worker();
            let capture = &mut *self.shared.lock().unwrap();
            self.auto_stopped = capture.auto_stopped;
            self.raw_frames = std::mem::take(&mut capture.frames_raw);
            self.raw_duration_ms = capture.elapsed_ms.max(1);
            self.phase = RecordingPhase::Ready;
        }

        let (duration_ms, quantization) = match bpm {
            Some(bpm) if bpm > 0.0 => (quantize_duration(self.raw_duration_ms, bpm), Some(bpm)),
            _ => (self.raw_duration_ms, None),
        };
        self.duration_ms = duration_ms;
        self.bpm_quantization = quantization;
        self.frames = normalize_captured(self.raw_frames.clone(), duration_ms);
        self.too_short = self.raw_duration_ms < MIN_DURATION_MS;
    }

    /// Stop the worker without producing a result.
    pub fn cancel(&mut self) {
        self.stop_worker();
    }

    /// The frames/duration a scene save would use. Fails when the capture
    /// never became usable.
    pub fn ready_frames(&self) -> Result<(Vec<AnimatedFrame>, u64), ControllerError> {
        if self.phase != RecordingPhase::Ready {
            return Err(ControllerError::Conflict(
                "recording has not been stopped yet".to_string(),
            ));
        }
        if self.frames.len() < 2 {
            return Err(ControllerError::InvalidInput(
                "recording captured fewer than 2 frames".to_string(),
            ));
        }
        if self.raw_duration_ms < MIN_DURATION_MS {
            return Err(ControllerError::InvalidInput(format!(
                "recording is shorter than {MIN_DURATION_MS} ms"
            )));
        }
        Ok((self.frames.clone(), self.duration_ms))
    }

    pub fn status_view(&self) -> serde_json::Value {
        serde_json::json!({
            "phase": self.phase,
            "frame_count": self.frames.len(),
            "duration_ms": self.duration_ms,
            "raw_duration_ms": self.raw_duration_ms,
            "auto_stopped": self.auto_stopped,
            "too_short": self.too_short,
            "bpm_quantization": self.bpm_quantization,
        })
    }

    fn stop_worker(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        // The receive socket must never outlive the session.
        self.stop_worker();
    }
}

fn capture_loop(socket: UdpSocket, shared: Arc<Mutex<Capture>>, stop: Arc<AtomicBool>) {
    let started = Instant::now();
    let mut buf = [0u8; 2048];

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms >= MAX_DURATION_MS {
            shared.lock().unwrap().auto_stopped = true;
            break;
        }

        let (size, _addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                warn!("recording recv error: {err}");
                continue;
            }
        };

        let Some((universe, dmx)) = parse_artdmx(&buf[..size]) else {
            continue;
        };

        let capture = &mut *shared.lock().unwrap();
        let Some(values) = capture.accumulators.get_mut(&universe) else {
            continue;
        };
        let take = dmx.len().min(DMX_CHANNELS);
        values[..take].copy_from_slice(&dmx[..take]);

        let signature = payload_signature(&capture.accumulators);
        if capture.last_signature != Some(signature) {
            capture.last_signature = Some(signature);
            let timestamp_ms = started.elapsed().as_millis() as u64;
            let universes = capture.accumulators.clone();
            capture.frames_raw.push(AnimatedFrame {
                timestamp_ms,
                universes,
            });
        }
    }

    let total = started.elapsed().as_millis() as u64;
    shared.lock().unwrap().elapsed_ms = total.min(MAX_DURATION_MS);
}

/// Normalize raw captured frames into a playable sequence: sorted, first
/// frame pinned to t=0, consecutive duplicates dropped (unless a frame
/// sits exactly on the duration), trimmed to the duration with a terminal
/// frame replicating the final state.
pub fn normalize_captured(mut frames: Vec<AnimatedFrame>, duration_ms: u64) -> Vec<AnimatedFrame> {
    if frames.is_empty() {
        return frames;
    }
    frames.sort_by_key(|frame| frame.timestamp_ms);
    frames[0].timestamp_ms = 0;
    frames.retain(|frame| frame.timestamp_ms <= duration_ms);

    let mut deduped: Vec<AnimatedFrame> = Vec::with_capacity(frames.len());
    let mut last_signature: Option<u64> = None;
    for frame in frames {
        let signature = payload_signature(&frame.universes);
        if last_signature == Some(signature) && frame.timestamp_ms != duration_ms {
            continue;
        }
        last_signature = Some(signature);
        deduped.push(frame);
    }

    if let Some(last) = deduped.last() {
        if last.timestamp_ms != duration_ms {
            let universes = last.universes.clone();
            deduped.push(AnimatedFrame {
                timestamp_ms: duration_ms,
                universes,
            });
        }
    }
    deduped
}

/// Snap a captured duration to the nearest whole 4-beat bar, never
/// exceeding the capture itself.
pub fn quantize_duration(captured_ms: u64, bpm: f64) -> u64 {
    let bar_ms = 60_000.0 * 4.0 / bpm;
    let mut bars = (captured_ms as f64 / bar_ms).round() as u64;
    if bars < 1 {
        bars = 1;
    }
    let mut quantized = (bars as f64 * bar_ms).round() as u64;
    while bars > 1 && quantized > captured_ms {
        bars -= 1;
        quantized = (bars as f64 * bar_ms).round() as u64;
    }
    if quantized > captured_ms {
        captured_ms
    } else {
        quantized
    }
}

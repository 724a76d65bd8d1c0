use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use crate::protocol::{build_artdmx, build_artpoll};
use crate::{ARTNET_PORT, DMX_CHANNELS};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to bind {addr}: {source}")]
    PortInUse { addr: String, source: io::Error },
    #[error("invalid stream config: {0}")]
    InvalidConfig(String),
}

/// Everything the sender threads need to know about the network side.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub local_ip: String,
    pub node_ip: String,
    pub fps: f64,
    pub poll_interval: Duration,
    /// Permit `fps <= 0` (run unpaced with a 1 ms floor) instead of
    /// rejecting it.
    pub allow_unpaced: bool,
}

/// Subnet broadcast derived from the local address: `A.B.C.D` maps to
/// `A.255.255.255`, anything unparseable falls back to the limited
/// broadcast.
pub fn broadcast_from_local(local_ip: &str) -> String {
    match local_ip.parse::<Ipv4Addr>() {
        Ok(ip) => format!("{}.255.255.255", ip.octets()[0]),
        Err(_) => "255.255.255.255".to_string(),
    }
}

/// Stop flag both worker threads wait on, so `stop()` wakes them
/// immediately instead of waiting out a frame or poll interval.
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn trigger(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        *stopped = true;
        self.condvar.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    /// Wait up to `timeout`; returns true once the signal fires.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.condvar.wait_timeout(guard, timeout).unwrap();
        *guard
    }
}

struct ActiveStream {
    payload: Arc<Mutex<BTreeMap<u16, [u8; DMX_CHANNELS]>>>,
    stop: Arc<StopSignal>,
    dmx_handle: Option<thread::JoinHandle<()>>,
    poll_handle: Option<thread::JoinHandle<()>>,
}

impl ActiveStream {
    fn shutdown(mut self) {
        self.stop.trigger();
        if let Some(handle) = self.dmx_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Handle to the single outbound Art-Net stream.
///
/// `start` replaces a running stream, `update` swaps the payload without
/// dropping a frame, `stop` joins the sender threads and closes the
/// sockets. All three are safe to call from any thread.
pub struct DmxStream {
    inner: Mutex<Option<ActiveStream>>,
}

impl Default for DmxStream {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl DmxStream {
    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Start streaming `universes` (values are padded/truncated to 512
    /// channels). A running stream is stopped first, so this doubles as a
    /// restart with a fresh payload.
    pub fn start(
        &self,
        universes: BTreeMap<u16, Vec<u8>>,
        config: &StreamConfig,
    ) -> Result<(), StreamError> {
        if config.fps <= 0.0 && !config.allow_unpaced {
            return Err(StreamError::InvalidConfig(format!(
                "dmx_fps must be positive (got {}); set allow_unpaced to run without pacing",
                config.fps
            )));
        }

        let mut guard = self.inner.lock().unwrap();
        if let Some(active) = guard.take() {
            active.shutdown();
        }

        let dmx_sock = bind_sender(&config.local_ip)?;
        let poll_sock = bind_sender(&config.local_ip)?;

        let payload = Arc::new(Mutex::new(normalize(universes)));
        let stop = Arc::new(StopSignal::new());
        let broadcast = broadcast_from_local(&config.local_ip);

        info!(
            "starting Art-Net stream (local_ip={}, node_ip={}, fps={:.2}, poll={:.2}s, universes={:?})",
            config.local_ip,
            config.node_ip,
            config.fps,
            config.poll_interval.as_secs_f64(),
            payload.lock().unwrap().keys().collect::<Vec<_>>(),
        );

        let dmx_handle = {
            let payload = payload.clone();
            let stop = stop.clone();
            let broadcast = broadcast.clone();
            let fps = config.fps;
            thread::spawn(move || dmx_loop(dmx_sock, payload, stop, fps, broadcast))
        };

        let poll_handle = {
            let stop = stop.clone();
            let node_ip = config.node_ip.clone();
            let poll_interval = config.poll_interval;
            thread::spawn(move || poll_loop(poll_sock, stop, broadcast, node_ip, poll_interval))
        };

        *guard = Some(ActiveStream {
            payload,
            stop,
            dmx_handle: Some(dmx_handle),
            poll_handle: Some(poll_handle),
        });
        Ok(())
    }

    /// Atomically replace the streamed payload. The very next frame uses
    /// the new data; no frame ever mixes old and new universes. No-op when
    /// the stream is not running.
    pub fn update(&self, universes: BTreeMap<u16, Vec<u8>>) {
        let guard = self.inner.lock().unwrap();
        if let Some(active) = guard.as_ref() {
            *active.payload.lock().unwrap() = normalize(universes);
        }
    }

    /// Stop the stream. Idempotent.
    pub fn stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(active) = guard.take() {
            info!("stopping Art-Net stream");
            active.shutdown();
        }
    }
}

fn bind_sender(local_ip: &str) -> Result<UdpSocket, StreamError> {
    let addr = format!("{local_ip}:0");
    let socket = UdpSocket::bind(&addr).map_err(|source| StreamError::PortInUse {
        addr: addr.clone(),
        source,
    })?;
    socket
        .set_broadcast(true)
        .map_err(|source| StreamError::PortInUse { addr, source })?;
    Ok(socket)
}

fn normalize(universes: BTreeMap<u16, Vec<u8>>) -> BTreeMap<u16, [u8; DMX_CHANNELS]> {
    universes
        .into_iter()
        .map(|(universe, values)| {
            let mut frame = [0u8; DMX_CHANNELS];
            let take = values.len().min(DMX_CHANNELS);
            frame[..take].copy_from_slice(&values[..take]);
            (universe, frame)
        })
        .collect()
}

fn dmx_loop(
    socket: UdpSocket,
    payload: Arc<Mutex<BTreeMap<u16, [u8; DMX_CHANNELS]>>>,
    stop: Arc<StopSignal>,
    fps: f64,
    broadcast: String,
) {
    if fps <= 0.0 {
        warn!("dmx_fps <= 0, sender runs unpaced with a 1 ms floor");
    }
    // 1 ms floor keeps an unpaced stream from busy-spinning.
    let frame_time = if fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::from_millis(1)
    };
    let target = format!("{broadcast}:{ARTNET_PORT}");
    let mut sequence: u8 = 0;
    let mut next_frame = Instant::now();

    while !stop.is_set() {
        let now = Instant::now();
        if next_frame > now && stop.wait_timeout(next_frame - now) {
            break;
        }

        let frame_start = Instant::now();
        // Clone under the lock so one frame is always a single payload.
        let frame = payload.lock().unwrap().clone();
        for (universe, dmx) in &frame {
            let packet = build_artdmx(*universe, dmx, sequence);
            sequence = sequence.wrapping_add(1);
            if let Err(err) = socket.send_to(&packet, &target) {
                warn!("DMX send error: {err}");
            }
        }
        next_frame = frame_start + frame_time;
    }
}

fn poll_loop(
    socket: UdpSocket,
    stop: Arc<StopSignal>,
    broadcast: String,
    node_ip: String,
    poll_interval: Duration,
) {
    let packet = build_artpoll();
    let broadcast_target = format!("{broadcast}:{ARTNET_PORT}");
    let unicast_target = format!("{node_ip}:{ARTNET_PORT}");

    loop {
        if let Err(err) = socket.send_to(&packet, &broadcast_target) {
            warn!("poll broadcast error: {err}");
        }
        if let Err(err) = socket.send_to(&packet, &unicast_target) {
            warn!("poll unicast error: {err}");
        }
        if stop.wait_timeout(poll_interval) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> StreamConfig {
        StreamConfig {
            local_ip: "127.0.0.1".to_string(),
            node_ip: "127.0.0.1".to_string(),
            fps: 40.0,
            poll_interval: Duration::from_millis(100),
            allow_unpaced: false,
        }
    }

    #[test]
    fn broadcast_derivation() {
        assert_eq!(broadcast_from_local("2.0.0.30"), "2.255.255.255");
        assert_eq!(broadcast_from_local("192.168.1.5"), "192.255.255.255");
        assert_eq!(broadcast_from_local("not-an-ip"), "255.255.255.255");
        assert_eq!(broadcast_from_local(""), "255.255.255.255");
    }

    #[test]
    fn normalize_pads_and_truncates() {
        let mut universes = BTreeMap::new();
        universes.insert(0u16, vec![200u8; 2]);
        universes.insert(1u16, vec![9u8; 600]);
        let frames = normalize(universes);
        assert_eq!(frames[&0][0], 200);
        assert_eq!(frames[&0][1], 200);
        assert_eq!(frames[&0][2], 0);
        assert_eq!(frames[&1].len(), DMX_CHANNELS);
        assert!(frames[&1].iter().all(|&b| b == 9));
    }

    #[test]
    fn start_rejects_non_positive_fps() {
        let stream = DmxStream::default();
        let mut config = loopback_config();
        config.fps = 0.0;
        let err = stream
            .start(BTreeMap::from([(0u16, vec![0u8; 512])]), &config)
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
        assert!(!stream.is_running());
    }

    #[test]
    fn start_update_stop_lifecycle() {
        let stream = DmxStream::default();
        let config = loopback_config();
        assert!(!stream.is_running());

        stream
            .start(BTreeMap::from([(0u16, vec![128u8; 512])]), &config)
            .unwrap();
        assert!(stream.is_running());

        stream.update(BTreeMap::from([(0u16, vec![64u8; 512])]));

        // Restart with a different payload is a replace, not an error.
        stream
            .start(BTreeMap::from([(1u16, vec![1u8; 512])]), &config)
            .unwrap();
        assert!(stream.is_running());

        stream.stop();
        assert!(!stream.is_running());
        stream.stop(); // idempotent
    }

    #[test]
    fn stop_signal_wakes_waiters() {
        let signal = Arc::new(StopSignal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        let started = Instant::now();
        assert!(waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}

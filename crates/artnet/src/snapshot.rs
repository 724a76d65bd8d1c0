use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use log::warn;

use crate::protocol::parse_artdmx;
use crate::stream::StreamError;
use crate::{ARTNET_PORT, DMX_CHANNELS};

/// Bind the shared Art-Net receive socket on all interfaces.
///
/// Port 6454 is single-owner; a second bind (another recorder, or some
/// other Art-Net software on the host) fails with `PortInUse`.
pub fn bind_receiver(read_timeout: Duration) -> Result<UdpSocket, StreamError> {
    let addr = format!("0.0.0.0:{ARTNET_PORT}");
    let socket = UdpSocket::bind(&addr).map_err(|source| StreamError::PortInUse {
        addr: addr.clone(),
        source,
    })?;
    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(|source| StreamError::PortInUse { addr, source })?;
    Ok(socket)
}

/// Listen on UDP 6454 for `duration` and return the latest observed value
/// of every channel in each target universe. Universes that never appear
/// on the wire come back as all zeros.
pub fn record_snapshots(
    universes: &[u16],
    duration: Duration,
) -> Result<BTreeMap<u16, [u8; DMX_CHANNELS]>, StreamError> {
    let socket = bind_receiver(Duration::from_millis(100))?;

    let mut buffers: BTreeMap<u16, [u8; DMX_CHANNELS]> = universes
        .iter()
        .map(|universe| (*universe, [0u8; DMX_CHANNELS]))
        .collect();

    let deadline = Instant::now() + duration;
    let mut buf = [0u8; 2048];

    while Instant::now() < deadline {
        let (size, _addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                warn!("snapshot recv error: {err}");
                continue;
            }
        };

        let Some((universe, dmx)) = parse_artdmx(&buf[..size]) else {
            continue;
        };
        let Some(target) = buffers.get_mut(&universe) else {
            continue;
        };
        // Overlay only the channels this packet carried.
        let take = dmx.len().min(DMX_CHANNELS);
        target[..take].copy_from_slice(&dmx[..take]);
    }

    Ok(buffers)
}

pub mod protocol;
pub mod snapshot;
pub mod stream;

/// UDP port used by every Art-Net packet, in and out.
pub const ARTNET_PORT: u16 = 6454;

/// Channels per DMX-512 universe.
pub const DMX_CHANNELS: usize = 512;

pub use snapshot::{bind_receiver, record_snapshots};
pub use stream::{DmxStream, StreamConfig, StreamError};

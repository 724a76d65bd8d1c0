//! Debug sender: streams a test payload to the configured node so a rig
//! can be verified without the full controller stack.
//!
//! Run with: cargo run --bin stream_probe -- [value]
//!
//! Configuration comes from the usual environment variables (LOCAL_IP,
//! NODE_IP, DMX_FPS, UNIVERSE_COUNT, ...). The optional argument is the
//! channel value to drive on every channel (default 255).

use std::collections::BTreeMap;
use std::time::Duration;

use log::info;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use candela::Settings;

fn main() {
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("logger init");

    let value: u8 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(255);

    let settings = Settings::load();
    let universes: BTreeMap<u16, Vec<u8>> = (0..settings.universe_count)
        .map(|universe| (universe, vec![value; artnet::DMX_CHANNELS]))
        .collect();

    info!(
        "probing {} universes at value {} toward {} (broadcast from {})",
        settings.universe_count, value, settings.node_ip, settings.local_ip
    );

    let stream = artnet::DmxStream::default();
    if let Err(err) = stream.start(universes, &settings.stream_config()) {
        eprintln!("failed to start stream: {err}");
        std::process::exit(1);
    }

    info!("streaming; press Ctrl-C to stop");
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

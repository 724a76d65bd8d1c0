pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod fixture_plan;
pub mod groups;
pub mod mixer;
pub mod playback;
pub mod recording;
pub mod scenes;

pub use config::Settings;
pub use error::ControllerError;
pub use events::{Event, EventHub, EventMessage, EventSubscriber};
pub use playback::{ControlMode, Controller};
pub use scenes::{AnimatedFrame, PlaybackMode, Scene, SceneStore, SceneType};

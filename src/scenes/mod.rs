pub mod delta;
pub mod model;
pub mod store;

pub use model::{AnimatedFrame, PlaybackMode, Scene, SceneStyle, SceneType};
pub use store::SceneStore;

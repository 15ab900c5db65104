pub mod error;
pub mod config;
pub mod serde_helpers;
pub mod session;
pub mod clock;
pub mod timeline;
pub mod collaborator;
pub mod clip;
pub mod audio_source;
pub mod frame_renderer;
pub mod synchronizer;
pub mod output_pusher;
pub mod controller;
pub mod sink;
pub mod synthetic;
pub mod mock;

pub use config::{ConfigManager, EnvConfigOverride, PipelineConfig};
pub use controller::{Collaborators, PipelineController, PipelineOutcome};
pub use error::{PipelineError, Stage};
pub use session::{PipelineSession, PipelineSignal};

pub mod api_probe;
pub mod diff;
pub mod error;
pub mod normalize;
pub mod provider;
pub mod render;
pub mod scheduler;

pub use api_probe::ApiProber;
pub use diff::DiffEngine;
pub use provider::SourceFetcher;
pub use render::{RenderCapture, RenderConfig};
pub use scheduler::{start_poll_loop, PollScheduler, SchedulerConfig};

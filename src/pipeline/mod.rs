pub mod broadcast;
pub mod coordinator;
pub mod factory;
pub mod stats;
pub mod still_queue;

pub use broadcast::FrameBroadcaster;
pub use coordinator::{CaptureCoordinator, CoordinatorState, VideoReader};
pub use factory::CoordinatorFactory;
pub use stats::{CoordinatorStats, StatsSnapshot};
pub use still_queue::{StillCaptureQueue, StillRequest, StillTicket};

// Position lifecycle: store, manager and the cron scheduler
pub mod manager;
pub mod scheduler;
pub mod store;

pub use manager::{CloseOutcome, PositionManager, SyncReport};
pub use scheduler::Scheduler;
pub use store::PositionStore;

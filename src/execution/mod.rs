// Signal hand-off, order execution and position management
pub mod executor;
pub mod position_manager;
pub mod queue;

pub use executor::{classify, ExecutorStats, OrderExecutor};
pub use position_manager::{CloseReport, CycleReport, PositionManager, TrailState};
pub use queue::{SignalLease, SignalQueue};

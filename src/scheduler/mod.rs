pub mod controller;
pub mod loop_worker;
pub mod state;

pub use controller::SchedulerController;
pub use loop_worker::{Scheduler, SchedulerConfig, SensorSet, SensorSlot};
pub use state::CycleState;

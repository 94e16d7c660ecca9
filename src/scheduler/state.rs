use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    /// Waiting for the next tick.
    Idle,
    Acquiring,
    Publishing,
    /// The loop has exited; terminal.
    Stopped,
}

impl Default for CycleState {
    fn default() -> Self {
        CycleState::Idle
    }
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::Acquiring => "acquiring",
            CycleState::Publishing => "publishing",
            CycleState::Stopped => "stopped",
        }
    }
}

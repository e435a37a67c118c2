pub mod discovery;
pub mod protocol;
pub mod session;

use serde_json::Value;

pub use session::spawn;

/// Connection lifecycle of the plug session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connected,
    Disconnected,
}

impl SessionState {
    /// Whether the session may move from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Discovering)
                | (SessionState::Discovering, SessionState::Connected)
                | (SessionState::Discovering, SessionState::Disconnected)
                | (SessionState::Connected, SessionState::Disconnected)
                | (SessionState::Disconnected, SessionState::Discovering)
        )
    }
}

/// Notification sent from the plug session to the control loop
#[derive(Debug, Clone, PartialEq)]
pub enum ApplianceEvent {
    Connected,
    Disconnected,
    Data(Value),
    Error(String),
}

/// Something that can switch the appliance on or off
///
/// Commands are fire-and-forget: no acknowledgement is returned.
pub trait PowerSwitch {
    fn set_power(&self, on: bool);
}

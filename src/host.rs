//! The bridge's view of the host automation engine

use crate::model::{HostSnapshot, ProfileId, RowId, SwitchCommand};

/// Snapshot provider plus dispatch surface for resolved intents
///
/// Dispatch is fire-and-forget. A profile switch is expected to come back into
/// the bridge through `on_active_profile_changed` once the host has applied it.
pub trait HostApp: Send + 'static {
    fn snapshot(&self) -> HostSnapshot;

    /// Forwards a switch command for an exposed row into the trigger pipeline
    fn trigger_row(&self, row_id: &RowId, command: SwitchCommand);

    /// Asks the host to activate a profile; `None` deactivates profiles
    fn switch_profile(&self, profile_id: Option<ProfileId>);
}

//! Host-side data the bridge reads but never owns: rows, profiles and the
//! active-profile selection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Identifier of an automation row as assigned by the host application
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a profile
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Output side of a row
///
/// Output modules store their settings as free-form JSON, so only the fields
/// the bridge reads for naming are typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowAction {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Input side of a row, opaque to the bridge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowTrigger {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
}

/// A user-defined input → output mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRow {
    pub id: RowId,
    #[serde(default)]
    pub input: RowTrigger,
    #[serde(default)]
    pub output: RowAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A named subset of rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDefinition {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub included_row_ids: Vec<RowId>,
}

/// The selection pushed into the bridge on every profile change
///
/// `id == None` means no profile is active and every row counts as active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveProfileInfo {
    pub id: Option<ProfileId>,
    pub included_row_ids: Option<BTreeSet<RowId>>,
}

impl ActiveProfileInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_profile(profile: &ProfileDefinition) -> Self {
        Self {
            id: Some(profile.id.clone()),
            included_row_ids: Some(profile.included_row_ids.iter().cloned().collect()),
        }
    }
}

/// On-demand view of the host's rows and profiles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSnapshot {
    pub rows: HashMap<RowId, AutomationRow>,
    pub profiles: Vec<ProfileDefinition>,
    pub active_profile_id: Option<ProfileId>,
}

impl HostSnapshot {
    pub fn profile(&self, id: &ProfileId) -> Option<&ProfileDefinition> {
        self.profiles.iter().find(|p| &p.id == id)
    }

    pub fn profile_by_name(&self, name: &str) -> Option<&ProfileDefinition> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Resolves the active profile id into the info the reconciler needs
    pub fn active_profile_info(&self) -> ActiveProfileInfo {
        self.active_profile_id
            .as_ref()
            .and_then(|id| self.profile(id))
            .map(ActiveProfileInfo::from_profile)
            .unwrap_or_default()
    }
}

/// Inbound switch payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCommand {
    On,
    Off,
}

impl SwitchCommand {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload.trim() {
            "ON" => Some(SwitchCommand::On),
            "OFF" => Some(SwitchCommand::Off),
            _ => None,
        }
    }
}

impl fmt::Display for SwitchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchCommand::On => write!(f, "ON"),
            SwitchCommand::Off => write!(f, "OFF"),
        }
    }
}

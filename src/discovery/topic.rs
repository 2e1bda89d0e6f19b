//! Topic layout and the typed matcher for inbound command topics.
//!
//! ```text
//! <prefix>/switch/io_row_<sanitized id>/{config,set,state}
//! <prefix>/select/io_profile_selector/{config,set,state}
//! ```

use crate::model::RowId;
use std::collections::BTreeSet;

pub const ROW_OBJECT_PREFIX: &str = "io_row_";
pub const SELECTOR_OBJECT_ID: &str = "io_profile_selector";

const SWITCH_COMPONENT: &str = "switch";
const SELECT_COMPONENT: &str = "select";
const COMMAND_SUFFIX: &str = "set";

/// Replaces everything outside `[A-Za-z0-9_]` with `_`
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub(crate) fn row_object_id(row_id: &RowId) -> String {
    format!("{ROW_OBJECT_PREFIX}{}", sanitize(row_id.as_str()))
}

/// The topic triple plus base of one discovery entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTopics {
    /// Value of the `~` abbreviation in the discovery payload
    pub base: String,
    pub config: String,
    pub command: String,
    pub state: String,
}

impl EntityTopics {
    fn new(prefix: &str, component: &str, object_id: &str) -> Self {
        let base = format!("{prefix}/{component}/{object_id}");
        Self {
            config: format!("{base}/config"),
            command: format!("{base}/{COMMAND_SUFFIX}"),
            state: format!("{base}/state"),
            base,
        }
    }

    pub fn switch(prefix: &str, row_id: &RowId) -> Self {
        Self::new(prefix, SWITCH_COMPONENT, &row_object_id(row_id))
    }

    pub fn selector(prefix: &str) -> Self {
        Self::new(prefix, SELECT_COMPONENT, SELECTOR_OBJECT_ID)
    }
}

/// Parsed inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTopic {
    /// `<prefix>/switch/io_row_<sanitized_id>/set`
    Switch { sanitized_id: String },
    /// `<prefix>/select/io_profile_selector/set`
    Selector,
    Unknown,
}

impl CommandTopic {
    pub fn parse(prefix: &str, topic: &str) -> Self {
        let Some(rest) = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return CommandTopic::Unknown;
        };

        let mut parts = rest.split('/');
        let (Some(component), Some(object_id), Some(COMMAND_SUFFIX), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return CommandTopic::Unknown;
        };

        match component {
            SWITCH_COMPONENT => match object_id.strip_prefix(ROW_OBJECT_PREFIX) {
                Some(id) if !id.is_empty() => CommandTopic::Switch {
                    sanitized_id: id.to_string(),
                },
                _ => CommandTopic::Unknown,
            },
            SELECT_COMPONENT if object_id == SELECTOR_OBJECT_ID => CommandTopic::Selector,
            _ => CommandTopic::Unknown,
        }
    }
}

/// Maps a sanitized id from a command topic back to an exposed row id
///
/// Sanitizing is lossy, so the lookup goes through the exposure list instead of
/// trying to undo it. An exact match wins over a sanitized one.
pub fn resolve_exposed_row(sanitized_id: &str, exposed: &BTreeSet<RowId>) -> Option<RowId> {
    if let Some(exact) = exposed.iter().find(|id| id.as_str() == sanitized_id) {
        return Some(exact.clone());
    }
    exposed
        .iter()
        .find(|id| sanitize(id.as_str()) == sanitized_id)
        .cloned()
}

//! # Reconciliation Engine
//!
//! Computes which rows should be exposed right now and moves the published
//! set there with the fewest register/unregister calls.
//!
//! ```text
//! desired = exposedRowIds ∩ profile.includedRowIds ∩ rows   (profile active)
//! desired = exposedRowIds ∩ rows                            (no profile)
//!
//! to_unregister = registered − desired   ──► runs first
//! to_register   = desired − registered   ──► runs second
//! registered   := desired
//! ```
//!
//! Unregistering first keeps the number of retained topics on the broker at
//! `max(|old|, |new|)` during the transition.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::config::ExposureConfig;
use crate::discovery::{register_entity, unregister_entity, DeviceDescriptor};
use crate::model::{ActiveProfileInfo, AutomationRow, RowId};
use crate::mqtt::MqttLink;

/// Rows assumed to be published on the broker
///
/// This is what the bridge last *sent*, not what the broker verifiably holds.
/// It starts empty on every process start and after every disconnect, and is
/// rebuilt by the next full reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssumedRegistry {
    rows: BTreeSet<RowId>,
}

impl AssumedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the row was not tracked yet
    pub fn insert(&mut self, id: RowId) -> bool {
        self.rows.insert(id)
    }

    pub fn remove(&mut self, id: &RowId) -> bool {
        self.rows.remove(id)
    }

    /// Forgets everything and hands back what was tracked
    pub fn drain(&mut self) -> BTreeSet<RowId> {
        std::mem::take(&mut self.rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &BTreeSet<RowId> {
        &self.rows
    }

    fn replace(&mut self, rows: BTreeSet<RowId>) {
        self.rows = rows;
    }
}

/// The pure half of a reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub desired: BTreeSet<RowId>,
    pub to_register: BTreeSet<RowId>,
    pub to_unregister: BTreeSet<RowId>,
}

impl ReconcilePlan {
    fn is_noop(&self) -> bool {
        self.to_register.is_empty() && self.to_unregister.is_empty()
    }
}

/// Counts of what a reconciliation actually did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub registered: usize,
    pub unregistered: usize,
    pub desired: usize,
}

pub fn desired_rows(
    active: &ActiveProfileInfo,
    rows: &HashMap<RowId, AutomationRow>,
    config: &ExposureConfig,
) -> BTreeSet<RowId> {
    let exposed = config
        .exposed_row_ids
        .iter()
        .filter(|id| rows.contains_key(*id));

    match &active.id {
        Some(_) => {
            let empty = BTreeSet::new();
            let included = active.included_row_ids.as_ref().unwrap_or(&empty);
            exposed.filter(|id| included.contains(*id)).cloned().collect()
        }
        None => exposed.cloned().collect(),
    }
}

/// Whether a single row belongs in the desired set
pub fn is_desired(
    row_id: &RowId,
    active: &ActiveProfileInfo,
    rows: &HashMap<RowId, AutomationRow>,
    config: &ExposureConfig,
) -> bool {
    config.exposed_row_ids.contains(row_id)
        && rows.contains_key(row_id)
        && match &active.id {
            Some(_) => active
                .included_row_ids
                .as_ref()
                .is_some_and(|included| included.contains(row_id)),
            None => true,
        }
}

pub fn plan(
    active: &ActiveProfileInfo,
    rows: &HashMap<RowId, AutomationRow>,
    config: &ExposureConfig,
    registry: &AssumedRegistry,
) -> ReconcilePlan {
    let desired = desired_rows(active, rows, config);
    let to_register = desired.difference(registry.rows()).cloned().collect();
    let to_unregister = registry.rows().difference(&desired).cloned().collect();
    ReconcilePlan {
        desired,
        to_register,
        to_unregister,
    }
}

/// Plans and applies; afterwards `registry` equals the desired set
pub fn reconcile<L: MqttLink + ?Sized>(
    active: &ActiveProfileInfo,
    rows: &HashMap<RowId, AutomationRow>,
    config: &ExposureConfig,
    device: &DeviceDescriptor,
    link: &L,
    registry: &mut AssumedRegistry,
) -> ReconcileSummary {
    let plan = plan(active, rows, config, registry);
    if plan.is_noop() {
        debug!("Reconcile: {} rows already in place", plan.desired.len());
        return ReconcileSummary {
            desired: plan.desired.len(),
            ..Default::default()
        };
    }

    for row_id in &plan.to_unregister {
        unregister_entity(row_id, config, link);
    }
    for row_id in &plan.to_register {
        if let Some(row) = rows.get(row_id) {
            register_entity(row, config, device, link);
        }
    }

    let summary = ReconcileSummary {
        registered: plan.to_register.len(),
        unregistered: plan.to_unregister.len(),
        desired: plan.desired.len(),
    };
    info!(
        "Reconcile: +{} -{} (now {} exposed)",
        summary.registered, summary.unregistered, summary.desired
    );
    registry.replace(plan.desired);
    summary
}

use crate::engine::{choose_replacement, Activation, EngineError, TabEngine};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use treetab_client::TabDirectory;
use treetab_core::{CreateProps, TabId, UpdateProps};

/// Whether a branch close takes the branch root with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCloseMode {
    IncludeRoot,
    DescendantsOnly,
}

struct RemovalPlan {
    /// Flattened order; executed in reverse so children close before their
    /// ancestors.
    remove: Vec<TabId>,
    activation: Option<Activation>,
}

impl<D: TabDirectory + 'static> TabEngine<D> {
    /// Closes a subtree. With `DescendantsOnly` the root survives and takes
    /// over activation if the active tab was inside the branch.
    pub async fn close_branch(
        self: Arc<Self>,
        target: TabId,
        mode: BranchCloseMode,
    ) -> Result<(), EngineError> {
        let plan = {
            let core = self.state.lock().await;
            let Some(pos) = core.snapshot.position_of(target) else {
                warn!(event = "close_branch_target_missing", target);
                return Ok(());
            };
            let depth = core.snapshot.depths.get(&target).copied().unwrap_or(0);

            let mut remove: Vec<TabId> = Vec::new();
            for tab in &core.snapshot.tabs[pos + 1..] {
                if core.snapshot.depths.get(&tab.id).copied().unwrap_or(0) > depth {
                    remove.push(tab.id);
                } else {
                    break;
                }
            }
            if mode == BranchCloseMode::IncludeRoot {
                remove.insert(0, target);
            }
            if remove.is_empty() {
                debug!(event = "close_branch_empty", target);
                return Ok(());
            }

            let removal_set: HashSet<TabId> = remove.iter().copied().collect();
            let activation = match mode {
                BranchCloseMode::DescendantsOnly => {
                    let active_inside = core
                        .snapshot
                        .tabs
                        .iter()
                        .any(|tab| tab.active && removal_set.contains(&tab.id));
                    active_inside.then_some(Activation::Existing(target))
                }
                BranchCloseMode::IncludeRoot => choose_replacement(&core.snapshot, &removal_set),
            };
            RemovalPlan { remove, activation }
        };

        debug!(event = "close_branch", target, count = plan.remove.len());
        self.execute(plan).await
    }

    /// Closes every tab before `reference` in flattened order.
    pub async fn close_all_above(self: Arc<Self>, reference: TabId) -> Result<(), EngineError> {
        let plan = {
            let core = self.state.lock().await;
            let Some(pos) = core.snapshot.position_of(reference) else {
                warn!(event = "close_above_reference_missing", reference);
                return Ok(());
            };
            let remove: Vec<TabId> = core.snapshot.tabs[..pos].iter().map(|tab| tab.id).collect();
            if remove.is_empty() {
                return Ok(());
            }
            let removal_set: HashSet<TabId> = remove.iter().copied().collect();
            let activation = choose_replacement(&core.snapshot, &removal_set);
            RemovalPlan { remove, activation }
        };

        debug!(event = "close_above", reference, count = plan.remove.len());
        self.execute(plan).await
    }

    /// Closes every tab after `reference` in flattened order.
    pub async fn close_all_below(self: Arc<Self>, reference: TabId) -> Result<(), EngineError> {
        let plan = {
            let core = self.state.lock().await;
            let Some(pos) = core.snapshot.position_of(reference) else {
                warn!(event = "close_below_reference_missing", reference);
                return Ok(());
            };
            let remove: Vec<TabId> = core.snapshot.tabs[pos + 1..]
                .iter()
                .map(|tab| tab.id)
                .collect();
            if remove.is_empty() {
                return Ok(());
            }
            let removal_set: HashSet<TabId> = remove.iter().copied().collect();
            let activation = choose_replacement(&core.snapshot, &removal_set);
            RemovalPlan { remove, activation }
        };

        debug!(event = "close_below", reference, count = plan.remove.len());
        self.execute(plan).await
    }

    /// Runs a removal plan under the bulk-update fence: activation handoff
    /// first, then the closes, then one fence-clearing reload. Individual
    /// failures are logged and skipped; the final reload converges on
    /// whatever the host actually did.
    async fn execute(self: Arc<Self>, plan: RemovalPlan) -> Result<(), EngineError> {
        self.clone().begin_bulk_update();

        match plan.activation {
            Some(Activation::Existing(replacement)) => {
                if let Err(err) = self
                    .directory
                    .update(replacement, UpdateProps::activate())
                    .await
                {
                    warn!(event = "activation_handoff_failed", tab_id = replacement, error = %err);
                }
            }
            Some(Activation::CreateBlank) => {
                if let Err(err) = self.directory.create(CreateProps::active_blank()).await {
                    warn!(event = "replacement_create_failed", error = %err);
                }
            }
            None => {}
        }

        for &tab_id in plan.remove.iter().rev() {
            if let Err(err) = self.directory.remove(tab_id).await {
                warn!(event = "close_failed", tab_id, error = %err);
            }
        }

        {
            let mut core = self.state.lock().await;
            for &tab_id in &plan.remove {
                core.map.promote_children_of(tab_id);
                core.visited.remove(&tab_id);
            }
        }

        self.end_bulk_update().await;
        Ok(())
    }
}

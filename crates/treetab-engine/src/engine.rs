use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use treetab_client::{DirectoryError, TabDirectory};
use treetab_core::tree::TreeSnapshot;
use treetab_core::wire::{EventTopic, TabEvent};
use treetab_core::{build_tree, CreateProps, ParentMap, TabId, TabQuery, UpdateProps, WindowId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("directory call failed: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long a bulk-update fence may stay raised before the watchdog
    /// clears it and forces a reload.
    pub bulk_update_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bulk_update_timeout: Duration::from_secs(10),
        }
    }
}

/// Context-menu anchor carried in the published state so the view renders
/// the menu against the same snapshot the tree came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMenu {
    pub tab_id: TabId,
    pub x: i32,
    pub y: i32,
}

/// The published view model: one consistent flattening plus everything the
/// view needs to render it. Replaced wholesale on every reconciliation;
/// observers only ever see complete states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeViewState {
    pub tabs: Vec<treetab_core::TabRecord>,
    pub depths: HashMap<TabId, u32>,
    pub parents: HashMap<TabId, Option<TabId>>,
    pub visited: HashSet<TabId>,
    pub context_menu: Option<ContextMenu>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

#[derive(Default)]
pub(crate) struct EngineCore {
    phase: Phase,
    window_id: Option<WindowId>,
    pub(crate) map: ParentMap,
    pub(crate) snapshot: TreeSnapshot,
    pub(crate) visited: HashSet<TabId>,
    context_menu: Option<ContextMenu>,
}

/// Reconciles the host's flat tab list into the published tree.
///
/// All mutation flows funnel through here: the core state sits behind one
/// async mutex, so reconciliations serialize and each one queries, rebuilds,
/// and publishes atomically. Mutation commands raise the bulk-update fence
/// first; reloads requested while the fence is up are dropped, and clearing
/// the fence (normally or via the watchdog) forces exactly one reload that
/// covers everything missed.
pub struct TabEngine<D: TabDirectory> {
    pub(crate) directory: D,
    config: EngineConfig,
    pub(crate) state: Mutex<EngineCore>,
    bulk_update: AtomicBool,
    bulk_generation: AtomicU64,
    published: watch::Sender<TreeViewState>,
}

impl<D: TabDirectory + 'static> TabEngine<D> {
    pub fn new(directory: D, config: EngineConfig) -> Arc<Self> {
        let (published, _) = watch::channel(TreeViewState::default());
        Arc::new(Self {
            directory,
            config,
            state: Mutex::new(EngineCore::default()),
            bulk_update: AtomicBool::new(false),
            bulk_generation: AtomicU64::new(0),
            published,
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TreeViewState> {
        self.published.subscribe()
    }

    pub fn is_fenced(&self) -> bool {
        self.bulk_update.load(Ordering::SeqCst)
    }

    /// Re-queries the host and republishes the tree. Safe to call from any
    /// event at any time; while a bulk update is in flight the call is
    /// dropped because the fence-clearing reload will cover it.
    pub async fn reload_tabs(&self) -> Result<(), EngineError> {
        if self.bulk_update.load(Ordering::SeqCst) {
            debug!(event = "reload_suppressed_bulk_update");
            return Ok(());
        }
        let mut core = self.state.lock().await;
        self.ensure_initialized(&mut core).await?;
        self.reload_locked(&mut core).await
    }

    /// Raises the fence and arms a watchdog that clears it if the caller
    /// never does. Callers pair this with `end_bulk_update`.
    pub fn begin_bulk_update(self: Arc<Self>) {
        self.bulk_update.store(true, Ordering::SeqCst);
        let generation = self.bulk_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timeout = self.config.bulk_update_timeout;
        debug!(event = "bulk_update_begin", generation);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if self.bulk_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if self.bulk_update.swap(false, Ordering::SeqCst) {
                warn!(event = "bulk_update_watchdog_cleared", generation);
                if let Err(err) = self.reload_tabs().await {
                    warn!(event = "watchdog_reload_failed", error = %err);
                }
            }
        });
    }

    /// Clears the fence and forces the one reload that covers every change
    /// suppressed while it was up.
    pub async fn end_bulk_update(&self) {
        self.bulk_generation.fetch_add(1, Ordering::SeqCst);
        self.bulk_update.store(false, Ordering::SeqCst);
        debug!(event = "bulk_update_end");
        if let Err(err) = self.reload_tabs().await {
            warn!(event = "post_bulk_reload_failed", error = %err);
        }
    }

    /// Host closed a tab behind our back. Children are promoted one level;
    /// if the tab was active a replacement is chosen by flattened-order
    /// continuity before the host's own default selection settles in.
    pub async fn on_external_remove(&self, tab_id: TabId) -> Result<(), EngineError> {
        let fenced = self.bulk_update.load(Ordering::SeqCst);
        let mut core = self.state.lock().await;
        let was_active = core
            .snapshot
            .tabs
            .iter()
            .any(|tab| tab.id == tab_id && tab.active);
        core.map.promote_children_of(tab_id);
        core.visited.remove(&tab_id);

        if fenced {
            debug!(event = "external_remove_while_fenced", tab_id);
            return Ok(());
        }

        if was_active {
            let removal = HashSet::from([tab_id]);
            match choose_replacement(&core.snapshot, &removal) {
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
        }

        self.ensure_initialized(&mut core).await?;
        self.reload_locked(&mut core).await
    }

    /// Host swapped the process backing a tab and gave it a new id. The
    /// learned hierarchy follows the new id; nothing else changes.
    pub async fn on_replaced(&self, added: TabId, removed: TabId) -> Result<(), EngineError> {
        let mut core = self.state.lock().await;
        core.map.replace_id(removed, added);
        core.visited.remove(&removed);
        debug!(event = "tab_id_replaced", added, removed);
        if self.bulk_update.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.ensure_initialized(&mut core).await?;
        self.reload_locked(&mut core).await
    }

    pub async fn on_activated(&self, tab_id: TabId) -> Result<(), EngineError> {
        {
            let mut core = self.state.lock().await;
            core.visited.insert(tab_id);
        }
        self.reload_tabs().await
    }

    pub async fn open_context_menu(&self, tab_id: TabId, x: i32, y: i32) {
        let mut core = self.state.lock().await;
        if core.snapshot.position_of(tab_id).is_none() {
            debug!(event = "context_menu_target_missing", tab_id);
            return;
        }
        core.context_menu = Some(ContextMenu { tab_id, x, y });
        self.publish(&core);
    }

    pub async fn close_context_menu(&self) {
        let mut core = self.state.lock().await;
        if core.context_menu.take().is_some() {
            self.publish(&core);
        }
    }

    /// Event loop: subscribes to every tab topic and reacts until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut created = self.directory.subscribe(EventTopic::TabCreated).await;
        let mut updated = self.directory.subscribe(EventTopic::TabUpdated).await;
        let mut moved = self.directory.subscribe(EventTopic::TabMoved).await;
        let mut activated = self.directory.subscribe(EventTopic::TabActivated).await;
        let mut removed = self.directory.subscribe(EventTopic::TabRemoved).await;
        let mut replaced = self.directory.subscribe(EventTopic::TabReplaced).await;

        if let Err(err) = self.reload_tabs().await {
            warn!(event = "initial_reload_failed", error = %err);
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = created.recv() => self.handle_event(event).await,
                Some(event) = updated.recv() => self.handle_event(event).await,
                Some(event) = moved.recv() => self.handle_event(event).await,
                Some(event) = activated.recv() => self.handle_event(event).await,
                Some(event) = removed.recv() => self.handle_event(event).await,
                Some(event) = replaced.recv() => self.handle_event(event).await,
                else => break,
            }
        }
        info!(event = "engine_stopped");
    }

    async fn handle_event(&self, event: TabEvent) {
        let result = match event {
            TabEvent::Created { .. } | TabEvent::Updated { .. } | TabEvent::Moved { .. } => {
                self.reload_tabs().await
            }
            TabEvent::Activated { tab_id, .. } => self.on_activated(tab_id).await,
            TabEvent::Removed { tab_id, .. } => self.on_external_remove(tab_id).await,
            TabEvent::Replaced {
                added_tab_id,
                removed_tab_id,
            } => self.on_replaced(added_tab_id, removed_tab_id).await,
        };
        if let Err(err) = result {
            warn!(event = "tab_event_failed", error = %err);
        }
    }

    /// One-shot: resolves which window this view belongs to and primes the
    /// visited set. Concurrent callers serialize on the core lock, so only
    /// the first one does the work.
    async fn ensure_initialized(&self, core: &mut EngineCore) -> Result<(), EngineError> {
        if core.phase == Phase::Ready {
            return Ok(());
        }
        core.phase = Phase::Initializing;

        let owner = match self.directory.owning_tab().await {
            Ok(owner) => owner,
            Err(err) => {
                core.phase = Phase::Uninitialized;
                return Err(err.into());
            }
        };
        let visited = match self.directory.visited_tab_ids().await {
            Ok(visited) => visited,
            Err(err) => {
                core.phase = Phase::Uninitialized;
                return Err(err.into());
            }
        };

        core.window_id = Some(owner.window_id);
        core.visited = visited.into_iter().collect();
        core.phase = Phase::Ready;
        info!(
            event = "engine_initialized",
            window_id = owner.window_id,
            visited = core.visited.len()
        );
        Ok(())
    }

    async fn reload_locked(&self, core: &mut EngineCore) -> Result<(), EngineError> {
        let Some(window_id) = core.window_id else {
            return Ok(());
        };
        let tabs = self.directory.query(TabQuery::window(window_id)).await?;
        for tab in &tabs {
            if tab.has_malformed_ext_data() {
                warn!(event = "ext_data_malformed", tab_id = tab.id);
            }
        }

        let outcome = build_tree(tabs, &mut core.map);
        for correction in &outcome.corrections {
            match self
                .directory
                .update(
                    correction.tab_id,
                    UpdateProps::reparent(correction.opener_tab_id),
                )
                .await
            {
                Ok(()) => debug!(
                    event = "opener_restored",
                    tab_id = correction.tab_id,
                    opener = correction.opener_tab_id
                ),
                Err(err) => {
                    warn!(event = "opener_restore_failed", tab_id = correction.tab_id, error = %err)
                }
            }
        }

        core.snapshot = outcome.snapshot;

        // The host can leave a window with no visible active tab, for
        // example when the active tab is a panel. Hand activation to the
        // first tab in flattened order.
        if let Some(first) = core.snapshot.tabs.first().map(|tab| tab.id) {
            if !core.snapshot.tabs.iter().any(|tab| tab.active) {
                match self.directory.update(first, UpdateProps::activate()).await {
                    Ok(()) => {
                        if let Some(tab) = core.snapshot.tabs.first_mut() {
                            tab.active = true;
                        }
                        core.visited.insert(first);
                        debug!(event = "active_tab_restored", tab_id = first);
                    }
                    Err(err) => {
                        warn!(event = "active_tab_restore_failed", tab_id = first, error = %err)
                    }
                }
            }
        }

        let live: HashSet<TabId> = core.snapshot.tabs.iter().map(|tab| tab.id).collect();
        core.visited.retain(|id| live.contains(id));
        if core
            .context_menu
            .as_ref()
            .is_some_and(|menu| !live.contains(&menu.tab_id))
        {
            core.context_menu = None;
        }
        self.publish(core);
        Ok(())
    }

    pub(crate) fn publish(&self, core: &EngineCore) {
        self.published.send_replace(TreeViewState {
            tabs: core.snapshot.tabs.clone(),
            depths: core.snapshot.depths.clone(),
            parents: core.map.to_table(),
            visited: core.visited.clone(),
            context_menu: core.context_menu.clone(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activation {
    Existing(TabId),
    CreateBlank,
}

/// Continuity rule for a removal that takes the active tab with it: nearest
/// surviving predecessor in flattened order, else the second tab if it
/// survives, else the first survivor anywhere, else a fresh blank tab. The
/// replacement is never a member of the removal set.
pub(crate) fn choose_replacement(
    snapshot: &TreeSnapshot,
    removal: &HashSet<TabId>,
) -> Option<Activation> {
    let active_pos = snapshot
        .tabs
        .iter()
        .position(|tab| tab.active && removal.contains(&tab.id))?;

    for tab in snapshot.tabs[..active_pos].iter().rev() {
        if !removal.contains(&tab.id) {
            return Some(Activation::Existing(tab.id));
        }
    }
    if let Some(second) = snapshot.tabs.get(1) {
        if !removal.contains(&second.id) {
            return Some(Activation::Existing(second.id));
        }
    }
    for tab in &snapshot.tabs {
        if !removal.contains(&tab.id) {
            return Some(Activation::Existing(tab.id));
        }
    }
    Some(Activation::CreateBlank)
}

use std::collections::HashSet;
use thiserror::Error;
use treetab_core::wire::TabEvent;
use treetab_core::{CreateProps, TabId, TabQuery, TabRecord, UpdateProps, WindowId};

/// Panel id written into the seeded pseudo-tab that backs the tree view UI.
pub const OWNING_PANEL_ID: &str = "treetab-view";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown tab {0}")]
    UnknownTab(TabId),
    #[error("tab {0} backs the view panel and cannot be closed")]
    NotClosable(TabId),
}

/// Authoritative tab state for one window. Tabs are kept in display order,
/// so `index` always equals the vector position. Mutations return the
/// events a host browser would emit for the same change.
pub struct TabStore {
    window_id: WindowId,
    next_id: TabId,
    owning_tab_id: TabId,
    tabs: Vec<TabRecord>,
    visited: HashSet<TabId>,
}

impl TabStore {
    pub fn new(window_id: WindowId) -> Self {
        let mut store = Self {
            window_id,
            next_id: 1,
            owning_tab_id: 0,
            tabs: Vec::new(),
            visited: HashSet::new(),
        };
        let panel = TabRecord {
            id: store.take_id(),
            window_id,
            index: 0,
            active: false,
            audible: false,
            opener_tab_id: None,
            title: "tab tree".to_string(),
            url: None,
            ext_data: Some(format!(r#"{{"panelId":"{OWNING_PANEL_ID}"}}"#)),
        };
        store.owning_tab_id = panel.id;
        store.tabs.push(panel);
        store
    }

    fn take_id(&mut self) -> TabId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    pub fn tabs(&self) -> &[TabRecord] {
        &self.tabs
    }

    /// The pseudo-tab backing the tree view. `remove` refuses to close it,
    /// so it is absent only if the store was tampered with.
    pub fn owning_tab(&self) -> Option<&TabRecord> {
        self.tabs.iter().find(|tab| tab.id == self.owning_tab_id)
    }

    pub fn visited_tab_ids(&self) -> Vec<TabId> {
        let mut ids: Vec<TabId> = self.visited.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn query(&self, filter: &TabQuery) -> Vec<TabRecord> {
        self.tabs
            .iter()
            .filter(|tab| filter.matches(tab, self.window_id))
            .cloned()
            .collect()
    }

    pub fn create(&mut self, props: CreateProps) -> (TabRecord, Vec<TabEvent>) {
        self.insert_tab(props, None)
    }

    /// Opens a tab the way a followed link would: appended at the end with
    /// the opener recorded on the record itself.
    pub fn open_child(
        &mut self,
        opener: TabId,
        active: bool,
    ) -> Result<(TabRecord, Vec<TabEvent>), StoreError> {
        if !self.tabs.iter().any(|tab| tab.id == opener) {
            return Err(StoreError::UnknownTab(opener));
        }
        let props = CreateProps {
            active: Some(active),
            url: None,
        };
        Ok(self.insert_tab(props, Some(opener)))
    }

    fn insert_tab(
        &mut self,
        props: CreateProps,
        opener_tab_id: Option<TabId>,
    ) -> (TabRecord, Vec<TabEvent>) {
        let active = props.active.unwrap_or(false);
        let id = self.take_id();
        if active {
            self.clear_active();
        }
        let tab = TabRecord {
            id,
            window_id: self.window_id,
            index: self.tabs.len() as u32,
            active,
            audible: false,
            opener_tab_id,
            title: String::new(),
            url: props.url,
            ext_data: None,
        };
        self.tabs.push(tab.clone());

        let mut events = vec![TabEvent::Created { tab: tab.clone() }];
        if active {
            self.visited.insert(id);
            events.push(TabEvent::Activated {
                tab_id: id,
                window_id: self.window_id,
            });
        }
        (tab, events)
    }

    pub fn update(
        &mut self,
        tab_id: TabId,
        props: UpdateProps,
    ) -> Result<Vec<TabEvent>, StoreError> {
        if !self.tabs.iter().any(|tab| tab.id == tab_id) {
            return Err(StoreError::UnknownTab(tab_id));
        }
        let mut events = Vec::new();
        if props.active == Some(true) {
            self.clear_active();
            self.visited.insert(tab_id);
            if let Some(tab) = self.tabs.iter_mut().find(|tab| tab.id == tab_id) {
                tab.active = true;
            }
            events.push(TabEvent::Activated {
                tab_id,
                window_id: self.window_id,
            });
        }
        if let Some(opener) = props.opener_tab_id {
            if let Some(tab) = self.tabs.iter_mut().find(|tab| tab.id == tab_id) {
                tab.opener_tab_id = Some(opener);
                events.push(TabEvent::Updated {
                    tab_id,
                    tab: tab.clone(),
                });
            }
        }
        Ok(events)
    }

    /// Removes a tab and compacts indexes. If the removed tab was active,
    /// activation falls to the tab now sitting at its old position, or the
    /// last tab when the end of the strip was removed.
    pub fn remove(&mut self, tab_id: TabId) -> Result<Vec<TabEvent>, StoreError> {
        if tab_id == self.owning_tab_id {
            return Err(StoreError::NotClosable(tab_id));
        }
        let Some(pos) = self.tabs.iter().position(|tab| tab.id == tab_id) else {
            return Err(StoreError::UnknownTab(tab_id));
        };
        let removed = self.tabs.remove(pos);
        self.visited.remove(&tab_id);
        self.reindex();

        let mut events = vec![TabEvent::Removed {
            tab_id,
            window_id: self.window_id,
        }];
        if removed.active && !self.tabs.is_empty() {
            let fallback = pos.min(self.tabs.len() - 1);
            let id = self.tabs[fallback].id;
            self.tabs[fallback].active = true;
            self.visited.insert(id);
            events.push(TabEvent::Activated {
                tab_id: id,
                window_id: self.window_id,
            });
        }
        Ok(events)
    }

    pub fn move_tab(&mut self, tab_id: TabId, to_index: u32) -> Result<Vec<TabEvent>, StoreError> {
        let Some(pos) = self.tabs.iter().position(|tab| tab.id == tab_id) else {
            return Err(StoreError::UnknownTab(tab_id));
        };
        let to = (to_index as usize).min(self.tabs.len() - 1);
        let tab = self.tabs.remove(pos);
        self.tabs.insert(to, tab);
        self.reindex();
        Ok(vec![TabEvent::Moved {
            tab_id,
            from_index: pos as u32,
            to_index: to as u32,
        }])
    }

    /// Swaps the id backing a tab in place, the way a host does when it
    /// migrates a tab to a new renderer process.
    pub fn replace_backing(&mut self, tab_id: TabId) -> Result<(TabId, Vec<TabEvent>), StoreError> {
        let Some(pos) = self.tabs.iter().position(|tab| tab.id == tab_id) else {
            return Err(StoreError::UnknownTab(tab_id));
        };
        let new_id = self.take_id();
        self.tabs[pos].id = new_id;
        if self.visited.remove(&tab_id) {
            self.visited.insert(new_id);
        }
        if self.owning_tab_id == tab_id {
            self.owning_tab_id = new_id;
        }
        Ok((
            new_id,
            vec![TabEvent::Replaced {
                added_tab_id: new_id,
                removed_tab_id: tab_id,
            }],
        ))
    }

    fn clear_active(&mut self) {
        for tab in &mut self.tabs {
            tab.active = false;
        }
    }

    fn reindex(&mut self) {
        for (index, tab) in self.tabs.iter_mut().enumerate() {
            tab.index = index as u32;
        }
    }
}

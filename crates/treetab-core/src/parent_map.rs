use crate::tab::{TabId, TabRecord};
use std::collections::HashMap;

/// Durable tab-id → parent-id mapping, the source of truth for hierarchy.
///
/// The host's opener field is only trusted the first time an id is seen;
/// after that the map wins, even when the host reverts the field to absent
/// on a later query. A key present with `None` means "known root".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentMap {
    entries: HashMap<TabId, Option<TabId>>,
}

/// Corrective write needed because the host's reported opener drifted from
/// the learned parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenerCorrection {
    pub tab_id: TabId,
    pub opener_tab_id: TabId,
}

impl ParentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tab_id: TabId) -> bool {
        self.entries.contains_key(&tab_id)
    }

    pub fn parent_of(&self, tab_id: TabId) -> Option<TabId> {
        self.entries.get(&tab_id).copied().flatten()
    }

    pub fn set_parent(&mut self, tab_id: TabId, parent: Option<TabId>) {
        self.entries.insert(tab_id, parent);
    }

    /// Reconciles a freshly queried tab list against the map.
    ///
    /// Known ids get their opener field overwritten from the map; unknown
    /// ids seed the map with whatever the host reported (possibly absent).
    /// Returns the corrective writes for drifted tabs: the map holds a
    /// non-empty parent and the host reported something else. An empty map
    /// value never produces a correction, so a legitimate re-parent observed
    /// before the map learned anything is not clobbered.
    pub fn normalize(&mut self, tabs: &mut [TabRecord]) -> Vec<OpenerCorrection> {
        let mut corrections = Vec::new();
        for tab in tabs.iter_mut() {
            match self.entries.get(&tab.id) {
                Some(known) => {
                    if let Some(parent) = *known {
                        if tab.opener_tab_id != Some(parent) {
                            corrections.push(OpenerCorrection {
                                tab_id: tab.id,
                                opener_tab_id: parent,
                            });
                        }
                    }
                    tab.opener_tab_id = *known;
                }
                None => {
                    self.entries.insert(tab.id, tab.opener_tab_id);
                }
            }
        }
        corrections
    }

    /// Promotes all children of a removed tab one level, to the removed
    /// tab's own parent. The removed entry itself is kept; stale entries are
    /// harmless once nothing references them.
    pub fn promote_children_of(&mut self, removed: TabId) {
        let new_parent = self.entries.get(&removed).copied().flatten();
        for value in self.entries.values_mut() {
            if *value == Some(removed) {
                *value = new_parent;
            }
        }
    }

    /// Rewrites an id after the host replaced the tab backing it, keeping
    /// both the tab's own entry and any children pointing at it.
    pub fn replace_id(&mut self, old: TabId, new: TabId) {
        if let Some(parent) = self.entries.remove(&old) {
            self.entries.insert(new, parent);
        }
        for value in self.entries.values_mut() {
            if *value == Some(old) {
                *value = Some(new);
            }
        }
    }

    /// Exports the raw entry table, for publishing alongside snapshots.
    pub fn to_table(&self) -> HashMap<TabId, Option<TabId>> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: TabId, opener: Option<TabId>) -> TabRecord {
        TabRecord {
            id,
            window_id: 1,
            index: id as u32,
            active: false,
            audible: false,
            opener_tab_id: opener,
            title: String::new(),
            url: None,
            ext_data: None,
        }
    }

    #[test]
    fn normalize_seeds_unknown_ids_from_host() {
        let mut map = ParentMap::new();
        let mut tabs = vec![tab(1, None), tab(2, Some(1))];

        let corrections = map.normalize(&mut tabs);

        assert!(corrections.is_empty());
        assert!(map.contains(1));
        assert_eq!(map.parent_of(2), Some(1));
    }

    #[test]
    fn normalize_restores_parent_the_host_forgot() {
        let mut map = ParentMap::new();
        map.set_parent(2, Some(1));

        // Host amnesia: opener came back absent on this query.
        let mut tabs = vec![tab(1, None), tab(2, None)];
        let corrections = map.normalize(&mut tabs);

        assert_eq!(tabs[1].opener_tab_id, Some(1));
        assert_eq!(
            corrections,
            vec![OpenerCorrection {
                tab_id: 2,
                opener_tab_id: 1
            }]
        );
    }

    #[test]
    fn normalize_does_not_correct_from_an_empty_entry() {
        let mut map = ParentMap::new();
        map.set_parent(2, None);

        // The host now claims a parent; the map still wins for the tree, but
        // no write-back is issued because the stored value is empty.
        let mut tabs = vec![tab(2, Some(1))];
        let corrections = map.normalize(&mut tabs);

        assert!(corrections.is_empty());
        assert_eq!(tabs[0].opener_tab_id, None);
    }

    #[test]
    fn promotion_is_single_level() {
        let mut map = ParentMap::new();
        map.set_parent(1, None);
        map.set_parent(2, Some(1));
        map.set_parent(3, Some(2));
        map.set_parent(4, Some(2));

        map.promote_children_of(2);

        assert_eq!(map.parent_of(3), Some(1));
        assert_eq!(map.parent_of(4), Some(1));
        // The removed tab's own entry stays; it is ignored once nothing
        // references it.
        assert!(map.contains(2));
    }

    #[test]
    fn promoting_a_root_makes_children_roots() {
        let mut map = ParentMap::new();
        map.set_parent(1, None);
        map.set_parent(2, Some(1));

        map.promote_children_of(1);

        assert!(map.contains(2));
        assert_eq!(map.parent_of(2), None);
    }

    #[test]
    fn replace_id_moves_entry_and_children() {
        let mut map = ParentMap::new();
        map.set_parent(1, None);
        map.set_parent(2, Some(1));
        map.set_parent(3, Some(2));

        map.replace_id(2, 9);

        assert!(!map.contains(2));
        assert_eq!(map.parent_of(9), Some(1));
        assert_eq!(map.parent_of(3), Some(9));
    }
}

use crate::parent_map::{OpenerCorrection, ParentMap};
use crate::tab::{TabId, TabRecord};
use std::collections::{HashMap, HashSet};

/// Point-in-time flattened view of one window's tab tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeSnapshot {
    /// Pre-order flattening in display-index order, panels excluded.
    pub tabs: Vec<TabRecord>,
    /// Nesting depth per emitted tab, roots at 0.
    pub depths: HashMap<TabId, u32>,
}

impl TreeSnapshot {
    pub fn position_of(&self, tab_id: TabId) -> Option<usize> {
        self.tabs.iter().position(|tab| tab.id == tab_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    pub snapshot: TreeSnapshot,
    /// Write-backs for tabs whose host-reported opener drifted from the map.
    pub corrections: Vec<OpenerCorrection>,
}

/// Builds the flattened tree for one window from a raw query result.
///
/// Normalizes the list against the parent map (seeding unknown ids), sorts
/// by display index, then emits pre-order: roots first, each node followed
/// by its children, siblings in index order. Panels are transparent: they
/// are never emitted, and their children attach to the panel's own
/// effective parent. A tab whose parent is missing from the live list is
/// emitted as a root rather than dropped. Parent cycles (possible through
/// id reuse) are broken by emitting the lowest-index unvisited member as a
/// root, so traversal always terminates.
///
/// No hidden state: identical inputs produce identical output.
pub fn build_tree(mut tabs: Vec<TabRecord>, map: &mut ParentMap) -> BuildOutcome {
    let corrections = map.normalize(&mut tabs);
    // Callers usually hand over sorted input already; do not rely on it.
    tabs.sort_by_key(|tab| tab.index);

    let by_id: HashMap<TabId, &TabRecord> = tabs.iter().map(|tab| (tab.id, tab)).collect();

    // Learned parent, hoisted through panel pseudo-tabs and broken to root
    // when the parent is absent from the live list.
    let effective_parent = |tab_id: TabId| -> Option<TabId> {
        let mut seen = HashSet::from([tab_id]);
        let mut current = map.parent_of(tab_id);
        while let Some(parent) = current {
            let record = by_id.get(&parent)?;
            if !record.is_panel() {
                return Some(parent);
            }
            if !seen.insert(parent) {
                return None;
            }
            current = map.parent_of(parent);
        }
        None
    };

    let mut children: HashMap<TabId, Vec<TabId>> = HashMap::new();
    let mut roots: Vec<TabId> = Vec::new();
    for tab in &tabs {
        if tab.is_panel() {
            continue;
        }
        match effective_parent(tab.id) {
            Some(parent) => children.entry(parent).or_default().push(tab.id),
            None => roots.push(tab.id),
        }
    }

    let mut snapshot = TreeSnapshot::default();
    let mut visited: HashSet<TabId> = HashSet::new();
    for &root in &roots {
        emit(root, 0, &by_id, &children, &mut visited, &mut snapshot);
    }
    // Anything still unvisited sits on a parent cycle; break it by treating
    // the lowest-index member as a root.
    for tab in &tabs {
        if tab.is_panel() || visited.contains(&tab.id) {
            continue;
        }
        emit(tab.id, 0, &by_id, &children, &mut visited, &mut snapshot);
    }

    BuildOutcome {
        snapshot,
        corrections,
    }
}

fn emit(
    tab_id: TabId,
    depth: u32,
    by_id: &HashMap<TabId, &TabRecord>,
    children: &HashMap<TabId, Vec<TabId>>,
    visited: &mut HashSet<TabId>,
    snapshot: &mut TreeSnapshot,
) {
    if !visited.insert(tab_id) {
        return;
    }
    if let Some(record) = by_id.get(&tab_id) {
        snapshot.tabs.push((*record).clone());
        snapshot.depths.insert(tab_id, depth);
    }
    if let Some(kids) = children.get(&tab_id) {
        for &child in kids {
            emit(child, depth + 1, by_id, children, visited, snapshot);
        }
    }
}

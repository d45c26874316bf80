use serde::{Deserialize, Serialize};

/// Host-assigned tab identifier. Unique within a browser session but
/// ephemeral: the host may hand the same id to a new tab after closure, so
/// nothing in this crate treats an id as stable beyond the current view.
pub type TabId = u64;

/// Host-assigned window identifier.
pub type WindowId = u64;

/// A tab as reported by the host browser. The record is externally owned;
/// every query result is ground truth and overrides whatever was cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabRecord {
    pub id: TabId,
    pub window_id: WindowId,
    /// Display position within the window, used for ordering.
    pub index: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub audible: bool,
    /// Host-reported parent. Unreliable: the host may clear it on refresh,
    /// so it only seeds the parent map for ids never seen before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_tab_id: Option<TabId>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Opaque host extension blob. The only field read out of it is
    /// `panelId`, which marks pseudo-tabs backing side-panel UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_data: Option<String>,
}

impl TabRecord {
    /// Whether the host flagged this record as a panel pseudo-tab.
    /// A malformed blob is treated as "not a panel".
    pub fn is_panel(&self) -> bool {
        let Some(raw) = self.ext_data.as_deref() else {
            return false;
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(data) => data.get("panelId").is_some_and(|value| !value.is_null()),
            Err(_) => false,
        }
    }

    /// True when an extension blob is present but cannot be parsed. Callers
    /// log this; it is never fatal.
    pub fn has_malformed_ext_data(&self) -> bool {
        match self.ext_data.as_deref() {
            Some(raw) => serde_json::from_str::<serde_json::Value>(raw).is_err(),
            None => false,
        }
    }
}

/// Filter for directory queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_window: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TabQuery {
    pub fn window(window_id: WindowId) -> Self {
        Self {
            window_id: Some(window_id),
            ..Self::default()
        }
    }

    /// Evaluates the filter against one record. `current_window_id` is the
    /// window the serving process considers "current".
    pub fn matches(&self, tab: &TabRecord, current_window_id: WindowId) -> bool {
        if let Some(window_id) = self.window_id {
            if tab.window_id != window_id {
                return false;
            }
        }
        if let Some(active) = self.active {
            if tab.active != active {
                return false;
            }
        }
        if self.current_window == Some(true) && tab.window_id != current_window_id {
            return false;
        }
        if let Some(url) = self.url.as_deref() {
            if tab.url.as_deref() != Some(url) {
                return false;
            }
        }
        true
    }
}

/// Properties for creating a tab.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl CreateProps {
    pub fn active_blank() -> Self {
        Self {
            active: Some(true),
            url: None,
        }
    }
}

/// Properties for updating a tab. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_tab_id: Option<TabId>,
}

impl UpdateProps {
    pub fn activate() -> Self {
        Self {
            active: Some(true),
            opener_tab_id: None,
        }
    }

    pub fn reparent(opener_tab_id: TabId) -> Self {
        Self {
            active: None,
            opener_tab_id: Some(opener_tab_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: TabId, ext_data: Option<&str>) -> TabRecord {
        TabRecord {
            id,
            window_id: 1,
            index: 0,
            active: false,
            audible: false,
            opener_tab_id: None,
            title: String::new(),
            url: None,
            ext_data: ext_data.map(str::to_string),
        }
    }

    #[test]
    fn panel_flag_requires_non_null_panel_id() {
        assert!(tab(1, Some(r#"{"panelId":"bookmarks"}"#)).is_panel());
        assert!(!tab(2, Some(r#"{"panelId":null}"#)).is_panel());
        assert!(!tab(3, Some(r#"{"thumbnail":"data:..."}"#)).is_panel());
        assert!(!tab(4, None).is_panel());
    }

    #[test]
    fn malformed_ext_data_is_not_a_panel() {
        let record = tab(1, Some("{not json"));
        assert!(!record.is_panel());
        assert!(record.has_malformed_ext_data());
        assert!(!tab(2, Some("{}")).has_malformed_ext_data());
    }

    #[test]
    fn query_filters_compose() {
        let mut record = tab(7, None);
        record.window_id = 3;
        record.active = true;
        record.url = Some("https://example.com/".to_string());

        assert!(TabQuery::window(3).matches(&record, 3));
        assert!(!TabQuery::window(4).matches(&record, 3));
        assert!(TabQuery {
            active: Some(true),
            current_window: Some(true),
            ..TabQuery::default()
        }
        .matches(&record, 3));
        assert!(!TabQuery {
            current_window: Some(true),
            ..TabQuery::default()
        }
        .matches(&record, 9));
        assert!(!TabQuery {
            url: Some("https://other.example/".to_string()),
            ..TabQuery::default()
        }
        .matches(&record, 3));
    }
}

use crate::tab::{CreateProps, TabId, TabQuery, TabRecord, UpdateProps, WindowId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

fn default_version() -> u16 {
    CURRENT_PROTOCOL_VERSION
}

/// One NDJSON frame on the directory channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default = "default_version")]
    pub version: u16,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Subscribe(SubscribePayload),
    Unsubscribe(SubscribePayload),
    Request(TabRequest),
    Response(TabResponse),
    Event(TabEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribePayload {
    #[serde(default)]
    pub topics: Vec<EventTopic>,
}

/// One variant per directory operation. The serving side matches
/// exhaustively; there is no string-method dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TabRequest {
    Query { filter: TabQuery },
    Create { props: CreateProps },
    Update { tab_id: TabId, props: UpdateProps },
    Remove { tab_id: TabId },
    OwningTab,
    VisitedTabIds,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TabResponse {
    Tabs { tabs: Vec<TabRecord> },
    Tab { tab: TabRecord },
    Done,
    VisitedTabIds { tab_ids: Vec<TabId> },
    Error { error: RequestError },
}

/// Operation-level rejection from the serving side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: String,
    pub message: String,
}

impl RequestError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// External tab lifecycle change, browser-shaped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TabEvent {
    Updated {
        tab_id: TabId,
        tab: TabRecord,
    },
    Removed {
        tab_id: TabId,
        window_id: WindowId,
    },
    Moved {
        tab_id: TabId,
        from_index: u32,
        to_index: u32,
    },
    Activated {
        tab_id: TabId,
        window_id: WindowId,
    },
    Replaced {
        added_tab_id: TabId,
        removed_tab_id: TabId,
    },
    Created {
        tab: TabRecord,
    },
}

impl TabEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            TabEvent::Updated { .. } => EventTopic::TabUpdated,
            TabEvent::Removed { .. } => EventTopic::TabRemoved,
            TabEvent::Moved { .. } => EventTopic::TabMoved,
            TabEvent::Activated { .. } => EventTopic::TabActivated,
            TabEvent::Replaced { .. } => EventTopic::TabReplaced,
            TabEvent::Created { .. } => EventTopic::TabCreated,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventTopic {
    #[serde(rename = "tab.updated")]
    TabUpdated,
    #[serde(rename = "tab.removed")]
    TabRemoved,
    #[serde(rename = "tab.moved")]
    TabMoved,
    #[serde(rename = "tab.activated")]
    TabActivated,
    #[serde(rename = "tab.replaced")]
    TabReplaced,
    #[serde(rename = "tab.created")]
    TabCreated,
}

impl EventTopic {
    pub const ALL: [EventTopic; 6] = [
        EventTopic::TabUpdated,
        EventTopic::TabRemoved,
        EventTopic::TabMoved,
        EventTopic::TabActivated,
        EventTopic::TabReplaced,
        EventTopic::TabCreated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventTopic::TabUpdated => "tab.updated",
            EventTopic::TabRemoved => "tab.removed",
            EventTopic::TabMoved => "tab.moved",
            EventTopic::TabActivated => "tab.activated",
            EventTopic::TabReplaced => "tab.replaced",
            EventTopic::TabCreated => "tab.created",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: CURRENT_PROTOCOL_VERSION,
            sender_id: "client-1".to_string(),
            timestamp: "2026-08-21T10:00:00Z".to_string(),
            request_id: Some("req-1".to_string()),
            msg,
        }
    }

    #[test]
    fn request_variants_are_closed_and_tagged() {
        let frame = encode_frame(
            &envelope(WireMsg::Request(TabRequest::Update {
                tab_id: 12,
                props: UpdateProps::reparent(4),
            })),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");

        let text = String::from_utf8(frame.clone()).expect("utf8");
        assert!(text.contains(r#""type":"request""#));
        assert!(text.contains(r#""op":"update""#));

        let decoded: WireEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        let WireMsg::Request(TabRequest::Update { tab_id, props }) = decoded.msg else {
            panic!("expected update request");
        };
        assert_eq!(tab_id, 12);
        assert_eq!(props.opener_tab_id, Some(4));
    }

    #[test]
    fn missing_version_defaults_to_current() {
        let decoded: WireEnvelope = serde_json::from_str(
            r#"{
                "sender_id": "hub",
                "timestamp": "2026-08-21T10:00:00Z",
                "type": "response",
                "payload": {"result": "done"}
            }"#,
        )
        .expect("parse");
        assert_eq!(decoded.version, CURRENT_PROTOCOL_VERSION);
        assert_eq!(decoded.msg, WireMsg::Response(TabResponse::Done));
    }

    #[test]
    fn event_topics_round_trip_as_dotted_names() {
        let event = TabEvent::Removed {
            tab_id: 3,
            window_id: 1,
        };
        assert_eq!(event.topic(), EventTopic::TabRemoved);
        assert_eq!(
            serde_json::to_string(&EventTopic::TabRemoved).expect("encode"),
            r#""tab.removed""#
        );
        let topic: EventTopic = serde_json::from_str(r#""tab.moved""#).expect("decode");
        assert_eq!(topic, EventTopic::TabMoved);
    }

    #[test]
    fn encoder_rejects_oversized_frame() {
        let huge = envelope(WireMsg::Hello(HelloPayload {
            client_id: "x".repeat(256),
            capabilities: Vec::new(),
        }));
        assert!(matches!(
            encode_frame(&huge, 64),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn decoder_reports_malformed_frames() {
        let result = decode_frame::<WireEnvelope>(b"{\"not\":\"valid\"\n", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}

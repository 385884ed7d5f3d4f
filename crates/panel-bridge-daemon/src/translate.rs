//! Raw compositor event to bridge event translation
//!
//! Every event read from the compositor passes through an
//! [`EventTranslator`] exactly once before it is queued for distribution.
//! Bridge events are JSON objects carrying an `"event"` type key; Wayfire
//! already speaks that shape, Sway and niri events are rewritten into it.

use serde_json::{json, Map, Value};

use crate::compositor::BackendKind;

/// What the translator knows about where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateContext {
    /// Backend of the connection the event was read from
    pub backend: Option<BackendKind>,
}

/// Hook applied to each raw event; `None` means the event is not distributed
pub trait EventTranslator: Send {
    fn translate(&mut self, raw: Value, context: &TranslateContext) -> Option<Value>;
}

impl<F> EventTranslator for F
where
    F: FnMut(Value, &TranslateContext) -> Option<Value> + Send,
{
    fn translate(&mut self, raw: Value, context: &TranslateContext) -> Option<Value> {
        self(raw, context)
    }
}

/// The default translator: normalises each backend's events
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendTranslator;

impl EventTranslator for BackendTranslator {
    fn translate(&mut self, raw: Value, context: &TranslateContext) -> Option<Value> {
        match context.backend {
            Some(BackendKind::Sway) => translate_sway(raw),
            Some(BackendKind::Niri) => translate_niri(raw),
            Some(BackendKind::Wayfire) | None => passthrough(raw),
        }
    }
}

fn passthrough(raw: Value) -> Option<Value> {
    raw.get("event").and_then(Value::as_str)?;
    Some(raw)
}

fn translate_sway(raw: Value) -> Option<Value> {
    let change = raw.get("change").and_then(Value::as_str)?;

    if let Some(container) = raw.get("container") {
        let kind = container.get("type").and_then(Value::as_str);
        if !matches!(kind, Some("con") | Some("floating_con")) {
            return None;
        }

        let event = match change {
            "focus" => "view-focused",
            "new" => "view-mapped",
            "title" => "view-title-changed",
            "close" => "view-closed",
            _ => return None,
        };
        return Some(json!({ "event": event, "view": container }));
    }

    // Workspace events carry `current`/`old` instead of `container`
    if change == "focus" {
        let old = raw.get("old")?;
        if old.get("type").and_then(Value::as_str) == Some("workspace") {
            return Some(json!({ "event": "workspace-lose-focus", "workspace": old }));
        }
    }

    None
}

fn translate_niri(raw: Value) -> Option<Value> {
    // niri events are externally tagged: {"WindowClosed": {"id": 3}}
    let Value::Object(map) = raw else {
        return None;
    };
    let (name, payload) = map.into_iter().next()?;

    let translated = match name.as_str() {
        "WindowFocusChanged" => payload
            .get("id")
            .and_then(Value::as_u64)
            .map(|id| json!({ "event": "view-focused", "view": { "id": id } })),
        "WindowOpenedOrChanged" => payload
            .get("window")
            .map(|window| json!({ "event": "view-mapped", "view": window })),
        "WindowClosed" => payload
            .get("id")
            .and_then(Value::as_u64)
            .map(|id| json!({ "event": "view-closed", "view": { "id": id } })),
        "WorkspaceActivated" if payload.get("focused").and_then(Value::as_bool) == Some(true) => {
            payload
                .get("id")
                .and_then(Value::as_u64)
                .map(|id| json!({ "event": "workspace-focused", "workspace": { "id": id } }))
        }
        _ => None,
    };

    translated.or_else(|| {
        let mut event = Map::new();
        event.insert("event".to_string(), Value::String(name));
        event.insert("data".to_string(), payload);
        Some(Value::Object(event))
    })
}

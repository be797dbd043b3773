//! Mirror of the browser's attached targets (tabs, workers).
//!
//! The extension is stateful about its live sessions but cannot replay
//! lifecycle to late joiners, so the room keeps this mirror and synthesizes
//! the attach/discovery events a freshly-connecting agent expects. Entries
//! are kept in insertion order; the legacy first-target fallback in
//! `Target.getTargetInfo` depends on it.

use serde_json::{json, Value};

/// A live browser attachment, keyed by its session id.
#[derive(Debug, Clone)]
pub struct Target {
    pub session_id: String,
    pub target_id: String,
    pub info: Value,
}

impl Target {
    /// The target info as agents see it: `attached` forced to `true`.
    pub fn attached_info(&self) -> Value {
        let mut info = self.info.clone();
        info["attached"] = json!(true);
        info
    }
}

/// The set of targets currently attached in a room.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Vec<Target>,
}

impl TargetRegistry {
    /// `Target.attachedToTarget` — insert, replacing any stale entry with the
    /// same session id.
    pub fn attach(&mut self, session_id: &str, info: Value) {
        let info = if info.is_object() { info } else { json!({}) };
        let target_id = info
            .get("targetId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(existing) = self
            .targets
            .iter_mut()
            .find(|t| t.session_id == session_id)
        {
            existing.target_id = target_id;
            existing.info = info;
        } else {
            self.targets.push(Target {
                session_id: session_id.to_string(),
                target_id,
                info,
            });
        }
    }

    /// `Target.detachedFromTarget` — remove by session id.
    pub fn detach(&mut self, session_id: &str) -> Option<Target> {
        let idx = self.targets.iter().position(|t| t.session_id == session_id)?;
        Some(self.targets.remove(idx))
    }

    /// `Target.targetInfoChanged` — replace the info of the target whose
    /// `targetId` matches. Returns `false` for an unknown target.
    pub fn update_info(&mut self, info: &Value) -> bool {
        let Some(target_id) = info.get("targetId").and_then(Value::as_str) else {
            return false;
        };
        match self.targets.iter_mut().find(|t| t.target_id == target_id) {
            Some(target) => {
                target.info = info.clone();
                true
            }
            None => false,
        }
    }

    /// Top-frame `Page.frameNavigated` — update the url, and take the frame
    /// name as the title when non-empty (otherwise the old title stands).
    pub fn navigate(&mut self, session_id: &str, url: &str, name: Option<&str>) -> bool {
        match self.targets.iter_mut().find(|t| t.session_id == session_id) {
            Some(target) => {
                target.info["url"] = json!(url);
                if let Some(name) = name {
                    if !name.is_empty() {
                        target.info["title"] = json!(name);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn by_session(&self, session_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.session_id == session_id)
    }

    pub fn by_target_id(&self, target_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.target_id == target_id)
    }

    pub fn first(&self) -> Option<&Target> {
        self.targets.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

//! Browser-side RPC multiplexing and event routing.
//!
//! Outbound: agent protocol commands are wrapped in `forwardCDPCommand`
//! envelopes with a room-scoped correlation id and await the extension's
//! response against the pending table. Inbound: `forwardCDPEvent` envelopes
//! pass through target-mirror bookkeeping and then fan out verbatim to every
//! agent peer; log and pong envelopes are consumed here.

use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{self, CallError, CdpEvent, PeerFrame, PeerLabel};
use crate::room::peers::{Outbound, PeerTag};
use crate::room::{pending, Room};

impl Room {
    /// Forward a protocol command to the extension and await its reply.
    ///
    /// `origin_client_id` records which agent (if any) the call is on behalf
    /// of; responses that arrive after that agent is gone are discarded
    /// harmlessly by the closed reply channel.
    pub async fn browser_call(
        &self,
        method: &str,
        params: Option<&Value>,
        session_id: Option<&str>,
        origin_client_id: Option<&str>,
    ) -> Result<Value, CallError> {
        let sender = {
            let peers = self.peers.lock().await;
            peers.extension().map(|p| p.sender.clone())
        }
        .ok_or(CallError::NotConnected(PeerLabel::Extension))?;

        let id = self.browser_pending.next_id();
        let envelope = protocol::forward_command(id, method, params, session_id);
        pending::dispatch(
            &self.browser_pending,
            &sender,
            id,
            method,
            origin_client_id,
            envelope,
            self.cfg.request_timeout_ms,
        )
        .await
    }

    /// Handle one parsed frame from the extension socket.
    pub async fn on_extension_frame(&self, frame: PeerFrame) {
        match frame {
            PeerFrame::Response { id, result, error } => {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if !self.browser_pending.resolve(id, outcome).await {
                    debug!(room = %self.id, id, "Dropped unmatched extension response");
                }
            }
            PeerFrame::Event(event) => self.on_browser_event(event).await,
            PeerFrame::Log { level, args } => self.emit_peer_log("extension", &level, &args),
            PeerFrame::Pong => self.touch_pong(&PeerTag::Extension).await,
        }
    }

    /// Target-mirror bookkeeping, then fan-out.
    pub async fn on_browser_event(&self, event: CdpEvent) {
        {
            let mut targets = self.targets.lock().await;
            match event.method.as_str() {
                "Target.attachedToTarget" => {
                    if let Some(session_id) =
                        event.params.get("sessionId").and_then(Value::as_str)
                    {
                        let info = event
                            .params
                            .get("targetInfo")
                            .cloned()
                            .unwrap_or(Value::Null);
                        targets.attach(session_id, info);
                    }
                }
                "Target.detachedFromTarget" => {
                    if let Some(session_id) =
                        event.params.get("sessionId").and_then(Value::as_str)
                    {
                        targets.detach(session_id);
                    }
                }
                "Target.targetInfoChanged" => {
                    if let Some(info) = event.params.get("targetInfo") {
                        targets.update_info(info);
                    }
                }
                "Page.frameNavigated" => {
                    // Only a top frame (no parent) with a session id moves the
                    // mirror; sub-frame navigations belong to the page.
                    let frame = event.params.get("frame");
                    let is_top = frame
                        .is_some_and(|f| f.get("parentId").and_then(Value::as_str).is_none());
                    if let (Some(session_id), Some(frame), true) =
                        (event.session_id.as_deref(), frame, is_top)
                    {
                        if let Some(url) = frame.get("url").and_then(Value::as_str) {
                            let name = frame.get("name").and_then(Value::as_str);
                            targets.navigate(session_id, url, name);
                        }
                    }
                }
                _ => {}
            }
        }
        self.broadcast_event(&event).await;
    }

    /// Fan the event out to every agent peer. The snapshot is taken before
    /// sending, so an agent disconnecting mid-broadcast cannot disturb the
    /// iteration, and one failed send cannot block the others.
    pub async fn broadcast_event(&self, event: &CdpEvent) {
        let agents = self.peers.lock().await.agents();
        if agents.is_empty() {
            return;
        }
        let message = protocol::event(
            &event.method,
            event.params.clone(),
            event.session_id.as_deref(),
        );
        for agent in agents {
            if agent.sender.try_send(Outbound::Json(message.clone())).is_err() {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                warn!(
                    room = %self.id,
                    peer = %agent.tag,
                    method = %event.method,
                    "Dropped event (agent backpressure or closed socket)"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{CallError, CdpEvent, PeerFrame};
    use crate::room::peers::PeerTag;
    use crate::room::test_support::{admit_peer, next_json, test_room, test_room_with};
    use serde_json::json;

    fn attached(session: &str, target: &str, url: &str) -> CdpEvent {
        CdpEvent {
            method: "Target.attachedToTarget".to_string(),
            session_id: None,
            params: json!({
                "sessionId": session,
                "targetInfo": {"targetId": target, "type": "page", "title": "", "url": url},
            }),
        }
    }

    #[tokio::test]
    async fn call_resolves_against_the_extension_response() {
        let room = test_room();
        let mut ext_rx = admit_peer(&room, PeerTag::Extension).await;

        let call_room = room.clone();
        let call = tokio::spawn(async move {
            call_room
                .browser_call("Runtime.evaluate", Some(&json!({"expression": "1"})), Some("s1"), None)
                .await
        });

        let sent = next_json(&mut ext_rx).await;
        assert_eq!(sent["method"], json!("forwardCDPCommand"));
        assert_eq!(sent["params"]["method"], json!("Runtime.evaluate"));
        assert_eq!(sent["params"]["sessionId"], json!("s1"));
        let id = sent["id"].as_u64().unwrap();

        room.on_extension_frame(PeerFrame::Response {
            id,
            result: Some(json!({"value": 1})),
            error: None,
        })
        .await;
        assert_eq!(call.await.unwrap().unwrap()["value"], json!(1));
    }

    #[tokio::test]
    async fn call_without_extension_fails_fast() {
        let room = test_room();
        let err = room.browser_call("Page.enable", None, None, None).await;
        assert_eq!(err.unwrap_err().to_string(), "Extension not connected");
    }

    #[tokio::test]
    async fn call_times_out_with_the_method_in_the_message() {
        let room = test_room_with(crate::room::RoomConfig {
            request_timeout_ms: 100,
            exec_timeout_ms: 100,
            keepalive_interval_secs: 60,
        });
        let _ext_rx = admit_peer(&room, PeerTag::Extension).await;
        let err = room
            .browser_call("Page.navigate", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Extension request timeout after 100ms: Page.navigate"
        );
        // The extension stays connected after a timeout.
        assert!(room.extension_connected().await);
        assert_eq!(room.pending_counts().await.0, 0);
    }

    #[tokio::test]
    async fn peer_error_strings_are_forwarded_verbatim() {
        let room = test_room();
        let mut ext_rx = admit_peer(&room, PeerTag::Extension).await;
        let call_room = room.clone();
        let call =
            tokio::spawn(async move { call_room.browser_call("Page.navigate", None, None, None).await });
        let sent = next_json(&mut ext_rx).await;
        room.on_extension_frame(PeerFrame::Response {
            id: sent["id"].as_u64().unwrap(),
            result: None,
            error: Some("Cannot navigate to invalid URL".to_string()),
        })
        .await;
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            CallError::Peer("Cannot navigate to invalid URL".to_string())
        );
    }

    #[tokio::test]
    async fn events_update_the_mirror_and_fan_out_in_order() {
        let room = test_room();
        let mut agent_rx = admit_peer(&room, PeerTag::Agent("a1".into())).await;

        room.on_browser_event(attached("s1", "t1", "/a")).await;
        room.on_browser_event(attached("s2", "t2", "/b")).await;
        room.on_browser_event(CdpEvent {
            method: "Page.frameNavigated".to_string(),
            session_id: Some("s1".to_string()),
            params: json!({"frame": {"url": "/a2", "name": ""}}),
        })
        .await;

        assert_eq!(room.target_count().await, 2);

        // Fan-out order equals source order.
        let first = next_json(&mut agent_rx).await;
        assert_eq!(first["method"], json!("Target.attachedToTarget"));
        assert_eq!(first["params"]["sessionId"], json!("s1"));
        let second = next_json(&mut agent_rx).await;
        assert_eq!(second["params"]["sessionId"], json!("s2"));
        let third = next_json(&mut agent_rx).await;
        assert_eq!(third["method"], json!("Page.frameNavigated"));
        assert_eq!(third["sessionId"], json!("s1"));
    }

    #[tokio::test]
    async fn dropped_fanout_sends_are_counted() {
        let room = test_room();
        let agent_rx = admit_peer(&room, PeerTag::Agent("gone".into())).await;
        // A closed receiver stands in for a dead agent socket.
        drop(agent_rx);
        room.on_browser_event(attached("s1", "t1", "/a")).await;
        assert_eq!(room.dropped_event_count(), 1);
        room.on_browser_event(attached("s2", "t2", "/b")).await;
        assert_eq!(room.dropped_event_count(), 2);
    }

    #[tokio::test]
    async fn subframe_navigation_leaves_the_mirror_alone() {
        let room = test_room();
        room.on_browser_event(attached("s1", "t1", "/a")).await;
        room.on_browser_event(CdpEvent {
            method: "Page.frameNavigated".to_string(),
            session_id: Some("s1".to_string()),
            params: json!({"frame": {"url": "/iframe", "parentId": "f0"}}),
        })
        .await;
        // A detached event for an unknown session is also a no-op.
        room.on_browser_event(CdpEvent {
            method: "Target.detachedFromTarget".to_string(),
            session_id: None,
            params: json!({"sessionId": "s9"}),
        })
        .await;
        assert_eq!(room.target_count().await, 1);
    }
}

//! Classification and routing of agent protocol commands.
//!
//! A command is either answered locally, answered locally after synthesizing
//! bookkeeping events to the requesting agent, or forwarded to the extension
//! verbatim. The relay owns the agent's view of the target graph so a
//! late-joining agent can re-attach to a pre-existing browser session
//! without replaying history; the extension is stateful about its live
//! sessions but cannot replay lifecycle to late joiners.
//!
//! ## Decision table (methods not listed are forwarded unchanged)
//!
//! | Method | Behavior |
//! |--------|----------|
//! | `Browser.getVersion` | fixed descriptor, no forward |
//! | `Browser.setDownloadBehavior` | empty result, no forward |
//! | `Target.setAutoAttach` (no session) | synthesize `attachedToTarget` per known target, then empty result |
//! | `Target.setAutoAttach` (session) | forward — child sessions defer to the browser |
//! | `Target.setDiscoverTargets` | synthesize `targetCreated` per known target when `discover` is true, then empty result |
//! | `Target.attachToTarget` | answer from the mirror, or error for an unknown target |
//! | `Target.getTargetInfo` | answer from the mirror (first target as legacy fallback) |
//! | `Target.getTargets` | the full mirror, each marked attached |
//! | `Target.detachFromTarget` | forward for mirrored sessions, acknowledge locally otherwise |

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::protocol::{self, AgentCommand};
use crate::room::peers::Outbound;
use crate::room::targets::Target;
use crate::room::Room;

/// Fixed descriptor answering `Browser.getVersion` without a browser round
/// trip.
fn version_descriptor() -> Value {
    json!({
        "protocolVersion": "1.3",
        "product": "Chrome/Cloudflare-Relay",
        "revision": "1.0.0",
        "userAgent": "Cloudflare-Relay/1.0.0",
        "jsVersion": "V8",
    })
}

/// Synthesized `Target.attachedToTarget` for one mirrored target.
fn attached_event(target: &Target) -> Value {
    protocol::event(
        "Target.attachedToTarget",
        json!({
            "sessionId": target.session_id,
            "targetInfo": target.attached_info(),
            "waitingForDebugger": false,
        }),
        None,
    )
}

/// Synthesized `Target.targetCreated` for one mirrored target.
fn created_event(target: &Target) -> Value {
    protocol::event(
        "Target.targetCreated",
        json!({ "targetInfo": target.attached_info() }),
        None,
    )
}

async fn send(reply: &mpsc::Sender<Outbound>, msg: Value) {
    let _ = reply.send(Outbound::Json(msg)).await;
}

/// Route one agent command. Synthesized events go to the requesting agent
/// only and always precede the reply; forwarded commands are awaited inline
/// so this agent's replies stay in command order.
pub async fn handle_agent_command(
    room: &Room,
    client_id: &str,
    reply: &mpsc::Sender<Outbound>,
    cmd: AgentCommand,
) {
    let sid = cmd.session_id.as_deref();
    match cmd.method.as_str() {
        "Browser.getVersion" => {
            send(reply, protocol::reply_ok(cmd.id, version_descriptor(), sid)).await;
        }
        "Browser.setDownloadBehavior" => {
            send(reply, protocol::reply_ok(cmd.id, json!({}), sid)).await;
        }
        "Target.setAutoAttach" if cmd.session_id.is_none() => {
            let events: Vec<Value> = {
                let targets = room.targets.lock().await;
                targets.iter().map(attached_event).collect()
            };
            for event in events {
                send(reply, event).await;
            }
            send(reply, protocol::reply_ok(cmd.id, json!({}), sid)).await;
        }
        "Target.setDiscoverTargets" => {
            let discover = cmd
                .param("discover")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if discover {
                let events: Vec<Value> = {
                    let targets = room.targets.lock().await;
                    targets.iter().map(created_event).collect()
                };
                for event in events {
                    send(reply, event).await;
                }
            }
            send(reply, protocol::reply_ok(cmd.id, json!({}), sid)).await;
        }
        "Target.attachToTarget" => {
            let target_id = cmd.param_str("targetId").unwrap_or_default().to_string();
            let found = {
                let targets = room.targets.lock().await;
                targets.by_target_id(&target_id).cloned()
            };
            match found {
                Some(target) => {
                    send(reply, attached_event(&target)).await;
                    send(
                        reply,
                        protocol::reply_ok(
                            cmd.id,
                            json!({ "sessionId": target.session_id }),
                            sid,
                        ),
                    )
                    .await;
                }
                None => {
                    let message =
                        format!("Target {target_id} not found in connected targets");
                    send(reply, protocol::reply_err(cmd.id, &message, sid)).await;
                }
            }
        }
        "Target.getTargetInfo" => {
            let requested = cmd.param_str("targetId").map(ToString::to_string);
            let info = {
                let targets = room.targets.lock().await;
                requested
                    .as_deref()
                    .and_then(|id| targets.by_target_id(id))
                    .or_else(|| sid.and_then(|s| targets.by_session(s)))
                    // Legacy fallback: no match resolves to the first target.
                    .or_else(|| targets.first())
                    .map(Target::attached_info)
            };
            match info {
                Some(info) => {
                    send(
                        reply,
                        protocol::reply_ok(cmd.id, json!({ "targetInfo": info }), sid),
                    )
                    .await;
                }
                None => {
                    let requested = requested
                        .or_else(|| sid.map(ToString::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    let message =
                        format!("Target {requested} not found in connected targets");
                    send(reply, protocol::reply_err(cmd.id, &message, sid)).await;
                }
            }
        }
        "Target.getTargets" => {
            let infos: Vec<Value> = {
                let targets = room.targets.lock().await;
                targets.iter().map(Target::attached_info).collect()
            };
            send(
                reply,
                protocol::reply_ok(cmd.id, json!({ "targetInfos": infos }), sid),
            )
            .await;
        }
        "Target.detachFromTarget" => {
            let session = cmd.param_str("sessionId").unwrap_or_default().to_string();
            let mirrored = room.targets.lock().await.by_session(&session).is_some();
            if mirrored {
                forward(room, client_id, reply, cmd).await;
            } else {
                // Child sessions are tracked only by the browser.
                send(reply, protocol::reply_ok(cmd.id, json!({}), sid)).await;
            }
        }
        _ => forward(room, client_id, reply, cmd).await,
    }
}

/// Forward through the browser multiplexer and reply with the outcome.
async fn forward(
    room: &Room,
    client_id: &str,
    reply: &mpsc::Sender<Outbound>,
    cmd: AgentCommand,
) {
    let sid = cmd.session_id.as_deref();
    let msg = match room
        .browser_call(&cmd.method, cmd.params.as_ref(), sid, Some(client_id))
        .await
    {
        Ok(result) => protocol::reply_ok(cmd.id, result, sid),
        Err(error) => protocol::reply_err(cmd.id, &error.to_string(), sid),
    };
    send(reply, msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CdpEvent, PeerFrame};
    use crate::room::peers::PeerTag;
    use crate::room::test_support::{admit_peer, next_json, test_room};

    fn command(id: u64, method: &str, params: Option<Value>) -> AgentCommand {
        AgentCommand {
            id,
            method: method.to_string(),
            params,
            session_id: None,
        }
    }

    async fn seed_targets(room: &std::sync::Arc<Room>) {
        for (session, target, url) in [("s1", "t1", "/a"), ("s2", "t2", "/b")] {
            room.on_browser_event(CdpEvent {
                method: "Target.attachedToTarget".to_string(),
                session_id: None,
                params: json!({
                    "sessionId": session,
                    "targetInfo": {"targetId": target, "type": "page", "title": target, "url": url},
                }),
            })
            .await;
        }
    }

    #[tokio::test]
    async fn get_version_is_answered_locally() {
        let room = test_room();
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        handle_agent_command(&room, "a", &tx, command(1, "Browser.getVersion", None)).await;
        let msg = next_json(&mut agent).await;
        assert_eq!(msg["id"], json!(1));
        assert_eq!(msg["result"]["protocolVersion"], json!("1.3"));
        assert_eq!(msg["result"]["product"], json!("Chrome/Cloudflare-Relay"));
        assert_eq!(msg["result"]["jsVersion"], json!("V8"));
    }

    #[tokio::test]
    async fn late_joining_agent_discovers_existing_targets() {
        let room = test_room();
        seed_targets(&room).await;
        // The first tab navigated before this agent existed.
        room.on_browser_event(CdpEvent {
            method: "Page.frameNavigated".to_string(),
            session_id: Some("s1".to_string()),
            params: json!({"frame": {"url": "/a2", "name": ""}}),
        })
        .await;

        let mut agent = admit_peer(&room, PeerTag::Agent("late".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers
                .get(&PeerTag::Agent("late".into()))
                .unwrap()
                .sender
                .clone()
        };
        handle_agent_command(
            &room,
            "late",
            &tx,
            command(5, "Target.setDiscoverTargets", Some(json!({"discover": true}))),
        )
        .await;

        let first = next_json(&mut agent).await;
        assert_eq!(first["method"], json!("Target.targetCreated"));
        assert_eq!(first["params"]["targetInfo"]["targetId"], json!("t1"));
        assert_eq!(first["params"]["targetInfo"]["url"], json!("/a2"));
        assert_eq!(first["params"]["targetInfo"]["attached"], json!(true));

        let second = next_json(&mut agent).await;
        assert_eq!(second["params"]["targetInfo"]["targetId"], json!("t2"));
        assert_eq!(second["params"]["targetInfo"]["url"], json!("/b"));

        let reply = next_json(&mut agent).await;
        assert_eq!(reply["id"], json!(5));
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn sessionless_auto_attach_synthesizes_every_known_target() {
        let room = test_room();
        seed_targets(&room).await;
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        handle_agent_command(
            &room,
            "a",
            &tx,
            command(2, "Target.setAutoAttach", Some(json!({"autoAttach": true}))),
        )
        .await;

        for expected_session in ["s1", "s2"] {
            let event = next_json(&mut agent).await;
            assert_eq!(event["method"], json!("Target.attachedToTarget"));
            assert_eq!(event["params"]["sessionId"], json!(expected_session));
            assert_eq!(event["params"]["waitingForDebugger"], json!(false));
            assert_eq!(event["params"]["targetInfo"]["attached"], json!(true));
        }
        let reply = next_json(&mut agent).await;
        assert_eq!(reply["id"], json!(2));
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn attach_to_known_target_replies_with_its_session() {
        let room = test_room();
        seed_targets(&room).await;
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        handle_agent_command(
            &room,
            "a",
            &tx,
            command(3, "Target.attachToTarget", Some(json!({"targetId": "t2"}))),
        )
        .await;
        let event = next_json(&mut agent).await;
        assert_eq!(event["method"], json!("Target.attachedToTarget"));
        assert_eq!(event["params"]["sessionId"], json!("s2"));
        let reply = next_json(&mut agent).await;
        assert_eq!(reply["result"], json!({"sessionId": "s2"}));
    }

    #[tokio::test]
    async fn attach_to_unknown_target_is_an_error_and_leaves_the_mirror_alone() {
        let room = test_room();
        seed_targets(&room).await;
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        handle_agent_command(
            &room,
            "a",
            &tx,
            command(4, "Target.attachToTarget", Some(json!({"targetId": "t9"}))),
        )
        .await;
        let reply = next_json(&mut agent).await;
        assert_eq!(
            reply["error"]["message"],
            json!("Target t9 not found in connected targets")
        );
        assert_eq!(room.target_count().await, 2);
    }

    #[tokio::test]
    async fn get_target_info_falls_back_to_first_target() {
        let room = test_room();
        seed_targets(&room).await;
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        // Neither a targetId nor a sessionId resolves: the first known target
        // is returned (legacy behavior, kept as shipped).
        handle_agent_command(&room, "a", &tx, command(6, "Target.getTargetInfo", None)).await;
        let reply = next_json(&mut agent).await;
        assert_eq!(reply["result"]["targetInfo"]["targetId"], json!("t1"));
    }

    #[tokio::test]
    async fn get_targets_marks_everything_attached() {
        let room = test_room();
        seed_targets(&room).await;
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        handle_agent_command(&room, "a", &tx, command(7, "Target.getTargets", None)).await;
        let reply = next_json(&mut agent).await;
        let infos = reply["result"]["targetInfos"].as_array().unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|i| i["attached"] == json!(true)));
    }

    #[tokio::test]
    async fn detach_of_unmirrored_session_is_acknowledged_locally() {
        let room = test_room();
        seed_targets(&room).await;
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        // No extension is connected: a forward would fail, proving the ack
        // never left the relay.
        handle_agent_command(
            &room,
            "a",
            &tx,
            command(8, "Target.detachFromTarget", Some(json!({"sessionId": "child-1"}))),
        )
        .await;
        let reply = next_json(&mut agent).await;
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn forwarded_command_without_extension_errs_but_keeps_the_agent() {
        let room = test_room();
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };
        let mut cmd = command(9, "Page.enable", None);
        cmd.session_id = Some("s1".to_string());
        handle_agent_command(&room, "a", &tx, cmd).await;
        let reply = next_json(&mut agent).await;
        assert_eq!(reply["id"], json!(9));
        assert_eq!(reply["sessionId"], json!("s1"));
        assert_eq!(reply["error"]["message"], json!("Extension not connected"));
        assert!(room.peer_connected(&PeerTag::Agent("a".into())).await);
    }

    #[tokio::test]
    async fn forwarded_command_round_trips_through_the_extension() {
        let room = test_room();
        let mut ext = admit_peer(&room, PeerTag::Extension).await;
        let mut agent = admit_peer(&room, PeerTag::Agent("a".into())).await;
        let tx = {
            let peers = room.peers.lock().await;
            peers.get(&PeerTag::Agent("a".into())).unwrap().sender.clone()
        };

        let room2 = room.clone();
        let tx2 = tx.clone();
        let routed = tokio::spawn(async move {
            let mut cmd = command(10, "Runtime.evaluate", Some(json!({"expression": "2"})));
            cmd.session_id = Some("s1".to_string());
            handle_agent_command(&room2, "a", &tx2, cmd).await;
        });

        let forwarded = next_json(&mut ext).await;
        assert_eq!(forwarded["method"], json!("forwardCDPCommand"));
        assert_eq!(forwarded["params"]["method"], json!("Runtime.evaluate"));
        room.on_extension_frame(PeerFrame::Response {
            id: forwarded["id"].as_u64().unwrap(),
            result: Some(json!({"value": 2})),
            error: None,
        })
        .await;
        routed.await.unwrap();

        let reply = next_json(&mut agent).await;
        // The agent sees its own command id, not the relay's correlation id.
        assert_eq!(reply["id"], json!(10));
        assert_eq!(reply["result"]["value"], json!(2));
    }
}

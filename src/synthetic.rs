//! The CDP surface the relay answers without consulting the extension.
//!
//! Unmodified CDP clients bootstrap with target discovery and attach
//! calls; the relay satisfies those locally against the one
//! [`SyntheticTarget`] the extension exposes, so the extension only ever
//! sees session-scoped page commands.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::protocol::{self, CommandFrame};
use crate::registry::{ClientId, SessionBinding, SyntheticTarget, Tables};

/// Capability string an extension advertises when it can pause targets
/// for a debugger itself.
pub const CAP_WAIT_FOR_DEBUGGER: &str = "waitForDebugger";

/// Result of offering a command to the synthetic responder.
pub enum SyntheticOutcome {
    /// Frames for the calling client, in delivery order (events precede
    /// the command response, as Chrome emits them).
    Replies(Vec<String>),
    /// The method is not part of the synthetic surface.
    NotSynthetic,
}

pub fn respond(tables: &mut Tables, client: ClientId, cmd: &CommandFrame) -> SyntheticOutcome {
    let frames = match cmd.method.as_str() {
        "Browser.getVersion" => browser_get_version(tables, cmd),
        "Target.setDiscoverTargets" => set_discover_targets(tables, client, cmd),
        "Target.getTargets" => get_targets(tables, cmd),
        "Target.setAutoAttach" => set_auto_attach(tables, client, cmd),
        "Target.attachToTarget" => attach_to_target(tables, client, cmd),
        "Target.detachFromTarget" => detach_from_target(tables, client, cmd),
        _ => return SyntheticOutcome::NotSynthetic,
    };
    SyntheticOutcome::Replies(frames)
}

/// Local acknowledgement of `Runtime.runIfWaitingForDebugger` when the
/// extension cannot handle it. Returns `None` when the command should be
/// forwarded instead.
pub fn maybe_ack_run_if_waiting(
    tables: &mut Tables,
    client: ClientId,
    cmd: &CommandFrame,
) -> Option<String> {
    if cmd.method != "Runtime.runIfWaitingForDebugger" {
        return None;
    }
    if tables
        .target
        .as_ref()
        .is_some_and(|t| t.supports(CAP_WAIT_FOR_DEBUGGER))
    {
        return None;
    }
    let session_id = cmd.session_id.as_deref()?;
    let binding = tables.sessions.get_mut(session_id)?;
    if binding.owner != client || !binding.waiting_for_debugger {
        return None;
    }
    binding.waiting_for_debugger = false;
    Some(protocol::result_frame(&cmd.id, json!({})))
}

/// 32-hex session ids, fresh per attach.
fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

fn target_info_json(target: &SyntheticTarget, attached: bool) -> Value {
    json!({
        "targetId": target.target_id,
        "type": "page",
        "title": target.title,
        "url": target.url,
        "attached": attached,
        "canAccessOpener": false,
        "browserContextId": target.browser_context_id,
    })
}

fn browser_get_version(tables: &Tables, cmd: &CommandFrame) -> Vec<String> {
    let user_agent = tables
        .target
        .as_ref()
        .and_then(|t| t.user_agent.clone())
        .unwrap_or_default();
    let product = user_agent
        .split_whitespace()
        .find(|part| part.starts_with("Chrome/"))
        .unwrap_or("Chrome/unknown")
        .to_string();
    vec![protocol::result_frame(
        &cmd.id,
        json!({
            "protocolVersion": "1.3",
            "product": product,
            "revision": "",
            "userAgent": user_agent,
            "jsVersion": "",
        }),
    )]
}

fn set_discover_targets(tables: &mut Tables, client: ClientId, cmd: &CommandFrame) -> Vec<String> {
    let discover = cmd
        .params
        .as_ref()
        .and_then(|p| p.get("discover"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let previously = match tables.clients.get_mut(&client) {
        Some(record) => std::mem::replace(&mut record.discover, discover),
        None => false,
    };

    let mut frames = Vec::new();
    if discover && !previously {
        if let Some(target) = &tables.target {
            frames.push(protocol::event_frame(
                "Target.targetCreated",
                None,
                json!({ "targetInfo": target_info_json(target, tables.target_attached()) }),
            ));
        }
    }
    frames.push(protocol::result_frame(&cmd.id, json!({})));
    frames
}

fn get_targets(tables: &Tables, cmd: &CommandFrame) -> Vec<String> {
    let infos: Vec<Value> = tables
        .target
        .as_ref()
        .map(|target| vec![target_info_json(target, tables.target_attached())])
        .unwrap_or_default();
    vec![protocol::result_frame(
        &cmd.id,
        json!({ "targetInfos": infos }),
    )]
}

fn set_auto_attach(tables: &mut Tables, client: ClientId, cmd: &CommandFrame) -> Vec<String> {
    let auto_attach = cmd
        .params
        .as_ref()
        .and_then(|p| p.get("autoAttach"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let wait_for_debugger = cmd
        .params
        .as_ref()
        .and_then(|p| {
            p.get("waitForDebugger")
                .or_else(|| p.get("waitForDebuggerOnStart"))
        })
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(record) = tables.clients.get_mut(&client) {
        record.auto_attach = auto_attach;
    }

    let mut frames = Vec::new();
    if auto_attach {
        if let Some(target) = tables.target.clone() {
            let session_id = new_session_id();
            tables.sessions.insert(
                session_id.clone(),
                SessionBinding {
                    owner: client,
                    target_id: target.target_id.clone(),
                    auto_attached: true,
                    waiting_for_debugger: wait_for_debugger,
                },
            );
            frames.push(protocol::event_frame(
                "Target.attachedToTarget",
                None,
                json!({
                    "sessionId": session_id,
                    "targetInfo": target_info_json(&target, true),
                    "waitingForDebugger": wait_for_debugger,
                }),
            ));
        }
    }
    frames.push(protocol::result_frame(&cmd.id, json!({})));
    frames
}

fn attach_to_target(tables: &mut Tables, client: ClientId, cmd: &CommandFrame) -> Vec<String> {
    let requested = cmd
        .params
        .as_ref()
        .and_then(|p| p.get("targetId"))
        .and_then(Value::as_str);

    let target = match (requested, tables.target.clone()) {
        (Some(id), Some(target)) if id == target.target_id => target,
        _ => {
            return vec![protocol::error_frame(
                &cmd.id,
                protocol::NO_SUCH_TARGET,
                "no such target",
            )]
        }
    };

    let session_id = new_session_id();
    tables.sessions.insert(
        session_id.clone(),
        SessionBinding {
            owner: client,
            target_id: target.target_id.clone(),
            auto_attached: false,
            waiting_for_debugger: false,
        },
    );
    vec![
        protocol::event_frame(
            "Target.attachedToTarget",
            None,
            json!({
                "sessionId": session_id,
                "targetInfo": target_info_json(&target, true),
                "waitingForDebugger": false,
            }),
        ),
        protocol::result_frame(&cmd.id, json!({ "sessionId": session_id })),
    ]
}

fn detach_from_target(tables: &mut Tables, client: ClientId, cmd: &CommandFrame) -> Vec<String> {
    let Some(session_id) = cmd
        .params
        .as_ref()
        .and_then(|p| p.get("sessionId"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return vec![protocol::error_frame(
            &cmd.id,
            protocol::NO_SUCH_TARGET,
            "sessionId required",
        )];
    };

    let Some(binding) = tables.sessions.remove(&session_id) else {
        return vec![protocol::error_frame(
            &cmd.id,
            protocol::NO_SUCH_TARGET,
            "no such session",
        )];
    };
    if binding.owner != client {
        tables.sessions.insert(session_id.clone(), binding);
        return vec![protocol::error_frame(
            &cmd.id,
            protocol::SESSION_NOT_OWNED,
            "session not owned",
        )];
    }
    vec![
        protocol::event_frame(
            "Target.detachedFromTarget",
            None,
            json!({ "sessionId": session_id, "targetId": binding.target_id }),
        ),
        protocol::result_frame(&cmd.id, json!({})),
    ]
}

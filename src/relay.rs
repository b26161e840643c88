//! Relay core: frame dispatch between clients and the extension.
//!
//! Every inbound frame funnels through here. The registry guard is taken
//! once per frame, mutations and routing decisions happen under it, and
//! the resulting frames are pushed onto connection channels after it
//! drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::metrics::{CounterSnapshot, RelayCounters};
use crate::protocol::{self, ClientFrame, CommandFrame, ExtensionFrame};
use crate::registry::{ClientId, Outbox, PendingCommand, Registry};
use crate::synthetic::{self, SyntheticOutcome};

/// What the extension reader loop needs to know about a frame it fed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtInbound {
    /// Dispatched; nothing for the loop to do.
    Routine,
    /// Keepalive reply; refresh the liveness clock.
    Pong,
    /// Handshake landed; disarm the handshake deadline.
    Handshake,
    /// The trusted producer broke the protocol; close with 1002.
    ProtocolViolation,
}

/// Body of `GET /extension/status`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub connected: bool,
    pub clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    pub counters: CounterSnapshot,
}

pub struct Relay {
    cfg: RelayConfig,
    registry: Registry,
    counters: RelayCounters,
    shutdown: watch::Sender<bool>,
    shutdown_started: AtomicBool,
}

impl Relay {
    pub fn new(cfg: RelayConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            registry: Registry::new(),
            counters: RelayCounters::default(),
            shutdown,
            shutdown_started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            connected: self.registry.extension_id().is_some(),
            clients: self.registry.client_count(),
            extension_id: self.registry.extension_id(),
            counters: self.counters.snapshot(),
        }
    }

    // ----- client path -------------------------------------------------

    pub fn admit_client(&self, outbox: Outbox, remote: String) -> ClientId {
        let id = self.registry.admit_client(outbox, remote.clone());
        info!(target: "relay", client = id, %remote, "client connected");
        id
    }

    pub fn client_closed(&self, client: ClientId) {
        let cancelled = self.registry.remove_client(client);
        info!(target: "relay", client, cancelled, "client disconnected");
    }

    /// Dispatch one text frame from a client. Protocol errors here are
    /// lenient: the frame is dropped, with a best-effort error reply when
    /// an id could be recovered.
    pub fn handle_client_frame(&self, client: ClientId, text: &str) {
        let cmd = match protocol::parse_client_frame(text) {
            ClientFrame::Command(cmd) => cmd,
            ClientFrame::Malformed { id: Some(id) } => {
                self.reply(
                    client,
                    protocol::error_frame(&id, protocol::INVALID_REQUEST, "invalid request"),
                );
                return;
            }
            ClientFrame::Malformed { id: None } => {
                debug!(target: "relay", client, "dropping unparseable client frame");
                return;
            }
        };

        let mut outbound: Vec<(Outbox, String)> = Vec::new();
        {
            let mut tables = self.registry.lock();
            let Some(outbox) = tables.clients.get(&client).map(|c| c.outbox.clone()) else {
                return;
            };

            match synthetic::respond(&mut tables, client, &cmd) {
                SyntheticOutcome::Replies(frames) => {
                    for frame in frames {
                        outbound.push((outbox.clone(), frame));
                    }
                }
                SyntheticOutcome::NotSynthetic => {
                    if let Some(ack) = synthetic::maybe_ack_run_if_waiting(&mut tables, client, &cmd)
                    {
                        outbound.push((outbox, ack));
                    } else if let Some(session) = &cmd.session_id {
                        if tables.session_owner(session) != Some(client) {
                            outbound.push((
                                outbox,
                                protocol::error_frame(
                                    &cmd.id,
                                    protocol::SESSION_NOT_OWNED,
                                    "session not owned",
                                ),
                            ));
                        } else {
                            self.forward(&mut tables, client, &cmd, outbox, &mut outbound);
                        }
                    } else {
                        self.forward(&mut tables, client, &cmd, outbox, &mut outbound);
                    }
                }
            }
        }
        for (outbox, frame) in outbound {
            outbox.push_frame(frame);
        }
    }

    /// Forwarding engine: rewrite the id, record the correlation, hand the
    /// frame to the extension. Must run under the registry guard.
    fn forward(
        &self,
        tables: &mut crate::registry::Tables,
        client: ClientId,
        cmd: &CommandFrame,
        client_outbox: Outbox,
        outbound: &mut Vec<(Outbox, String)>,
    ) {
        let Some(ext_outbox) = tables.extension.as_ref().map(|ext| ext.outbox.clone()) else {
            outbound.push((
                client_outbox,
                protocol::error_frame(&cmd.id, protocol::SERVER_ERROR, "browser not connected"),
            ));
            return;
        };
        if ext_outbox.queued_bytes() > self.cfg.max_client_queue_bytes {
            outbound.push((
                client_outbox,
                protocol::error_frame(&cmd.id, protocol::SERVER_ERROR, "extension busy"),
            ));
            return;
        }

        let timeout_ms = if protocol::is_long_method(&cmd.method) {
            self.cfg.long_command_timeout_ms
        } else {
            self.cfg.command_timeout_ms
        };
        let relay_id = self.registry.next_relay_id();
        tables.pending.insert(
            relay_id,
            PendingCommand {
                client,
                original_id: cmd.id.clone(),
                method: cmd.method.clone(),
                session_id: cmd.session_id.clone(),
                deadline: Instant::now() + Duration::from_millis(timeout_ms),
            },
        );
        outbound.push((ext_outbox, protocol::forward_frame(relay_id, cmd)));
    }

    // ----- extension path ----------------------------------------------

    /// Admit a new extension connection, superseding any live one.
    pub fn admit_extension(&self, extension_id: String, outbox: Outbox) -> u64 {
        let (epoch, replaced, orphaned) = self
            .registry
            .admit_extension(extension_id.clone(), outbox);
        if let Some(old) = replaced {
            info!(
                target: "relay",
                old = %old.extension_id,
                new = %extension_id,
                "extension replaced"
            );
            self.counters.record_extension_replacement();
            old.outbox.push_close(1000, "replaced");
        } else {
            info!(target: "relay", extension = %extension_id, "extension connected");
        }
        self.fail_orphaned(orphaned, "browser disconnected");
        epoch
    }

    /// Tear down the extension identified by `epoch`; a superseded
    /// connection's late cleanup no-ops. Clients stay connected.
    pub fn extension_closed(&self, epoch: u64) {
        let Some(orphaned) = self.registry.remove_extension(epoch) else {
            return;
        };
        info!(target: "relay", epoch, "extension disconnected");
        self.fail_orphaned(orphaned, "browser disconnected");
    }

    fn fail_orphaned(&self, orphaned: Vec<crate::registry::OrphanedCommand>, message: &str) {
        if orphaned.is_empty() {
            return;
        }
        let mut outbound = Vec::with_capacity(orphaned.len());
        {
            let tables = self.registry.lock();
            for cmd in &orphaned {
                if let Some(record) = tables.clients.get(&cmd.client) {
                    outbound.push((
                        record.outbox.clone(),
                        protocol::error_frame(&cmd.original_id, protocol::SERVER_ERROR, message),
                    ));
                }
            }
        }
        for (outbox, frame) in outbound {
            outbox.push_frame(frame);
        }
    }

    /// Dispatch one text frame from the extension connection `epoch`.
    pub fn handle_extension_frame(&self, epoch: u64, text: &str) -> ExtInbound {
        match protocol::parse_extension_frame(text) {
            ExtensionFrame::Response { relay_id, raw } => {
                let mut delivery = None;
                {
                    let mut tables = self.registry.lock();
                    if !current_epoch(&tables, epoch) {
                        return ExtInbound::Routine;
                    }
                    if let Some(pending) = tables.pending.remove(&relay_id) {
                        if let Some(record) = tables.clients.get(&pending.client) {
                            delivery = Some((
                                record.outbox.clone(),
                                protocol::restore_response(raw, pending.original_id),
                            ));
                        }
                    } else {
                        self.counters.record_unknown_response();
                        debug!(target: "relay", relay_id, "response without pending command");
                    }
                }
                if let Some((outbox, frame)) = delivery {
                    outbox.push_frame(frame);
                }
                ExtInbound::Routine
            }
            ExtensionFrame::Event {
                method,
                session_id,
                params,
            } => {
                self.route_event(epoch, &method, session_id.as_deref(), params);
                ExtInbound::Routine
            }
            ExtensionFrame::Log { level, args } => {
                let line = args
                    .iter()
                    .map(|arg| match arg {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                match level.as_str() {
                    "error" => error!(target: "extension", "{line}"),
                    "warn" => warn!(target: "extension", "{line}"),
                    "debug" => debug!(target: "extension", "{line}"),
                    _ => info!(target: "extension", "{line}"),
                }
                ExtInbound::Routine
            }
            ExtensionFrame::Pong => ExtInbound::Pong,
            ExtensionFrame::TargetInfo(params) => {
                self.apply_target_info(epoch, &params);
                ExtInbound::Handshake
            }
            ExtensionFrame::Unknown { method } => {
                debug!(target: "relay", %method, "ignoring unknown extension message");
                ExtInbound::Routine
            }
            ExtensionFrame::Malformed => ExtInbound::ProtocolViolation,
        }
    }

    fn route_event(&self, epoch: u64, method: &str, session_id: Option<&str>, params: Value) {
        let mut targets: Vec<Outbox> = Vec::new();
        let mut unowned = false;
        {
            let mut tables = self.registry.lock();
            if !current_epoch(&tables, epoch) {
                return;
            }
            if method == "Page.frameNavigated" {
                if let Some(url) = params
                    .get("frame")
                    .and_then(|f| f.get("url"))
                    .and_then(Value::as_str)
                {
                    if let Some(target) = tables.target.as_mut() {
                        target.url = url.to_string();
                    }
                }
            }
            match session_id {
                Some(session) => match tables.session_owner(session) {
                    Some(owner) => {
                        if let Some(record) = tables.clients.get(&owner) {
                            targets.push(record.outbox.clone());
                        }
                    }
                    None => unowned = true,
                },
                // Browser-level event: every client gets a copy.
                None => targets.extend(tables.clients.values().map(|c| c.outbox.clone())),
            }
        }

        if unowned {
            self.counters.record_unowned_event();
            debug!(target: "relay", %method, "dropping event for unowned session");
            return;
        }
        let frame = protocol::event_frame(method, session_id, params);
        for outbox in targets {
            let delivered = outbox.push_event(
                frame.clone(),
                self.cfg.max_client_queue_bytes,
                self.cfg.max_client_queue_frames,
            );
            if !delivered {
                self.counters.record_dropped_event();
            }
        }
    }

    fn apply_target_info(&self, epoch: u64, params: &Value) {
        let mut tables = self.registry.lock();
        if !current_epoch(&tables, epoch) {
            return;
        }
        let Some(target) = tables.target.as_mut() else {
            return;
        };
        if let Some(id) = params.get("targetId").and_then(Value::as_str) {
            target.target_id = id.to_string();
        }
        if let Some(title) = params.get("title").and_then(Value::as_str) {
            target.title = title.to_string();
        }
        if let Some(url) = params.get("url").and_then(Value::as_str) {
            target.url = url.to_string();
        }
        if let Some(agent) = params.get("userAgent").and_then(Value::as_str) {
            target.user_agent = Some(agent.to_string());
        }
        if let Some(context) = params.get("browserContextId").and_then(Value::as_str) {
            target.browser_context_id = context.to_string();
        }
        if let Some(caps) = params.get("capabilities").and_then(Value::as_array) {
            target.capabilities = caps
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }

    // ----- timers and lifecycle ----------------------------------------

    /// Resolve every pending command whose deadline has passed with a
    /// CDP-shaped timeout error. Driven by one scheduled sweep task.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut outbound = Vec::new();
        {
            let mut tables = self.registry.lock();
            let expired: Vec<u64> = tables
                .pending
                .iter()
                .filter(|(_, cmd)| cmd.deadline <= now)
                .map(|(relay_id, _)| *relay_id)
                .collect();
            for relay_id in expired {
                let Some(cmd) = tables.pending.remove(&relay_id) else {
                    continue;
                };
                warn!(
                    target: "relay",
                    client = cmd.client,
                    method = %cmd.method,
                    "command timed out"
                );
                if let Some(record) = tables.clients.get(&cmd.client) {
                    outbound.push((
                        record.outbox.clone(),
                        protocol::error_frame(
                            &cmd.original_id,
                            protocol::SERVER_ERROR,
                            "relay timeout",
                        ),
                    ));
                }
            }
        }
        if !outbound.is_empty() {
            self.counters.record_timed_out_commands(outbound.len() as u64);
        }
        for (outbox, frame) in outbound {
            outbox.push_frame(frame);
        }
    }

    /// Begin an ordered shutdown: drain pending commands with a shutdown
    /// error and queue a close frame on every connection, then signal the
    /// loops. The close frames go out first so each writer still drains
    /// them before its channel shuts.
    pub fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "relay", "shutting down");

        let mut outbound = Vec::new();
        let mut closers = Vec::new();
        {
            let mut tables = self.registry.lock();
            let drained: Vec<PendingCommand> =
                tables.pending.drain().map(|(_, cmd)| cmd).collect();
            for cmd in drained {
                if let Some(record) = tables.clients.get(&cmd.client) {
                    outbound.push((
                        record.outbox.clone(),
                        protocol::error_frame(
                            &cmd.original_id,
                            protocol::SERVER_ERROR,
                            "relay shutdown",
                        ),
                    ));
                }
            }
            closers.extend(tables.clients.values().map(|c| c.outbox.clone()));
            if let Some(ext) = tables.extension.as_ref() {
                closers.push(ext.outbox.clone());
            }
        }
        for (outbox, frame) in outbound {
            outbox.push_frame(frame);
        }
        for outbox in closers {
            outbox.push_close(1001, "shutting down");
        }
        let _ = self.shutdown.send(true);
    }

    pub fn reply(&self, client: ClientId, frame: String) {
        let outbox = {
            let tables = self.registry.lock();
            tables.clients.get(&client).map(|c| c.outbox.clone())
        };
        if let Some(outbox) = outbox {
            outbox.push_frame(frame);
        }
    }
}

fn current_epoch(tables: &crate::registry::Tables, epoch: u64) -> bool {
    tables
        .extension
        .as_ref()
        .is_some_and(|ext| ext.epoch == epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn relay() -> Arc<Relay> {
        Relay::new(RelayConfig::default())
    }

    fn connect_client(relay: &Relay) -> (ClientId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = relay.admit_client(Outbox::new(tx), "test".into());
        (id, rx)
    }

    fn connect_extension(relay: &Relay) -> (u64, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = relay.admit_extension("ext-id".into(), Outbox::new(tx));
        (epoch, rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        match rx.try_recv() {
            Ok(Outbound::Frame(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_without_extension_is_refused() {
        let relay = relay();
        let (client, mut rx) = connect_client(&relay);
        relay.handle_client_frame(
            client,
            r#"{"id":4,"method":"Page.navigate","params":{"url":"about:blank"}}"#,
        );
        let reply = next_frame(&mut rx);
        assert_eq!(reply["id"], json!(4));
        assert_eq!(reply["error"]["code"], json!(-32000));
        assert_eq!(reply["error"]["message"], json!("browser not connected"));
    }

    #[tokio::test]
    async fn forwarded_command_round_trips_with_original_id() {
        let relay = relay();
        let (client, mut client_rx) = connect_client(&relay);
        let (epoch, mut ext_rx) = connect_extension(&relay);

        relay.handle_client_frame(
            client,
            r#"{"id":9,"method":"Page.enable"}"#,
        );
        let forwarded = next_frame(&mut ext_rx);
        let relay_id = forwarded["id"].as_u64().unwrap();
        assert_ne!(relay_id, 9);
        assert_eq!(forwarded["method"], json!("Page.enable"));

        let outcome = relay.handle_extension_frame(
            epoch,
            &format!(r#"{{"id":{relay_id},"result":{{"ok":true}}}}"#),
        );
        assert_eq!(outcome, ExtInbound::Routine);
        let reply = next_frame(&mut client_rx);
        assert_eq!(reply["id"], json!(9));
        assert_eq!(reply["result"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn response_for_unknown_relay_id_is_counted_not_fatal() {
        let relay = relay();
        let (epoch, _ext_rx) = connect_extension(&relay);
        relay.handle_extension_frame(epoch, r#"{"id":9999,"result":{}}"#);
        assert_eq!(relay.counters().snapshot().unknown_responses, 1);
    }

    #[tokio::test]
    async fn session_scoped_command_requires_ownership() {
        let relay = relay();
        let (owner, mut owner_rx) = connect_client(&relay);
        let (intruder, mut intruder_rx) = connect_client(&relay);
        let (_epoch, mut ext_rx) = connect_extension(&relay);

        let target_id = relay.registry().lock().target.as_ref().unwrap().target_id.clone();
        relay.handle_client_frame(
            owner,
            &format!(
                r#"{{"id":1,"method":"Target.attachToTarget","params":{{"targetId":"{target_id}"}}}}"#
            ),
        );
        let _attached = next_frame(&mut owner_rx);
        let reply = next_frame(&mut owner_rx);
        let session = reply["result"]["sessionId"].as_str().unwrap().to_string();

        relay.handle_client_frame(
            intruder,
            &format!(r#"{{"id":2,"method":"Runtime.enable","sessionId":"{session}"}}"#),
        );
        let refused = next_frame(&mut intruder_rx);
        assert_eq!(refused["error"]["code"], json!(-32001));
        assert_eq!(refused["error"]["message"], json!("session not owned"));
        // Nothing was forwarded for the refused command.
        assert!(ext_rx.try_recv().is_err());

        relay.handle_client_frame(
            owner,
            &format!(r#"{{"id":3,"method":"Runtime.enable","sessionId":"{session}"}}"#),
        );
        let forwarded = next_frame(&mut ext_rx);
        assert_eq!(forwarded["sessionId"], json!(session));
    }

    #[tokio::test]
    async fn events_route_to_session_owner_only() {
        let relay = relay();
        let (owner, mut owner_rx) = connect_client(&relay);
        let (other, mut other_rx) = connect_client(&relay);
        let (epoch, _ext_rx) = connect_extension(&relay);

        let target_id = relay.registry().lock().target.as_ref().unwrap().target_id.clone();
        relay.handle_client_frame(
            owner,
            &format!(
                r#"{{"id":1,"method":"Target.attachToTarget","params":{{"targetId":"{target_id}"}}}}"#
            ),
        );
        let _attached = next_frame(&mut owner_rx);
        let reply = next_frame(&mut owner_rx);
        let session = reply["result"]["sessionId"].as_str().unwrap().to_string();

        relay.handle_extension_frame(
            epoch,
            &format!(
                r#"{{"method":"forwardCDPEvent","params":{{"method":"Page.loadEventFired","sessionId":"{session}","params":{{"timestamp":7}}}}}}"#
            ),
        );
        let event = next_frame(&mut owner_rx);
        assert_eq!(event["method"], json!("Page.loadEventFired"));
        assert_eq!(event["sessionId"], json!(session));
        assert!(other_rx.try_recv().is_err());
        let _ = other;
    }

    #[tokio::test]
    async fn sessionless_events_broadcast_to_every_client() {
        let relay = relay();
        let (_a, mut rx_a) = connect_client(&relay);
        let (_b, mut rx_b) = connect_client(&relay);
        let (epoch, _ext_rx) = connect_extension(&relay);

        relay.handle_extension_frame(
            epoch,
            r#"{"method":"forwardCDPEvent","params":{"method":"Target.targetInfoChanged","params":{}}}"#,
        );
        assert_eq!(
            next_frame(&mut rx_a)["method"],
            json!("Target.targetInfoChanged")
        );
        assert_eq!(
            next_frame(&mut rx_b)["method"],
            json!("Target.targetInfoChanged")
        );
    }

    #[tokio::test]
    async fn unowned_session_event_is_dropped_and_counted() {
        let relay = relay();
        let (_client, mut rx) = connect_client(&relay);
        let (epoch, _ext_rx) = connect_extension(&relay);
        relay.handle_extension_frame(
            epoch,
            r#"{"method":"forwardCDPEvent","params":{"method":"Page.loadEventFired","sessionId":"nobody","params":{}}}"#,
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.counters().snapshot().unowned_events, 1);
    }

    #[tokio::test]
    async fn extension_loss_fails_inflight_commands_but_keeps_clients() {
        let relay = relay();
        let (client, mut client_rx) = connect_client(&relay);
        let (epoch, mut ext_rx) = connect_extension(&relay);

        relay.handle_client_frame(client, r#"{"id":11,"method":"Page.enable"}"#);
        let _forwarded = next_frame(&mut ext_rx);

        relay.extension_closed(epoch);
        let reply = next_frame(&mut client_rx);
        assert_eq!(reply["id"], json!(11));
        assert_eq!(reply["error"]["message"], json!("browser disconnected"));
        assert_eq!(relay.registry().client_count(), 1);
        assert!(relay.registry().extension_id().is_none());
    }

    #[tokio::test]
    async fn replacement_closes_the_old_extension_with_reason() {
        let relay = relay();
        let (_epoch_a, mut old_rx) = connect_extension(&relay);
        let (_epoch_b, _new_rx) = connect_extension(&relay);
        loop {
            match old_rx.try_recv() {
                Ok(Outbound::Close { code, reason }) => {
                    assert_eq!(code, 1000);
                    assert!(reason.contains("replaced"));
                    break;
                }
                Ok(_) => continue,
                Err(err) => panic!("no close frame for superseded extension: {err:?}"),
            }
        }
        assert_eq!(relay.counters().snapshot().extension_replacements, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_commands_get_exactly_one_timeout_reply() {
        let cfg = RelayConfig {
            command_timeout_ms: 50,
            ..Default::default()
        };
        let relay = Relay::new(cfg);
        let (client, mut client_rx) = connect_client(&relay);
        let (_epoch, mut ext_rx) = connect_extension(&relay);

        relay.handle_client_frame(client, r#"{"id":21,"method":"Page.enable"}"#);
        let _forwarded = next_frame(&mut ext_rx);

        sleep(Duration::from_millis(60)).await;
        relay.sweep_expired();
        let reply = next_frame(&mut client_rx);
        assert_eq!(reply["id"], json!(21));
        assert_eq!(reply["error"]["message"], json!("relay timeout"));
        assert_eq!(relay.counters().snapshot().timed_out_commands, 1);

        // The sweep consumed the record: no duplicate on the next pass.
        relay.sweep_expired();
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn long_methods_outlive_the_default_deadline() {
        let cfg = RelayConfig {
            command_timeout_ms: 10,
            long_command_timeout_ms: 60_000,
            ..Default::default()
        };
        let relay = Relay::new(cfg);
        let (client, mut client_rx) = connect_client(&relay);
        let (_epoch, mut ext_rx) = connect_extension(&relay);

        relay.handle_client_frame(
            client,
            r#"{"id":31,"method":"Page.navigate","params":{"url":"about:blank"}}"#,
        );
        let _forwarded = next_frame(&mut ext_rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        relay.sweep_expired();
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn saturated_extension_queue_rejects_new_commands() {
        let cfg = RelayConfig {
            max_client_queue_bytes: 32,
            ..Default::default()
        };
        let relay = Relay::new(cfg);
        let (client, mut client_rx) = connect_client(&relay);
        // Nothing drains the extension channel in this test.
        let (_epoch, _ext_rx) = connect_extension(&relay);

        relay.handle_client_frame(
            client,
            r#"{"id":1,"method":"Page.enable","params":{"pad":"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}}"#,
        );
        assert!(client_rx.try_recv().is_err());

        relay.handle_client_frame(client, r#"{"id":2,"method":"Page.enable"}"#);
        let reply = next_frame(&mut client_rx);
        assert_eq!(reply["id"], json!(2));
        assert_eq!(reply["error"]["message"], json!("extension busy"));
        // The first command is still pending, not errored.
        assert_eq!(relay.registry().lock().pending.len(), 1);
    }

    #[tokio::test]
    async fn malformed_client_frame_with_id_gets_error_reply() {
        let relay = relay();
        let (client, mut rx) = connect_client(&relay);
        relay.handle_client_frame(client, r#"{"id":5,"params":{}}"#);
        let reply = next_frame(&mut rx);
        assert_eq!(reply["id"], json!(5));
        assert_eq!(reply["error"]["code"], json!(-32600));
    }

    #[tokio::test]
    async fn shutdown_drains_pending_and_closes_connections() {
        let relay = relay();
        let (client, mut client_rx) = connect_client(&relay);
        let (_epoch, mut ext_rx) = connect_extension(&relay);
        relay.handle_client_frame(client, r#"{"id":41,"method":"Page.enable"}"#);
        let _forwarded = next_frame(&mut ext_rx);

        relay.shutdown();
        assert!(relay.is_shutting_down());
        let reply = next_frame(&mut client_rx);
        assert_eq!(reply["id"], json!(41));
        assert_eq!(reply["error"]["message"], json!("relay shutdown"));
        assert!(matches!(
            client_rx.try_recv(),
            Ok(Outbound::Close { code: 1001, .. })
        ));
        assert!(matches!(
            ext_rx.try_recv(),
            Ok(Outbound::Close { code: 1001, .. })
        ));
    }

    #[tokio::test]
    async fn handshake_refreshes_target_and_version() {
        let relay = relay();
        let (client, mut rx) = connect_client(&relay);
        let (epoch, _ext_rx) = connect_extension(&relay);

        let outcome = relay.handle_extension_frame(
            epoch,
            r#"{"method":"targetInfo","params":{"title":"Example","url":"https://example.com/","userAgent":"Mozilla/5.0 Chrome/126.0.0.0"}}"#,
        );
        assert_eq!(outcome, ExtInbound::Handshake);

        relay.handle_client_frame(client, r#"{"id":1,"method":"Target.getTargets"}"#);
        let reply = next_frame(&mut rx);
        let info = &reply["result"]["targetInfos"][0];
        assert_eq!(info["title"], json!("Example"));
        assert_eq!(info["url"], json!("https://example.com/"));

        relay.handle_client_frame(client, r#"{"id":2,"method":"Browser.getVersion"}"#);
        let version = next_frame(&mut rx);
        assert_eq!(version["result"]["product"], json!("Chrome/126.0.0.0"));
    }

    #[tokio::test]
    async fn frame_navigated_refreshes_target_url() {
        let relay = relay();
        let (client, mut rx) = connect_client(&relay);
        let (epoch, _ext_rx) = connect_extension(&relay);
        relay.handle_extension_frame(
            epoch,
            r#"{"method":"forwardCDPEvent","params":{"method":"Page.frameNavigated","params":{"frame":{"id":"f1","url":"https://example.org/next"}}}}"#,
        );
        // Broadcast copy of the event arrives first.
        let _event = next_frame(&mut rx);
        relay.handle_client_frame(client, r#"{"id":1,"method":"Target.getTargets"}"#);
        let reply = next_frame(&mut rx);
        assert_eq!(
            reply["result"]["targetInfos"][0]["url"],
            json!("https://example.org/next")
        );
    }

    #[tokio::test]
    async fn stale_extension_frames_are_ignored() {
        let relay = relay();
        let (client, mut client_rx) = connect_client(&relay);
        let (old_epoch, mut old_rx) = connect_extension(&relay);

        relay.handle_client_frame(client, r#"{"id":51,"method":"Page.enable"}"#);
        let forwarded = next_frame(&mut old_rx);
        let relay_id = forwarded["id"].as_u64().unwrap();

        let (_new_epoch, _new_rx) = connect_extension(&relay);
        // The in-flight command already failed with "browser disconnected".
        let failed = next_frame(&mut client_rx);
        assert_eq!(failed["error"]["message"], json!("browser disconnected"));

        // A late reply over the superseded connection goes nowhere.
        relay.handle_extension_frame(old_epoch, &format!(r#"{{"id":{relay_id},"result":{{}}}}"#));
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_client_loses_events_but_not_responses() {
        let cfg = RelayConfig {
            max_client_queue_bytes: 8,
            ..Default::default()
        };
        let relay = Relay::new(cfg);
        let (client, mut rx) = connect_client(&relay);
        let (epoch, _ext_rx) = connect_extension(&relay);

        // Nothing drains rx, so the first reply saturates the tiny budget.
        relay.handle_client_frame(client, r#"{"id":1,"method":"Target.getTargets"}"#);
        relay.handle_extension_frame(
            epoch,
            r#"{"method":"forwardCDPEvent","params":{"method":"Target.targetInfoChanged","params":{}}}"#,
        );
        assert_eq!(relay.counters().snapshot().dropped_events, 1);

        // Responses bypass the cap.
        relay.handle_client_frame(client, r#"{"id":2,"method":"Target.getTargets"}"#);
        let _first = next_frame(&mut rx);
        let second = next_frame(&mut rx);
        assert_eq!(second["id"], json!(2));
        assert!(rx.try_recv().is_err());
    }
}

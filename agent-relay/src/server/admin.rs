//! Admin surface: ordinary frames on the same socket, authorized by
//! filesystem permissions on the socket path.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use serde_json::{json, Value};
use tracing::debug;

// Layer 3: Internal module imports
use super::Shared;
use super::SERVER_VERSION;
use crate::dlq::DlqQuery;
use crate::session::SessionHandle;
use crate::storage::{HistoryQuery, SortOrder};

/// Execute one admin operation and build its result payload.
///
/// Failures are reported in-band as `{ "error": ... }` payloads; admin
/// traffic never closes the session.
pub(crate) async fn handle(
    shared: &Shared,
    session: &SessionHandle,
    op: &str,
    args: Value,
) -> Value {
    debug!(agent = %session.agent(), op, "admin operation");
    match op {
        "status" => status(shared).await,
        "list_agents" => list_agents(shared),
        "list_subscriptions" => list_subscriptions(shared),
        "history" => history(shared, args).await,
        "dlq_query" => dlq_query(shared, args).await,
        "dlq_ack" => dlq_ack(shared, session, args).await,
        "dlq_retry" => dlq_retry(shared, args).await,
        "memory_summary" => memory_summary(shared),
        "monitor_register" => monitor_register(shared, args),
        "monitor_unregister" => monitor_unregister(shared, args),
        other => json!({ "error": "unknown_op", "op": other }),
    }
}

async fn status(shared: &Shared) -> Value {
    let dlq_stats = shared.dlq.stats().await.ok();
    let stored = shared.storage.count().await.unwrap_or(0);
    json!({
        "serverVersion": SERVER_VERSION,
        "socket": shared.config.socket_path.display().to_string(),
        "agents": shared.registry.online_count(),
        "storedMessages": stored,
        "storageDegraded": shared.storage.is_degraded(),
        "metrics": shared.metrics.snapshot(),
        "dlq": dlq_stats,
    })
}

fn list_agents(shared: &Shared) -> Value {
    let mut agents: Vec<_> = shared
        .registry
        .sessions()
        .iter()
        .map(|s| s.info())
        .collect();
    agents.sort_by(|a, b| a.agent.cmp(&b.agent));
    json!({ "agents": agents })
}

fn list_subscriptions(shared: &Shared) -> Value {
    let table: Vec<Value> = shared
        .registry
        .subscriptions()
        .into_iter()
        .map(|(topic, agents)| json!({ "topic": topic, "subscribers": agents }))
        .collect();
    json!({ "subscriptions": table })
}

async fn history(shared: &Shared, args: Value) -> Value {
    if let Some(id) = args.get("id").and_then(Value::as_str) {
        let id = crate::util::MessageId::from_string(id);
        return match shared.storage.get_by_id(&id).await {
            Ok(Some(envelope)) => json!({ "envelope": envelope }),
            Ok(None) => json!({ "error": "not_found", "id": id }),
            Err(e) => json!({ "error": "storage_error", "detail": e.to_string() }),
        };
    }

    let mut query = HistoryQuery::default();
    if let Some(from) = args.get("from").and_then(Value::as_str) {
        match crate::util::AgentName::parse(from) {
            Ok(from) => query.from = Some(from),
            Err(e) => return json!({ "error": "invalid_args", "detail": e.to_string() }),
        }
    }
    if let Some(to) = args.get("to").and_then(Value::as_str) {
        query.to = Some(to.to_string());
    }
    if let Some(thread) = args.get("thread").and_then(Value::as_str) {
        query.thread = Some(thread.to_string());
    }
    if let Some(limit) = args.get("limit").and_then(Value::as_u64) {
        query.limit = limit as usize;
    }
    if args.get("order").and_then(Value::as_str) == Some("asc") {
        query.order = SortOrder::Ascending;
    }

    match shared.storage.list_history(query).await {
        Ok(envelopes) => json!({ "envelopes": envelopes }),
        Err(e) => json!({ "error": "storage_error", "detail": e.to_string() }),
    }
}

async fn dlq_query(shared: &Shared, args: Value) -> Value {
    let query: DlqQuery = if args.is_null() {
        DlqQuery::default()
    } else {
        match serde_json::from_value(args) {
            Ok(query) => query,
            Err(e) => return json!({ "error": "invalid_args", "detail": e.to_string() }),
        }
    };
    match shared.dlq.query(query).await {
        Ok(entries) => json!({ "entries": entries }),
        Err(e) => json!({ "error": "dlq_error", "detail": e.to_string() }),
    }
}

async fn dlq_ack(shared: &Shared, session: &SessionHandle, args: Value) -> Value {
    let ids: Vec<String> = match args.get("ids") {
        Some(ids) => match serde_json::from_value(ids.clone()) {
            Ok(ids) => ids,
            Err(e) => return json!({ "error": "invalid_args", "detail": e.to_string() }),
        },
        None => match args.get("id").and_then(Value::as_str) {
            Some(id) => vec![id.to_string()],
            None => return json!({ "error": "invalid_args", "detail": "id or ids required" }),
        },
    };

    match shared
        .dlq
        .acknowledge_many(&ids, Some(session.agent().clone()))
        .await
    {
        Ok(acknowledged) => json!({ "acknowledged": acknowledged, "requested": ids.len() }),
        Err(e) => json!({ "error": "dlq_error", "detail": e.to_string() }),
    }
}

async fn dlq_retry(shared: &Shared, args: Value) -> Value {
    let Some(id) = args.get("id").and_then(Value::as_str) else {
        return json!({ "error": "invalid_args", "detail": "id required" });
    };

    let entry = match shared.dlq.get(id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return json!({ "error": "not_found", "id": id }),
        Err(e) => return json!({ "error": "dlq_error", "detail": e.to_string() }),
    };

    let retry_count = match shared.dlq.increment_retry(id).await {
        Ok(count) => count,
        Err(e) => return json!({ "error": "dlq_error", "detail": e.to_string() }),
    };

    shared
        .engine
        .requeue(entry.envelope.clone(), &entry.recipient);
    json!({
        "requeued": entry.envelope.id,
        "recipient": entry.recipient,
        "dlqRetryCount": retry_count,
    })
}

fn memory_summary(shared: &Shared) -> Value {
    json!({
        "config": shared.config.monitor,
        "processes": shared.monitor.summary(),
    })
}

fn monitor_register(shared: &Shared, args: Value) -> Value {
    let agent = args.get("agent").and_then(Value::as_str);
    let pid = args.get("pid").and_then(Value::as_u64);
    match (agent, pid) {
        (Some(agent), Some(pid)) => match crate::util::AgentName::parse(agent) {
            Ok(agent) => {
                shared.monitor.register(agent.clone(), pid as u32);
                json!({ "registered": agent })
            }
            Err(e) => json!({ "error": "invalid_args", "detail": e.to_string() }),
        },
        _ => json!({ "error": "invalid_args", "detail": "agent and pid required" }),
    }
}

fn monitor_unregister(shared: &Shared, args: Value) -> Value {
    match args
        .get("agent")
        .and_then(Value::as_str)
        .map(crate::util::AgentName::parse)
    {
        Some(Ok(agent)) => {
            shared.monitor.unregister(&agent);
            json!({ "unregistered": agent })
        }
        Some(Err(e)) => json!({ "error": "invalid_args", "detail": e.to_string() }),
        None => json!({ "error": "invalid_args", "detail": "agent required" }),
    }
}

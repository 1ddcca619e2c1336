//! Method registry and the core RPC surface.
//!
//! Dispatch order: lookup (`METHOD_NOT_FOUND`) → schema validation
//! (`INVALID_REQUEST`) → scope authorization (`PERMISSION_DENIED`) →
//! execute. Handlers receive the shared [`AppState`] at call time, so the
//! registry itself stays cycle-free.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use valet_agent::TurnRequest;

use crate::frames::{ErrorCode, ErrorShape};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Method + registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type MethodHandler =
    Arc<dyn Fn(AppState, Value) -> BoxFuture<'static, Result<Value, ErrorShape>> + Send + Sync>;

pub struct Method {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    /// JSON schema for the params object ("required" + "properties"."type").
    pub schema: Value,
    /// Scope the caller must hold; `None` means unrestricted.
    pub required_scope: Option<&'static str>,
    pub handler: MethodHandler,
}

#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<&'static str, Arc<Method>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: Method) {
        if self.methods.contains_key(method.name) {
            tracing::warn!(method = method.name, "method already registered, overwriting");
        }
        self.methods.insert(method.name, Arc::new(method));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn list(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort();
        names
    }

    pub fn list_by_category(&self, category: &str) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .methods
            .values()
            .filter(|m| m.category == category)
            .map(|m| m.name)
            .collect();
        names.sort();
        names
    }

    /// Method metadata for client discovery.
    pub fn docs(&self) -> Value {
        let mut methods = serde_json::Map::new();
        for method in self.methods.values() {
            methods.insert(
                method.name.to_owned(),
                json!({
                    "description": method.description,
                    "category": method.category,
                    "schema": method.schema,
                }),
            );
        }
        json!({
            "totalMethods": self.methods.len(),
            "methods": methods,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Param validation + authorization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

/// Validate params against the method's declared schema.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), ErrorShape> {
    if !params.is_object() {
        return Err(ErrorShape::new(
            ErrorCode::InvalidRequest,
            "params must be an object",
        ));
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if params.get(key).is_none() {
                return Err(ErrorShape::new(
                    ErrorCode::InvalidRequest,
                    format!("missing required parameter: {key}"),
                ));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, spec) in properties {
            let Some(value) = params.get(key) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if let Some(expected) = spec.get("type").and_then(|t| t.as_str()) {
                if !type_matches(expected, value) {
                    return Err(ErrorShape::new(
                        ErrorCode::InvalidRequest,
                        format!("parameter {key} must be a {expected}"),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Check the caller's scopes against a method's requirement.
pub fn authorize(method: &Method, scopes: &HashSet<String>) -> bool {
    match method.required_scope {
        None => true,
        Some(scope) => scopes.contains(scope) || scopes.contains("operator.admin"),
    }
}

/// The scope set granted to operators that request none explicitly.
pub fn default_operator_scopes() -> HashSet<String> {
    [
        "operator.admin",
        "operator.read",
        "operator.write",
        "operator.approvals",
        "operator.pairing",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core methods
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(AppState, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ErrorShape>> + Send + 'static,
{
    Arc::new(move |state, params| f(state, params).boxed())
}

fn internal(message: impl std::fmt::Display) -> ErrorShape {
    ErrorShape::new(ErrorCode::InternalError, message.to_string())
}

fn str_param(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned()
}

async fn run_agent_turn(state: AppState, params: Value) -> Result<Value, ErrorShape> {
    let session_id = str_param(&params, "sessionId");
    let message = str_param(&params, "message");
    let run_id = params
        .get("runId")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let streaming = params
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let request = TurnRequest {
        session_id: session_id.clone(),
        message,
        run_id: Some(run_id.clone()),
        ..Default::default()
    };

    if streaming {
        // Events reach the caller through the broadcast fan-out; the
        // response only confirms acceptance.
        let runtime = state.runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.run_turn(request).await {
                tracing::warn!(run_id = %run_id, error = %e, "streamed turn failed");
            }
        });
        Ok(json!({"accepted": true, "sessionId": session_id}))
    } else {
        let outcome = state.runtime.run_turn(request).await.map_err(internal)?;
        Ok(json!({
            "runId": outcome.run_id,
            "sessionId": session_id,
            "text": outcome.text,
            "cancelled": outcome.cancelled,
        }))
    }
}

/// Build the registry with every core method installed.
pub fn core_registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();

    // ── Liveness (exempt from auth) ────────────────────────────────
    registry.register(Method {
        name: "ping",
        description: "Liveness probe",
        category: "system",
        schema: json!({}),
        required_scope: None,
        handler: handler(|_state, _params| async move {
            Ok(json!({"pong": true, "ts": chrono::Utc::now().timestamp_millis()}))
        }),
    });

    registry.register(Method {
        name: "health",
        description: "Gateway health summary",
        category: "system",
        schema: json!({}),
        required_scope: None,
        handler: handler(|state, _params| async move {
            Ok(json!({
                "ok": true,
                "uptimeMs": state.started_at.elapsed().as_millis() as u64,
                "channelsRunning": state.channels.list_running().len(),
            }))
        }),
    });

    // ── Agent ──────────────────────────────────────────────────────
    let agent_schema = json!({
        "required": ["message", "sessionId"],
        "properties": {
            "message": {"type": "string"},
            "sessionId": {"type": "string"},
            "agentId": {"type": "string"},
            "runId": {"type": "string"},
            "stream": {"type": "boolean"},
        },
    });
    registry.register(Method {
        name: "agent",
        description: "Execute an agent turn",
        category: "agent",
        schema: agent_schema.clone(),
        required_scope: Some("operator.write"),
        handler: handler(run_agent_turn),
    });
    registry.register(Method {
        name: "agent.turn",
        description: "Execute an agent turn",
        category: "agent",
        schema: agent_schema,
        required_scope: Some("operator.write"),
        handler: handler(run_agent_turn),
    });

    registry.register(Method {
        name: "chat.abort",
        description: "Abort a run in progress",
        category: "agent",
        schema: json!({
            "required": ["runId"],
            "properties": {"runId": {"type": "string"}},
        }),
        required_scope: Some("operator.write"),
        handler: handler(|state, params| async move {
            let run_id = str_param(&params, "runId");
            let aborted = state.runtime.runs().abort(&run_id);
            Ok(json!({"aborted": aborted, "runId": run_id}))
        }),
    });

    registry.register(Method {
        name: "agent.queue.status",
        description: "Concurrency lane statistics",
        category: "agent",
        schema: json!({}),
        required_scope: Some("operator.read"),
        handler: handler(|state, _params| async move {
            let lanes = state.runtime.queue().stats();
            Ok(json!({"lanes": lanes}))
        }),
    });

    // ── Channels ───────────────────────────────────────────────────
    registry.register(Method {
        name: "channels.list",
        description: "Registered channel ids",
        category: "channels",
        schema: json!({}),
        required_scope: Some("operator.read"),
        handler: handler(|state, _params| async move {
            Ok(json!({
                "channels": state.channels.list_channels(),
                "running": state.channels.list_running(),
            }))
        }),
    });

    registry.register(Method {
        name: "channels.status",
        description: "Lifecycle status of every channel",
        category: "channels",
        schema: json!({}),
        required_scope: Some("operator.read"),
        handler: handler(|state, _params| async move {
            let status = state.channels.all_status();
            serde_json::to_value(status)
                .map(|channels| json!({"channels": channels}))
                .map_err(internal)
        }),
    });

    // ── Sessions ───────────────────────────────────────────────────
    registry.register(Method {
        name: "sessions.list",
        description: "Persisted session ids",
        category: "sessions",
        schema: json!({}),
        required_scope: Some("operator.read"),
        handler: handler(|state, _params| async move {
            Ok(json!({"sessions": state.sessions.list()}))
        }),
    });

    registry.register(Method {
        name: "sessions.history",
        description: "Message history of one session",
        category: "sessions",
        schema: json!({
            "required": ["sessionId"],
            "properties": {"sessionId": {"type": "string"}},
        }),
        required_scope: Some("operator.read"),
        handler: handler(|state, params| async move {
            let session_id = str_param(&params, "sessionId");
            let (session, _) = state
                .sessions
                .get_or_create(&session_id)
                .map_err(internal)?;
            let session = session.lock().clone();
            serde_json::to_value(&session).map_err(internal)
        }),
    });

    registry.register(Method {
        name: "sessions.delete",
        description: "Delete a session and its lane",
        category: "sessions",
        schema: json!({
            "required": ["sessionId"],
            "properties": {"sessionId": {"type": "string"}},
        }),
        required_scope: Some("operator.write"),
        handler: handler(|state, params| async move {
            let session_id = str_param(&params, "sessionId");
            let deleted = state.sessions.delete(&session_id);
            state.runtime.queue().retire_session(&session_id);
            Ok(json!({"deleted": deleted}))
        }),
    });

    // ── Observability ──────────────────────────────────────────────
    registry.register(Method {
        name: "logs.tail",
        description: "Tail the gateway log file",
        category: "system",
        schema: json!({
            "properties": {"lines": {"type": "integer"}},
        }),
        required_scope: Some("operator.read"),
        handler: handler(|state, params| async move {
            let count = params.get("lines").and_then(|v| v.as_u64()).unwrap_or(100) as usize;
            let Some(path) = state.config.logging.file.clone() else {
                return Ok(json!({"lines": []}));
            };
            let content = tokio::fs::read_to_string(&path)
                .await
                .unwrap_or_default();
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(count);
            Ok(json!({"lines": lines[start..]}))
        }),
    });

    registry.register(Method {
        name: "gateway.cost",
        description: "Aggregate usage counters",
        category: "system",
        schema: json!({}),
        required_scope: Some("operator.read"),
        handler: handler(|state, _params| async move {
            let bus = state.bus.stats();
            Ok(json!({
                "eventsPublished": bus.events_published,
                "deliveryErrors": bus.delivery_errors,
                "sessions": state.sessions.list().len(),
                "activeRuns": state.runtime.runs().active_runs(),
            }))
        }),
    });

    // ── Wizard ─────────────────────────────────────────────────────
    registry.register(Method {
        name: "wizard.start",
        description: "Begin the onboarding wizard",
        category: "wizard",
        schema: json!({}),
        required_scope: Some("operator.admin"),
        handler: handler(|state, _params| async move { Ok(state.wizards.start()) }),
    });

    registry.register(Method {
        name: "wizard.next",
        description: "Answer the current wizard step",
        category: "wizard",
        schema: json!({
            "required": ["wizardId"],
            "properties": {"wizardId": {"type": "string"}},
        }),
        required_scope: Some("operator.admin"),
        handler: handler(|state, params| async move {
            let wizard_id = str_param(&params, "wizardId");
            let answer = params.get("answer").cloned().unwrap_or(Value::Null);
            state
                .wizards
                .next(&wizard_id, answer)
                .ok_or_else(|| {
                    ErrorShape::new(ErrorCode::InvalidRequest, "unknown wizard session")
                })
        }),
    });

    registry.register(Method {
        name: "wizard.cancel",
        description: "Abandon a wizard session",
        category: "wizard",
        schema: json!({
            "required": ["wizardId"],
            "properties": {"wizardId": {"type": "string"}},
        }),
        required_scope: Some("operator.admin"),
        handler: handler(|state, params| async move {
            let wizard_id = str_param(&params, "wizardId");
            Ok(json!({"cancelled": state.wizards.cancel(&wizard_id)}))
        }),
    });

    registry.register(Method {
        name: "wizard.status",
        description: "Progress of a wizard session",
        category: "wizard",
        schema: json!({
            "required": ["wizardId"],
            "properties": {"wizardId": {"type": "string"}},
        }),
        required_scope: Some("operator.admin"),
        handler: handler(|state, params| async move {
            let wizard_id = str_param(&params, "wizardId");
            state.wizards.status(&wizard_id).ok_or_else(|| {
                ErrorShape::new(ErrorCode::InvalidRequest, "unknown wizard session")
            })
        }),
    });

    registry
}

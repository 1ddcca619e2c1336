//! End-to-end turn scenarios against a scripted provider stub.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use valet_agent::{AgentRuntime, QueueManager, RuntimeConfig, ThinkingMode, TurnRequest};
use valet_domain::error::{Error, Result};
use valet_domain::message::{Role, ToolCall};
use valet_domain::stream::{BoxStream, ProviderChunk};
use valet_events::{Event, EventBus, EventKind};
use valet_providers::{ChatRequest, LlmProvider};
use valet_sessions::SessionStore;
use valet_tools::{EchoTool, ToolRegistry, WriteFileTool};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stub provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
enum Script {
    /// Replay these chunks.
    Chunks(Vec<ProviderChunk>),
    /// Replay chunks with a delay before each one.
    Slow(Vec<ProviderChunk>, Duration),
    /// Fail the stream-open call.
    Fail(fn() -> Error),
}

#[derive(Debug)]
struct StubProvider {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    calls: Arc<Mutex<Vec<ChatRequest>>>,
}

#[async_trait::async_trait]
impl LlmProvider for StubProvider {
    async fn stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<ProviderChunk>>> {
        self.calls.lock().push(req.clone());
        match self.scripts.lock().pop_front() {
            Some(Script::Fail(make_error)) => Err(make_error()),
            Some(Script::Chunks(chunks)) => Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            ))),
            Some(Script::Slow(chunks, delay)) => Ok(Box::pin(async_stream::stream! {
                for chunk in chunks {
                    tokio::time::sleep(delay).await;
                    yield Ok(chunk);
                }
            })),
            None => Ok(Box::pin(futures_util::stream::iter([Ok(
                ProviderChunk::Done,
            )]))),
        }
    }

    fn provider_id(&self) -> &str {
        "stub"
    }

    fn model(&self) -> &str {
        "stub-model"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    runtime: Arc<AgentRuntime>,
    events: Arc<Mutex<Vec<Event>>>,
    sessions: Arc<SessionStore>,
    calls: Arc<Mutex<Vec<ChatRequest>>>,
    _dir: tempfile::TempDir,
}

fn text(text: &str) -> ProviderChunk {
    ProviderChunk::TextDelta { text: text.into() }
}

fn harness(scripts: Vec<Script>, tweak: impl FnOnce(&mut RuntimeConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let sessions = Arc::new(SessionStore::new(dir.path()).unwrap());

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    tools.register(Arc::new(WriteFileTool::new(dir.path())));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe(None, move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().push(event);
            Ok(())
        }
    });

    let scripts = Arc::new(Mutex::new(VecDeque::from(scripts)));
    let calls: Arc<Mutex<Vec<ChatRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let factory_scripts = scripts.clone();
    let factory_calls = calls.clone();

    let mut config = RuntimeConfig {
        model: "stub/model-a".into(),
        enable_compaction: false,
        ..Default::default()
    };
    tweak(&mut config);

    let runtime = AgentRuntime::new(
        config,
        bus,
        sessions.clone(),
        Arc::new(tools),
        Arc::new(QueueManager::default()),
    )
    .with_provider_factory(Arc::new(
        move |_model: &str, _opts: &valet_providers::registry::ProviderOptions| {
            let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider {
                scripts: factory_scripts.clone(),
                calls: factory_calls.clone(),
            });
            Ok(provider)
        },
    ));

    Harness {
        runtime: Arc::new(runtime),
        events,
        sessions,
        calls,
        _dir: dir,
    }
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn request(session_id: &str, message: &str) -> TurnRequest {
    TurnRequest {
        session_id: session_id.into(),
        message: message.into(),
        ..Default::default()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn simple_echo_turn() {
    let h = harness(
        vec![Script::Chunks(vec![
            text("Hello "),
            text("world"),
            ProviderChunk::Done,
        ])],
        |_| {},
    );

    let outcome = h.runtime.run_turn(request("cli-test", "hi")).await.unwrap();
    assert_eq!(outcome.text, "Hello world");
    assert!(!outcome.cancelled);

    let events = h.events.lock();
    let observed = kinds(&events);
    assert_eq!(
        observed,
        vec![
            EventKind::SessionCreated,
            EventKind::AgentStarted,
            EventKind::AgentText,
            EventKind::AgentText,
            EventKind::AgentTurnComplete,
        ]
    );
    assert_eq!(events[2].data["text"], "Hello ");
    assert_eq!(events[3].data["text"], "world");

    let (session, _) = h.sessions.get_or_create("cli-test").unwrap();
    let session = session.lock();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[0].content, "hi");
    assert_eq!(session.messages[1].role, Role::Assistant);
    assert_eq!(session.messages[1].content, "Hello world");
}

#[tokio::test]
async fn tool_round_trip_turn() {
    let h = harness(
        vec![
            Script::Chunks(vec![
                ProviderChunk::ToolCall {
                    calls: vec![ToolCall {
                        id: "t1".into(),
                        name: "echo".into(),
                        arguments: serde_json::json!({"text": "yo"}),
                    }],
                },
                ProviderChunk::Done,
            ]),
            Script::Chunks(vec![text("got: yo"), ProviderChunk::Done]),
        ],
        |_| {},
    );

    let outcome = h.runtime.run_turn(request("s-tools", "run it")).await.unwrap();
    assert_eq!(outcome.text, "got: yo");

    let events = h.events.lock();
    let observed = kinds(&events);
    assert!(observed.contains(&EventKind::AgentToolUse));
    assert!(observed.contains(&EventKind::AgentToolResult));
    assert!(observed.contains(&EventKind::AgentTurnComplete));

    let tool_result = events
        .iter()
        .find(|e| e.kind == EventKind::AgentToolResult)
        .unwrap();
    assert_eq!(tool_result.data["success"], true);
    assert_eq!(tool_result.data["result"], "yo");

    // Session: user, assistant(tool_calls), tool result, final assistant.
    let (session, _) = h.sessions.get_or_create("s-tools").unwrap();
    let session = session.lock();
    let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(session.messages[1].tool_calls[0].id, "t1");
    assert_eq!(session.messages[2].tool_call_id.as_deref(), Some("t1"));
    assert_eq!(session.messages[2].content, "yo");
    assert_eq!(session.messages[3].content, "got: yo");

    // The follow-up round goes out without tools.
    let calls = h.calls.lock();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].tools.is_empty());
    assert!(calls[1].tools.is_empty());
}

#[tokio::test]
async fn failover_to_next_model() {
    let h = harness(
        vec![
            Script::Fail(|| Error::RateLimit("429 rate limit".into())),
            Script::Chunks(vec![text("ok"), ProviderChunk::Done]),
        ],
        |config| {
            config.fallback_models = vec!["stub/model-b".into()];
        },
    );

    let outcome = h.runtime.run_turn(request("s-fo", "hi")).await.unwrap();
    assert_eq!(outcome.text, "ok");

    let events = h.events.lock();
    let observed = kinds(&events);
    assert!(observed.contains(&EventKind::AgentFailover));
    assert!(!observed.contains(&EventKind::AgentError));

    let failover = events
        .iter()
        .find(|e| e.kind == EventKind::AgentFailover)
        .unwrap();
    assert_eq!(failover.data["from"], "stub/model-a");
    assert_eq!(failover.data["to"], "stub/model-b");
    assert_eq!(failover.data["reason"], "rate_limit");
}

#[tokio::test(start_paused = true)]
async fn retryable_error_backs_off_then_succeeds() {
    let h = harness(
        vec![
            Script::Fail(|| Error::Timeout("read timeout".into())),
            Script::Fail(|| Error::Timeout("read timeout".into())),
            Script::Chunks(vec![text("recovered"), ProviderChunk::Done]),
        ],
        |_| {},
    );

    let outcome = h.runtime.run_turn(request("s-retry", "hi")).await.unwrap();
    assert_eq!(outcome.text, "recovered");

    let events = h.events.lock();
    let retries: Vec<&Event> = events
        .iter()
        .filter(|e| e.kind == EventKind::AgentRetry)
        .collect();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].data["attempt"], 1);
    assert_eq!(retries[0].data["delay_s"], 1);
    assert_eq!(retries[1].data["delay_s"], 2);
}

#[tokio::test]
async fn non_retryable_error_surfaces() {
    let h = harness(
        vec![Script::Fail(|| Error::Other("model exploded".into()))],
        |_| {},
    );

    let result = h.runtime.run_turn(request("s-err", "hi")).await;
    assert!(result.is_err());

    let events = h.events.lock();
    let error = events
        .iter()
        .find(|e| e.kind == EventKind::AgentError)
        .unwrap();
    assert_eq!(error.data["category"], "unknown");
    // The error still terminates with a completion event.
    assert_eq!(events.last().unwrap().kind, EventKind::AgentTurnComplete);
}

#[tokio::test]
async fn turns_on_same_session_serialize() {
    let h = harness(
        vec![
            Script::Slow(
                vec![text("first"), ProviderChunk::Done],
                Duration::from_millis(30),
            ),
            Script::Chunks(vec![text("second"), ProviderChunk::Done]),
        ],
        |_| {},
    );

    let runtime1 = h.runtime.clone();
    let first = tokio::spawn(async move {
        runtime1
            .run_turn(TurnRequest {
                run_id: Some("run-1".into()),
                ..request("s-serial", "one")
            })
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let runtime2 = h.runtime.clone();
    let second = tokio::spawn(async move {
        runtime2
            .run_turn(TurnRequest {
                run_id: Some("run-2".into()),
                ..request("s-serial", "two")
            })
            .await
            .unwrap()
    });

    first.await.unwrap();
    second.await.unwrap();

    let events = h.events.lock();
    let first_complete = events
        .iter()
        .position(|e| {
            e.kind == EventKind::AgentTurnComplete && e.data["run_id"] == "run-1"
        })
        .unwrap();
    let second_started = events
        .iter()
        .position(|e| e.kind == EventKind::AgentStarted && e.data["run_id"] == "run-2")
        .unwrap();
    assert!(
        first_complete < second_started,
        "second turn started before the first completed"
    );

    // Session messages appear in submission order.
    let (session, _) = h.sessions.get_or_create("s-serial").unwrap();
    let session = session.lock();
    let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["one", "first", "two", "second"]);
}

#[tokio::test]
async fn abort_stops_the_stream() {
    let h = harness(
        vec![Script::Slow(
            vec![
                text("a"),
                text("b"),
                text("c"),
                text("d"),
                ProviderChunk::Done,
            ],
            Duration::from_millis(30),
        )],
        |_| {},
    );

    let runtime = h.runtime.clone();
    let turn = tokio::spawn(async move {
        runtime
            .run_turn(TurnRequest {
                run_id: Some("r-abort".into()),
                ..request("s-abort", "hi")
            })
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.runtime.runs().abort("r-abort"));

    let outcome = turn.await.unwrap();
    assert!(outcome.cancelled);

    let events = h.events.lock();
    let completes: Vec<&Event> = events
        .iter()
        .filter(|e| e.kind == EventKind::AgentTurnComplete)
        .collect();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].data["cancelled"], true);
    // Nothing follows the completion event for this run.
    assert_eq!(events.last().unwrap().kind, EventKind::AgentTurnComplete);
}

#[tokio::test]
async fn compaction_fires_over_threshold() {
    let h = harness(
        vec![Script::Chunks(vec![text("ok"), ProviderChunk::Done])],
        |config| {
            config.enable_compaction = true;
        },
    );

    // Seed the session past 70% of the (unknown-model) 128k window.
    let (session, _) = h.sessions.get_or_create("s-compact").unwrap();
    h.sessions
        .append(&session, valet_domain::message::Message::system("rules"))
        .unwrap();
    for i in 0..120 {
        h.sessions
            .append(
                &session,
                valet_domain::message::Message::user(format!("{i}: {}", "x".repeat(3600))),
            )
            .unwrap();
    }

    h.runtime
        .run_turn(request("s-compact", "final question"))
        .await
        .unwrap();

    let events = h.events.lock();
    let compaction = events
        .iter()
        .find(|e| e.kind == EventKind::AgentCompaction)
        .unwrap();
    let compacted = compaction.data["compacted_tokens"].as_u64().unwrap();
    assert!(compacted <= (128_000f64 * 0.70) as u64);

    // The system message survived.
    let session = session.lock();
    assert!(session.messages.iter().any(|m| m.role == Role::System));
}

#[tokio::test]
async fn thinking_stream_mode_splits_deltas() {
    let h = harness(
        vec![Script::Chunks(vec![
            text("<think"),
            text("ing>secret plan</thinking>Hello"),
            ProviderChunk::Done,
        ])],
        |config| {
            config.thinking_mode = ThinkingMode::Stream;
        },
    );

    let outcome = h.runtime.run_turn(request("s-think", "hi")).await.unwrap();
    assert_eq!(outcome.text, "Hello");

    let events = h.events.lock();
    let thinking: String = events
        .iter()
        .filter(|e| e.kind == EventKind::AgentThinking)
        .map(|e| e.data["text"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(thinking, "secret plan");

    let content: String = events
        .iter()
        .filter(|e| e.kind == EventKind::AgentText)
        .map(|e| e.data["text"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(content, "Hello");
}

#[tokio::test]
async fn thinking_on_mode_emits_once_at_end() {
    let h = harness(
        vec![Script::Chunks(vec![
            text("<thinking>alpha</thinking>"),
            text("answer"),
            ProviderChunk::Done,
        ])],
        |config| {
            config.thinking_mode = ThinkingMode::On;
        },
    );

    h.runtime.run_turn(request("s-think-on", "hi")).await.unwrap();

    let events = h.events.lock();
    let thinking: Vec<&Event> = events
        .iter()
        .filter(|e| e.kind == EventKind::AgentThinking)
        .collect();
    assert_eq!(thinking.len(), 1);
    assert_eq!(thinking[0].data["text"], "alpha");
    assert_eq!(thinking[0].data["mode"], "on");
}

#[tokio::test]
async fn system_prompt_injected_only_on_first_turn() {
    let h = harness(
        vec![
            Script::Chunks(vec![text("one"), ProviderChunk::Done]),
            Script::Chunks(vec![text("two"), ProviderChunk::Done]),
        ],
        |_| {},
    );

    let with_prompt = |message: &str| TurnRequest {
        system_prompt: Some("be helpful".into()),
        ..request("s-sys", message)
    };

    h.runtime.run_turn(with_prompt("first")).await.unwrap();
    h.runtime.run_turn(with_prompt("second")).await.unwrap();

    let (session, _) = h.sessions.get_or_create("s-sys").unwrap();
    let session = session.lock();
    let system_count = session
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .count();
    assert_eq!(system_count, 1);
    assert_eq!(session.messages[0].role, Role::System);
}

#[tokio::test]
async fn generated_file_publishes_side_channel_event() {
    let h = harness(
        vec![
            Script::Chunks(vec![
                ProviderChunk::ToolCall {
                    calls: vec![ToolCall {
                        id: "t-file".into(),
                        name: "write_file".into(),
                        arguments: serde_json::json!({"path": "report.txt", "content": "data"}),
                    }],
                },
                ProviderChunk::Done,
            ]),
            Script::Chunks(vec![text("saved"), ProviderChunk::Done]),
        ],
        |_| {},
    );

    h.runtime.run_turn(request("s-file", "write it")).await.unwrap();

    let events = h.events.lock();
    let generated = events
        .iter()
        .find(|e| e.kind == EventKind::AgentFileGenerated)
        .unwrap();
    assert!(generated.data["file_path"]
        .as_str()
        .unwrap()
        .ends_with("report.txt"));
    assert_eq!(generated.data["file_type"], "txt");
    assert_eq!(generated.data["tool"], "write_file");
}

#[tokio::test]
async fn failed_tool_does_not_end_turn() {
    let h = harness(
        vec![
            Script::Chunks(vec![
                ProviderChunk::ToolCall {
                    calls: vec![ToolCall {
                        id: "t-bad".into(),
                        name: "no_such_tool".into(),
                        arguments: serde_json::json!({}),
                    }],
                },
                ProviderChunk::Done,
            ]),
            Script::Chunks(vec![text("handled"), ProviderChunk::Done]),
        ],
        |_| {},
    );

    let outcome = h.runtime.run_turn(request("s-badtool", "go")).await.unwrap();
    assert_eq!(outcome.text, "handled");

    let events = h.events.lock();
    let tool_result = events
        .iter()
        .find(|e| e.kind == EventKind::AgentToolResult)
        .unwrap();
    assert_eq!(tool_result.data["success"], false);
    assert!(!kinds(&events).contains(&EventKind::AgentError));
}

#[tokio::test]
async fn steering_message_lands_before_provider_round() {
    let h = harness(
        vec![Script::Chunks(vec![text("noted"), ProviderChunk::Done])],
        |_| {},
    );

    // Steer before the turn starts; the drain happens at CALL_PROVIDER.
    h.runtime.steer("s-steer", "also consider this");
    h.runtime.run_turn(request("s-steer", "main question")).await.unwrap();

    let calls = h.calls.lock();
    let sent: Vec<&str> = calls[0]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(sent, vec!["main question", "also consider this"]);
}

//! End-to-end tests for the HTTP surface, driven through the router with a
//! fake mind process (a tiny axum server speaking the NDJSON contract) on
//! the other side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use tower::ServiceExt;

use volute_core::config::DaemonConfig;
use volute_core::home::VoluteHome;
use volute_core::types::Stage;
use volute_gateway::app::{build_router, AppState};
use volute_gateway::bootstrap;
use volute_store::ParticipantRole;

struct Fixture {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    router: Router,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let home = VoluteHome::new(dir.path());
    let state = bootstrap::build_state(home, DaemonConfig::default()).unwrap();
    let router = build_router(state.clone());
    Fixture {
        _dir: dir,
        state,
        router,
    }
}

/// Spawn a fake mind on an ephemeral port. Returns the port and a counter
/// of /message hits.
async fn spawn_fake_mind(script: &'static str) -> (u16, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_handler = hits.clone();
    let app = Router::new()
        .route(
            "/health",
            get(|| async { axum::Json(serde_json::json!({"status": "ok", "name": "fake"})) }),
        )
        .route(
            "/message",
            post(move || {
                let hits = hits_for_handler.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "application/x-ndjson")], script)
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, hits)
}

fn bearer(state: &AppState) -> String {
    format!("Bearer {}", state.token)
}

async fn send(router: &Router, request: Request<Body>) -> axum::response::Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn authed_json(state: &AppState, method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, bearer(state))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let f = fixture();
    let response = send(
        &f.router,
        Request::get("/api/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("\"ok\":true"));
}

#[tokio::test]
async fn api_requires_credentials() {
    let f = fixture();
    let response = send(
        &f.router,
        Request::get("/api/minds").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &f.router,
        Request::get("/api/minds")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_needs_matching_origin_without_token() {
    let f = fixture();
    let creds = serde_json::json!({"username": "root", "password": "hunter2"});

    let crossed = Request::post("/api/auth/register")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ORIGIN, "http://evil.example")
        .body(Body::from(creds.to_string()))
        .unwrap();
    assert_eq!(send(&f.router, crossed).await.status(), StatusCode::FORBIDDEN);

    let own_origin = f.state.config.origin();
    let fine = Request::post("/api/auth/register")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ORIGIN, own_origin)
        .body(Body::from(creds.to_string()))
        .unwrap();
    let response = send(&f.router, fine).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_string(response).await;
    // First registered user is the admin.
    assert!(body.contains("\"role\":\"admin\""));
}

#[tokio::test]
async fn session_cookie_round_trip() {
    let f = fixture();
    let creds = serde_json::json!({"username": "root", "password": "hunter2"});
    let response = send(
        &f.router,
        Request::post("/api/auth/register")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ORIGIN, f.state.config.origin())
            .body(Body::from(creds.to_string()))
            .unwrap(),
    )
    .await;
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let me = send(
        &f.router,
        Request::get("/api/auth/me")
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(me.status(), StatusCode::OK);
    assert!(body_string(me).await.contains("\"username\":\"root\""));
}

#[tokio::test]
async fn pending_users_are_promoted_by_an_admin() {
    let f = fixture();
    let origin = f.state.config.origin();

    for (name, pw) in [("root", "a"), ("guest", "b")] {
        let response = send(
            &f.router,
            Request::post("/api/auth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::ORIGIN, origin.clone())
                .body(Body::from(
                    serde_json::json!({"username": name, "password": pw}).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let guest = f.state.store.find_user_by_username("guest").unwrap().unwrap();
    assert_eq!(guest.role, volute_core::types::UserRole::Pending);

    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "PUT",
            &format!("/api/users/{}/role", guest.id),
            serde_json::json!({"role": "user"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let guest = f.state.store.find_user_by_username("guest").unwrap().unwrap();
    assert_eq!(guest.role, volute_core::types::UserRole::User);
}

#[tokio::test]
async fn stage_and_budget_routes() {
    let f = fixture();
    f.state
        .registry
        .add("alice", 4100, Stage::Seed, None)
        .unwrap();

    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "PUT",
            "/api/minds/alice/stage",
            serde_json::json!({"stage": "sprouted"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(f.state.registry.find("alice").unwrap().stage, Stage::Sprouted);

    // A zero token limit is a validation error.
    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "PUT",
            "/api/minds/alice/budget",
            serde_json::json!({"token_limit": 0}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "PUT",
            "/api/minds/alice/budget",
            serde_json::json!({"token_limit": 10_000, "period_minutes": 60}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &f.router,
        Request::get("/api/minds/alice/budget")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let body = body_string(response).await;
    assert!(body.contains("\"status\":\"ok\""));
    assert!(body.contains("\"tokens_used\":0"));
}

#[tokio::test]
async fn typing_signals_reach_the_event_stream() {
    let f = fixture();

    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "POST",
            "/api/typing",
            serde_json::json!({"channel": "volute:c1", "sender": "alice"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("\"alice\""));
    assert_eq!(f.state.typing.get("volute:c1"), vec!["alice"]);

    // The publish landed in the sequencer as a typing event.
    let events = f.state.bus.events_since(0);
    assert!(events.iter().any(|e| e.event == "typing"));

    let response = send(
        &f.router,
        Request::builder()
            .method("DELETE")
            .uri("/api/typing/alice")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(f.state.typing.get("volute:c1").is_empty());
}

#[tokio::test]
async fn mind_crud() {
    let f = fixture();

    let response = send(
        &f.router,
        authed_json(&f.state, "POST", "/api/minds", serde_json::json!({"name": "alice"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_string(response).await;
    assert!(body.contains("\"port\":4100"));
    assert!(body.contains("\"stage\":\"seed\""));

    // Duplicate name conflicts.
    let response = send(
        &f.router,
        authed_json(&f.state, "POST", "/api/minds", serde_json::json!({"name": "alice"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Bad name is a validation failure.
    let response = send(
        &f.router,
        authed_json(&f.state, "POST", "/api/minds", serde_json::json!({"name": ".bad"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &f.router,
        Request::get("/api/minds/alice")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("\"status\":\"stopped\""));

    let response = send(
        &f.router,
        Request::builder()
            .method("DELETE")
            .uri("/api/minds/alice")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(f.state.registry.find("alice").is_none());
}

#[tokio::test]
async fn seed_minds_are_gated_from_schedules_and_variants() {
    let f = fixture();
    f.state
        .registry
        .add("seedling", 4100, Stage::Seed, None)
        .unwrap();

    for uri in [
        "/api/minds/seedling/schedules",
        "/api/minds/seedling/variants",
    ] {
        let response = send(
            &f.router,
            Request::get(uri)
                .header(header::AUTHORIZATION, bearer(&f.state))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
    }
}

#[tokio::test]
async fn message_streams_back_verbatim_and_lands_in_history() {
    let script = "{\"type\":\"text\",\"content\":\"hello\"}\n{\"type\":\"done\"}\n";
    let (port, hits) = spawn_fake_mind(script).await;

    let f = fixture();
    f.state
        .registry
        .add("alice", port, Stage::Sprouted, None)
        .unwrap();

    let request = authed_json(
        &f.state,
        "POST",
        "/api/minds/alice/message",
        serde_json::json!({
            "content": [{"type": "text", "text": "hi"}],
            "channel": "cli",
            "sender": "u",
        }),
    );
    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );
    assert_eq!(body_string(response).await, script);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let history = send(
        &f.router,
        Request::get("/api/minds/alice/history")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let body = body_string(history).await;
    assert!(body.contains("\"inbound\""));
    assert!(body.contains("\"outbound\""));
    assert!(body.contains("hello"));
}

#[tokio::test]
async fn message_to_unknown_mind_is_404() {
    let f = fixture();
    let request = authed_json(
        &f.state,
        "POST",
        "/api/minds/ghost/message",
        serde_json::json!({"content": [], "channel": "cli"}),
    );
    assert_eq!(send(&f.router, request).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn message_to_stopped_mind_is_503() {
    let f = fixture();
    // Port 1 refuses connections.
    f.state.registry.add("alice", 1, Stage::Sprouted, None).unwrap();

    let request = authed_json(
        &f.state,
        "POST",
        "/api/minds/alice/message",
        serde_json::json!({"content": [{"type": "text", "text": "hi"}], "channel": "cli"}),
    );
    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_string(response).await.contains("mind not running"));
}

#[tokio::test]
async fn usage_events_feed_the_budget() {
    let script = "{\"type\":\"usage\",\"input_tokens\":6000,\"output_tokens\":4000}\n{\"type\":\"done\"}\n";
    let (port, _) = spawn_fake_mind(script).await;

    let f = fixture();
    f.state
        .registry
        .add("carol", port, Stage::Sprouted, None)
        .unwrap();
    f.state.budget.set_budget("carol", 10_000, 60).unwrap();

    let request = authed_json(
        &f.state,
        "POST",
        "/api/minds/carol/message",
        serde_json::json!({"content": [{"type": "text", "text": "hi"}], "channel": "cli"}),
    );
    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = body_string(response).await;

    assert_eq!(f.state.budget.tokens_used("carol"), Some(10_000));
}

#[tokio::test]
async fn exceeded_budget_queues_instead_of_forwarding() {
    let (port, hits) = spawn_fake_mind("{\"type\":\"done\"}\n").await;

    let f = fixture();
    f.state
        .registry
        .add("carol", port, Stage::Sprouted, None)
        .unwrap();
    f.state.budget.set_budget("carol", 10_000, 60).unwrap();
    f.state.budget.record_usage("carol", 6_000, 4_000);

    let request = authed_json(
        &f.state,
        "POST",
        "/api/minds/carol/message",
        serde_json::json!({"content": [{"type": "text", "text": "hi"}], "channel": "cli"}),
    );
    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_string(response).await;
    assert!(body.contains("\"queued\":true"));
    assert!(body.contains("budget-exceeded"));

    // The mind never saw the request; the message waits in the queue.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(f.state.budget.queue_len("carol"), 1);
}

#[tokio::test]
async fn conversation_messages_persist_with_title() {
    let script = "{\"type\":\"text\",\"content\":\"hello there\"}\n{\"type\":\"done\"}\n";
    let (port, _) = spawn_fake_mind(script).await;

    let f = fixture();
    f.state
        .registry
        .add("alice", port, Stage::Sprouted, None)
        .unwrap();
    let mind_user = f.state.store.ensure_mind_user("alice").unwrap();
    let conversation = f
        .state
        .store
        .get_or_create_conversation("alice", "pending", volute_core::types::ConversationKind::Dm)
        .unwrap();
    f.state
        .store
        .add_participant(&conversation.id, mind_user.id, ParticipantRole::Member)
        .unwrap();

    let channel = format!("volute:{}", conversation.id);
    let request = authed_json(
        &f.state,
        "POST",
        "/api/minds/alice/message",
        serde_json::json!({
            "content": [{"type": "text", "text": "what is the plan for today"}],
            "channel": channel,
            "sender": "u",
        }),
    );
    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = body_string(response).await;

    let messages = f.state.store.list_messages(&conversation.id, None).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content[0].as_text(), Some("hello there"));

    let reloaded = f.state.store.get_conversation(&conversation.id).unwrap().unwrap();
    assert_eq!(reloaded.title.as_deref(), Some("what is the plan for today"));
}

#[tokio::test]
async fn sse_replays_from_last_event_id() {
    let f = fixture();
    for n in 1..=10 {
        f.state
            .bus
            .publish("activity", serde_json::json!({ "n": n }));
    }

    let response = send(
        &f.router,
        Request::get("/api/events")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .header("Last-Event-ID", "5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    fn sse_ids(acc: &str) -> Vec<String> {
        acc.lines()
            .filter_map(|line| line.strip_prefix("id:"))
            .map(|id| id.trim().to_string())
            .collect()
    }

    let mut stream = response.into_body().into_data_stream();
    let mut acc = String::new();
    while sse_ids(&acc).len() < 5 {
        let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for SSE replay")
            .expect("stream ended early")
            .expect("stream errored");
        acc.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    assert_eq!(sse_ids(&acc), vec!["6", "7", "8", "9", "10"]);

    // A live event keeps flowing on the same stream.
    f.state
        .bus
        .publish("activity", serde_json::json!({ "n": 11 }));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut saw_live = false;
    while !saw_live && tokio::time::Instant::now() < deadline {
        if let Ok(Some(Ok(chunk))) =
            tokio::time::timeout(Duration::from_millis(200), stream.next()).await
        {
            acc.push_str(std::str::from_utf8(&chunk).unwrap());
            saw_live = sse_ids(&acc).iter().any(|id| id == "11");
        }
    }
    assert!(saw_live, "live event after replay never arrived");
}

#[tokio::test]
async fn volute_channel_membership_flow() {
    let f = fixture();

    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "POST",
            "/api/volute/channels",
            serde_json::json!({"name": "general"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "POST",
            "/api/volute/channels/general/invite",
            serde_json::json!({"username": "alice", "mind": true}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &f.router,
        Request::get("/api/volute/channels/general/members")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let body = body_string(response).await;
    assert!(body.contains("\"alice\""));
    assert!(body.contains("\"mind\""));
}

#[tokio::test]
async fn shared_env_crud() {
    let f = fixture();

    let response = send(
        &f.router,
        authed_json(
            &f.state,
            "PUT",
            "/api/env/API_KEY",
            serde_json::json!({"value": "secret"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &f.router,
        Request::get("/api/env")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert!(body_string(response).await.contains("\"API_KEY\":\"secret\""));

    let response = send(
        &f.router,
        Request::builder()
            .method("DELETE")
            .uri("/api/env/API_KEY")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &f.router,
        Request::builder()
            .method("DELETE")
            .uri("/api/env/API_KEY")
            .header(header::AUTHORIZATION, bearer(&f.state))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pages_reject_traversal() {
    let f = fixture();
    let pages = f.state.home.pages_dir("alice");
    std::fs::create_dir_all(&pages).unwrap();
    std::fs::write(pages.join("index.html"), "<h1>hi</h1>").unwrap();

    let response = send(
        &f.router,
        Request::get("/pages/alice/index.html")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "<h1>hi</h1>");

    let response = send(
        &f.router,
        Request::get("/pages/alice/..%2F..%2Fdaemon.json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_ne!(response.status(), StatusCode::OK);
}

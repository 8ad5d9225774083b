use super::*;
use axum::{body, body::Body, http::Request};
use tower::ServiceExt;

const TEST_UPLOAD_LIMIT: usize = 64 * 1024;

async fn test_app() -> (Router, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let state = Arc::new(AppState {
        api: ApiContext { storage },
        hub: Hub::new(),
        calls: CallRegistry::new(),
        auth: AuthConfig {
            jwt_secret: "test-secret".into(),
            token_ttl_seconds: 3600,
        },
        public_base_url: "http://localhost:3000".into(),
    });
    (build_router(state.clone(), TEST_UPLOAD_LIMIT), state)
}

async fn register_via_http(app: &Router, username: &str) -> AuthResponse {
    let request = Request::post("/api/auth/register")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": username, "password": "hunter2" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _state) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"ok");
}

#[tokio::test]
async fn register_then_login_round_trips() {
    let (app, _state) = test_app().await;
    let registered = register_via_http(&app, "alice").await;
    assert_eq!(registered.user.username, "alice");
    assert!(!registered.token.is_empty());

    let login = Request::post("/api/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": "alice", "password": "hunter2" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(login).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bad_login = Request::post("/api/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": "alice", "password": "wrong" }).to_string(),
        ))
        .expect("request");
    let response = app.oneshot(bad_login).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_username_is_rejected() {
    let (app, _state) = test_app().await;
    register_via_http(&app, "alice").await;

    let request = Request::post("/api/auth/register")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": "alice", "password": "other" }).to_string(),
        ))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bearer_routes_refuse_missing_and_bogus_tokens() {
    let (app, _state) = test_app().await;

    let no_token = Request::post("/api/groups")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "name": "team" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(no_token).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let bad_token = Request::post("/api/groups")
        .header("content-type", "application/json")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::from(
            serde_json::json!({ "name": "team" }).to_string(),
        ))
        .expect("request");
    let response = app.oneshot(bad_token).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn group_create_join_and_invite_flow() {
    let (app, _state) = test_app().await;
    let alice = register_via_http(&app, "alice").await;
    let bob = register_via_http(&app, "bob").await;

    let create = Request::post("/api/groups")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({ "name": "team", "description": "the team" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(create).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let group: GroupSummary = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(group.members, vec![alice.user.id.clone()]);

    let join = Request::post(format!("/api/groups/{}/join", group.id))
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(join).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let rejoin = Request::post(format!("/api/groups/{}/join", group.id))
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(rejoin).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let invite = Request::get(format!("/api/groups/{}/invite", group.id))
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(invite).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let invite: InviteResponse = serde_json::from_slice(&bytes).expect("json");
    assert!(invite.invite_link.contains(group.id.as_str()));

    let unknown_join = Request::post("/api/groups/no-such-group/join")
        .header("authorization", format!("Bearer {}", bob.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(unknown_join).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invite_requires_membership() {
    let (app, _state) = test_app().await;
    let alice = register_via_http(&app, "alice").await;
    let mallory = register_via_http(&app, "mallory").await;

    let create = Request::post("/api/groups")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(serde_json::json!({ "name": "team" }).to_string()))
        .expect("request");
    let response = app.clone().oneshot(create).await.expect("response");
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let group: GroupSummary = serde_json::from_slice(&bytes).expect("json");

    let invite = Request::get(format!("/api/groups/{}/invite", group.id))
        .header("authorization", format!("Bearer {}", mallory.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(invite).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn profile_update_round_trips() {
    let (app, _state) = test_app().await;
    let alice = register_via_http(&app, "alice").await;

    let update = Request::put("/api/profile")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(
            serde_json::json!({ "description": "says hi" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(update).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let fetch = Request::get("/api/profile")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(fetch).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let profile: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(profile["username"], "alice");
    assert_eq!(profile["description"], "says hi");
}

#[tokio::test]
async fn upload_then_download_round_trips_with_metadata() {
    let (app, _state) = test_app().await;
    let alice = register_via_http(&app, "alice").await;

    let upload = Request::post("/api/upload?filename=photo.png&mime_type=image/png")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from("png-bytes"))
        .expect("request");
    let response = app.clone().oneshot(upload).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let descriptor: AttachmentPayload = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(descriptor.kind, shared::domain::AttachmentKind::Image);
    assert_eq!(descriptor.display_name, "photo.png");

    let download = Request::get(descriptor.url.as_str())
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(download).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .expect("content type"),
        "image/png"
    );
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"png-bytes");
}

#[tokio::test]
async fn oversized_upload_is_refused() {
    let (app, _state) = test_app().await;
    let alice = register_via_http(&app, "alice").await;

    let upload = Request::post("/api/upload?filename=big.bin")
        .header("authorization", format!("Bearer {}", alice.token))
        .body(Body::from(vec![0u8; TEST_UPLOAD_LIMIT + 1]))
        .expect("request");
    let response = app.oneshot(upload).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn missing_file_download_is_not_found() {
    let (app, _state) = test_app().await;
    let request = Request::get("/api/files/no-such-file")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

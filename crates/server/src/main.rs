use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use server_api::ApiContext;
use shared::{
    domain::{AttachmentKind, FileId, GroupId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{AttachmentPayload, GroupSummary, UserSummary},
};
use storage::{Storage, StoredGroup, StoredUser};

mod auth;
mod calls;
mod config;
mod hub;
mod ws;

use auth::AuthConfig;
use calls::CallRegistry;
use config::load_settings;
use hub::Hub;

pub struct AppState {
    pub api: ApiContext,
    pub hub: Hub,
    pub calls: CallRegistry,
    pub auth: AuthConfig,
    pub public_base_url: String,
}

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthResponse {
    token: String,
    user: UserSummary,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InviteResponse {
    #[serde(rename = "inviteLink")]
    invite_link: String,
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    id: UserId,
    username: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRequest {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: Option<String>,
    mime_type: Option<String>,
}

const MAX_FILENAME_BYTES: usize = 180;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let storage = Storage::new(&settings.database_url).await.map_err(|error| {
        error!(
            database_url = %settings.database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = Arc::new(AppState {
        api: ApiContext { storage },
        hub: Hub::new(),
        calls: CallRegistry::new(),
        auth: AuthConfig {
            jwt_secret: settings.jwt_secret,
            token_ttl_seconds: settings.token_ttl_seconds,
        },
        public_base_url: settings.public_base_url,
    });
    let app = build_router(state, settings.max_upload_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/users", get(list_users))
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/:group_id/join", post(join_group))
        .route("/api/groups/:group_id/leave", post(leave_group))
        .route("/api/groups/:group_id/invite", get(group_invite))
        .route("/api/profile", get(get_profile).put(update_profile))
        .route("/api/profile/avatar", post(upload_avatar))
        .route("/api/upload", post(upload_file))
        .route("/api/files/:file_id", get(download_file))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(internal)?;
    Ok("ok")
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<AuthResponse>, HttpError> {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(validation("username and password required"));
    }
    if state
        .api
        .storage
        .find_user_by_username(&req.username)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(validation("username already exists"));
    }

    let password_hash =
        auth::hash_password(&req.password).map_err(|e| internal(anyhow::Error::new(e)))?;
    let user = state
        .api
        .storage
        .create_user(&req.username, &password_hash)
        .await
        .map_err(internal)?;
    auth_response(&state, user)
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<AuthResponse>, HttpError> {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(validation("username and password required"));
    }
    let user = state
        .api
        .storage
        .find_user_by_username(&req.username)
        .await
        .map_err(internal)?
        .filter(|user| auth::verify_password(&user.password_hash, &req.password))
        .ok_or_else(|| validation("invalid credentials"))?;
    auth_response(&state, user)
}

fn auth_response(state: &AppState, user: StoredUser) -> Result<Json<AuthResponse>, HttpError> {
    let token = auth::mint_token(&state.auth, &user.id)
        .map_err(|e| internal(anyhow::Error::new(e)))?;
    Ok(Json(AuthResponse {
        token,
        user: UserSummary {
            id: user.id,
            username: user.username,
            avatar: user.avatar,
        },
    }))
}

async fn list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserSummary>>, HttpError> {
    let users = state.api.storage.list_users().await.map_err(internal)?;
    Ok(Json(
        users
            .into_iter()
            .map(|user| UserSummary {
                id: user.id,
                username: user.username,
                avatar: user.avatar,
            })
            .collect(),
    ))
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<GroupSummary>>, HttpError> {
    let groups = state.api.storage.list_groups().await.map_err(internal)?;
    Ok(Json(groups.into_iter().map(group_summary).collect()))
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<GroupSummary>, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    if req.name.trim().is_empty() {
        return Err(validation("group name is required"));
    }
    let group = state
        .api
        .storage
        .create_group(req.name.trim(), &req.description, &user_id)
        .await
        .map_err(internal)?;
    Ok(Json(group_summary(group)))
}

async fn join_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    let group_id = GroupId(group_id);
    state
        .api
        .storage
        .find_group(&group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("group not found"))?;
    let joined = state
        .api
        .storage
        .add_group_member(&group_id, &user_id)
        .await
        .map_err(internal)?;
    if !joined {
        return Err(validation("already a member of this group"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    let left = state
        .api
        .storage
        .remove_group_member(&GroupId(group_id), &user_id)
        .await
        .map_err(internal)?;
    if !left {
        return Err(validation("not a member of this group"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn group_invite(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<InviteResponse>, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    let group_id = GroupId(group_id);
    state
        .api
        .storage
        .find_group(&group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("group not found"))?;
    if !state
        .api
        .storage
        .is_group_member(&group_id, &user_id)
        .await
        .map_err(internal)?
    {
        return Err(forbidden("not a member of this group"));
    }
    Ok(Json(InviteResponse {
        invite_link: format!(
            "{}/join-group.html?groupId={}",
            state.public_base_url, group_id
        ),
    }))
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ProfileResponse>, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    let user = state
        .api
        .storage
        .find_user(&user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("user not found"))?;
    Ok(Json(ProfileResponse {
        id: user.id,
        username: user.username,
        description: user.description,
        avatar: user.avatar,
    }))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<StatusCode, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    let updated = state
        .api
        .storage
        .update_user_description(&user_id, &req.description)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(not_found("user not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_avatar(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    let file = store_upload(&state, &user_id, &q, body).await?;
    let avatar_url = file_url(&file.id);
    state
        .api
        .storage
        .update_user_avatar(&user_id, &avatar_url)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "avatarUrl": avatar_url })))
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<AttachmentPayload>, HttpError> {
    let user_id = bearer_user(&state, &headers)?;
    let file = store_upload(&state, &user_id, &q, body).await?;
    let kind = file
        .mime_type
        .as_deref()
        .map(AttachmentKind::from_mime)
        .unwrap_or(AttachmentKind::File);
    Ok(Json(AttachmentPayload {
        kind,
        url: file_url(&file.id),
        storage_key: file.id,
        display_name: file.display_name,
    }))
}

async fn store_upload(
    state: &AppState,
    user_id: &UserId,
    q: &UploadQuery,
    body: Bytes,
) -> Result<storage::StoredFile, HttpError> {
    if body.is_empty() {
        return Err(validation("upload body cannot be empty"));
    }
    let display_name = q
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("file");
    if display_name.len() > MAX_FILENAME_BYTES {
        return Err(validation("filename is too long"));
    }
    if display_name.contains('/') || display_name.contains('\\') {
        return Err(validation("filename must not contain path separators"));
    }
    state
        .api
        .storage
        .store_file(
            user_id,
            display_name,
            q.mime_type
                .as_deref()
                .filter(|mime| !mime.trim().is_empty()),
            &body,
        )
        .await
        .map_err(internal)
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let file = state
        .api
        .storage
        .load_file(&FileId(file_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("file not found"))?;

    let mut headers = HeaderMap::new();
    let content_type = file
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file.display_name))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((StatusCode::OK, headers, file.data))
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, HttpError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(ErrorCode::Unauthorized, "access token required")),
        ));
    };
    auth::verify_token(&state.auth, token).map_err(|_| {
        (
            StatusCode::FORBIDDEN,
            Json(ApiError::new(ErrorCode::Forbidden, "invalid token")),
        )
    })
}

fn group_summary(group: StoredGroup) -> GroupSummary {
    GroupSummary {
        id: group.id,
        name: group.name,
        description: group.description,
        creator_id: group.creator_id,
        members: group.members,
        avatar: group.avatar,
        created_at: group.created_at,
    }
}

fn file_url(file_id: &FileId) -> String {
    format!("/api/files/{file_id}")
}

fn validation(message: &str) -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

fn not_found(message: &str) -> HttpError {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(ErrorCode::NotFound, message)),
    )
}

fn forbidden(message: &str) -> HttpError {
    (
        StatusCode::FORBIDDEN,
        Json(ApiError::new(ErrorCode::Forbidden, message)),
    )
}

fn internal(err: anyhow::Error) -> HttpError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, err.to_string())),
    )
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

//! HTTP surface of the catalog.
//!
//! Reads are public and always go through normalisation plus Alist
//! enrichment before serialisation. Mutations require a session cookie
//! obtained from `/api/auth/login`.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderValue, Method, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::{
    CookieJar,
    cookie::{Cookie, SameSite},
};
use chrono::Utc;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::alist::AlistResolver;
use crate::auth::{SESSION_COOKIE, SessionStore};
use crate::catalog::{CatalogStore, ContentItem, ContentPayload, User};
use crate::enrich::{Enriched, enrich_all, normalize_for_response, normalize_for_storage, prepare_for_response};

const SERVICE_NAME: &str = "MLWIO API";
const INTERNAL_ERROR: &str = "Internal server error";

/// Characters that cannot appear verbatim in a `Location` header.
const LOCATION_ESCAPES: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

#[derive(Clone)]
pub struct AppState {
    store: CatalogStore,
    resolver: Arc<AlistResolver>,
    sessions: Arc<SessionStore>,
    cookie_secure: bool,
}

impl AppState {
    pub fn new(
        store: CatalogStore,
        resolver: AlistResolver,
        sessions: Arc<SessionStore>,
        cookie_secure: bool,
    ) -> Self {
        Self {
            store,
            resolver: Arc::new(resolver),
            sessions,
            cookie_secure,
        }
    }

    /// Runs a store operation on the blocking pool.
    async fn with_store<F, T>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&CatalogStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| {
                error!(error = %err, "store task panicked");
                ApiError::internal(INTERNAL_ERROR)
            })?
            .map_err(|err| {
                error!(error = ?err, "store operation failed");
                ApiError::internal(INTERNAL_ERROR)
            })
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Present on handlers that need a logged-in user.
pub struct SessionUser {
    pub user_id: String,
}

impl FromRequestParts<AppState> for SessionUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ApiResult<Self> {
        let jar = CookieJar::from_headers(&parts.headers);
        let user_id = jar
            .get(SESSION_COOKIE)
            .and_then(|cookie| state.sessions.user_id(cookie.value()));
        match user_id {
            Some(user_id) => Ok(SessionUser { user_id }),
            None => {
                warn!(path = %parts.uri.path(), "unauthorized access attempt");
                Err(ApiError::unauthorized("Unauthorized"))
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/content", get(list_content).post(create_content))
        .route("/api/content/search", get(search_content))
        .route(
            "/api/content/{id}",
            get(get_content).put(update_content).delete(delete_content),
        )
        .route("/api/admin/fix-alist-paths", post(fix_alist_paths))
        .route("/api/download", get(download))
        .route("/api/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct CredentialsBody {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl CredentialsBody {
    fn from_bytes(body: &[u8]) -> Self {
        if body.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(body).unwrap_or_default()
    }

    fn into_pair(self) -> ApiResult<(String, String)> {
        match (self.username, self.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Ok((username, password))
            }
            _ => Err(ApiError::bad_request("Username and password required")),
        }
    }
}

fn user_json(user: &User) -> Value {
    json!({ "user": { "id": user.id, "username": user.username } })
}

async fn verify_credentials(state: &AppState, body: CredentialsBody) -> ApiResult<User> {
    let (username, password) = body.into_pair()?;
    state
        .with_store(move |store| store.verify_password(&username, &password))
        .await?
        .ok_or_else(|| ApiError::unauthorized("Wrong password"))
}

async fn login(State(state): State<AppState>, jar: CookieJar, body: Bytes) -> ApiResult<(CookieJar, Json<Value>)> {
    let user = verify_credentials(&state, CredentialsBody::from_bytes(&body)).await?;
    let token = state.sessions.create(&user.id);
    info!(username = %user.username, "login successful");

    let ttl_secs = i64::try_from(state.sessions.ttl().as_secs()).unwrap_or(i64::MAX);
    let max_age = cookie::time::Duration::seconds(ttl_secs);
    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(state.cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .build();

    Ok((jar.add(cookie), Json(user_json(&user))))
}

async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Json<Value>) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.destroy(cookie.value());
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/").build()),
        Json(json!({ "success": true })),
    )
}

async fn me(State(state): State<AppState>, jar: CookieJar) -> ApiResult<Json<Value>> {
    let user_id = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.user_id(cookie.value()))
        .ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;

    let user = state
        .with_store(move |store| store.get_user(&user_id))
        .await?
        .ok_or_else(|| ApiError::unauthorized("User not found"))?;
    Ok(Json(user_json(&user)))
}

fn into_items(enriched: Vec<Enriched>) -> Vec<ContentItem> {
    enriched.into_iter().map(|entry| entry.item).collect()
}

async fn list_content(State(state): State<AppState>) -> ApiResult<Json<Vec<ContentItem>>> {
    let items = state.with_store(|store| store.list_content()).await?;
    let items = items.into_iter().map(normalize_for_response).collect();
    Ok(Json(into_items(enrich_all(&state.resolver, items).await)))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
    category: Option<String>,
}

async fn search_content(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<ContentItem>>> {
    let q = query
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Search query required"))?;
    let category = query.category.filter(|category| !category.is_empty());

    let items = state
        .with_store(move |store| store.search_content(&q, category.as_deref()))
        .await?;
    let items = items.into_iter().map(normalize_for_response).collect();
    Ok(Json(into_items(enrich_all(&state.resolver, items).await)))
}

async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContentItem>> {
    let item = state
        .with_store(move |store| store.get_content(&id))
        .await?
        .ok_or_else(|| ApiError::not_found("Content not found"))?;

    let enriched = prepare_for_response(&state.resolver, item).await;
    if enriched.degraded > 0 {
        warn!(id = %enriched.item.id, degraded = enriched.degraded, "served unsigned links");
    }
    Ok(Json(enriched.item))
}

/// Decodes and validates a write body, then normalises its Drive links. The
/// body is read as raw bytes so that malformed JSON and a missing
/// `Content-Type` still produce a JSON error.
fn parse_payload(body: &[u8]) -> ApiResult<ContentPayload> {
    let payload: ContentPayload = serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Validation error: {err}")))?;
    payload
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(normalize_for_storage(payload))
}

async fn create_content(
    State(state): State<AppState>,
    _user: SessionUser,
    body: Bytes,
) -> ApiResult<Json<ContentItem>> {
    let payload = parse_payload(&body)?;
    let item = state
        .with_store(move |store| {
            let item = store.create_content(&payload)?;
            store.record_upload(&item.title)?;
            Ok(item)
        })
        .await?;
    info!(id = %item.id, "New upload: {}", item.title);
    Ok(Json(item))
}

async fn update_content(
    State(state): State<AppState>,
    _user: SessionUser,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ContentItem>> {
    let payload = parse_payload(&body)?;
    let item = state
        .with_store(move |store| store.update_content(&id, &payload))
        .await?
        .ok_or_else(|| ApiError::not_found("Content not found"))?;
    Ok(Json(item))
}

/// Deletion asks for the credentials again on top of the session.
async fn delete_content(
    State(state): State<AppState>,
    user: SessionUser,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    verify_credentials(&state, CredentialsBody::from_bytes(&body)).await?;

    let deleted = {
        let id = id.clone();
        state.with_store(move |store| store.delete_content(&id)).await?
    };
    if !deleted {
        return Err(ApiError::not_found("Content not found"));
    }
    info!(%id, user_id = %user.user_id, "content deleted");
    Ok(Json(json!({
        "success": true,
        "message": "Content deleted successfully",
    })))
}

async fn fix_alist_paths(
    State(state): State<AppState>,
    _user: SessionUser,
) -> ApiResult<Json<Value>> {
    info!("starting Alist path migration");
    let markers = state.resolver.config().host_markers.clone();
    let report = state
        .with_store(move |store| store.fix_alist_paths(&markers))
        .await?;
    info!(updated = report.updated, "Alist path migration complete");
    if !report.errors.is_empty() {
        warn!(errors = ?report.errors, "errors during Alist path migration");
    }
    Ok(Json(json!({
        "success": true,
        "updated": report.updated,
        "errors": report.errors,
    })))
}

#[derive(Deserialize)]
struct DownloadQuery {
    url: Option<String>,
}

/// Redirects to a playable URL so the media bytes never pass through here.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let url = query
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("Download URL required"))?;

    let target = if url.starts_with('/') {
        state.resolver.resolve(&url).await.into_link()
    } else {
        url
    };
    info!(target = %target, "redirecting download");

    let location: String = utf8_percent_encode(&target, LOCATION_ESCAPES).collect();
    let location = HeaderValue::from_str(&location)
        .map_err(|_| ApiError::bad_request("Download URL is not a valid redirect target"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
        "endpoints": {
            "auth": "/api/auth/login",
            "content": "/api/content",
            "download": "/api/download",
        },
    }))
}

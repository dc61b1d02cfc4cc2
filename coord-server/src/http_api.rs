//! The HTTP JSON surface: public read-only views, the `/admin/*` control
//! endpoints and the replay download service. Admin requests authenticate
//! with the permanent token, the read-only view token (GET only) or an
//! OTP-issued temp token; errors are `{ok:false, error:<slug>}`.

use crate::replay;
use crate::room::{ADMIN_DISBAND_MESSAGE, Room, RoomError};
use crate::server_state::AppState;
use crate::session;
use crate::ws_push;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

/// Download throttle: one chunk of this size per second.
const DOWNLOAD_CHUNK: usize = 50 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rooms", get(rooms))
        .route("/room", get(room_legacy))
        .route("/status", get(status))
        .route("/ws", get(ws_push::ws_handler))
        .route("/admin/otp/request", post(otp_request))
        .route("/admin/otp/verify", post(otp_verify))
        .route("/admin/rooms", get(admin_rooms))
        .route("/admin/rooms/{id}/max_users", post(admin_room_max_users))
        .route("/admin/rooms/{id}/disband", post(admin_room_disband))
        .route("/admin/rooms/{id}/chat", post(admin_room_chat))
        .route("/admin/broadcast", post(admin_broadcast))
        .route("/admin/replay/config", get(replay_config_get).post(replay_config_set))
        .route(
            "/admin/room-creation/config",
            get(room_creation_config_get).post(room_creation_config_set),
        )
        .route("/admin/ip-blacklist", get(ip_blacklist_list))
        .route("/admin/ip-blacklist/remove", post(ip_blacklist_remove))
        .route("/admin/ip-blacklist/clear", post(ip_blacklist_clear))
        .route("/admin/users/{id}", get(admin_user_get))
        .route("/admin/ban/user", post(admin_ban_user))
        .route("/admin/ban/room", post(admin_ban_room))
        .route("/admin/users/{id}/disconnect", post(admin_user_disconnect))
        .route("/admin/users/{id}/move", post(admin_user_move))
        .route("/admin/contest/rooms/{id}/config", post(contest_config))
        .route("/admin/contest/rooms/{id}/whitelist", post(contest_whitelist))
        .route("/admin/contest/rooms/{id}/start", post(contest_start))
        .route("/replay/auth", post(replay_auth))
        .route("/replay/download", get(replay_download))
        .route("/replay/delete", post(replay_delete))
        .with_state(state)
}

pub struct ApiError(StatusCode, &'static str);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "ok": false, "error": self.1 }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn bad_request(slug: &'static str) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, slug)
}

fn unauthorized() -> ApiError {
    ApiError(StatusCode::UNAUTHORIZED, "unauthorized")
}

fn not_found(slug: &'static str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, slug)
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(PartialEq, Eq)]
enum AdminRole {
    Full,
    View,
}

/// Resolves the caller's admin role from `?token=`, `X-Admin-Token` or
/// `Authorization: Bearer`. The view token is admitted for GETs only.
fn admin_auth(
    state: &AppState,
    headers: &HeaderMap,
    query: &TokenQuery,
    ip: IpAddr,
    is_get: bool,
) -> Result<AdminRole, ApiError> {
    let token = query
        .token
        .clone()
        .or_else(|| {
            headers
                .get("x-admin-token")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        })
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_owned)
        })
        .ok_or_else(unauthorized)?;

    if state.config.admin_token.as_deref() == Some(token.as_str()) {
        return Ok(AdminRole::Full);
    }
    if state.config.view_token.as_deref() == Some(token.as_str()) {
        return if is_get {
            Ok(AdminRole::View)
        } else {
            Err(ApiError(StatusCode::FORBIDDEN, "view-token-readonly"))
        };
    }
    if let Ok(uuid) = token.parse::<Uuid>()
        && state.trust.validate_temp_token(uuid, ip)
    {
        return Ok(AdminRole::Full);
    }
    Err(unauthorized())
}

fn room_error_slug(err: RoomError) -> &'static str {
    match err {
        RoomError::NotHost => "not-host",
        RoomError::WrongState => "wrong-state",
        RoomError::RoomFull => "room-full",
        RoomError::RoomLocked => "room-locked",
        RoomError::NotWhitelisted => "not-whitelisted",
        RoomError::NoChartSelected => "no-chart-selected",
        RoomError::NotPlayer => "not-player",
        RoomError::NotAllReady => "not-all-ready",
    }
}

fn lookup_room(state: &AppState, id: &str) -> Result<Arc<Room>, ApiError> {
    state
        .rooms
        .get(id)
        .map(|room| Arc::clone(room.value()))
        .ok_or_else(|| not_found("room-not-found"))
}

async fn all_room_views(state: &AppState) -> Vec<crate::room::RoomView> {
    let rooms: Vec<Arc<Room>> = state
        .rooms
        .iter()
        .map(|room| Arc::clone(room.value()))
        .collect();
    let mut views = Vec::with_capacity(rooms.len());
    for room in rooms {
        views.push(room.view().await);
    }
    views
}

// Public surface.

async fn rooms(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let views = all_room_views(&state).await;
    Json(json!({ "count": views.len(), "rooms": views }))
}

/// The older public projection, kept for existing dashboards. Chart names
/// are resolved through the chart service with a fallback.
async fn room_legacy(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let rooms: Vec<Arc<Room>> = state
        .rooms
        .iter()
        .map(|room| Arc::clone(room.value()))
        .collect();
    let mut entries = Vec::with_capacity(rooms.len());
    for room in rooms {
        let view = room.view().await;
        let chart = match room.chart().await {
            Some((id, name)) => {
                let name = match name {
                    Some(name) => name,
                    None => state.remote.chart_name(id).await,
                };
                json!({ "name": name, "id": id })
            }
            None => serde_json::Value::Null,
        };
        let players: Vec<_> = view
            .players
            .iter()
            .filter(|player| !player.is_monitor)
            .map(|player| json!({ "name": player.name, "id": player.id }))
            .collect();
        entries.push(json!({
            "roomid": view.id,
            "cycle": view.is_cycle,
            "lock": view.is_locked,
            "host": { "name": view.host_name, "id": view.host_id },
            "state": view.state,
            "chart": chart,
            "players": players,
        }));
    }
    Json(json!({ "total": entries.len(), "rooms": entries }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "serverName": state.config.server_name,
        "version": "1.0.0",
        "uptime": state.started.elapsed().as_secs(),
        "roomCount": state.rooms.len(),
        "sessionCount": state.sessions.len(),
        "userCount": state.users.len(),
    }))
}

// OTP flow. Both endpoints are disabled when a permanent token exists.

async fn otp_request(State(state): State<Arc<AppState>>) -> ApiResult {
    if state.config.admin_token.is_some() {
        return Err(ApiError(StatusCode::FORBIDDEN, "otp-disabled"));
    }
    let (ssid, otp) = state.trust.create_otp();
    // The code is revealed out-of-band through the server log only.
    tracing::info!(%ssid, %otp, "admin OTP issued");
    Ok(Json(json!({ "ok": true, "ssid": ssid })))
}

#[derive(Deserialize)]
struct OtpVerifyBody {
    ssid: Uuid,
    otp: String,
}

async fn otp_verify(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<OtpVerifyBody>,
) -> ApiResult {
    if state.config.admin_token.is_some() {
        return Err(ApiError(StatusCode::FORBIDDEN, "otp-disabled"));
    }
    match state.trust.verify_otp(body.ssid, &body.otp, addr.ip()) {
        Some(token) => Ok(Json(json!({
            "ok": true,
            "token": token,
            "expiresIn": crate::trust::TEMP_TOKEN_TTL.as_millis() as u64,
        }))),
        None => Err(ApiError(StatusCode::UNAUTHORIZED, "invalid-otp")),
    }
}

// Admin: rooms.

async fn admin_rooms(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), true)?;
    let views = all_room_views(&state).await;
    Ok(Json(json!({ "ok": true, "count": views.len(), "rooms": views })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaxUsersBody {
    max_users: usize,
}

async fn admin_room_max_users(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<MaxUsersBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    if body.max_users == 0 {
        return Err(bad_request("invalid-max-users"));
    }
    let room = lookup_room(&state, &id)?;
    room.set_max_players(&state, body.max_users).await;
    Ok(Json(json!({ "ok": true })))
}

async fn admin_room_disband(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    let room = lookup_room(&state, &id)?;
    room.disband(&state, ADMIN_DISBAND_MESSAGE).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
}

async fn admin_room_chat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    if body.message.chars().count() > 200 {
        return Err(bad_request("message-too-long"));
    }
    let room = lookup_room(&state, &id)?;
    room.system_chat(&state, &body.message).await;
    Ok(Json(json!({ "ok": true })))
}

async fn admin_broadcast(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    if body.message.chars().count() > 200 {
        return Err(bad_request("message-too-long"));
    }
    state.broadcast_chat(&body.message);
    tracing::info!(message = %body.message, "admin broadcast");
    Ok(Json(json!({ "ok": true })))
}

// Feature toggles.

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn replay_config_get(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), true)?;
    Ok(Json(json!({ "ok": true, "enabled": state.replay_enabled.load(Ordering::Relaxed) })))
}

async fn replay_config_set(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<EnabledBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    state.replay_enabled.store(body.enabled, Ordering::Relaxed);
    tracing::info!(enabled = body.enabled, "replay recording toggled");
    Ok(Json(json!({ "ok": true, "enabled": body.enabled })))
}

async fn room_creation_config_get(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), true)?;
    Ok(Json(
        json!({ "ok": true, "enabled": state.room_creation_enabled.load(Ordering::Relaxed) }),
    ))
}

async fn room_creation_config_set(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<EnabledBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    state
        .room_creation_enabled
        .store(body.enabled, Ordering::Relaxed);
    tracing::info!(enabled = body.enabled, "room creation toggled");
    Ok(Json(json!({ "ok": true, "enabled": body.enabled })))
}

// IP blacklist.

async fn ip_blacklist_list(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), true)?;
    let ips: Vec<String> = state
        .trust
        .blacklisted_ips()
        .into_iter()
        .map(|ip| ip.to_string())
        .collect();
    Ok(Json(json!({ "ok": true, "ips": ips })))
}

#[derive(Deserialize)]
struct IpBody {
    ip: String,
}

async fn ip_blacklist_remove(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<IpBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    let ip: IpAddr = body.ip.parse().map_err(|_| bad_request("invalid-ip"))?;
    let removed = state.trust.remove_blacklisted(ip);
    Ok(Json(json!({ "ok": true, "removed": removed })))
}

async fn ip_blacklist_clear(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    state.trust.clear_blacklist();
    Ok(Json(json!({ "ok": true })))
}

// Admin: users.

async fn admin_user_get(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i32>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), true)?;
    let user = state
        .users
        .get(&id)
        .map(|user| Arc::clone(user.value()))
        .ok_or_else(|| not_found("user-not-found"))?;
    let room_id = user.current_room().map(|room| room.id.clone());
    Ok(Json(json!({
        "ok": true,
        "user": {
            "id": user.id,
            "name": user.name(),
            "connected": user.is_connected(),
            "roomId": room_id,
            "monitor": user.monitor.load(Ordering::Relaxed),
            "banned": state.admin_data.is_user_banned(i64::from(user.id)),
        },
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BanUserBody {
    user_id: i64,
    banned: bool,
    #[serde(default)]
    disconnect: bool,
}

async fn admin_ban_user(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<BanUserBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    state.admin_data.set_user_ban(body.user_id, body.banned).await;
    tracing::info!(user = body.user_id, banned = body.banned, "user ban updated");
    if body.banned && body.disconnect {
        let user = i32::try_from(body.user_id)
            .ok()
            .and_then(|id| state.users.get(&id).map(|user| Arc::clone(user.value())));
        if let Some(user) = user
            && let Some(banned_session) = user.session()
        {
            session::connection_lost(&state, &banned_session).await;
        }
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BanRoomBody {
    user_id: i64,
    room_id: String,
    banned: bool,
}

async fn admin_ban_room(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<BanRoomBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    state
        .admin_data
        .set_room_ban(&body.room_id, body.user_id, body.banned)
        .await;
    tracing::info!(
        user = body.user_id,
        room = %body.room_id,
        banned = body.banned,
        "room ban updated"
    );
    Ok(Json(json!({ "ok": true })))
}

async fn admin_user_disconnect(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i32>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    let user = state
        .users
        .get(&id)
        .map(|user| Arc::clone(user.value()))
        .ok_or_else(|| not_found("user-not-found"))?;
    let Some(target) = user.session() else {
        return Err(bad_request("user-not-connected"));
    };
    session::connection_lost(&state, &target).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveBody {
    room_id: String,
    #[serde(default)]
    monitor: bool,
}

/// Moves a disconnected user into another room. The source removal runs
/// under the source room's lock, the destination add under the target's;
/// the two locks are never held together.
async fn admin_user_move(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i32>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<MoveBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    let user = state
        .users
        .get(&id)
        .map(|user| Arc::clone(user.value()))
        .ok_or_else(|| not_found("user-not-found"))?;
    if user.is_connected() {
        return Err(bad_request("user-connected"));
    }
    let target = lookup_room(&state, &body.room_id)?;
    if let Some(source) = user.current_room() {
        source.on_user_leave(&state, &user).await;
    }
    target
        .add_user(&state, &user, body.monitor)
        .await
        .map_err(|err| bad_request(room_error_slug(err)))?;
    Ok(Json(json!({ "ok": true })))
}

// Contest controls.

#[derive(Deserialize)]
struct ContestConfigBody {
    enabled: bool,
    whitelist: Option<Vec<i64>>,
}

async fn contest_config(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<ContestConfigBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    let room = lookup_room(&state, &id)?;
    room.set_contest(&state, body.enabled, body.whitelist).await;
    tracing::info!(room = %id, enabled = body.enabled, "contest mode updated");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WhitelistBody {
    user_ids: Vec<i64>,
}

async fn contest_whitelist(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<WhitelistBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    let room = lookup_room(&state, &id)?;
    room.set_whitelist(body.user_ids).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct StartBody {
    #[serde(default)]
    force: bool,
}

async fn contest_start(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> ApiResult {
    admin_auth(&state, &headers, &query, addr.ip(), false)?;
    let room = lookup_room(&state, &id)?;
    room.start_manually(&state, body.force)
        .await
        .map_err(|err| bad_request(room_error_slug(err)))?;
    Ok(Json(json!({ "ok": true })))
}

// Replay download service.

#[derive(Deserialize)]
struct ReplayAuthBody {
    token: String,
}

async fn replay_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReplayAuthBody>,
) -> ApiResult {
    let user = state
        .remote
        .me(&body.token)
        .await
        .map_err(|_| unauthorized())?;
    let session_token = state.trust.create_replay_session(user.id);
    let charts: Vec<_> = replay::list_for_user(&state.config.record_dir(), user.id)
        .await
        .into_iter()
        .map(|(chart_id, timestamps)| json!({ "chartId": chart_id, "timestamps": timestamps }))
        .collect();
    Ok(Json(json!({
        "ok": true,
        "sessionToken": session_token,
        "expiresIn": crate::trust::REPLAY_SESSION_TTL.as_millis() as u64,
        "charts": charts,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayFileQuery {
    session_token: Uuid,
    chart_id: i32,
    timestamp: i64,
}

/// Streams one replay, throttled to 50 KiB per second.
async fn replay_download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReplayFileQuery>,
) -> Result<Response, ApiError> {
    let user_id = state
        .trust
        .validate_replay_session(query.session_token)
        .ok_or_else(unauthorized)?;
    let path = replay::replay_path(
        &state.config.record_dir(),
        user_id,
        query.chart_id,
        query.timestamp,
    );
    let data = tokio::fs::read(&path)
        .await
        .map_err(|_| not_found("replay-not-found"))?;

    let stream = futures_util::stream::unfold(
        (Bytes::from(data), 0usize),
        |(data, pos)| async move {
            if pos >= data.len() {
                return None;
            }
            if pos > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let end = (pos + DOWNLOAD_CHUNK).min(data.len());
            let chunk = data.slice(pos..end);
            Some((Ok::<_, std::io::Error>(chunk), (data, end)))
        },
    );
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}.phirarec", query.timestamp),
        )
        .body(Body::from_stream(stream))
        .map_err(|_| ApiError(StatusCode::INTERNAL_SERVER_ERROR, "internal"))?;
    Ok(response)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayDeleteBody {
    session_token: Uuid,
    chart_id: i32,
    timestamp: i64,
}

async fn replay_delete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReplayDeleteBody>,
) -> ApiResult {
    let user_id = state
        .trust
        .validate_replay_session(body.session_token)
        .ok_or_else(unauthorized)?;
    let path = replay::replay_path(
        &state.config.record_dir(),
        user_id,
        body.chart_id,
        body.timestamp,
    );
    tokio::fs::remove_file(&path)
        .await
        .map_err(|_| not_found("replay-not-found"))?;
    Ok(Json(json!({ "ok": true })))
}

//! REST surface for rooms, membership and invites.
//!
//! ```text
//! GET    /health
//! GET    /rooms                    rooms owned by the caller
//! POST   /rooms                    {name, language}
//! GET    /rooms/:id                room + members
//! PUT    /rooms/:id                {name?, language?}        admin
//! DELETE /rooms/:id                                          admin
//! GET    /rooms/:id/members
//! POST   /invites                  {roomId, email}           admin
//! GET    /invites/:token
//! POST   /invites/:token/accept
//! ```
//!
//! The caller's identity comes from headers set by the identity layer in
//! front of this service: `x-user-id` and `x-user-email` (plus optional
//! `x-user-name`) for signed-in users, otherwise a guest keyed by
//! `x-guest-id`.
//!
//! Membership calls hit RocksDB, so handlers run them on the blocking pool.
//! Deleting a room first discards its live hub, which closes every socket
//! still attached and keeps the hub from writing the document back.

use std::sync::Arc;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::authority::MembershipAuthority;
use crate::error::CollabError;
use crate::hub::HubRegistry;
use crate::model::{Identity, Invite, Language, Room, RoomMember, DEFAULT_GUEST_MARKER};

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<MembershipAuthority>,
    /// Live sync hubs when the sync server shares this process
    pub rooms: Option<Arc<HubRegistry>>,
}

impl AppState {
    pub fn new(authority: Arc<MembershipAuthority>) -> Self {
        Self { authority, rooms: None }
    }

    pub fn with_rooms(mut self, rooms: Arc<HubRegistry>) -> Self {
        self.rooms = Some(rooms);
        self
    }

    /// Run `f` against the authority on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&MembershipAuthority) -> Result<T, CollabError> + Send + 'static,
        T: Send + 'static,
    {
        let authority = self.authority.clone();
        let outcome = tokio::task::spawn_blocking(move || f(&authority))
            .await
            .map_err(|e| CollabError::Persistence(format!("storage task failed: {e}")))?;
        Ok(outcome?)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/:id", get(get_room).put(update_room).delete(delete_room))
        .route("/rooms/:id/members", get(list_members))
        .route("/invites", post(create_invite))
        .route("/invites/:token", get(get_invite))
        .route("/invites/:token/accept", post(accept_invite))
        .with_state(state)
}

/// Bind `config.bind_addr` and serve until the process exits.
pub async fn run(config: &ApiConfig, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    log::info!("REST API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

// ─── Identity ─────────────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn identity_from_headers(headers: &HeaderMap) -> Identity {
    match (header(headers, "x-user-id"), header(headers, "x-user-email")) {
        (Some(id), Some(email)) => {
            let name = header(headers, "x-user-name").unwrap_or(email);
            Identity::user(id, email, name)
        }
        _ => Identity::guest(header(headers, "x-guest-id").unwrap_or(DEFAULT_GUEST_MARKER)),
    }
}

// ─── Errors ───────────────────────────────────────────────────────────

pub struct ApiError(CollabError);

impl From<CollabError> for ApiError {
    fn from(e: CollabError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            CollabError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            CollabError::Forbidden(reason) => (StatusCode::FORBIDDEN, reason.clone()),
            CollabError::AlreadyUsed => (StatusCode::BAD_REQUEST, "Invitation has already been used".to_string()),
            CollabError::Expired => (StatusCode::BAD_REQUEST, "Invitation has expired".to_string()),
            CollabError::Validation(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            CollabError::Transport(_) | CollabError::Persistence(_) => {
                log::error!("Request failed: {}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ─── Views ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct PersonView {
    name: String,
    email: String,
}

impl From<&Identity> for PersonView {
    fn from(identity: &Identity) -> Self {
        Self {
            name: identity.name().to_string(),
            email: identity.email().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberView {
    email: String,
    name: String,
    role: &'static str,
    joined_at: DateTime<Utc>,
}

impl From<&RoomMember> for MemberView {
    fn from(member: &RoomMember) -> Self {
        Self {
            email: member.email.clone(),
            name: member.identity.name().to_string(),
            role: member.role.as_str(),
            joined_at: member.joined_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomView {
    id: Uuid,
    name: String,
    language: Language,
    owner: PersonView,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    members: Option<Vec<MemberView>>,
}

impl RoomView {
    fn new(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            language: room.language,
            owner: PersonView::from(&room.owner),
            created_at: room.created_at,
            updated_at: room.updated_at,
            members: None,
        }
    }

    fn with_members(room: &Room, members: &[RoomMember]) -> Self {
        Self {
            members: Some(members.iter().map(MemberView::from).collect()),
            ..Self::new(room)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InviteView {
    token: String,
    invited_email: String,
    used: bool,
    expires_at: DateTime<Utc>,
    invited_by: PersonView,
    #[serde(skip_serializing_if = "Option::is_none")]
    invite_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    room: Option<RoomView>,
}

impl InviteView {
    fn new(invite: &Invite) -> Self {
        Self {
            token: invite.token.clone(),
            invited_email: invite.invited_email.clone(),
            used: invite.used,
            expires_at: invite.expires_at,
            invited_by: PersonView::from(&invite.invited_by),
            invite_link: None,
            room: None,
        }
    }
}

// ─── Bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRoomBody {
    #[serde(default)]
    name: String,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateRoomBody {
    name: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInviteBody {
    room_id: Uuid,
    #[serde(default)]
    email: String,
}

fn parse_language(raw: Option<&str>) -> Result<Option<Language>, CollabError> {
    raw.map(str::parse::<Language>).transpose()
}

// ─── Handlers ─────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

async fn list_rooms(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<RoomView>>> {
    let actor = identity_from_headers(&headers);
    let rooms = state.blocking(move |authority| authority.rooms_owned_by(&actor)).await?;
    Ok(Json(rooms.iter().map(RoomView::new).collect()))
}

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomBody>,
) -> ApiResult<(StatusCode, Json<RoomView>)> {
    let actor = identity_from_headers(&headers);
    let language = parse_language(body.language.as_deref())?.unwrap_or_default();
    let room = state
        .blocking(move |authority| authority.create_room(&body.name, language, &actor))
        .await?;
    Ok((StatusCode::CREATED, Json(RoomView::new(&room))))
}

async fn get_room(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<RoomView>> {
    let (room, members) = state
        .blocking(move |authority| Ok((authority.get_room(id)?, authority.list_members(id)?)))
        .await?;
    Ok(Json(RoomView::with_members(&room, &members)))
}

async fn update_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRoomBody>,
) -> ApiResult<Json<RoomView>> {
    let actor = identity_from_headers(&headers);
    let language = parse_language(body.language.as_deref())?;
    let room = state
        .blocking(move |authority| authority.update_room(id, &actor, body.name.as_deref(), language))
        .await?;
    Ok(Json(RoomView::new(&room)))
}

async fn delete_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = identity_from_headers(&headers);
    let checked = actor.clone();
    state
        .blocking(move |authority| authority.require_admin(id, &checked, "delete this room"))
        .await?;
    if let Some(rooms) = &state.rooms {
        rooms.discard(id).await;
    }
    state.blocking(move |authority| authority.delete_room(id, &actor)).await?;
    Ok(Json(json!({ "message": "Room deleted successfully" })))
}

async fn list_members(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Vec<MemberView>>> {
    let members = state.blocking(move |authority| authority.list_members(id)).await?;
    Ok(Json(members.iter().map(MemberView::from).collect()))
}

async fn create_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateInviteBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let actor = identity_from_headers(&headers);
    let outcome = state
        .blocking(move |authority| authority.create_invite(body.room_id, &body.email, &actor))
        .await?;

    let mut invite = InviteView::new(&outcome.invite);
    invite.invite_link = Some(outcome.invite_link);
    let body = if outcome.email_sent {
        json!({ "message": "Invitation sent successfully", "emailSent": true, "invite": invite })
    } else {
        json!({
            "message": "Invitation created but email could not be sent",
            "emailSent": false,
            "emailError": outcome.email_error,
            "invite": invite,
        })
    };
    Ok((StatusCode::CREATED, Json(body)))
}

async fn get_invite(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let (invite, room) = state
        .blocking(move |authority| {
            let invite = authority.resolve_invite(&token)?;
            let room = authority.get_room(invite.room_id)?;
            Ok((invite, room))
        })
        .await?;
    let mut view = InviteView::new(&invite);
    view.room = Some(RoomView::new(&room));
    Ok(Json(json!({ "invite": view })))
}

async fn accept_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = identity_from_headers(&headers);
    let (room, members) = state
        .blocking(move |authority| {
            let room = authority.accept_invite(&token, &actor)?;
            let members = authority.list_members(room.id)?;
            Ok((room, members))
        })
        .await?;
    Ok(Json(json!({
        "message": "Invitation accepted",
        "room": RoomView::with_members(&room, &members),
    })))
}

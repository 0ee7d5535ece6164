//! Membership & invite authority.
//!
//! Decides who administers a room and runs the invite life cycle:
//!
//! ```text
//! create_invite ──► Invite{used: false, expires_at: now + ttl}
//!                      │
//!   resolve_invite ────┤  NotFound / AlreadyUsed / Expired
//!                      ▼
//! accept_invite  ──► used = true  +  member row upsert   (one batch)
//! ```
//!
//! Acceptance runs under the authority's lock, so the used-check and the
//! used-write cannot interleave between two callers.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::mail::{InviteEmail, InviteMailer, UnconfiguredMailer};
use crate::model::{
    normalize_email, sort_members, validate_room_name, Identity, Invite, Language, Role, Room,
    RoomMember,
};
use crate::storage::Store;

pub const INVITE_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Lifetime of a fresh invite (default: 24h)
    pub invite_ttl: Duration,
    /// Base of invite links, `<frontend_url>/join/<token>`
    pub frontend_url: String,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            invite_ttl: Duration::hours(24),
            frontend_url: "http://localhost:5173".to_string(),
        }
    }
}

/// Result of `create_invite`. `email_sent == false` is a degraded success:
/// the invite exists and `invite_link` must be shared by hand.
#[derive(Debug, Clone)]
pub struct InviteOutcome {
    pub invite: Invite,
    pub invite_link: String,
    pub email_sent: bool,
    pub email_error: Option<String>,
}

/// The one admin rule: the owner, or a member row with role admin that
/// matches the actor. A room with no rows is therefore owner-only.
pub fn is_admin_of(room: &Room, members: &[RoomMember], actor: &Identity) -> bool {
    room.owner.same_principal(actor)
        || members
            .iter()
            .any(|m| m.role == Role::Admin && m.matches(actor))
}

fn generate_token() -> String {
    let mut bytes = [0u8; INVITE_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct MembershipAuthority {
    store: Arc<Store>,
    config: AuthorityConfig,
    mailer: Arc<dyn InviteMailer>,
    accept_lock: Mutex<()>,
}

impl MembershipAuthority {
    pub fn new(store: Arc<Store>, config: AuthorityConfig) -> Self {
        Self::with_mailer(store, config, Arc::new(UnconfiguredMailer))
    }

    pub fn with_mailer(store: Arc<Store>, config: AuthorityConfig, mailer: Arc<dyn InviteMailer>) -> Self {
        Self {
            store,
            config,
            mailer,
            accept_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn invite_link(&self, token: &str) -> String {
        format!("{}/join/{}", self.config.frontend_url.trim_end_matches('/'), token)
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Create a room; the creator gets the admin row.
    pub fn create_room(&self, name: &str, language: Language, creator: &Identity) -> Result<Room> {
        let room = Room::new(name, language, creator.clone())?;
        let admin = RoomMember {
            room_id: room.id,
            identity: creator.clone(),
            email: normalize_email(creator.email()),
            role: Role::Admin,
            joined_at: room.created_at,
        };
        self.store.create_room(&room, &admin)?;
        log::info!("Room {} '{}' created by {}", room.id, room.name, creator.key());
        Ok(room)
    }

    pub fn get_room(&self, room_id: Uuid) -> Result<Room> {
        self.store
            .get_room(room_id)?
            .ok_or_else(|| CollabError::not_found("Room"))
    }

    /// Rooms owned by `actor`, most recently updated first. Guests own none.
    pub fn rooms_owned_by(&self, actor: &Identity) -> Result<Vec<Room>> {
        if actor.is_guest() {
            return Ok(Vec::new());
        }
        let mut rooms: Vec<Room> = self
            .store
            .list_rooms()?
            .into_iter()
            .filter(|room| room.owner.same_principal(actor))
            .collect();
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rooms)
    }

    /// Members of a room, admin first then by join time.
    pub fn list_members(&self, room_id: Uuid) -> Result<Vec<RoomMember>> {
        self.get_room(room_id)?;
        let mut members = self.store.list_members(room_id)?;
        sort_members(&mut members);
        Ok(members)
    }

    pub fn is_admin(&self, room_id: Uuid, actor: &Identity) -> Result<bool> {
        let room = self.get_room(room_id)?;
        let members = self.store.list_members(room_id)?;
        Ok(is_admin_of(&room, &members, actor))
    }

    /// The room, if `actor` may `action` it; otherwise `Forbidden`.
    pub fn require_admin(&self, room_id: Uuid, actor: &Identity, action: &str) -> Result<Room> {
        let room = self.get_room(room_id)?;
        let members = self.store.list_members(room_id)?;
        if !is_admin_of(&room, &members, actor) {
            return Err(CollabError::forbidden(format!("Only room admin can {action}")));
        }
        Ok(room)
    }

    pub fn update_room(
        &self,
        room_id: Uuid,
        actor: &Identity,
        name: Option<&str>,
        language: Option<Language>,
    ) -> Result<Room> {
        let mut room = self.require_admin(room_id, actor, "update this room")?;
        if let Some(name) = name {
            room.name = validate_room_name(name)?;
        }
        if let Some(language) = language {
            room.language = language;
        }
        room.updated_at = Utc::now();
        self.store.put_room(&room)?;
        log::debug!("Room {} updated", room.id);
        Ok(room)
    }

    pub fn delete_room(&self, room_id: Uuid, actor: &Identity) -> Result<()> {
        self.require_admin(room_id, actor, "delete this room")?;
        self.store.delete_room(room_id)?;
        log::info!("Room {room_id} deleted");
        Ok(())
    }

    // ─── Invites ──────────────────────────────────────────────────────

    pub fn create_invite(&self, room_id: Uuid, invited_email: &str, actor: &Identity) -> Result<InviteOutcome> {
        let invited_email = normalize_email(invited_email);
        if invited_email.is_empty() || !invited_email.contains('@') {
            return Err(CollabError::validation("Please provide a valid email"));
        }
        let room = self.require_admin(room_id, actor, "send invitations")?;

        let now = Utc::now();
        let invite = Invite {
            token: generate_token(),
            room_id,
            invited_by: actor.clone(),
            invited_email,
            used: false,
            created_at: now,
            expires_at: now + self.config.invite_ttl,
        };
        self.store.put_invite(&invite)?;

        let invite_link = self.invite_link(&invite.token);
        let email = InviteEmail {
            to: &invite.invited_email,
            invite_link: &invite_link,
            room_name: &room.name,
            inviter_name: actor.name(),
        };
        let (email_sent, email_error) = match self.mailer.send_invite(&email) {
            Ok(()) => (true, None),
            Err(e) => {
                log::warn!("Invite email to {} failed: {e}", invite.invited_email);
                (false, Some(e.to_string()))
            }
        };

        log::info!("Invite created for {} in room {}", invite.invited_email, room_id);
        Ok(InviteOutcome {
            invite,
            invite_link,
            email_sent,
            email_error,
        })
    }

    /// Look up a usable invite.
    pub fn resolve_invite(&self, token: &str) -> Result<Invite> {
        self.resolve_invite_at(token, Utc::now())
    }

    pub fn resolve_invite_at(&self, token: &str, now: DateTime<Utc>) -> Result<Invite> {
        let invite = self
            .store
            .get_invite(token)?
            .ok_or_else(|| CollabError::not_found("Invite"))?;
        invite.check_usable(now)?;
        Ok(invite)
    }

    /// Consume an invite and make the acceptor a member.
    ///
    /// Authenticated acceptors join under their own email; guests under the
    /// invited email. An existing row for that email keeps its role when it
    /// belongs to the acceptor. A row held by anyone else is never taken
    /// over: the call is `Forbidden` and the invite stays unused.
    pub fn accept_invite(&self, token: &str, acceptor: &Identity) -> Result<Room> {
        self.accept_invite_at(token, acceptor, Utc::now())
    }

    pub fn accept_invite_at(&self, token: &str, acceptor: &Identity, now: DateTime<Utc>) -> Result<Room> {
        let _guard = self
            .accept_lock
            .lock()
            .map_err(|_| CollabError::Persistence("authority lock poisoned".into()))?;

        let mut invite = self.resolve_invite_at(token, now)?;
        let room = self.get_room(invite.room_id)?;

        let email = match acceptor {
            Identity::User { email, .. } => normalize_email(email),
            Identity::Guest { .. } => invite.invited_email.clone(),
        };
        let member = match self.store.get_member(room.id, &email)? {
            Some(existing) if existing.matches(acceptor) => RoomMember {
                identity: acceptor.clone(),
                ..existing
            },
            Some(existing) => {
                log::warn!("Refused invite for room {} held by another member as {}", room.id, existing.email);
                return Err(CollabError::forbidden("This invitation belongs to an existing member"));
            }
            None => RoomMember {
                room_id: room.id,
                identity: acceptor.clone(),
                email,
                role: Role::Member,
                joined_at: now,
            },
        };

        invite.used = true;
        self.store.commit_acceptance(&invite, &member)?;
        log::info!("Invite for room {} accepted by {}", room.id, member.email);
        Ok(room)
    }

    pub fn purge_expired_invites(&self) -> Result<usize> {
        let purged = self.store.purge_expired_invites(Utc::now())?;
        if purged > 0 {
            log::info!("Purged {purged} expired invites");
        }
        Ok(purged)
    }
}

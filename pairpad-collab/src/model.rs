//! Room, membership and invite records plus the actor identity they are
//! checked against.
//!
//! These are the relational records kept next to document snapshots in the
//! store. They serialize with bincode for storage; the REST layer renders
//! its own JSON views of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CollabError;

pub const GUEST_EMAIL: &str = "guest@example.com";
pub const GUEST_NAME: &str = "Guest User";
pub const DEFAULT_GUEST_MARKER: &str = "guest";

// ─── Language ─────────────────────────────────────────────────────────

/// Editor language of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    JavaScript,
    Python,
    Java,
    Cpp,
    Html,
    Css,
    TypeScript,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::JavaScript,
        Language::Python,
        Language::Java,
        Language::Cpp,
        Language::Html,
        Language::Css,
        Language::TypeScript,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Html => "html",
            Language::Css => "css",
            Language::TypeScript => "typescript",
        }
    }

    /// Buffer a brand-new room document starts with.
    pub fn default_content(self) -> &'static str {
        match self {
            Language::JavaScript => {
                "// Welcome to Collab Editor!\n// Start coding together...\n\nfunction hello() {\n  console.log(\"Hello, World!\");\n}"
            }
            Language::Python => {
                "# Welcome to Collab Editor!\n# Start coding together...\n\ndef hello():\n    print(\"Hello, World!\")"
            }
            Language::Java => {
                "// Welcome to Collab Editor!\n// Start coding together...\n\npublic class Main {\n    public static void main(String[] args) {\n        System.out.println(\"Hello, World!\");\n    }\n}"
            }
            Language::Cpp => {
                "// Welcome to Collab Editor!\n// Start coding together...\n\n#include <iostream>\n\nint main() {\n    std::cout << \"Hello, World!\" << std::endl;\n    return 0;\n}"
            }
            Language::Html => {
                "<!DOCTYPE html>\n<html>\n<head>\n    <title>Welcome</title>\n</head>\n<body>\n    <h1>Welcome to Collab Editor!</h1>\n</body>\n</html>"
            }
            Language::Css => {
                "/* Welcome to Collab Editor! */\n/* Start styling together... */\n\nbody {\n    font-family: Arial, sans-serif;\n}"
            }
            Language::TypeScript => {
                "// Welcome to Collab Editor!\n// Start coding together...\n\nfunction hello(): void {\n  console.log(\"Hello, World!\");\n}"
            }
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == s)
            .ok_or_else(|| CollabError::validation(format!("unsupported language '{s}'")))
    }
}

// ─── Identity ─────────────────────────────────────────────────────────

/// The acting principal, as vouched for by the external identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    User {
        user_id: String,
        email: String,
        name: String,
    },
    /// Unauthenticated visitor, told apart only by an opaque marker.
    Guest { marker: String },
}

impl Identity {
    pub fn user(user_id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        Identity::User {
            user_id: user_id.into(),
            email: normalize_email(&email.into()),
            name: name.into(),
        }
    }

    pub fn guest(marker: impl Into<String>) -> Self {
        Identity::Guest { marker: marker.into() }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest { .. })
    }

    pub fn email(&self) -> &str {
        match self {
            Identity::User { email, .. } => email,
            Identity::Guest { .. } => GUEST_EMAIL,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Identity::User { name, .. } => name,
            Identity::Guest { .. } => GUEST_NAME,
        }
    }

    /// User id for users, marker for guests.
    pub fn key(&self) -> &str {
        match self {
            Identity::User { user_id, .. } => user_id,
            Identity::Guest { marker } => marker,
        }
    }

    /// Same principal: users by id, guests by marker, never across kinds.
    pub fn same_principal(&self, other: &Identity) -> bool {
        match (self, other) {
            (Identity::User { user_id: a, .. }, Identity::User { user_id: b, .. }) => a == b,
            (Identity::Guest { marker: a }, Identity::Guest { marker: b }) => a == b,
            _ => false,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ─── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub owner: Identity,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(name: &str, language: Language, owner: Identity) -> Result<Self, CollabError> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: validate_room_name(name)?,
            owner,
            language,
            created_at: now,
            updated_at: now,
        })
    }
}

pub fn validate_room_name(name: &str) -> Result<String, CollabError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CollabError::validation("Please provide a room name"));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub room_id: Uuid,
    pub identity: Identity,
    /// Lowercased; unique per room
    pub email: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

impl RoomMember {
    /// Whether this row speaks for `actor`: users match by email, guests by marker.
    pub fn matches(&self, actor: &Identity) -> bool {
        match actor {
            Identity::User { email, .. } => self.email == normalize_email(email),
            Identity::Guest { .. } => self.identity.is_guest() && self.identity.same_principal(actor),
        }
    }
}

/// Admin first, then by join time.
pub fn sort_members(members: &mut [RoomMember]) {
    members.sort_by(|a, b| a.role.cmp(&b.role).then(a.joined_at.cmp(&b.joined_at)));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub token: String,
    pub room_id: Uuid,
    pub invited_by: Identity,
    pub invited_email: String,
    pub used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Invite {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// `NotFound` is the caller's concern; this checks used, then expiry.
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<(), CollabError> {
        if self.used {
            return Err(CollabError::AlreadyUsed);
        }
        if self.is_expired_at(now) {
            return Err(CollabError::Expired);
        }
        Ok(())
    }
}

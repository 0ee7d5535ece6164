//! Presence table: who is in the room and where their cursor is.
//!
//! One entry per live connection, never persisted. Entries merge
//! last-writer-wins on the sender's awareness clock and carry a liveness
//! stamp refreshed by publishes and heartbeats; the hub sweeps entries whose
//! stamp is older than the heartbeat timeout.
//!
//! ```text
//! publish(conn, clock, state) ──► upsert if clock >= entry.clock
//! heartbeat(conn)             ──► entry.last_seen = now
//! evict_stale()               ──► remove entries idle > timeout
//! remove(conn)                ──► clean departure
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default window after which an entry without heartbeats is evicted.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Selection in UTF-16 offsets of the shared text. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

/// What a connection publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub display_name: String,
    /// CSS colour, e.g. `#ff0000`
    pub color: String,
    pub cursor: Option<CursorRange>,
}

impl AwarenessState {
    pub fn new(display_name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            color: color.into(),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, anchor: u32, head: u32) -> Self {
        self.cursor = Some(CursorRange { anchor, head });
        self
    }
}

/// A stable, visually distinct CSS colour for a connection id.
pub fn color_for(id: Uuid) -> String {
    let hue = (id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 0.5 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// One connection's presence as tracked by a table.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub connection_id: Uuid,
    pub state: AwarenessState,
    /// Sender's awareness clock at the last accepted publish
    pub clock: u64,
    last_seen: Instant,
}

impl AwarenessEntry {
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Per-room presence table.
#[derive(Debug)]
pub struct AwarenessTable {
    entries: HashMap<Uuid, AwarenessEntry>,
    timeout: Duration,
}

impl AwarenessTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Upsert a connection's entry. Returns `false` if the publish carried an
    /// older clock than the entry already holds.
    pub fn publish(&mut self, connection_id: Uuid, clock: u64, state: AwarenessState) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(&connection_id) {
            Some(entry) if clock < entry.clock => {
                // Out-of-order publish still proves the connection is alive.
                entry.last_seen = now;
                false
            }
            Some(entry) => {
                entry.state = state;
                entry.clock = clock;
                entry.last_seen = now;
                true
            }
            None => {
                self.entries.insert(
                    connection_id,
                    AwarenessEntry {
                        connection_id,
                        state,
                        clock,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Refresh liveness. Returns `false` for connections with no entry.
    pub fn heartbeat(&mut self, connection_id: Uuid) -> bool {
        match self.entries.get_mut(&connection_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, connection_id: Uuid) -> Option<AwarenessEntry> {
        self.entries.remove(&connection_id)
    }

    pub fn get(&self, connection_id: &Uuid) -> Option<&AwarenessEntry> {
        self.entries.get(connection_id)
    }

    /// Current online set, ordered by display name then connection id.
    pub fn list(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.state
                .display_name
                .cmp(&b.state.display_name)
                .then(a.connection_id.cmp(&b.connection_id))
        });
        entries
    }

    /// Remove entries idle for longer than the timeout and return their ids.
    pub fn evict_stale(&mut self) -> Vec<Uuid> {
        self.evict_stale_at(Instant::now())
    }

    pub fn evict_stale_at(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_stale(now, timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AwarenessTable {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> AwarenessState {
        AwarenessState::new("Alice", "#ff0000")
    }

    #[test]
    fn test_publish_and_list() {
        let mut table = AwarenessTable::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(table.publish(a, 1, alice()));
        assert!(table.publish(b, 1, AwarenessState::new("Bob", "#00ff00")));

        let names: Vec<String> = table.list().into_iter().map(|e| e.state.display_name).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_last_writer_wins_rejects_older_clock() {
        let mut table = AwarenessTable::default();
        let conn = Uuid::new_v4();

        table.publish(conn, 5, alice().with_cursor(10, 10));
        assert!(!table.publish(conn, 3, alice().with_cursor(0, 0)));
        assert_eq!(table.get(&conn).unwrap().state.cursor, Some(CursorRange { anchor: 10, head: 10 }));

        assert!(table.publish(conn, 6, alice().with_cursor(2, 4)));
        assert_eq!(table.get(&conn).unwrap().clock, 6);
    }

    #[test]
    fn test_equal_clock_overwrites() {
        let mut table = AwarenessTable::default();
        let conn = Uuid::new_v4();
        table.publish(conn, 2, alice());
        assert!(table.publish(conn, 2, AwarenessState::new("Alicia", "#ff0000")));
        assert_eq!(table.get(&conn).unwrap().state.display_name, "Alicia");
    }

    #[test]
    fn test_remove_only_that_connection() {
        let mut table = AwarenessTable::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.publish(a, 0, alice());
        table.publish(b, 0, AwarenessState::new("Bob", "#00ff00"));

        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.get(&b).is_some());
    }

    #[test]
    fn test_heartbeat_unknown_connection() {
        let mut table = AwarenessTable::default();
        assert!(!table.heartbeat(Uuid::new_v4()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_evict_stale() {
        let mut table = AwarenessTable::new(Duration::from_secs(30));
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        table.publish(quiet, 0, alice());
        table.publish(chatty, 0, AwarenessState::new("Bob", "#00ff00"));

        // Nothing is stale yet.
        assert!(table.evict_stale().is_empty());

        let later = Instant::now() + Duration::from_secs(31);
        let evicted = table.evict_stale_at(later);
        assert_eq!(evicted.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_entry_alive() {
        let mut table = AwarenessTable::new(Duration::from_millis(40));
        let conn = Uuid::new_v4();
        table.publish(conn, 0, alice());

        std::thread::sleep(Duration::from_millis(25));
        assert!(table.heartbeat(conn));
        std::thread::sleep(Duration::from_millis(25));
        assert!(table.evict_stale().is_empty());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(table.evict_stale(), vec![conn]);
    }

    #[test]
    fn test_color_for_is_stable_hex() {
        let id = Uuid::new_v4();
        let c = color_for(id);
        assert_eq!(c, color_for(id));
        assert_eq!(c.len(), 7);
        assert!(c.starts_with('#'));
        assert!(c[1..].chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_achromatic() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }
}

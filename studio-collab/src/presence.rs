//! Presence tracking: who is in a project, where their pointer is, what
//! they have selected, and whether they are typing.
//!
//! ## Lifecycle
//!
//! ```text
//! user_joined ──► Participant { is_online: true }
//!      │
//!      ├── cursor_moved / selection_changed / user_typing  (mutate in place)
//!      │
//! user_left  ──► Participant { is_online: false }   (retained for last-seen)
//! ```
//!
//! Records are never removed; a participant that left keeps its last
//! cursor and selection so the UI can show "last seen" information.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Pointer position over the review canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            element_id: None,
        }
    }

    pub fn on_element(mut self, element_id: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self
    }
}

/// Selected time range (seconds into the video).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub start: f64,
    pub end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl SelectionRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            element_id: None,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Identity broadcast in `user_joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantProfile {
    pub user_id: String,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// One user in a project, local or remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub color: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    /// Epoch millis of the last event seen from this user
    pub last_seen: u64,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub is_typing: bool,
}

impl Participant {
    pub fn from_profile(profile: &ParticipantProfile, now: u64) -> Self {
        Self {
            id: profile.user_id.clone(),
            name: profile.name.clone(),
            color: profile.color.clone(),
            avatar: profile.avatar.clone(),
            is_online: true,
            last_seen: now,
            cursor: None,
            selection: None,
            is_typing: false,
        }
    }

    fn touch(&mut self, timestamp: u64) {
        self.last_seen = self.last_seen.max(timestamp);
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, visually distinct `#rrggbb` color for a user id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and
/// lightness are fixed for vivid, readable cursors.
pub fn color_for_user(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| {
            (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
    let hue = (hash % 360) as f32 / 360.0;
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
        return (l, l, l); // Achromatic
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
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

/// Participant records for one project, keyed by user id.
///
/// Mutations on unknown users are ignored (only `join` creates a
/// record) and report `false`.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRoster {
    participants: BTreeMap<String, Participant>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a participant from a join announcement.
    pub fn join(&mut self, profile: &ParticipantProfile, timestamp: u64) -> &Participant {
        let participant = self
            .participants
            .entry(profile.user_id.clone())
            .or_insert_with(|| Participant::from_profile(profile, timestamp));
        participant.name = profile.name.clone();
        participant.color = profile.color.clone();
        participant.avatar = profile.avatar.clone();
        participant.is_online = true;
        participant.touch(timestamp);
        participant
    }

    /// Mark a participant offline; the record is retained.
    pub fn leave(&mut self, user_id: &str, timestamp: u64) -> bool {
        self.update(user_id, timestamp, |p| {
            p.is_online = false;
            p.is_typing = false;
        })
    }

    pub fn set_online(&mut self, user_id: &str, online: bool, timestamp: u64) -> bool {
        self.update(user_id, timestamp, |p| p.is_online = online)
    }

    pub fn set_typing(&mut self, user_id: &str, is_typing: bool, timestamp: u64) -> bool {
        self.update(user_id, timestamp, |p| p.is_typing = is_typing)
    }

    pub fn move_cursor(&mut self, user_id: &str, cursor: CursorPosition, timestamp: u64) -> bool {
        self.update(user_id, timestamp, |p| p.cursor = Some(cursor))
    }

    pub fn change_selection(
        &mut self,
        user_id: &str,
        selection: SelectionRange,
        timestamp: u64,
    ) -> bool {
        self.update(user_id, timestamp, |p| p.selection = Some(selection))
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    /// All participants, ordered by user id.
    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_online).count()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn update(&mut self, user_id: &str, timestamp: u64, f: impl FnOnce(&mut Participant)) -> bool {
        match self.participants.get_mut(user_id) {
            Some(participant) => {
                f(participant);
                participant.touch(timestamp);
                true
            }
            None => false,
        }
    }
}

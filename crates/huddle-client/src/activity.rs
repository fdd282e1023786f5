//! Auxiliary room activity: chat, whiteboard, shared note and presence
//! highlights. Everything here is replayed as received; nothing reconciles.

use huddle_common::ConnectionId;
use huddle_common::protocol::{ChatMessage, Stroke};
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct RoomActivity {
    chat: Vec<ChatMessage>,
    strokes: Vec<Stroke>,
    note: String,
    speaker: Option<ConnectionId>,
    board_user: Option<ConnectionId>,
    screen_sharer: Option<ConnectionId>,
}

impl RoomActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chat(&mut self, message: ChatMessage) {
        self.chat.push(message);
    }

    pub fn chat(&self) -> &[ChatMessage] {
        &self.chat
    }

    /// Record a stroke in arrival order, with defaults filled in.
    pub fn apply_stroke(&mut self, stroke: Stroke) -> &Stroke {
        self.strokes.push(stroke.normalized());
        &self.strokes[self.strokes.len() - 1]
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn clear_board(&mut self) {
        self.strokes.clear();
    }

    /// Replace the note. Returns `false` when the html is unchanged.
    pub fn update_note(&mut self, html: &str) -> bool {
        if self.note == html {
            return false;
        }
        self.note = html.to_owned();
        true
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn speaker(&self) -> Option<ConnectionId> {
        self.speaker
    }

    pub fn board_user(&self) -> Option<ConnectionId> {
        self.board_user
    }

    pub fn screen_sharer(&self) -> Option<ConnectionId> {
        self.screen_sharer
    }

    pub fn set_speaking(&mut self, peer: ConnectionId, active: bool) -> bool {
        highlight(&mut self.speaker, peer, active)
    }

    pub fn set_board_active(&mut self, peer: ConnectionId, active: bool) -> bool {
        highlight(&mut self.board_user, peer, active)
    }

    pub fn set_screen_sharing(&mut self, peer: ConnectionId, active: bool) -> bool {
        highlight(&mut self.screen_sharer, peer, active)
    }

    /// Drop highlights held by peers no longer in the room.
    pub fn retain_present(&mut self, present: &HashSet<ConnectionId>) {
        for slot in [&mut self.speaker, &mut self.board_user, &mut self.screen_sharer] {
            if slot.is_some_and(|id| !present.contains(&id)) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Single-holder highlight: `active` takes the slot; `!active` releases it
/// only if `peer` holds it. Returns whether the slot changed.
fn highlight(slot: &mut Option<ConnectionId>, peer: ConnectionId, active: bool) -> bool {
    let next = match (active, *slot) {
        (true, _) => Some(peer),
        (false, Some(holder)) if holder == peer => None,
        (false, current) => current,
    };
    let changed = next != *slot;
    *slot = next;
    changed
}

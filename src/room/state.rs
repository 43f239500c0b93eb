use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{ParticipantId, RoomId};

/// Room-level topology, fixed when the meeting is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    #[default]
    Mesh,
    Delegated,
}

impl std::str::FromStr for TopologyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mesh" | "p2p" => Ok(TopologyMode::Mesh),
            "delegated" | "sfu" => Ok(TopologyMode::Delegated),
            other => Err(format!("unknown topology mode: {other}")),
        }
    }
}

/// Capability flags enforced by the UI, carried verbatim by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub allow_participant_mic: bool,
    pub allow_participant_screen: bool,
    pub allow_participant_chat: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            allow_participant_mic: true,
            allow_participant_screen: true,
            allow_participant_chat: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveView {
    #[default]
    Video,
    Whiteboard,
    Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: RoomId,
    pub creator_id: ParticipantId,
    pub mode: TopologyMode,
    pub settings: RoomSettings,
    pub active_view: ActiveView,
    /// Whiteboard and code blobs, never interpreted here.
    #[serde(default)]
    pub shared_state: BTreeMap<String, Value>,
}

impl RoomRecord {
    pub fn new(id: RoomId, creator_id: ParticipantId, mode: TopologyMode) -> Self {
        Self {
            id,
            creator_id,
            mode,
            settings: RoomSettings::default(),
            active_view: ActiveView::default(),
            shared_state: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Regular,
    Admin,
}

/// One roster entry per participant per room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub display_name: String,
    pub role: Role,
    pub mic_on: bool,
    pub camera_on: bool,
    pub screen_sharing: bool,
    pub mic_allowed: bool,
    pub video_allowed: bool,
    pub screen_share_allowed: bool,
    #[serde(default)]
    pub force_muted: bool,
    #[serde(default)]
    pub removed: bool,
}

impl ParticipantRecord {
    pub fn new(id: ParticipantId, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role,
            mic_on: false,
            camera_on: false,
            screen_sharing: false,
            mic_allowed: true,
            video_allowed: true,
            screen_share_allowed: true,
            force_muted: false,
            removed: false,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Present in the roster and not kicked out.
    pub fn is_active(&self) -> bool {
        !self.removed
    }
}

/// Permission change applied by an elevated participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "permission", content = "allowed", rename_all = "camelCase")]
pub enum PermissionUpdate {
    Mic(bool),
    Video(bool),
    ScreenShare(bool),
}

impl PermissionUpdate {
    /// Applies the change. Revoking mic or video also switches it off.
    pub fn apply(self, record: &mut ParticipantRecord) {
        match self {
            PermissionUpdate::Mic(allowed) => {
                record.mic_allowed = allowed;
                if !allowed {
                    record.mic_on = false;
                }
            }
            PermissionUpdate::Video(allowed) => {
                record.video_allowed = allowed;
                if !allowed {
                    record.camera_on = false;
                }
            }
            PermissionUpdate::ScreenShare(allowed) => {
                record.screen_share_allowed = allowed;
            }
        }
    }
}

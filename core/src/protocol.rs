use serde::{Deserialize, Serialize};

/// Bumped whenever the wire format changes incompatibly. Peers with
/// different versions refuse to authenticate.
pub const PROTOCOL_VERSION: i32 = 1;

/// Control messages exchanged between session peers.
///
/// Every variant carries a stable `msg_type` discriminator on the wire.
/// Unknown discriminators fail to decode; unknown fields inside a known
/// variant are ignored so newer peers can add fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum GameMessage {
    #[serde(rename = "playback_command", rename_all = "camelCase")]
    PlaybackCommand {
        #[serde(rename = "type")]
        command: PlaybackCommandType,
        #[serde(default = "default_video_index")]
        video_index: i32,
        #[serde(default = "default_playback_position")]
        playback_position: i64,
        #[serde(default = "default_play_when_ready")]
        play_when_ready: bool,
    },

    #[serde(rename = "playback_state", rename_all = "camelCase")]
    PlaybackState {
        video_index: i32,
        playback_position: i64,
        play_when_ready: bool,
    },

    #[serde(rename = "advanced_command")]
    AdvancedCommand {
        #[serde(rename = "type")]
        command: AdvancedCommandType,
    },

    #[serde(rename = "password_challenge")]
    PasswordChallenge(PasswordChallenge),

    /// Joining peer's answer to a challenge: hex SHA-256 of password ‖ nonce.
    #[serde(rename = "password", rename_all = "camelCase")]
    Password { password_hash: String },

    #[serde(rename = "password_response")]
    PasswordResponse { success: bool },

    /// Announces that `sender_address` wants to push a file to
    /// `target_address`, which should dial back on `port`.
    #[serde(rename = "file_transfer_request", rename_all = "camelCase")]
    FileTransferRequest {
        file_name: String,
        port: u16,
        sender_address: String,
        target_address: String,
    },

    #[serde(rename = "video_list")]
    VideoList { videos: Vec<VideoItem> },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        timestamp: i64,
    },

    #[serde(rename = "game_state_snapshot")]
    GameStateSnapshot(GameStateSnapshot),
}

impl GameMessage {
    /// Heartbeat stamped with the current wall clock.
    pub fn heartbeat() -> Self {
        GameMessage::Heartbeat {
            timestamp: current_unix_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackCommandType {
    PlayPause,
    Next,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvancedCommandType {
    TurnOffScreen,
    DeactivateTorch,
}

/// Nonce challenge the listener sends to every freshly accepted peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChallenge {
    pub nonce: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
}

/// One playlist entry. The URI stays a string on the wire; resolving it
/// is the player's problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoItem {
    #[serde(rename = "uriString")]
    pub uri: String,
    pub title: String,
}

/// Full session state, both broadcast to peers and persisted to disk for
/// resume-after-kill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateSnapshot {
    pub video_list: Vec<VideoItem>,
    pub current_video_index: i32,
    pub playback_position: i64,
    pub is_playing: bool,
    pub player_addresses: Vec<String>,
    pub game_master_address: String,
    pub timestamp: i64,
}

pub fn current_unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as i64)
        .unwrap_or(0)
}

fn default_video_index() -> i32 {
    -1
}

fn default_playback_position() -> i64 {
    -1
}

fn default_play_when_ready() -> bool {
    true
}

fn default_protocol_version() -> i32 {
    PROTOCOL_VERSION
}

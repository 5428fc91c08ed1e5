//! Game-facing protocol: binary message codec plus the single-client TCP
//! server the local game connects to.

pub mod message;
pub mod server;

pub use message::{Chunk, GpgNetMessage};
pub use server::GpgNetServer;

/// Game lifecycle as reported over the game-facing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    None,
    Idle,
    Lobby,
    Launching,
    Ended,
}

impl GameState {
    pub fn name(&self) -> &'static str {
        match self {
            GameState::None => "None",
            GameState::Idle => "Idle",
            GameState::Lobby => "Lobby",
            GameState::Launching => "Launching",
            GameState::Ended => "Ended",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "None" => Some(GameState::None),
            "Idle" => Some(GameState::Idle),
            "Lobby" => Some(GameState::Lobby),
            "Launching" => Some(GameState::Launching),
            "Ended" => Some(GameState::Ended),
            _ => None,
        }
    }
}

/// Whether the game shows a lobby screen or proceeds directly.
/// Set by the orchestrator, transmitted to the game in CreateLobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyInitMode {
    Normal,
    Auto,
}

impl LobbyInitMode {
    pub fn name(&self) -> &'static str {
        match self {
            LobbyInitMode::Normal => "normal",
            LobbyInitMode::Auto => "auto",
        }
    }

    /// Numeric id carried in the CreateLobby command.
    pub fn id(&self) -> i32 {
        match self {
            LobbyInitMode::Normal => 0,
            LobbyInitMode::Auto => 1,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(LobbyInitMode::Normal),
            "auto" => Some(LobbyInitMode::Auto),
            _ => None,
        }
    }
}

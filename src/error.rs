//! Error types shared by the manifest model, tracker and peer services

use thiserror::Error;

/// Main error type for Lynx operations
#[derive(Error, Debug)]
pub enum LynxError {
    /// Malformed request line (wrong field count, unknown verb, bad port)
    #[error("protocol syntax error: {0}")]
    ProtocolSyntax(String),

    /// Manifest, roster, lynk or requested file is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// File or lynk is already registered
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Dial, read or write failure talking to a peer or tracker
    #[error("transport error: {0}")]
    Transport(String),

    /// Sealing/opening failed (wrong key, tampered body, bad key encoding)
    #[error("crypto error: {0}")]
    Crypto(String),

    /// `meta.info` / `swarm.info` content could not be parsed
    #[error("format error: {0}")]
    Format(String),

    /// Every peer in the roster was tried and none served the file
    #[error("could not retrieve {lynk}/{file} from any peer")]
    FileNotAvailable { lynk: String, file: String },

    /// A download was cancelled through the lynk's downloading flag
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LynxError {
    /// Errors a fetch walk recovers from by moving on to the next peer
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LynxError::Transport(_)
                | LynxError::NotFound(_)
                | LynxError::Crypto(_)
                | LynxError::Format(_)
                | LynxError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LynxError>;

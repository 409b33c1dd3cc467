use thiserror::Error;

use crate::ubx::Error as UbxError;

/// Assistance upload phase, used to qualify upload failures
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UploadPhase {
    Open,
    Decode,
    Encode,
    Write,
}

impl std::fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "opening mga offline file"),
            Self::Decode => write!(f, "decoding mga offline file"),
            Self::Encode => write!(f, "encoding ano message"),
            Self::Write => write!(f, "writing to stream"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decoding error: {0}")]
    Decode(#[from] UbxError),

    #[error("invalid fix type #{0}")]
    InvalidFixType(u8),

    #[error("database not initialized")]
    SinkNotInitialized,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("system time error: {0}")]
    Time(#[from] hifitime::HifitimeError),

    #[error("database handle poisoned")]
    LockPoisoned,

    #[error("{phase}: {source}")]
    Upload {
        phase: UploadPhase,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid ano record date {year:02}-{month:02}-{day:02}")]
    InvalidRecordDate { year: u8, month: u8, day: u8 },

    #[error("read-only interface cannot be written to")]
    ReadOnlyInterface,

    #[error("no acknowledgment received for {class:02x}-{id:02x}")]
    AckTimeout { class: u8, id: u8 },

    #[error("receiver rejected {class:02x}-{id:02x}")]
    Nack { class: u8, id: u8 },

    #[error("{0} task aborted")]
    TaskAborted(&'static str),
}

impl Error {
    /// Qualifies this error with the upload phase it occurred in
    pub fn during(self, phase: UploadPhase) -> Self {
        Self::Upload {
            phase,
            source: Box::new(self),
        }
    }
}

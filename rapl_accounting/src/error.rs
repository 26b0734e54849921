use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A hardware counter could not be opened. Recoverable: the scope runs
    /// without cycle accounting.
    #[error("cycle counter unavailable for {scope} (perf_event_paranoid = {paranoid}): {source}")]
    CounterUnavailable {
        scope: String,
        paranoid: String,
        #[source]
        source: io::Error,
    },

    /// A monitored entity disappeared between two polls.
    #[error("{id} terminated: cannot read {}", path.display())]
    EntityTerminated {
        id: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cgroup scope {} could not be set up: {source}", path.display())]
    ScopeSetup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cgroup scope statistics unavailable: cannot read {}", path.display())]
    ScopeRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry is full ({capacity} entities), rejecting {id}")]
    RegistryFull { id: String, capacity: usize },

    #[error("invalid calibration file {}: {reason}", path.display())]
    Calibration { path: PathBuf, reason: String },

    #[error("failed to parse {what}: '{content}'")]
    Parse { what: String, content: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Error::EntityTerminated { .. })
    }

    pub(crate) fn parse(what: impl Into<String>, content: impl Into<String>) -> Error {
        Error::Parse {
            what: what.into(),
            content: content.into(),
        }
    }
}

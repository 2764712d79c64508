use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The backing file could not be created, resized or mapped.
    #[error("failed to open tracking store {path:?}: {source}")]
    StoreCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A reader found a file that is not a tracking store of this layout.
    #[error("{path:?} is not a tracking store with the expected layout")]
    LayoutMismatch { path: PathBuf },

    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),

    #[error("capture device lost: {0}")]
    DeviceLost(String),

    /// Malformed input handed to the tracker or to discovery.
    #[error("tracking precondition violated: {0}")]
    TrackingPrecondition(String),
}

impl Error {
    pub fn store(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StoreCreationFailed {
            path: path.into(),
            source,
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::TrackingPrecondition(msg.into())
    }
}

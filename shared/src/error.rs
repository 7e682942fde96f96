//! Error type shared by every prediction component

use crate::physics::BodyHandle;
use crate::state_manager::ModelId;
use crate::tick::Tick;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// The autonomous proxy was asked to replay a tick it never buffered input for.
    #[error("no buffered input for tick {tick}")]
    MissingInput { tick: Tick },

    /// Reconciliation looked up a tick that already fell out of the state history.
    #[error("tick {tick} is not in the state history")]
    HistoryMiss { tick: Tick },

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown physics body {0:?}")]
    UnknownBody(BodyHandle),

    #[error("model {0:?} is not registered")]
    ModelNotRegistered(ModelId),
}

impl From<bincode::Error> for SimError {
    fn from(err: bincode::Error) -> Self {
        SimError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

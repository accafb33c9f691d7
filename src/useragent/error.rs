use super::state::{CallState, Operation};
use thiserror::Error;

/// Errors raised synchronously by user agent commands.
///
/// Transport-driven outcomes (rejected registrations, lost connections)
/// are never reported through this type; they arrive as events.
#[derive(Debug, Error)]
pub enum VoipError {
    #[error("invalid state {state} for {operation}")]
    InvalidState {
        state: CallState,
        operation: &'static str,
    },

    #[error("operation {operation} already in progress")]
    OperationInProgress { operation: Operation },

    #[error("no active session")]
    NoSession,

    #[error("session is not an inbound invitation")]
    NotInbound,

    #[error("caller info requested outside of an inbound call")]
    NoCallerInfo,

    #[error("remote media stream undefined")]
    RemoteMediaUndefined,

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl VoipError {
    pub(crate) fn invalid_state(state: CallState, operation: &'static str) -> Self {
        VoipError::InvalidState { state, operation }
    }
}

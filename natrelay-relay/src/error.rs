use crate::backend::BackendError;
use crate::state::RelayState;
use natrelay_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay was already started")]
    AlreadyStarted,
    #[error("relay is not open (state: {0})")]
    NotOpen(RelayState),
    #[error("relay is recovering its backend")]
    Recovering,
    #[error("relay is closing")]
    Closing,
    #[error("backend write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

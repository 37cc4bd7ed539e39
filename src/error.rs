use thiserror::Error;

use crate::config::ConfigError;
use crate::cpo::CpoError;
use crate::crypto::CryptoError;
use crate::message::MessageError;
use crate::po::PoError;

/// Crate-level convenience error: a thin wrapper over the per-concern
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Po(#[from] PoError),

    #[error(transparent)]
    Cpo(#[from] CpoError),
}

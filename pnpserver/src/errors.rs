//! Erreurs du miniserver.

use thiserror::Error;

use pnpnet::{AdapterError, SocketError};

use crate::miniserver::MiniServerState;

/// Erreur de démarrage ou d'exploitation du miniserver.
///
/// La dissymétrie voulue : l'échec de liaison d'un socket HTTP est fatal au
/// démarrage, l'échec d'adhésion multicast sur *un* adaptateur est journalisé
/// et l'adaptateur ignoré (les hôtes multi-interfaces ne doivent pas refuser
/// de démarrer pour une interface indisponible).
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("miniserver start failed: {0}")]
    StartFailed(String),

    #[error("no free HTTP port in {first}..={last}")]
    PortProbeExhausted { first: u16, last: u16 },

    #[error("operation invalid in state {0:?}")]
    InvalidState(MiniServerState),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("configuration error: {0}")]
    Config(String),

    #[cfg(feature = "tls")]
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

//! Erreurs de la couche réseau.
//!
//! Chaque composant expose son propre enum d'erreur ; les erreurs d'appels
//! système conservent le `std::io::Error` d'origine (et donc le code errno)
//! pour le diagnostic.

use std::time::Duration;

use thiserror::Error;

use crate::addr::SockAddress;

/// Erreur de format d'une adresse textuelle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrFormatError {
    #[error("invalid address literal: '{0}'")]
    InvalidHost(String),

    #[error("invalid port: '{0}' (expected 1-5 decimal digits <= 65535)")]
    InvalidPort(String),
}

/// Erreur d'énumération des interfaces réseau.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("adapter query failed: {0}")]
    QueryFailed(#[from] std::io::Error),

    #[error("non-contiguous netmask: {0}")]
    InvalidNetmask(String),

    #[error("prefix length {prefix} out of range for {family}")]
    InvalidPrefix { prefix: u8, family: &'static str },
}

/// Erreur de résolution de nom.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("lookup of '{host}' failed: {source}")]
    LookupFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' did not resolve to any address")]
    NoAddress(String),
}

/// Erreur d'une opération socket.
///
/// Les variantes portant un `std::io::Error` exposent le code d'erreur OS
/// via `source` ; aucune erreur n'est avalée silencieusement.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("socket creation failed: {0}")]
    CreateFailed(#[source] std::io::Error),

    #[error("bind to {addr} failed: {source}")]
    BindFailed {
        addr: SockAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("listen failed: {0}")]
    ListenFailed(#[source] std::io::Error),

    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: SockAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out after {1:?}")]
    ConnectTimeout(SockAddress, Duration),

    #[error("socket is not bound")]
    NotBound,

    #[error("socket is not listening")]
    NotListening,

    #[error("operation invalid for this socket kind or state")]
    InvalidState,

    #[error("socket is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SocketError {
    /// Code d'erreur OS d'origine, si l'erreur en porte un.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            SocketError::CreateFailed(e)
            | SocketError::ListenFailed(e)
            | SocketError::AcceptFailed(e)
            | SocketError::Io(e) => e.raw_os_error(),
            SocketError::BindFailed { source, .. } | SocketError::ConnectFailed { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

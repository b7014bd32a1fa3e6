//! # pnpserver - Miniserver UPnP de PnPStack
//!
//! Ce crate implémente le cœur réseau d'une pile UPnP : le *miniserver* qui
//! lie les sockets d'écoute (HTTP et SSDP, IPv4/IPv6, TLS en option), les
//! multiplexe dans une boucle unique et remet connexions et datagrammes aux
//! couches protocolaires.
//!
//! ## Fonctionnalités
//!
//! - ✅ [`MiniServer`] : liaison des sockets, sondage de port borné, boucle
//!   de répartition, arrêt propre et idempotent
//! - ✅ [`Webserver`] : service de documents statiques + routage des requêtes
//!   SOAP/GENA vers des callbacks externes
//! - ✅ [`SsdpReply`] : sockets de réponse unicast pour les M-SEARCH
//! - ✅ [`ServerConfig`] : configuration YAML typée avec surcharges
//!   d'environnement
//!
//! ## Architecture
//!
//! Les contenus des messages SOAP/GENA/SSDP ne sont *pas* interprétés ici :
//! le miniserver transporte, les callbacks (trait [`UpnpCallbacks`])
//! interprètent. Toutes les dépendances au système passent par des objets
//! injectés à la construction ([`pnpnet::AdapterSource`], [`JobSink`]), ce
//! qui permet de faire tourner plusieurs instances indépendantes dans les
//! tests.

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod httpmsg;
pub mod miniserver;
pub mod ssdp;
pub mod webserver;

#[cfg(feature = "tls")]
pub mod tls;

pub use config::{ServerConfig, DEFAULT_HTTP_PORT, PORT_PROBE_RANGE};
pub use dispatch::{JobSink, NullCallbacks, TokioJobs, UpnpCallbacks};
pub use errors::ServerError;
pub use httpmsg::{HttpRequest, HttpResponse, Method};
pub use miniserver::{MiniServer, MiniServerHandle, MiniServerState};
pub use ssdp::{SsdpPacket, SsdpReply, SsdpScope};
pub use webserver::Webserver;

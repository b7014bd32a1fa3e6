//! # pnpnet - Couche réseau de PnPStack
//!
//! Ce crate fournit l'abstraction socket/adresse commune à toutes les couches
//! protocolaires UPnP (SSDP, GENA, SOAP, téléchargement HTTP). Il ne contient
//! aucune logique protocolaire : uniquement les adresses, les interfaces
//! réseau, la résolution de noms et les sockets.
//!
//! ## Fonctionnalités
//!
//! - ✅ [`SockAddress`] : valeur d'adresse {non spécifiée, IPv4, IPv6} + port
//! - ✅ [`AdapterScan`] : énumération des interfaces réseau locales
//! - ✅ [`Resolver`] : résolution de noms substituable pour les tests
//! - ✅ [`Socket`] : propriétaire exclusif d'un descripteur socket
//!
//! ## Architecture
//!
//! Les dépendances vers le système d'exploitation passent par des traits
//! ([`AdapterSource`], [`Resolver`]) injectés à la construction, ce qui rend
//! chaque composant testable sans réseau réel.

pub mod addr;
pub mod adapter;
pub mod errors;
pub mod resolver;
pub mod socket;

pub use addr::{AddrFamily, SockAddress};
pub use adapter::{
    guess_local_ip, interface_index, netmask_from_prefix, prefix_from_netmask, AdapterScan,
    AdapterSource, NetworkAdapter, SystemAdapters,
};
pub use errors::{AdapterError, AddrFormatError, ResolveError, SocketError};
pub use resolver::{Resolver, StaticResolver, SystemResolver};
pub use socket::{Socket, SocketKind};

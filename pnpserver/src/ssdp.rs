//! Transport SSDP du miniserver.
//!
//! Seul le *transport* vit ici : adresses de groupe, datagrammes bruts et
//! sockets de réponse unicast. L'interprétation des messages (NOTIFY,
//! M-SEARCH, réponses) appartient à la couche SSDP externe, branchée via
//! [`crate::dispatch::UpnpCallbacks::on_ssdp`].

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use pnpnet::{AddrFamily, SockAddress, Socket, SocketError};

/// Port multicast SSDP.
pub const SSDP_PORT: u16 = 1900;

/// Groupe multicast SSDP IPv4.
pub const SSDP_MCAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Groupe multicast SSDP IPv6 lien-local (FF02::C).
pub const SSDP_MCAST_V6_LINK: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

/// Groupe multicast SSDP IPv6 site-local (FF05::C).
pub const SSDP_MCAST_V6_SITE: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);

/// Taille maximale d'un datagramme SSDP accepté.
pub const SSDP_DATAGRAM_MAX: usize = 8192;

/// Portée du socket sur lequel un datagramme est arrivé.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdpScope {
    V4,
    V6LinkLocal,
    V6SiteLocal,
}

/// Datagramme SSDP brut remis au callback.
#[derive(Debug, Clone)]
pub struct SsdpPacket {
    pub data: Vec<u8>,
    pub from: SockAddress,
    pub scope: SsdpScope,
}

/// Sockets de réponse unicast (ports éphémères, une par famille).
///
/// Les réponses aux M-SEARCH partent d'ici et non du socket multicast lié
/// au port 1900, pour ne pas disputer les datagrammes au récepteur.
#[derive(Debug)]
pub struct SsdpReply {
    v4: Option<Arc<Socket>>,
    v6: Option<Arc<Socket>>,
}

impl SsdpReply {
    pub(crate) fn new(v4: Option<Arc<Socket>>, v6: Option<Arc<Socket>>) -> Self {
        Self { v4, v6 }
    }

    /// Paire vide : tout envoi échoue. Utile quand SSDP est désactivé.
    pub fn disabled() -> Self {
        Self { v4: None, v6: None }
    }

    /// Émet une réponse unicast vers `to`, via le socket de la bonne famille.
    pub async fn send_to(&self, data: &[u8], to: SockAddress) -> Result<usize, SocketError> {
        let sock = match to.family() {
            Some(AddrFamily::V4) => self.v4.as_ref(),
            Some(AddrFamily::V6) => self.v6.as_ref(),
            None => None,
        };
        match sock {
            Some(sock) => sock.send_to(data, to).await,
            None => Err(SocketError::InvalidState),
        }
    }
}

//! Construction du tableau de sockets du miniserver.
//!
//! Un emplacement par rôle d'écoute : HTTP IPv4/IPv6, récepteurs SSDP
//! (IPv4, IPv6 lien-local, IPv6 site-local) et sockets de réponse unicast.
//! Chaque emplacement vaut `None` ou contient exactement un socket lié ;
//! le tableau est construit une fois au démarrage et fermé une fois à
//! l'arrêt.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use tracing::{debug, info, warn};

use pnpnet::{AdapterScan, AddrFamily, SockAddress, Socket, SocketError, SocketKind};

use crate::config::{ServerConfig, DEFAULT_BACKLOG, PORT_PROBE_RANGE};
use crate::errors::ServerError;
use crate::ssdp::{SSDP_MCAST_V4, SSDP_MCAST_V6_LINK, SSDP_MCAST_V6_SITE};

/// Tableau des sockets d'écoute du miniserver.
#[derive(Debug)]
pub(crate) struct MiniServerSockArray {
    pub http_v4: Option<Socket>,
    pub http_v6: Option<Socket>,
    pub ssdp_v4: Option<Socket>,
    pub ssdp_v6_link: Option<Socket>,
    pub ssdp_v6_site: Option<Socket>,
    pub ssdp_reply_v4: Option<Arc<Socket>>,
    pub ssdp_reply_v6: Option<Arc<Socket>>,
}

impl MiniServerSockArray {
    /// Ferme chaque emplacement exactement une fois.
    pub fn close_all(&mut self) {
        for sock in [
            self.http_v4.take(),
            self.http_v6.take(),
            self.ssdp_v4.take(),
            self.ssdp_v6_link.take(),
            self.ssdp_v6_site.take(),
        ]
        .into_iter()
        .flatten()
        {
            sock.close();
        }
        for sock in [self.ssdp_reply_v4.take(), self.ssdp_reply_v6.take()]
            .into_iter()
            .flatten()
        {
            sock.close();
        }
    }

    /// Port effectif du récepteur SSDP IPv4 (0 si SSDP est désactivé).
    pub fn ssdp_port(&self) -> u16 {
        self.ssdp_v4
            .as_ref()
            .map(|s| s.local_addr().port())
            .unwrap_or(0)
    }
}

fn bind_listener(addr: SockAddress) -> Result<Socket, SocketError> {
    let sock = Socket::bind(SocketKind::Stream, Some(addr))?;
    sock.listen(DEFAULT_BACKLOG)?;
    Ok(sock)
}

fn is_addr_in_use(e: &SocketError) -> bool {
    matches!(e, SocketError::BindFailed { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
}

/// Adresse de liaison HTTP IPv4 selon la configuration.
fn http_bind_host_v4(config: &ServerConfig, scan: &AdapterScan) -> Result<SockAddress, ServerError> {
    if config.loopback_only {
        return Ok(SockAddress::loopback(AddrFamily::V4));
    }
    if let Some(name) = &config.interface {
        return scan
            .valid_adapters()
            .find(|a| &a.name == name && a.family() == Some(AddrFamily::V4))
            .map(|a| a.addr)
            .ok_or_else(|| {
                ServerError::StartFailed(format!("interface '{name}' has no usable IPv4 address"))
            });
    }
    Ok(SockAddress::any(AddrFamily::V4))
}

/// Adresse de liaison HTTP IPv6 : loopback en mode local, sinon toutes les
/// interfaces (la sélection fine d'interface IPv6 passe par le routage).
fn http_bind_host_v6(config: &ServerConfig) -> SockAddress {
    if config.loopback_only {
        SockAddress::loopback(AddrFamily::V6)
    } else {
        SockAddress::any(AddrFamily::V6)
    }
}

/// Lie les sockets d'écoute HTTP.
///
/// Port préféré puis sondage borné vers le haut ([`PORT_PROBE_RANGE`]
/// candidats) sur collision. Quand IPv6 est activé, les deux familles
/// doivent se lier *sur le même numéro de port* ; l'échec d'une famille
/// activée (hors collision) est fatal. Port 0 = port éphémère.
pub(crate) fn build_http_listeners(
    config: &ServerConfig,
    scan: &AdapterScan,
) -> Result<(Option<Socket>, Option<Socket>, u16), ServerError> {
    let v4_host = http_bind_host_v4(config, scan)?;
    let v6_host = config.enable_ipv6.then(|| http_bind_host_v6(config));

    if config.http_port == 0 {
        // Port éphémère : l'OS choisit pour IPv4, IPv6 doit s'aligner.
        for _ in 0..PORT_PROBE_RANGE {
            let v4 = bind_listener(v4_host.with_port(0))?;
            let port = v4.local_addr().port();
            let Some(v6_host) = &v6_host else {
                return Ok((Some(v4), None, port));
            };
            match bind_listener(v6_host.with_port(port)) {
                Ok(v6) => return Ok((Some(v4), Some(v6), port)),
                Err(e) if is_addr_in_use(&e) => {
                    v4.close();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServerError::StartFailed(
            "could not align an ephemeral HTTP port across IPv4 and IPv6".to_string(),
        ))
    } else {
        let first = config.http_port;
        let last = first.saturating_add(PORT_PROBE_RANGE - 1);
        for port in first..=last {
            let v4 = match bind_listener(v4_host.with_port(port)) {
                Ok(sock) => sock,
                Err(e) if is_addr_in_use(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(v6_host) = &v6_host else {
                if port != first {
                    info!("HTTP port {} busy, bound {} instead", first, port);
                }
                return Ok((Some(v4), None, port));
            };
            match bind_listener(v6_host.with_port(port)) {
                Ok(v6) => {
                    if port != first {
                        info!("HTTP port {} busy, bound {} instead", first, port);
                    }
                    return Ok((Some(v4), Some(v6), port));
                }
                Err(e) if is_addr_in_use(&e) => {
                    v4.close();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServerError::PortProbeExhausted { first, last })
    }
}

/// Sockets SSDP prêts à l'emploi (None partout si SSDP est désactivé).
pub(crate) struct SsdpSockets {
    pub recv_v4: Option<Socket>,
    pub recv_v6_link: Option<Socket>,
    pub recv_v6_site: Option<Socket>,
    pub reply_v4: Option<Arc<Socket>>,
    pub reply_v6: Option<Arc<Socket>>,
}

impl SsdpSockets {
    fn disabled() -> Self {
        Self {
            recv_v4: None,
            recv_v6_link: None,
            recv_v6_site: None,
            reply_v4: None,
            reply_v6: None,
        }
    }
}

/// Construit les sockets SSDP et rejoint les groupes multicast.
///
/// Le récepteur IPv4 est obligatoire (échec fatal) ; tout le reste est au
/// mieux : une adhésion multicast qui échoue sur un adaptateur est
/// journalisée et l'adaptateur ignoré.
pub(crate) fn build_ssdp_sockets(
    config: &ServerConfig,
    scan: &AdapterScan,
) -> Result<SsdpSockets, ServerError> {
    if !config.enable_ssdp {
        return Ok(SsdpSockets::disabled());
    }

    let recv_v4 = Socket::bind_with(
        SocketKind::Datagram,
        Some(SockAddress::any(AddrFamily::V4).with_port(config.ssdp_port)),
        true,
    )?;

    let mut joined = 0usize;
    for adapter in scan.valid_adapters() {
        let Some(std::net::IpAddr::V4(ip)) = adapter.addr.ip() else {
            continue;
        };
        if ip.is_loopback() {
            continue;
        }
        match recv_v4.join_multicast_v4(SSDP_MCAST_V4, ip) {
            Ok(()) => {
                joined += 1;
                debug!("SSDP: joined {} on {} ({})", SSDP_MCAST_V4, ip, adapter.name);
            }
            Err(e) => {
                warn!(
                    "SSDP: failed to join {} on {} ({}), skipping adapter: {}",
                    SSDP_MCAST_V4, ip, adapter.name, e
                );
            }
        }
    }
    info!(
        "✅ SSDP IPv4 receiver on port {} ({} multicast membership(s))",
        recv_v4.local_addr().port(),
        joined
    );

    let reply_v4 = Arc::new(Socket::bind(
        SocketKind::Datagram,
        Some(SockAddress::any(AddrFamily::V4)),
    )?);

    let (recv_v6_link, recv_v6_site, reply_v6) = if config.enable_ipv6 {
        build_ssdp_v6(config, scan)
    } else {
        (None, None, None)
    };

    Ok(SsdpSockets {
        recv_v4: Some(recv_v4),
        recv_v6_link,
        recv_v6_site,
        reply_v4: Some(reply_v4),
        reply_v6,
    })
}

/// Partie IPv6 des sockets SSDP, entièrement au mieux : un hôte sans IPv6
/// fonctionnel reste opérationnel en IPv4 seul.
fn build_ssdp_v6(
    config: &ServerConfig,
    scan: &AdapterScan,
) -> (Option<Socket>, Option<Socket>, Option<Arc<Socket>>) {
    // Indices d'interfaces à joindre, dédupliqués (une interface peut porter
    // plusieurs adresses IPv6).
    let indexes: HashSet<u32> = scan
        .valid_adapters()
        .filter(|a| a.family() == Some(AddrFamily::V6) && !a.loopback)
        .map(|a| a.index)
        .collect();

    let bind_and_join = |group: &std::net::Ipv6Addr, label: &str| -> Option<Socket> {
        let sock = match Socket::bind_with(
            SocketKind::Datagram,
            Some(SockAddress::any(AddrFamily::V6).with_port(config.ssdp_port)),
            true,
        ) {
            Ok(sock) => sock,
            Err(e) => {
                warn!("SSDP: cannot bind IPv6 {} receiver: {}", label, e);
                return None;
            }
        };
        let mut joined = 0usize;
        for index in &indexes {
            match sock.join_multicast_v6(group, *index) {
                Ok(()) => {
                    joined += 1;
                    debug!("SSDP: joined {} on interface index {}", group, index);
                }
                Err(e) => {
                    warn!(
                        "SSDP: failed to join {} on interface index {}, skipping: {}",
                        group, index, e
                    );
                }
            }
        }
        info!(
            "✅ SSDP IPv6 {} receiver on port {} ({} membership(s))",
            label,
            sock.local_addr().port(),
            joined
        );
        Some(sock)
    };

    let link = bind_and_join(&SSDP_MCAST_V6_LINK, "link-local");
    let site = bind_and_join(&SSDP_MCAST_V6_SITE, "site-local");

    let reply = match Socket::bind(SocketKind::Datagram, Some(SockAddress::any(AddrFamily::V6))) {
        Ok(sock) => Some(Arc::new(sock)),
        Err(e) => {
            warn!("SSDP: cannot bind IPv6 reply socket: {}", e);
            None
        }
    };

    (link, site, reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(port: u16) -> ServerConfig {
        ServerConfig {
            http_port: port,
            loopback_only: true,
            enable_ssdp: false,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn ephemeral_port_is_reported() {
        let scan = AdapterScan::new();
        let (v4, v6, port) = build_http_listeners(&loopback_config(0), &scan).unwrap();
        assert!(v4.is_some());
        assert!(v6.is_none());
        assert!(port > 0);
        assert_eq!(v4.unwrap().local_addr().port(), port);
    }

    #[tokio::test]
    async fn occupied_port_is_probed_upward() {
        let scan = AdapterScan::new();

        // On occupe un port éphémère, puis on le demande comme port préféré.
        let (occupant, _, taken) = build_http_listeners(&loopback_config(0), &scan).unwrap();
        let (v4, _, bound) = build_http_listeners(&loopback_config(taken), &scan).unwrap();

        assert!(bound > taken);
        assert!(bound <= taken.saturating_add(PORT_PROBE_RANGE - 1));
        assert!(v4.is_some());
        occupant.unwrap().close();
    }

    #[tokio::test]
    async fn disabled_ssdp_builds_no_socket() {
        let scan = AdapterScan::new();
        let sockets = build_ssdp_sockets(&loopback_config(0), &scan).unwrap();
        assert!(sockets.recv_v4.is_none());
        assert!(sockets.reply_v4.is_none());
    }

    #[tokio::test]
    async fn ssdp_sockets_bind_on_an_ephemeral_test_port() {
        let scan = AdapterScan::new(); // aucune interface : aucune adhésion
        let config = ServerConfig {
            ssdp_port: 0,
            loopback_only: true,
            ..ServerConfig::default()
        };
        let sockets = build_ssdp_sockets(&config, &scan).unwrap();
        let recv = sockets.recv_v4.unwrap();
        assert!(recv.local_addr().port() > 0);
        assert!(sockets.reply_v4.is_some());
        // IPv6 désactivé par défaut
        assert!(sockets.recv_v6_link.is_none());
    }

    #[tokio::test]
    async fn close_all_is_single_shot() {
        let scan = AdapterScan::new();
        let (v4, v6, _) = build_http_listeners(&loopback_config(0), &scan).unwrap();
        let mut array = MiniServerSockArray {
            http_v4: v4,
            http_v6: v6,
            ssdp_v4: None,
            ssdp_v6_link: None,
            ssdp_v6_site: None,
            ssdp_reply_v4: None,
            ssdp_reply_v6: None,
        };
        array.close_all();
        assert!(array.http_v4.is_none());
        // un second passage ne trouve plus rien à fermer
        array.close_all();
    }
}

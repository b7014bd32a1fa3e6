//! Propriétaire exclusif d'un descripteur socket.
//!
//! [`Socket`] unifie les trois usages de la pile : socket d'écoute TCP,
//! connexion acceptée, socket UDP (multicast SSDP et réponses unicast).
//! Le descripteur est créé et configuré via `socket2` (options explicites,
//! notamment `IPV6_V6ONLY`) puis converti en socket `tokio` pour l'I/O.
//!
//! Cycle de vie : créé lié (`bind`) → en écoute (`listen`) ou connecté
//! (`connect`) → fermé. Un objet possède au plus un descripteur ; une fois
//! fermé, le descripteur n'est jamais réutilisé ; la destruction ferme sur
//! tous les chemins. `close()` est idempotent et peut concourir sans danger
//! avec une opération en cours (transition sous verrou vers l'état fermé,
//! la fermeture effective attend la fin de l'opération).
//!
//! Les transferts partiels de `send`/`recv` sont rapportés tels quels : la
//! politique de réémission appartient à la couche HTTP, pas au socket.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::addr::{AddrFamily, SockAddress};
use crate::errors::SocketError;

/// Type de socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

#[derive(Debug)]
enum Inner {
    /// Socket flux lié, pas encore en écoute ni connecté.
    Bound(socket2::Socket),
    Listener(tokio::net::TcpListener),
    Stream(tokio::net::TcpStream),
    Datagram(tokio::net::UdpSocket),
}

/// Socket possédant exclusivement son descripteur (déplaçable, non clonable).
#[derive(Debug)]
pub struct Socket {
    kind: SocketKind,
    family: AddrFamily,
    inner: Mutex<Option<Arc<Inner>>>,
}

impl Socket {
    /// Crée et lie un socket.
    ///
    /// Sans adresse locale (ou avec la sentinelle), le socket est lié à un
    /// port éphémère sur l'adresse IPv4 non spécifiée. Les sockets IPv6 sont
    /// toujours `IPV6_V6ONLY` : la double pile s'obtient avec deux sockets,
    /// un par famille, identiquement sur toutes les plateformes.
    ///
    /// Doit être appelé dans un runtime tokio (conversion du descripteur).
    pub fn bind(kind: SocketKind, local: Option<SockAddress>) -> Result<Self, SocketError> {
        Self::bind_with(kind, local, false)
    }

    /// Variante de [`Socket::bind`] avec `SO_REUSEADDR`, pour les sockets
    /// SSDP qui partagent le port multicast 1900.
    pub fn bind_with(
        kind: SocketKind,
        local: Option<SockAddress>,
        reuse_address: bool,
    ) -> Result<Self, SocketError> {
        let addr = match local {
            None | Some(SockAddress::Unspecified) => SockAddress::any(AddrFamily::V4),
            Some(a) => a,
        };
        let family = addr.family().expect("specified address always has a family");

        let domain = match family {
            AddrFamily::V4 => Domain::IPV4,
            AddrFamily::V6 => Domain::IPV6,
        };
        let (ty, proto) = match kind {
            SocketKind::Stream => (Type::STREAM, Protocol::TCP),
            SocketKind::Datagram => (Type::DGRAM, Protocol::UDP),
        };

        let sock = socket2::Socket::new(domain, ty, Some(proto))
            .map_err(SocketError::CreateFailed)?;
        sock.set_nonblocking(true).map_err(SocketError::CreateFailed)?;
        if family == AddrFamily::V6 {
            // Contrat double pile explicite : jamais d'adresses v4 mappées.
            sock.set_only_v6(true).map_err(SocketError::CreateFailed)?;
        }
        if reuse_address {
            sock.set_reuse_address(true)
                .map_err(SocketError::CreateFailed)?;
        }

        let target: SocketAddr = addr.to_socket_addr().expect("specified address");
        sock.bind(&target.into())
            .map_err(|source| SocketError::BindFailed { addr, source })?;

        let inner = match kind {
            SocketKind::Stream => Inner::Bound(sock),
            SocketKind::Datagram => {
                let std_sock: std::net::UdpSocket = sock.into();
                Inner::Datagram(
                    tokio::net::UdpSocket::from_std(std_sock).map_err(SocketError::Io)?,
                )
            }
        };

        Ok(Self {
            kind,
            family,
            inner: Mutex::new(Some(Arc::new(inner))),
        })
    }

    fn from_stream(stream: tokio::net::TcpStream, family: AddrFamily) -> Self {
        Self {
            kind: SocketKind::Stream,
            family,
            inner: Mutex::new(Some(Arc::new(Inner::Stream(stream)))),
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn family(&self) -> AddrFamily {
        self.family
    }

    /// Instantané de l'état courant, sans garder le verrou pendant l'I/O.
    fn snapshot(&self) -> Result<Arc<Inner>, SocketError> {
        self.inner.lock().clone().ok_or(SocketError::Closed)
    }

    /// Passe un socket flux lié en écoute.
    pub fn listen(&self, backlog: u32) -> Result<(), SocketError> {
        if self.kind != SocketKind::Stream {
            return Err(SocketError::InvalidState);
        }
        let mut guard = self.inner.lock();
        let arc = guard.take().ok_or(SocketError::Closed)?;
        match Arc::try_unwrap(arc) {
            Ok(Inner::Bound(sock)) => match sock.listen(backlog as i32) {
                Ok(()) => {
                    let std_listener: std::net::TcpListener = sock.into();
                    match tokio::net::TcpListener::from_std(std_listener) {
                        Ok(listener) => {
                            *guard = Some(Arc::new(Inner::Listener(listener)));
                            Ok(())
                        }
                        Err(e) => Err(SocketError::ListenFailed(e)),
                    }
                }
                Err(e) => {
                    *guard = Some(Arc::new(Inner::Bound(sock)));
                    Err(SocketError::ListenFailed(e))
                }
            },
            Ok(other) => {
                *guard = Some(Arc::new(other));
                Err(SocketError::InvalidState)
            }
            Err(arc) => {
                *guard = Some(arc);
                Err(SocketError::InvalidState)
            }
        }
    }

    /// Accepte une connexion entrante et rend un nouveau [`Socket`]
    /// propriétaire du descripteur accepté.
    ///
    /// Échoue immédiatement avec [`SocketError::NotListening`] si le socket
    /// n'est pas en écoute : l'appelant n'est jamais bloqué par erreur.
    pub async fn accept(&self) -> Result<Socket, SocketError> {
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Listener(listener) => {
                let (stream, _peer) = listener
                    .accept()
                    .await
                    .map_err(SocketError::AcceptFailed)?;
                Ok(Socket::from_stream(stream, self.family))
            }
            _ => Err(SocketError::NotListening),
        }
    }

    /// Connecte un socket flux lié, avec un délai explicite.
    ///
    /// La connexion est non bloquante : on attend que le descripteur soit
    /// inscriptible puis on relit `SO_ERROR` pour distinguer succès et échec.
    pub async fn connect(&self, addr: SockAddress, timeout: Duration) -> Result<(), SocketError> {
        if self.kind != SocketKind::Stream {
            return Err(SocketError::InvalidState);
        }
        let target = addr.to_socket_addr().ok_or(SocketError::InvalidState)?;

        let arc = {
            let mut guard = self.inner.lock();
            guard.take().ok_or(SocketError::Closed)?
        };
        let sock = match Arc::try_unwrap(arc) {
            Ok(Inner::Bound(sock)) => sock,
            Ok(other) => {
                *self.inner.lock() = Some(Arc::new(other));
                return Err(SocketError::InvalidState);
            }
            Err(arc) => {
                *self.inner.lock() = Some(arc);
                return Err(SocketError::InvalidState);
            }
        };

        match sock.connect(&target.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(source) => return Err(SocketError::ConnectFailed { addr, source }),
        }

        let std_stream: std::net::TcpStream = sock.into();
        let stream = tokio::net::TcpStream::from_std(std_stream)
            .map_err(|source| SocketError::ConnectFailed { addr, source })?;

        match tokio::time::timeout(timeout, stream.writable()).await {
            Err(_) => return Err(SocketError::ConnectTimeout(addr, timeout)),
            Ok(Err(source)) => return Err(SocketError::ConnectFailed { addr, source }),
            Ok(Ok(())) => {}
        }
        if let Some(source) = stream.take_error().map_err(SocketError::Io)? {
            return Err(SocketError::ConnectFailed { addr, source });
        }
        stream
            .peer_addr()
            .map_err(|source| SocketError::ConnectFailed { addr, source })?;

        *self.inner.lock() = Some(Arc::new(Inner::Stream(stream)));
        Ok(())
    }

    /// Émet sur un socket connecté ; rend le nombre d'octets réellement
    /// écrits (écriture partielle possible).
    pub async fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Stream(stream) => loop {
                stream.writable().await.map_err(SocketError::Io)?;
                match stream.try_write(data) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(SocketError::Io(e)),
                }
            },
            _ => Err(SocketError::InvalidState),
        }
    }

    /// Reçoit sur un socket connecté ; 0 signale la fin de flux.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Stream(stream) => loop {
                stream.readable().await.map_err(SocketError::Io)?;
                match stream.try_read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(SocketError::Io(e)),
                }
            },
            _ => Err(SocketError::InvalidState),
        }
    }

    /// Émet un datagramme.
    pub async fn send_to(&self, data: &[u8], to: SockAddress) -> Result<usize, SocketError> {
        let target = to.to_socket_addr().ok_or(SocketError::InvalidState)?;
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Datagram(sock) => sock.send_to(data, target).await.map_err(SocketError::Io),
            _ => Err(SocketError::InvalidState),
        }
    }

    /// Reçoit un datagramme et l'adresse de son émetteur.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SockAddress), SocketError> {
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Datagram(sock) => {
                let (n, from) = sock.recv_from(buf).await.map_err(SocketError::Io)?;
                Ok((n, SockAddress::from(from)))
            }
            _ => Err(SocketError::InvalidState),
        }
    }

    /// Rejoint un groupe multicast IPv4 sur l'interface donnée.
    pub fn join_multicast_v4(
        &self,
        group: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<(), SocketError> {
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Datagram(sock) => sock
                .join_multicast_v4(group, interface)
                .map_err(SocketError::Io),
            _ => Err(SocketError::InvalidState),
        }
    }

    /// Rejoint un groupe multicast IPv6 sur l'interface d'index donné
    /// (0 = interface par défaut).
    pub fn join_multicast_v6(&self, group: &Ipv6Addr, interface: u32) -> Result<(), SocketError> {
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Datagram(sock) => sock
                .join_multicast_v6(group, interface)
                .map_err(SocketError::Io),
            _ => Err(SocketError::InvalidState),
        }
    }

    pub fn set_multicast_loop_v4(&self, on: bool) -> Result<(), SocketError> {
        let inner = self.snapshot()?;
        match &*inner {
            Inner::Datagram(sock) => sock.set_multicast_loop_v4(on).map_err(SocketError::Io),
            _ => Err(SocketError::InvalidState),
        }
    }

    /// Adresse locale, sentinelle si le socket est fermé.
    pub fn local_addr(&self) -> SockAddress {
        let Ok(inner) = self.snapshot() else {
            return SockAddress::Unspecified;
        };
        let addr = match &*inner {
            Inner::Bound(s) => s.local_addr().ok().and_then(|a| a.as_socket()),
            Inner::Listener(l) => l.local_addr().ok(),
            Inner::Stream(s) => s.local_addr().ok(),
            Inner::Datagram(d) => d.local_addr().ok(),
        };
        addr.map(SockAddress::from).unwrap_or_default()
    }

    /// Adresse du pair, sentinelle tant qu'il n'y a pas de pair.
    pub fn peer_addr(&self) -> SockAddress {
        let Ok(inner) = self.snapshot() else {
            return SockAddress::Unspecified;
        };
        match &*inner {
            Inner::Stream(s) => s.peer_addr().map(SockAddress::from).unwrap_or_default(),
            _ => SockAddress::Unspecified,
        }
    }

    /// Ferme le socket. Idempotent, sans danger face à une opération
    /// concurrente : le descripteur passe à l'état fermé sous verrou.
    pub fn close(&self) {
        let taken = self.inner.lock().take();
        drop(taken);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Extrait le flux TCP sous-jacent (connexion acceptée ou connectée),
    /// par exemple pour l'envelopper dans une session TLS.
    pub fn into_tcp_stream(self) -> Result<tokio::net::TcpStream, SocketError> {
        let arc = self.inner.lock().take().ok_or(SocketError::Closed)?;
        match Arc::try_unwrap(arc) {
            Ok(Inner::Stream(stream)) => Ok(stream),
            Ok(_) | Err(_) => Err(SocketError::InvalidState),
        }
    }
}

/// `connect(2)` non bloquant : l'échec "en cours" attendu diffère selon l'OS.
fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(not(unix))]
    {
        e.kind() == io::ErrorKind::WouldBlock
    }
}

// Vue flux asynchrone d'une connexion : permet à la couche HTTP (et au
// wrapper TLS) de travailler sur un `AsyncRead + AsyncWrite` uniforme.
impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let inner = match self.snapshot() {
            Ok(inner) => inner,
            Err(_) => return Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        };
        let Inner::Stream(stream) = &*inner else {
            return Poll::Ready(Err(io::ErrorKind::InvalidInput.into()));
        };
        loop {
            match stream.poll_read_ready(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            match stream.try_read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let inner = match self.snapshot() {
            Ok(inner) => inner,
            Err(_) => return Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        };
        let Inner::Stream(stream) = &*inner else {
            return Poll::Ready(Err(io::ErrorKind::InvalidInput.into()));
        };
        loop {
            match stream.poll_write_ready(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            match stream.try_write(data) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // TCP n'a pas de tampon applicatif ici.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // La fermeture du flux passe par close()/drop du Socket.
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::SockAddress;
    use std::time::Duration;

    fn loopback_ephemeral() -> SockAddress {
        SockAddress::parse("127.0.0.1:0").unwrap()
    }

    #[tokio::test]
    async fn ephemeral_binds_never_collide() {
        let a = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        let b = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        let pa = a.local_addr().port();
        let pb = b.local_addr().port();
        assert!(pa > 0 && pb > 0);
        assert_ne!(pa, pb);
    }

    #[tokio::test]
    async fn second_bind_on_same_address_fails() {
        let first = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        first.listen(16).unwrap();
        let taken = first.local_addr();

        let err = Socket::bind(SocketKind::Stream, Some(taken)).unwrap_err();
        match err {
            SocketError::BindFailed { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected BindFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn stream_round_trip_on_loopback() {
        let listener = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        listener.listen(16).unwrap();
        let target = listener.local_addr();

        let client = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        let (accepted, _) = tokio::join!(listener.accept(), async {
            client.connect(target, Duration::from_secs(5)).await.unwrap();
        });
        let accepted = accepted.unwrap();
        assert!(!accepted.peer_addr().is_unspecified());

        let sent = client.send(b"NOTIFY").await.unwrap();
        assert_eq!(sent, 6);

        let mut buf = [0u8; 32];
        let n = accepted.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"NOTIFY");
    }

    #[tokio::test]
    async fn accept_on_non_listening_socket_fails_fast() {
        let bound = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        assert!(matches!(
            bound.accept().await,
            Err(SocketError::NotListening)
        ));
    }

    #[tokio::test]
    async fn listen_on_datagram_socket_is_invalid() {
        let udp = Socket::bind(SocketKind::Datagram, Some(loopback_ephemeral())).unwrap();
        assert!(matches!(udp.listen(16), Err(SocketError::InvalidState)));
    }

    #[tokio::test]
    async fn connect_to_dead_port_is_refused() {
        // On lie un port puis on le libère : plus personne n'écoute dessus.
        let probe = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        probe.listen(1).unwrap();
        let dead = probe.local_addr();
        probe.close();

        let client = Socket::bind(SocketKind::Stream, Some(loopback_ephemeral())).unwrap();
        let err = client
            .connect(dead, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SocketError::ConnectFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sock = Socket::bind(SocketKind::Datagram, Some(loopback_ephemeral())).unwrap();
        assert!(!sock.is_closed());
        sock.close();
        sock.close();
        assert!(sock.is_closed());

        let mut buf = [0u8; 8];
        assert!(matches!(
            sock.recv_from(&mut buf).await,
            Err(SocketError::Closed)
        ));
        assert_eq!(sock.local_addr(), SockAddress::Unspecified);
    }

    #[tokio::test]
    async fn datagram_round_trip_on_loopback() {
        let receiver = Socket::bind(SocketKind::Datagram, Some(loopback_ephemeral())).unwrap();
        let sender = Socket::bind(SocketKind::Datagram, Some(loopback_ephemeral())).unwrap();

        let n = sender
            .send_to(b"M-SEARCH", receiver.local_addr())
            .await
            .unwrap();
        assert_eq!(n, 8);

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"M-SEARCH");
        assert_eq!(from, sender.local_addr());
    }

    #[tokio::test]
    async fn ipv6_listener_is_v6_only() {
        let Ok(listener) =
            Socket::bind(SocketKind::Stream, Some(SockAddress::parse("[::1]:0").unwrap()))
        else {
            // hôte sans IPv6 : rien à vérifier ici
            return;
        };
        listener.listen(4).unwrap();
        assert_eq!(listener.family(), AddrFamily::V6);
        assert_eq!(listener.local_addr().family(), Some(AddrFamily::V6));
    }
}

//! # Miniserver - cœur d'écoute de la pile UPnP
//!
//! Le miniserver lie l'ensemble des sockets entrants (HTTP IPv4/IPv6,
//! récepteurs SSDP multicast), puis une tâche dédiée multiplexe leur
//! disponibilité : connexion acceptée → pipeline HTTP, datagramme lu →
//! pipeline SSDP, signal d'arrêt → fermeture ordonnée. Le traitement des
//! requêtes part systématiquement vers le [`JobSink`] : la boucle d'écoute
//! n'est jamais bloquée par une requête.
//!
//! États : `Stopped → Starting → Running → Stopping → Stopped`. L'échec de
//! liaison d'un socket HTTP d'une famille activée est fatal au démarrage ;
//! une adhésion multicast qui échoue sur un adaptateur est journalisée et
//! l'adaptateur ignoré.

mod sockets;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pnpnet::{
    guess_local_ip, AdapterScan, AdapterSource, SockAddress, Socket, SocketError, SystemAdapters,
};

use crate::config::ServerConfig;
use crate::dispatch::{JobSink, NullCallbacks, TokioJobs, UpnpCallbacks};
use crate::errors::ServerError;
use crate::ssdp::{SsdpPacket, SsdpReply, SsdpScope, SSDP_DATAGRAM_MAX};
use crate::webserver::Webserver;

use sockets::{build_http_listeners, build_ssdp_sockets, MiniServerSockArray};

/// État du cycle de vie du miniserver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiniServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Constructeur du miniserver : une configuration, des collaborateurs
/// injectables, puis [`MiniServer::start`].
pub struct MiniServer {
    config: ServerConfig,
    webserver: Option<Arc<Webserver>>,
    callbacks: Arc<dyn UpnpCallbacks>,
    adapters: Arc<dyn AdapterSource>,
    jobs: Arc<dyn JobSink>,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
}

impl MiniServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            webserver: None,
            callbacks: Arc::new(NullCallbacks),
            adapters: Arc::new(SystemAdapters),
            jobs: Arc::new(TokioJobs),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Remplace le webserver construit par défaut depuis la configuration.
    pub fn with_webserver(mut self, webserver: Arc<Webserver>) -> Self {
        self.webserver = Some(webserver);
        self
    }

    /// Branche les callbacks SOAP/GENA/SSDP.
    pub fn with_callbacks(mut self, callbacks: Arc<dyn UpnpCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Substitue la source d'interfaces réseau (tests).
    pub fn with_adapter_source(mut self, adapters: Arc<dyn AdapterSource>) -> Self {
        self.adapters = adapters;
        self
    }

    /// Substitue la remise de travaux (tests, pool maison).
    pub fn with_jobs(mut self, jobs: Arc<dyn JobSink>) -> Self {
        self.jobs = jobs;
        self
    }

    /// Enveloppe les connexions HTTP acceptées dans une session TLS.
    #[cfg(feature = "tls")]
    pub fn with_tls_acceptor(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Démarre le miniserver : lie tous les sockets puis lance la tâche
    /// d'écoute. Rend la main avec un [`MiniServerHandle`] une fois tous les
    /// ports liés — ou l'erreur de démarrage.
    pub async fn start(self) -> Result<MiniServerHandle, ServerError> {
        let (state_tx, state_rx) = watch::channel(MiniServerState::Starting);
        info!(
            "🚀 Starting miniserver (HTTP port {}, IPv6 {}, SSDP {})",
            self.config.http_port,
            if self.config.enable_ipv6 { "on" } else { "off" },
            if self.config.enable_ssdp { "on" } else { "off" },
        );

        let mut scan = AdapterScan::new();
        scan.load(&*self.adapters)?;

        let (http_v4, http_v6, http_port) = build_http_listeners(&self.config, &scan)?;
        let ssdp = build_ssdp_sockets(&self.config, &scan)?;

        let array = MiniServerSockArray {
            http_v4,
            http_v6,
            ssdp_v4: ssdp.recv_v4,
            ssdp_v6_link: ssdp.recv_v6_link,
            ssdp_v6_site: ssdp.recv_v6_site,
            ssdp_reply_v4: ssdp.reply_v4,
            ssdp_reply_v6: ssdp.reply_v6,
        };
        let ssdp_port = array.ssdp_port();

        #[cfg(feature = "tls")]
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        #[cfg(not(feature = "tls"))]
        let scheme = "http";
        let base_url = format!("{scheme}://{}:{http_port}", self.base_host(&scan));

        let webserver = match self.webserver {
            Some(webserver) => webserver,
            None => {
                let webserver = Webserver::with_callbacks(self.callbacks.clone());
                if let Some(root) = &self.config.document_root {
                    webserver.set_root_dir(root)?;
                }
                if let Some(origin) = &self.config.cors {
                    webserver.set_cors(origin)?;
                }
                Arc::new(webserver)
            }
        };

        let dispatcher = Dispatcher {
            webserver,
            callbacks: self.callbacks,
            jobs: self.jobs,
            reply: Arc::new(SsdpReply::new(
                array.ssdp_reply_v4.clone(),
                array.ssdp_reply_v6.clone(),
            )),
            #[cfg(feature = "tls")]
            tls: self.tls,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(array, dispatcher, stop_rx, state_tx));

        Ok(MiniServerHandle {
            http_port,
            ssdp_port,
            base_url,
            state_rx,
            stop_tx,
            stop_requested: AtomicBool::new(false),
            join: tokio::sync::Mutex::new(Some(join)),
        })
    }

    /// Hôte annoncé dans l'URL de base.
    fn base_host(&self, scan: &AdapterScan) -> String {
        if self.config.loopback_only {
            return "127.0.0.1".to_string();
        }
        if let Some(name) = &self.config.interface {
            if let Some(adapter) = scan.valid_adapters().find(|a| &a.name == name) {
                return bracketed(&adapter.addr);
            }
        }
        let ip = guess_local_ip();
        bracketed(&SockAddress::new(ip, 0))
    }
}

fn bracketed(addr: &SockAddress) -> String {
    let text = addr.to_text();
    if text.contains(':') {
        format!("[{text}]")
    } else {
        text
    }
}

/// Poignée d'une instance démarrée.
///
/// `stop()` est idempotent : le premier appel signale l'arrêt et attend la
/// fin de la tâche d'écoute, les suivants attendent simplement l'état
/// `Stopped`. Lâcher la poignée arrête aussi le serveur (le canal d'arrêt
/// se ferme).
pub struct MiniServerHandle {
    http_port: u16,
    ssdp_port: u16,
    base_url: String,
    state_rx: watch::Receiver<MiniServerState>,
    stop_tx: watch::Sender<bool>,
    stop_requested: AtomicBool,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MiniServerHandle {
    /// Port HTTP effectivement lié (utile avec le port 0 ou le sondage).
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Port effectif du récepteur SSDP IPv4, 0 si SSDP est désactivé.
    pub fn ssdp_port(&self) -> u16 {
        self.ssdp_port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> MiniServerState {
        *self.state_rx.borrow()
    }

    /// Demande l'arrêt et attend la fermeture des sockets.
    pub async fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            // Déjà demandé : on attend juste l'arrêt effectif.
            self.wait_stopped().await;
            return;
        }
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.lock().await.take() {
            if let Err(e) = join.await {
                warn!("miniserver task ended abnormally: {}", e);
            }
        }
    }

    /// Attend l'état `Stopped` sans demander l'arrêt.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == MiniServerState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Répartition des événements de la boucle vers les pipelines.
struct Dispatcher {
    webserver: Arc<Webserver>,
    callbacks: Arc<dyn UpnpCallbacks>,
    jobs: Arc<dyn JobSink>,
    reply: Arc<SsdpReply>,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
}

impl Dispatcher {
    fn connection(&self, conn: Socket) {
        let peer = conn.peer_addr();
        debug!("📥 HTTP connection from {}", peer);

        #[cfg(feature = "tls")]
        if let Some(acceptor) = self.tls.clone() {
            let webserver = self.webserver.clone();
            self.jobs.submit(Box::pin(async move {
                match conn.into_tcp_stream() {
                    Ok(tcp) => match acceptor.accept(tcp).await {
                        Ok(stream) => webserver.serve(stream, peer).await,
                        Err(e) => warn!("TLS handshake with {} failed: {}", peer, e),
                    },
                    Err(e) => warn!("cannot unwrap accepted connection: {}", e),
                }
            }));
            return;
        }

        let webserver = self.webserver.clone();
        self.jobs
            .submit(Box::pin(async move { webserver.handle_connection(conn).await }));
    }

    fn datagram(&self, data: &[u8], from: SockAddress, scope: SsdpScope) {
        debug!("📡 SSDP datagram ({} bytes) from {}", data.len(), from);
        let packet = SsdpPacket {
            data: data.to_vec(),
            from,
            scope,
        };
        let callbacks = self.callbacks.clone();
        let reply = self.reply.clone();
        self.jobs
            .submit(Box::pin(async move { callbacks.on_ssdp(packet, reply).await }));
    }
}

async fn accept_on(sock: Option<&Socket>) -> Result<Socket, SocketError> {
    match sock {
        Some(sock) => sock.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv_on(
    sock: Option<&Socket>,
    buf: &mut [u8],
) -> Result<(usize, SockAddress), SocketError> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Boucle d'écoute : une tâche dédiée, un `select!` sur tous les
/// emplacements du tableau plus le signal d'arrêt. Le tirage aléatoire des
/// branches de `select!` évite la famine d'un descripteur quand plusieurs
/// sont prêts en même temps.
async fn run_loop(
    mut array: MiniServerSockArray,
    dispatcher: Dispatcher,
    mut stop_rx: watch::Receiver<bool>,
    state: watch::Sender<MiniServerState>,
) {
    let _ = state.send(MiniServerState::Running);
    info!("✅ Miniserver running");

    let mut buf_v4 = vec![0u8; SSDP_DATAGRAM_MAX];
    let mut buf_link = vec![0u8; SSDP_DATAGRAM_MAX];
    let mut buf_site = vec![0u8; SSDP_DATAGRAM_MAX];

    loop {
        tokio::select! {
            result = accept_on(array.http_v4.as_ref()) => match result {
                Ok(conn) => dispatcher.connection(conn),
                // la connexion affectée est perdue, la boucle continue
                Err(e) => warn!("IPv4 accept failed: {}", e),
            },
            result = accept_on(array.http_v6.as_ref()) => match result {
                Ok(conn) => dispatcher.connection(conn),
                Err(e) => warn!("IPv6 accept failed: {}", e),
            },
            result = recv_on(array.ssdp_v4.as_ref(), &mut buf_v4) => match result {
                Ok((n, from)) => dispatcher.datagram(&buf_v4[..n], from, SsdpScope::V4),
                Err(e) => warn!("SSDP IPv4 read error: {}", e),
            },
            result = recv_on(array.ssdp_v6_link.as_ref(), &mut buf_link) => match result {
                Ok((n, from)) => dispatcher.datagram(&buf_link[..n], from, SsdpScope::V6LinkLocal),
                Err(e) => warn!("SSDP IPv6 link-local read error: {}", e),
            },
            result = recv_on(array.ssdp_v6_site.as_ref(), &mut buf_site) => match result {
                Ok((n, from)) => dispatcher.datagram(&buf_site[..n], from, SsdpScope::V6SiteLocal),
                Err(e) => warn!("SSDP IPv6 site-local read error: {}", e),
            },
            // signal d'arrêt, ou poignée lâchée (canal fermé)
            _ = stop_rx.changed() => break,
        }
    }

    let _ = state.send(MiniServerState::Stopping);
    info!("👋 Miniserver stopping, closing listener sockets");
    array.close_all();
    let _ = state.send(MiniServerState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pnpnet::{AdapterError, NetworkAdapter};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    /// Hôte de test : uniquement une interface loopback.
    struct LoopbackOnlySource;

    impl AdapterSource for LoopbackOnlySource {
        fn snapshot(&self) -> Result<Vec<NetworkAdapter>, AdapterError> {
            Ok(vec![NetworkAdapter {
                name: "lo".to_string(),
                index: 1,
                addr: SockAddress::parse("127.0.0.1").unwrap(),
                netmask: SockAddress::parse("255.0.0.0").unwrap(),
                prefix: 8,
                loopback: true,
                up: true,
                multicast: false,
            }])
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            http_port: 0,
            loopback_only: true,
            enable_ssdp: false,
            ..ServerConfig::default()
        }
    }

    async fn start_test_server(config: ServerConfig) -> MiniServerHandle {
        MiniServer::new(config)
            .with_adapter_source(Arc::new(LoopbackOnlySource))
            .start()
            .await
            .unwrap()
    }

    async fn http_exchange(port: u16, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn end_to_end_get_then_stop() {
        let handle = start_test_server(test_config()).await;
        assert!(handle.http_port() > 0);
        assert!(handle
            .base_url()
            .starts_with(&format!("http://127.0.0.1:{}", handle.http_port())));

        // sans racine de documents : réponse 404, jamais de blocage
        let response =
            http_exchange(handle.http_port(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        handle.stop().await;
        assert_eq!(handle.state(), MiniServerState::Stopped);

        // après l'arrêt, plus personne n'écoute
        assert!(TcpStream::connect(("127.0.0.1", handle.http_port()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn serves_static_documents_end_to_end() {
        let dir = std::env::temp_dir().join(format!("pnp-miniserver-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), b"<html>upnp</html>").unwrap();

        let config = ServerConfig {
            document_root: Some(dir),
            ..test_config()
        };
        let handle = start_test_server(config).await;

        let response =
            http_exchange(handle.http_port(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("<html>upnp</html>"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn occupied_preferred_port_is_probed() {
        let first = start_test_server(test_config()).await;
        let taken = first.http_port();

        let second = start_test_server(ServerConfig {
            http_port: taken,
            ..test_config()
        })
        .await;

        assert!(second.http_port() > taken);
        assert!(second.http_port() <= taken + crate::config::PORT_PROBE_RANGE - 1);

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn stop_twice_is_a_no_op() {
        let handle = start_test_server(test_config()).await;
        handle.stop().await;
        // le second arrêt ne doit ni échouer ni bloquer
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.stop())
            .await
            .expect("second stop must not hang");
        assert_eq!(handle.state(), MiniServerState::Stopped);
    }

    struct RecordingCallbacks {
        tx: mpsc::UnboundedSender<SsdpPacket>,
    }

    #[async_trait]
    impl UpnpCallbacks for RecordingCallbacks {
        async fn on_ssdp(&self, packet: SsdpPacket, _reply: Arc<SsdpReply>) {
            let _ = self.tx.send(packet);
        }
    }

    #[tokio::test]
    async fn ssdp_datagrams_reach_the_callback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = ServerConfig {
            http_port: 0,
            loopback_only: true,
            enable_ssdp: true,
            ssdp_port: 0, // port éphémère pour un test déterministe
            ..ServerConfig::default()
        };
        let handle = MiniServer::new(config)
            .with_adapter_source(Arc::new(LoopbackOnlySource))
            .with_callbacks(Arc::new(RecordingCallbacks { tx }))
            .start()
            .await
            .unwrap();
        assert!(handle.ssdp_port() > 0);

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let msearch = b"M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nST: ssdp:all\r\n\r\n";
        sender
            .send_to(msearch, ("127.0.0.1", handle.ssdp_port()))
            .await
            .unwrap();

        let packet = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("datagram must be dispatched")
            .unwrap();
        assert_eq!(packet.scope, SsdpScope::V4);
        assert_eq!(packet.data, msearch.to_vec());
        assert_eq!(packet.from.port(), sender.local_addr().unwrap().port());

        handle.stop().await;
    }

    #[tokio::test]
    async fn state_follows_the_lifecycle() {
        let handle = start_test_server(test_config()).await;
        // la tâche publie Running dès son premier tour
        let mut rx = handle.state_rx.clone();
        loop {
            let s = *rx.borrow_and_update();
            if s == MiniServerState::Running {
                break;
            }
            rx.changed().await.unwrap();
        }
        handle.stop().await;
        assert_eq!(handle.state(), MiniServerState::Stopped);
    }
}

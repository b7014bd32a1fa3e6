//! Bordure HTTP du miniserver.
//!
//! Le [`Webserver`] consomme les connexions acceptées par le miniserver :
//! il lit la ligne de requête, sert les GET/HEAD statiques (racine de
//! documents et alias en mémoire) et route SOAP/GENA vers les callbacks
//! externes. Les erreurs de traitement ferment la connexion concernée et
//! sont journalisées ; elles ne remontent jamais vers la boucle d'écoute.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use pnpnet::{SockAddress, Socket};

use crate::dispatch::{NullCallbacks, UpnpCallbacks};
use crate::errors::ServerError;
use crate::httpmsg::{read_request, HttpError, HttpRequest, HttpResponse, Method};

/// Document en mémoire servi sous un chemin fixe (descriptions de devices,
/// SCPD, etc.).
#[derive(Debug, Clone)]
pub struct Alias {
    pub content: Arc<Vec<u8>>,
    pub content_type: String,
}

#[derive(Debug, Default)]
struct WebState {
    root_dir: Option<PathBuf>,
    aliases: HashMap<String, Alias>,
    cors: Option<String>,
}

/// Serveur de documents et répartiteur de requêtes.
pub struct Webserver {
    state: RwLock<WebState>,
    callbacks: Arc<dyn UpnpCallbacks>,
}

impl Webserver {
    /// Webserver sans couche protocolaire : SOAP/GENA répondent 501.
    pub fn new() -> Self {
        Self::with_callbacks(Arc::new(NullCallbacks))
    }

    pub fn with_callbacks(callbacks: Arc<dyn UpnpCallbacks>) -> Self {
        Self {
            state: RwLock::new(WebState::default()),
            callbacks,
        }
    }

    /// Fixe la racine des documents statiques.
    pub fn set_root_dir(&self, dir: impl AsRef<Path>) -> Result<(), ServerError> {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            return Err(ServerError::InvalidArgument("document root must not be empty"));
        }
        self.state.write().root_dir = Some(dir.to_path_buf());
        Ok(())
    }

    /// Publie (ou remplace) un document en mémoire sous `path`.
    pub fn set_alias(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ServerError> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(ServerError::InvalidArgument(
                "alias path must start with '/'",
            ));
        }
        if content_type.is_empty() {
            return Err(ServerError::InvalidArgument(
                "alias content type must not be empty",
            ));
        }
        self.state.write().aliases.insert(
            path.to_string(),
            Alias {
                content: Arc::new(content),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    /// Retire un alias ; `true` s'il existait.
    pub fn clear_alias(&self, path: &str) -> bool {
        self.state.write().aliases.remove(path).is_some()
    }

    /// Active l'en-tête `ACCESS-CONTROL-ALLOW-ORIGIN` sur les réponses.
    pub fn set_cors(&self, origin: &str) -> Result<(), ServerError> {
        if origin.is_empty() {
            return Err(ServerError::InvalidArgument(
                "CORS origin must not be empty",
            ));
        }
        self.state.write().cors = Some(origin.to_string());
        Ok(())
    }

    pub fn clear_cors(&self) {
        self.state.write().cors = None;
    }

    /// Point d'entrée du miniserver pour une connexion acceptée en clair.
    pub async fn handle_connection(&self, conn: Socket) {
        let peer = conn.peer_addr();
        self.serve(conn, peer).await;
    }

    /// Sert une requête sur un flux déjà établi (TCP nu ou session TLS).
    ///
    /// Ne retourne jamais d'erreur : tout échec est journalisé et la
    /// connexion fermée par le drop du flux.
    pub async fn serve<S>(&self, mut stream: S, peer: SockAddress)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let response = match read_request(&mut stream, peer).await {
            Ok(request) => {
                debug!("📥 {:?} {} from {}", request.method, request.path, peer);
                let include_body = request.method != Method::Head;
                let response = self.route(request).await;
                if let Err(e) = response.write_to(&mut stream, include_body).await {
                    warn!("failed to write response to {}: {}", peer, e);
                }
                return;
            }
            Err(HttpError::UnknownMethod(m)) => {
                debug!("unsupported method '{}' from {}", m, peer);
                HttpResponse::not_implemented()
            }
            Err(HttpError::UnexpectedEof) => return, // pair parti, rien à répondre
            Err(e) => {
                debug!("malformed request from {}: {}", peer, e);
                HttpResponse::bad_request()
            }
        };
        if let Err(e) = response.write_to(&mut stream, true).await {
            warn!("failed to write error response to {}: {}", peer, e);
        }
    }

    async fn route(&self, request: HttpRequest) -> HttpResponse {
        let response = match request.method {
            Method::Get | Method::Head => self.serve_document(&request.path).await,
            Method::Post => {
                if request.header("SOAPACTION").is_some() {
                    self.callbacks.on_soap(request).await
                } else {
                    HttpResponse::not_implemented()
                }
            }
            Method::Subscribe | Method::Unsubscribe | Method::Notify => {
                self.callbacks.on_gena(request).await
            }
        };
        self.apply_cors(response)
    }

    fn apply_cors(&self, response: HttpResponse) -> HttpResponse {
        match self.state.read().cors.as_deref() {
            Some(origin) => response.with_header("ACCESS-CONTROL-ALLOW-ORIGIN", origin),
            None => response,
        }
    }

    async fn serve_document(&self, raw_path: &str) -> HttpResponse {
        let path = raw_path.split('?').next().unwrap_or(raw_path);

        // Alias d'abord : les descriptions de devices priment sur le disque.
        let (alias, root) = {
            let state = self.state.read();
            (state.aliases.get(path).cloned(), state.root_dir.clone())
        };
        if let Some(alias) = alias {
            return HttpResponse::ok()
                .with_body(alias.content.as_ref().clone(), &alias.content_type);
        }

        let Some(root) = root else {
            return HttpResponse::not_found();
        };
        let Some(full) = sanitize_path(&root, path) else {
            return HttpResponse::forbidden();
        };

        match tokio::fs::read(&full).await {
            Ok(content) => {
                let content_type = content_type_for(&full);
                HttpResponse::ok().with_body(content, content_type)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HttpResponse::not_found(),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                HttpResponse::forbidden()
            }
            Err(e) => {
                warn!("failed to read {}: {}", full.display(), e);
                HttpResponse::internal_error()
            }
        }
    }
}

impl Default for Webserver {
    fn default() -> Self {
        Self::new()
    }
}

/// Résout un chemin de requête sous la racine, sans jamais en sortir.
///
/// Les segments `..`, les segments absolus et les octets nuls sont rejetés ;
/// un chemin de répertoire est complété par `index.html`.
fn sanitize_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    if request_path.contains('\0') {
        return None;
    }
    let relative = request_path.trim_start_matches('/');

    let mut full = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => full.push(part),
            Component::CurDir => {}
            _ => return None, // `..`, racine, préfixe : hors de question
        }
    }
    if request_path.ends_with('/') || relative.is_empty() {
        full.push("index.html");
    }
    Some(full)
}

/// Type de contenu déduit de l'extension ; volontairement court, les médias
/// exotiques partent en `application/octet-stream`.
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("xml") => "text/xml",
        Some("txt") => "text/plain",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

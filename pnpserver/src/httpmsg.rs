//! Lecture et écriture des messages HTTP du miniserver.
//!
//! Le miniserver n'embarque pas de pile HTTP complète : il lit l'en-tête de
//! requête dans une fenêtre bornée, en extrait méthode, chemin et en-têtes,
//! et écrit des réponses minimales. L'analyse tolérante des lignes d'en-tête
//! suit la même discipline que le parseur SSDP : découpe au premier `:`,
//! noms en majuscules, lignes malformées ignorées.

use std::collections::HashMap;
use std::io;

use chrono::Utc;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use pnpnet::SockAddress;

/// Taille maximale acceptée pour l'en-tête de requête.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Taille maximale acceptée pour un corps de requête (SOAP/GENA).
pub const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Chaîne SERVER process-wide, calculée une fois.
static SERVER_STRING: Lazy<String> = Lazy::new(|| {
    format!(
        "{}/{} UPnP/1.1 PnPStack/{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    )
});

/// Valeur de l'en-tête `SERVER` émise par la pile.
pub fn server_string() -> &'static str {
    &SERVER_STRING
}

/// Date HTTP (RFC 1123) de l'instant courant.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Méthodes comprises par le miniserver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Subscribe,
    Unsubscribe,
    Notify,
}

// Table triée une fois pour toutes : recherche dichotomique directe.
const METHODS: &[(&str, Method)] = &[
    ("GET", Method::Get),
    ("HEAD", Method::Head),
    ("NOTIFY", Method::Notify),
    ("POST", Method::Post),
    ("SUBSCRIBE", Method::Subscribe),
    ("UNSUBSCRIBE", Method::Unsubscribe),
];

/// Recherche une méthode par nom (sensible à la casse, comme HTTP).
pub fn method_from_name(name: &str) -> Option<Method> {
    METHODS
        .binary_search_by(|(n, _)| (*n).cmp(name))
        .ok()
        .map(|i| METHODS[i].1)
}

/// Erreur de framing HTTP.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("unsupported method: {0}")]
    UnknownMethod(String),

    #[error("request head larger than {0} bytes")]
    HeadTooLarge(usize),

    #[error("request body larger than {0} bytes")]
    BodyTooLarge(usize),

    #[error("connection closed before a full request arrived")]
    UnexpectedEof,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Requête HTTP entrante, en-têtes à clés majuscules.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub peer: SockAddress,
}

impl HttpRequest {
    /// Valeur d'un en-tête, nom insensible à la casse.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }
}

/// Lit et analyse une requête complète (en-tête borné, corps borné par
/// CONTENT-LENGTH) depuis un flux accepté.
pub async fn read_request<S>(stream: &mut S, peer: SockAddress) -> Result<HttpRequest, HttpError>
where
    S: AsyncRead + Unpin,
{
    let (head, mut body) = read_head(stream).await?;
    let (method, path, version, headers) = parse_head(&head)?;

    // Corps : uniquement ce que CONTENT-LENGTH annonce.
    if let Some(len_text) = headers.get("CONTENT-LENGTH") {
        let expected: usize = len_text
            .parse()
            .map_err(|_| HttpError::BadRequest(format!("bad CONTENT-LENGTH '{len_text}'")))?;
        if expected > MAX_REQUEST_BODY {
            return Err(HttpError::BodyTooLarge(MAX_REQUEST_BODY));
        }
        while body.len() < expected {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(HttpError::UnexpectedEof);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(expected);
    } else {
        body.clear();
    }

    Ok(HttpRequest {
        method,
        path,
        version,
        headers,
        body,
        peer,
    })
}

/// Lit jusqu'à la ligne vide terminant l'en-tête ; rend (en-tête, début de
/// corps déjà reçu).
async fn read_head<S>(stream: &mut S) -> Result<(String, Vec<u8>), HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            let body = buf[end + 4..].to_vec();
            return Ok((head, body));
        }
        if buf.len() >= MAX_REQUEST_HEAD {
            return Err(HttpError::HeadTooLarge(MAX_REQUEST_HEAD));
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::UnexpectedEof);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[allow(clippy::type_complexity)]
fn parse_head(
    head: &str,
) -> Result<(Method, String, String, HashMap<String, String>), HttpError> {
    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| HttpError::BadRequest("empty request".to_string()))?
        .trim();

    let mut parts = request_line.split_whitespace();
    let (Some(method_name), Some(path), Some(version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::BadRequest(format!(
            "bad request line '{request_line}'"
        )));
    };
    if !version.starts_with("HTTP/") {
        return Err(HttpError::BadRequest(format!(
            "bad protocol version '{version}'"
        )));
    }
    let method = method_from_name(method_name)
        .ok_or_else(|| HttpError::UnknownMethod(method_name.to_string()))?;

    Ok((
        method,
        path.to_string(),
        version.to_string(),
        parse_headers(lines),
    ))
}

/// Analyse tolérante des lignes d'en-tête : découpe au premier `:` (les
/// valeurs peuvent en contenir), noms en majuscules, lignes malformées
/// ignorées, arrêt à la première ligne vide.
fn parse_headers<'a, I>(lines: I) -> HashMap<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.find(':') {
            let (name, value_with_colon) = line.split_at(colon);
            let value = &value_with_colon[1..];

            let name = name.trim().to_ascii_uppercase();
            let value = value.trim().to_string();
            if !name.is_empty() && !value.is_empty() {
                headers.insert(name, value);
            } else {
                trace!("skipping malformed header: '{}'", line);
            }
        } else {
            trace!("skipping line without colon: '{}'", line);
        }
    }
    headers
}

/// Réponse HTTP minimale du miniserver.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request").with_text("Bad Request")
    }

    pub fn forbidden() -> Self {
        Self::new(403, "Forbidden").with_text("Forbidden")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found").with_text("Not Found")
    }

    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented").with_text("Not Implemented")
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error").with_text("Internal Server Error")
    }

    /// Attache un corps et son type de contenu.
    pub fn with_body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.headers
            .push(("CONTENT-TYPE".to_string(), content_type.to_string()));
        self.body = body;
        self
    }

    fn with_text(self, text: &str) -> Self {
        self.with_body(text.as_bytes().to_vec(), "text/plain")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sérialise la réponse sur le flux. Pour HEAD, `include_body` est faux :
    /// CONTENT-LENGTH annonce la taille réelle mais le corps est omis.
    pub async fn write_to<S>(&self, stream: &mut S, include_body: bool) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        head.push_str(&format!("SERVER: {}\r\n", server_string()));
        head.push_str(&format!("DATE: {}\r\n", http_date()));
        head.push_str(&format!("CONTENT-LENGTH: {}\r\n", self.body.len()));
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("CONNECTION: close\r\n\r\n");

        stream.write_all(head.as_bytes()).await?;
        if include_body && !self.body.is_empty() {
            stream.write_all(&self.body).await?;
        }
        stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn method_table_lookup() {
        assert_eq!(method_from_name("GET"), Some(Method::Get));
        assert_eq!(method_from_name("SUBSCRIBE"), Some(Method::Subscribe));
        assert_eq!(method_from_name("NOTIFY"), Some(Method::Notify));
        // sensible à la casse, comme le veut HTTP
        assert_eq!(method_from_name("get"), None);
        assert_eq!(method_from_name("BREW"), None);
    }

    #[tokio::test]
    async fn parses_a_simple_get() {
        let (mut client, mut server) = duplex(4096);
        tokio::io::AsyncWriteExt::write_all(
            &mut client,
            b"GET /desc.xml HTTP/1.1\r\nHost: 10.0.0.1\r\nUser-Agent: test\r\n\r\n",
        )
        .await
        .unwrap();

        let req = read_request(&mut server, SockAddress::Unspecified)
            .await
            .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/desc.xml");
        assert_eq!(req.version, "HTTP/1.1");
        // clés en majuscules, lecture insensible à la casse
        assert_eq!(req.header("host"), Some("10.0.0.1"));
        assert_eq!(req.header("USER-AGENT"), Some("test"));
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn reads_body_up_to_content_length() {
        let (mut client, mut server) = duplex(4096);
        tokio::io::AsyncWriteExt::write_all(
            &mut client,
            b"POST /ctl HTTP/1.1\r\nSOAPACTION: \"urn:svc#Play\"\r\nContent-Length: 11\r\n\r\nhello world",
        )
        .await
        .unwrap();

        let req = read_request(&mut server, SockAddress::Unspecified)
            .await
            .unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.header("soapaction"), Some("\"urn:svc#Play\""));
        assert_eq!(req.body, b"hello world");
    }

    #[tokio::test]
    async fn rejects_unknown_methods() {
        let (mut client, mut server) = duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"BREW /pot HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            read_request(&mut server, SockAddress::Unspecified).await,
            Err(HttpError::UnknownMethod(_))
        ));
    }

    #[tokio::test]
    async fn rejects_garbage_request_lines() {
        let (mut client, mut server) = duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"GET\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            read_request(&mut server, SockAddress::Unspecified).await,
            Err(HttpError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn bounds_the_request_head() {
        let (mut client, mut server) = duplex(64 * 1024);
        let mut oversized = b"GET / HTTP/1.1\r\n".to_vec();
        oversized.extend(std::iter::repeat_n(b'A', MAX_REQUEST_HEAD + 1024));
        tokio::io::AsyncWriteExt::write_all(&mut client, &oversized)
            .await
            .unwrap();
        assert!(matches!(
            read_request(&mut server, SockAddress::Unspecified).await,
            Err(HttpError::HeadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_request_is_an_eof_error() {
        let (mut client, mut server) = duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"GET / HTT")
            .await
            .unwrap();
        drop(client);
        assert!(matches!(
            read_request(&mut server, SockAddress::Unspecified).await,
            Err(HttpError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn response_carries_standard_headers() {
        let (mut a, mut b) = duplex(4096);
        let resp = HttpResponse::ok().with_body(b"<root/>".to_vec(), "text/xml");
        resp.write_to(&mut a, true).await.unwrap();
        drop(a);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut b, &mut out)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("CONTENT-LENGTH: 7\r\n"));
        assert!(text.contains("CONTENT-TYPE: text/xml\r\n"));
        assert!(text.contains("SERVER: "));
        assert!(text.contains("DATE: "));
        assert!(text.ends_with("<root/>"));
    }

    #[tokio::test]
    async fn head_response_omits_the_body() {
        let (mut a, mut b) = duplex(4096);
        let resp = HttpResponse::ok().with_body(b"payload".to_vec(), "text/plain");
        resp.write_to(&mut a, false).await.unwrap();
        drop(a);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut b, &mut out)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        // la taille est annoncée mais le corps omis
        assert!(text.contains("CONTENT-LENGTH: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}

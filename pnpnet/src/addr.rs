//! Valeur d'adresse socket.
//!
//! [`SockAddress`] est l'union étiquetée {non spécifiée, IPv4, IPv6} utilisée
//! partout dans la pile : l'étiquette et le contenu sont garantis cohérents
//! par construction (enum Rust), et la valeur "non spécifiée" sert de
//! sentinelle légale ("pas encore de pair", "toutes les interfaces").
//!
//! Aucune résolution DNS n'est faite ici : un hôte non numérique est une
//! erreur de format, la résolution est le travail de [`crate::resolver`].

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use crate::errors::AddrFormatError;

/// Famille d'adresse d'un socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    V4,
    V6,
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrFamily::V4 => write!(f, "IPv4"),
            AddrFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Adresse socket : non spécifiée, IPv4 ou IPv6 (adresse + port).
///
/// L'égalité dérivée donne exactement le contrat attendu :
/// - deux valeurs non spécifiées sont égales ;
/// - deux adresses de la même famille sont égales si adresse et port
///   correspondent exactement ;
/// - deux familles différentes ne sont jamais égales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SockAddress {
    /// Sentinelle "vide" (AF_UNSPEC) : pas de pair, pas d'adresse choisie.
    #[default]
    Unspecified,
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl SockAddress {
    /// Construit une adresse IPv4 ou IPv6 à partir d'une IP et d'un port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => SockAddress::V4(SocketAddrV4::new(v4, port)),
            IpAddr::V6(v6) => SockAddress::V6(SocketAddrV6::new(v6, port, 0, 0)),
        }
    }

    /// Adresse non spécifiée de la famille demandée ("0.0.0.0" / "::"), port 0.
    pub fn any(family: AddrFamily) -> Self {
        match family {
            AddrFamily::V4 => SockAddress::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
            AddrFamily::V6 => SockAddress::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    /// Adresse de loopback de la famille demandée, port 0.
    pub fn loopback(family: AddrFamily) -> Self {
        match family {
            AddrFamily::V4 => SockAddress::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 0),
            AddrFamily::V6 => SockAddress::new(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), 0),
        }
    }

    /// Analyse une adresse textuelle.
    ///
    /// Formes acceptées : `"hôte:port"`, `"[ipv6]:port"`, hôte numérique nu,
    /// chaîne vide (→ non spécifiée). Le port doit compter 1 à 5 chiffres
    /// décimaux et valoir au plus 65535.
    pub fn parse(text: &str) -> Result<Self, AddrFormatError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SockAddress::Unspecified);
        }

        let (host, port_text) = split_authority(text)?;
        let port = match port_text {
            Some(p) => parse_port(p)?,
            None => 0,
        };

        let ip: IpAddr = host
            .parse()
            .map_err(|_| AddrFormatError::InvalidHost(host.to_string()))?;
        Ok(SockAddress::new(ip, port))
    }

    /// Famille de l'adresse, `None` pour la valeur non spécifiée.
    pub fn family(&self) -> Option<AddrFamily> {
        match self {
            SockAddress::Unspecified => None,
            SockAddress::V4(_) => Some(AddrFamily::V4),
            SockAddress::V6(_) => Some(AddrFamily::V6),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, SockAddress::Unspecified)
    }

    pub fn is_loopback(&self) -> bool {
        self.ip().map(|ip| ip.is_loopback()).unwrap_or(false)
    }

    /// IP portée par l'adresse, `None` pour la valeur non spécifiée.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            SockAddress::Unspecified => None,
            SockAddress::V4(a) => Some(IpAddr::V4(*a.ip())),
            SockAddress::V6(a) => Some(IpAddr::V6(*a.ip())),
        }
    }

    /// Port, 0 pour la valeur non spécifiée.
    pub fn port(&self) -> u16 {
        match self {
            SockAddress::Unspecified => 0,
            SockAddress::V4(a) => a.port(),
            SockAddress::V6(a) => a.port(),
        }
    }

    /// Copie de l'adresse avec un autre port (sans effet sur la sentinelle).
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            SockAddress::Unspecified => SockAddress::Unspecified,
            SockAddress::V4(a) => SockAddress::V4(SocketAddrV4::new(*a.ip(), port)),
            SockAddress::V6(a) => {
                SockAddress::V6(SocketAddrV6::new(*a.ip(), port, a.flowinfo(), a.scope_id()))
            }
        }
    }

    /// Forme textuelle de l'adresse seule, sans port ("" pour la sentinelle).
    pub fn to_text(&self) -> String {
        match self {
            SockAddress::Unspecified => String::new(),
            SockAddress::V4(a) => a.ip().to_string(),
            SockAddress::V6(a) => a.ip().to_string(),
        }
    }

    /// Forme textuelle `adresse:port`, IPv6 entre crochets ("" pour la
    /// sentinelle). `parse(to_authority(a)) == a` pour toute adresse
    /// spécifiée.
    pub fn to_authority(&self) -> String {
        match self {
            SockAddress::Unspecified => String::new(),
            SockAddress::V4(a) => a.to_string(),
            SockAddress::V6(a) => format!("[{}]:{}", a.ip(), a.port()),
        }
    }

    /// Conversion vers `std::net::SocketAddr`, `None` pour la sentinelle.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            SockAddress::Unspecified => None,
            SockAddress::V4(a) => Some(SocketAddr::V4(*a)),
            SockAddress::V6(a) => Some(SocketAddr::V6(*a)),
        }
    }
}

impl From<SocketAddr> for SockAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => SockAddress::V4(a),
            SocketAddr::V6(a) => SockAddress::V6(a),
        }
    }
}

impl FromStr for SockAddress {
    type Err = AddrFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SockAddress::parse(s)
    }
}

impl fmt::Display for SockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddress::Unspecified => write!(f, "unspecified"),
            _ => write!(f, "{}", self.to_authority()),
        }
    }
}

/// Découpe `texte` en (hôte, port optionnel) sans interpréter l'hôte.
fn split_authority(text: &str) -> Result<(&str, Option<&str>), AddrFormatError> {
    if let Some(rest) = text.strip_prefix('[') {
        // Forme "[ipv6]" ou "[ipv6]:port"
        let end = rest
            .find(']')
            .ok_or_else(|| AddrFormatError::InvalidHost(text.to_string()))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(port))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(AddrFormatError::InvalidHost(text.to_string())),
        };
    }

    // Sans crochets : un seul ':' sépare hôte et port ; plusieurs ':'
    // signifient un littéral IPv6 nu.
    match text.bytes().filter(|b| *b == b':').count() {
        0 => Ok((text, None)),
        1 => {
            let (host, port) = text.split_once(':').unwrap();
            Ok((host, Some(port)))
        }
        _ => Ok((text, None)),
    }
}

/// Valide un port textuel : 1 à 5 chiffres décimaux, valeur <= 65535.
fn parse_port(text: &str) -> Result<u16, AddrFormatError> {
    if text.is_empty() || text.len() > 5 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddrFormatError::InvalidPort(text.to_string()));
    }
    text.parse::<u32>()
        .ok()
        .filter(|p| *p <= u16::MAX as u32)
        .map(|p| p as u16)
        .ok_or_else(|| AddrFormatError::InvalidPort(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parse_empty_is_unspecified() {
        assert_eq!(SockAddress::parse("").unwrap(), SockAddress::Unspecified);
        assert_eq!(SockAddress::parse("  ").unwrap(), SockAddress::Unspecified);
    }

    #[test]
    fn parse_v4_with_port() {
        let a = SockAddress::parse("192.168.1.42:8080").unwrap();
        assert_eq!(a.ip(), Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42))));
        assert_eq!(a.port(), 8080);
    }

    #[test]
    fn parse_bare_hosts() {
        let a = SockAddress::parse("127.0.0.1").unwrap();
        assert_eq!(a.port(), 0);
        assert!(a.is_loopback());

        let b = SockAddress::parse("fe80::1").unwrap();
        assert_eq!(b.family(), Some(AddrFamily::V6));
        assert_eq!(b.port(), 0);
    }

    #[test]
    fn parse_bracketed_v6() {
        let a = SockAddress::parse("[::1]:1900").unwrap();
        assert_eq!(a.ip(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(a.port(), 1900);

        let b = SockAddress::parse("[fe80::1]").unwrap();
        assert_eq!(b.port(), 0);
    }

    #[test]
    fn parse_rejects_bad_ports() {
        // 6 chiffres
        assert!(matches!(
            SockAddress::parse("1.2.3.4:123456"),
            Err(AddrFormatError::InvalidPort(_))
        ));
        // 5 chiffres mais > 65535
        assert!(matches!(
            SockAddress::parse("1.2.3.4:99999"),
            Err(AddrFormatError::InvalidPort(_))
        ));
        // port vide
        assert!(matches!(
            SockAddress::parse("1.2.3.4:"),
            Err(AddrFormatError::InvalidPort(_))
        ));
        // port non décimal
        assert!(matches!(
            SockAddress::parse("[::1]:http"),
            Err(AddrFormatError::InvalidPort(_))
        ));
    }

    #[test]
    fn parse_rejects_hostnames() {
        // La résolution de noms appartient au resolver, pas à la valeur.
        assert!(matches!(
            SockAddress::parse("example.com:80"),
            Err(AddrFormatError::InvalidHost(_))
        ));
        assert!(matches!(
            SockAddress::parse("[not-an-ip]:80"),
            Err(AddrFormatError::InvalidHost(_))
        ));
    }

    #[test]
    fn authority_round_trip() {
        for text in [
            "10.0.0.1:49152",
            "127.0.0.1:0",
            "[::1]:1900",
            "[fe80::1234]:65535",
        ] {
            let a = SockAddress::parse(text).unwrap();
            assert_eq!(SockAddress::parse(&a.to_authority()).unwrap(), a, "{text}");
        }
    }

    #[test]
    fn equality_contract() {
        let a = SockAddress::parse("10.0.0.1:80").unwrap();
        let b = SockAddress::parse("10.0.0.1:80").unwrap();
        let c = SockAddress::parse("10.0.0.1:81").unwrap();
        let v6 = SockAddress::parse("[::ffff:10.0.0.1]:80").unwrap();

        // réflexive et symétrique
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        // port différent
        assert_ne!(a, c);
        // familles différentes, même si l'adresse v6 est une forme mappée
        assert_ne!(a, v6);
        // deux sentinelles sont égales
        assert_eq!(SockAddress::Unspecified, SockAddress::Unspecified);
        assert_ne!(SockAddress::Unspecified, a);
    }

    #[test]
    fn with_port_and_accessors() {
        let a = SockAddress::parse("192.168.0.9").unwrap();
        assert_eq!(a.with_port(5000).port(), 5000);
        assert_eq!(a.with_port(5000).ip(), a.ip());

        // La sentinelle reste une sentinelle
        assert_eq!(
            SockAddress::Unspecified.with_port(80),
            SockAddress::Unspecified
        );
        assert_eq!(SockAddress::Unspecified.port(), 0);
        assert_eq!(SockAddress::Unspecified.to_text(), "");
        assert_eq!(SockAddress::Unspecified.to_authority(), "");
    }

    #[test]
    fn display_forms() {
        assert_eq!(
            SockAddress::parse("[::1]:80").unwrap().to_authority(),
            "[::1]:80"
        );
        assert_eq!(SockAddress::parse("::1").unwrap().to_text(), "::1");
        assert_eq!(format!("{}", SockAddress::Unspecified), "unspecified");
    }
}

//! Configuration du miniserver.
//!
//! Structure typée, chargée depuis un fichier YAML puis surchargée par les
//! variables d'environnement `PNP_CONFIG__*`. Chaque instance de
//! [`crate::MiniServer`] reçoit sa propre copie : pas d'état global.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::ServerError;
use crate::ssdp::SSDP_PORT;

/// Port HTTP préféré par défaut (début de la plage dynamique UPnP).
pub const DEFAULT_HTTP_PORT: u16 = 49152;

/// Nombre de ports candidats sondés quand le port préféré est occupé :
/// le port demandé puis ses 19 successeurs. Épuisement = échec de démarrage.
pub const PORT_PROBE_RANGE: u16 = 20;

/// Backlog des sockets d'écoute HTTP.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Variable d'environnement donnant le chemin du fichier de configuration.
pub const ENV_CONFIG_FILE: &str = "PNP_CONFIG";

/// Préfixe des surcharges d'environnement (`PNP_CONFIG__HTTP_PORT`, ...).
pub const ENV_PREFIX: &str = "PNP_CONFIG__";

/// Chemins des fichiers PEM pour l'acceptation TLS (exploités uniquement
/// quand le crate est compilé avec la feature `tls`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_pem: PathBuf,
    pub key_pem: PathBuf,
}

/// Configuration d'une instance de miniserver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Port HTTP préféré ; 0 demande un port éphémère (sans sondage).
    pub http_port: u16,
    /// Active l'écoute IPv6 (toujours en v6-only, jamais en v4 mappé).
    pub enable_ipv6: bool,
    /// Active les sockets SSDP (récepteurs multicast + réponses unicast).
    pub enable_ssdp: bool,
    /// Port des récepteurs SSDP ; 1900 en production, 0 dans les tests.
    pub ssdp_port: u16,
    /// Restreint la liaison HTTP à une interface nommée.
    pub interface: Option<String>,
    /// N'écoute que sur le loopback (mode test / strictement local).
    pub loopback_only: bool,
    /// Racine des documents statiques du webserver.
    pub document_root: Option<PathBuf>,
    /// Origine CORS ajoutée aux réponses du webserver.
    pub cors: Option<String>,
    /// Certificat/clé TLS pour l'écoute HTTPS.
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            enable_ipv6: false,
            enable_ssdp: true,
            ssdp_port: SSDP_PORT,
            interface: None,
            loopback_only: false,
            document_root: None,
            cors: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Charge la configuration depuis un fichier YAML puis applique les
    /// surcharges d'environnement.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: ServerConfig = serde_yaml::from_str(&text)
            .map_err(|e| ServerError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Configuration par défaut, fichier `PNP_CONFIG` s'il est défini,
    /// surcharges d'environnement dans tous les cas.
    pub fn load_default() -> Result<Self, ServerError> {
        let mut config = match std::env::var(ENV_CONFIG_FILE) {
            Ok(path) if !path.is_empty() => return Self::load(path),
            _ => ServerConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applique les surcharges `PNP_CONFIG__*` fournies par `get`.
    ///
    /// Les valeurs invalides sont journalisées et ignorées : une variable
    /// d'environnement mal formée ne doit pas empêcher le démarrage.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let key = |name: &str| format!("{ENV_PREFIX}{name}");

        if let Some(text) = get(&key("HTTP_PORT")) {
            match text.parse() {
                Ok(port) => self.http_port = port,
                Err(_) => warn!("ignoring invalid {}HTTP_PORT='{}'", ENV_PREFIX, text),
            }
        }
        if let Some(text) = get(&key("ENABLE_IPV6")) {
            match parse_bool(&text) {
                Some(v) => self.enable_ipv6 = v,
                None => warn!("ignoring invalid {}ENABLE_IPV6='{}'", ENV_PREFIX, text),
            }
        }
        if let Some(text) = get(&key("ENABLE_SSDP")) {
            match parse_bool(&text) {
                Some(v) => self.enable_ssdp = v,
                None => warn!("ignoring invalid {}ENABLE_SSDP='{}'", ENV_PREFIX, text),
            }
        }
        if let Some(text) = get(&key("LOOPBACK_ONLY")) {
            match parse_bool(&text) {
                Some(v) => self.loopback_only = v,
                None => warn!("ignoring invalid {}LOOPBACK_ONLY='{}'", ENV_PREFIX, text),
            }
        }
        if let Some(text) = get(&key("INTERFACE")) {
            self.interface = (!text.is_empty()).then_some(text);
        }
        if let Some(text) = get(&key("DOCUMENT_ROOT")) {
            self.document_root = (!text.is_empty()).then(|| PathBuf::from(text));
        }
        if let Some(text) = get(&key("CORS")) {
            self.cors = (!text.is_empty()).then_some(text);
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_upnp_conventions() {
        let config = ServerConfig::default();
        assert_eq!(config.http_port, 49152);
        assert_eq!(config.ssdp_port, 1900);
        assert!(config.enable_ssdp);
        assert!(!config.enable_ipv6);
        assert!(!config.loopback_only);
        assert!(config.document_root.is_none());
    }

    #[test]
    fn yaml_round_trip() {
        let text = "http_port: 8200\nenable_ipv6: true\ndocument_root: /srv/www\ncors: '*'\n";
        let config: ServerConfig = serde_yaml::from_str(text).unwrap();
        assert_eq!(config.http_port, 8200);
        assert!(config.enable_ipv6);
        assert_eq!(config.document_root, Some(PathBuf::from("/srv/www")));
        assert_eq!(config.cors.as_deref(), Some("*"));
        // les champs absents gardent leurs défauts
        assert_eq!(config.ssdp_port, 1900);

        let dumped = serde_yaml::to_string(&config).unwrap();
        let reloaded: ServerConfig = serde_yaml::from_str(&dumped).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn environment_overrides_apply() {
        let mut vars = HashMap::new();
        vars.insert("PNP_CONFIG__HTTP_PORT".to_string(), "9000".to_string());
        vars.insert("PNP_CONFIG__ENABLE_IPV6".to_string(), "yes".to_string());
        vars.insert("PNP_CONFIG__CORS".to_string(), "*".to_string());

        let mut config = ServerConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        assert_eq!(config.http_port, 9000);
        assert!(config.enable_ipv6);
        assert_eq!(config.cors.as_deref(), Some("*"));
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut vars = HashMap::new();
        vars.insert("PNP_CONFIG__HTTP_PORT".to_string(), "banana".to_string());
        vars.insert("PNP_CONFIG__ENABLE_IPV6".to_string(), "maybe".to_string());

        let mut config = ServerConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert!(!config.enable_ipv6);
    }

    #[test]
    fn load_reports_missing_files() {
        assert!(matches!(
            ServerConfig::load("/nonexistent/pnpstack.yaml"),
            Err(ServerError::Config(_))
        ));
    }
}

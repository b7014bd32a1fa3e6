//! Résolution de noms d'hôtes.
//!
//! [`SockAddress::parse`](crate::addr::SockAddress::parse) n'accepte que des
//! littéraux numériques ; tout ce qui ressemble à un nom passe par ici. Le
//! trait [`Resolver`] est injecté à la construction des composants qui en ont
//! besoin, avec [`SystemResolver`] en production et [`StaticResolver`] dans
//! les tests.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::addr::SockAddress;
use crate::errors::ResolveError;

/// Résolution nom → adresses, substituable pour les tests.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Résout `host` et associe `port` à chaque adresse obtenue.
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SockAddress>, ResolveError>;
}

/// Résolution réelle via le resolver du système.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SockAddress>, ResolveError> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ResolveError::LookupFailed {
                host: host.to_string(),
                source,
            })?
            .map(SockAddress::from)
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(ResolveError::NoAddress(host.to_string()));
        }
        Ok(addrs)
    }
}

/// Table de résolution figée, pour les tests déterministes.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute (ou remplace) les adresses d'un nom.
    pub fn insert(&mut self, host: impl Into<String>, addrs: Vec<IpAddr>) {
        self.table.insert(host.into(), addrs);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SockAddress>, ResolveError> {
        match self.table.get(host) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs
                .iter()
                .map(|ip| SockAddress::new(*ip, port))
                .collect()),
            _ => Err(ResolveError::NoAddress(host.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn static_resolver_returns_registered_addresses() {
        let mut resolver = StaticResolver::new();
        resolver.insert(
            "media-server.local",
            vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))],
        );

        let addrs = resolver.resolve("media-server.local", 8080).await.unwrap();
        assert_eq!(addrs, vec![SockAddress::parse("192.168.1.10:8080").unwrap()]);
    }

    #[tokio::test]
    async fn static_resolver_reports_unknown_hosts() {
        let resolver = StaticResolver::new();
        assert!(matches!(
            resolver.resolve("unknown.local", 80).await,
            Err(ResolveError::NoAddress(_))
        ));
    }

    #[tokio::test]
    async fn system_resolver_resolves_localhost() {
        let addrs = SystemResolver.resolve("localhost", 1900).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 1900));
        assert!(addrs.iter().any(|a| a.is_loopback()));
    }

    #[tokio::test]
    async fn system_resolver_accepts_numeric_hosts() {
        let addrs = SystemResolver.resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(addrs, vec![SockAddress::parse("127.0.0.1:80").unwrap()]);
    }
}

//! Seams de répartition du miniserver.
//!
//! Deux interfaces consommées, jamais implémentées en dur ici :
//!
//! - [`JobSink`] : remise de travaux "fire-and-forget" au pool de tâches
//!   externe, pour que la boucle d'écoute ne soit jamais bloquée par le
//!   traitement d'une requête ;
//! - [`UpnpCallbacks`] : points d'entrée SOAP/GENA/SSDP choisis au démarrage.
//!
//! L'implémentation par défaut de [`JobSink`] pose le travail sur le runtime
//! tokio ; [`NullCallbacks`] répond 501 et ignore les datagrammes, ce qui
//! permet de faire tourner le cœur seul.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::httpmsg::{HttpRequest, HttpResponse};
use crate::ssdp::{SsdpPacket, SsdpReply};

/// Travail prêt à être exécuté par le pool externe.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Interface de remise de travaux, sans valeur de retour attendue.
pub trait JobSink: Send + Sync + 'static {
    fn submit(&self, job: Job);
}

/// Remise sur le runtime tokio courant.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioJobs;

impl JobSink for TokioJobs {
    fn submit(&self, job: Job) {
        tokio::spawn(job);
    }
}

/// Callbacks protocolaires branchés au démarrage du miniserver.
///
/// Les corps de messages arrivent bruts : leur interprétation (XML SOAP,
/// en-têtes GENA, framing SSDP) est le travail des couches externes.
#[async_trait]
pub trait UpnpCallbacks: Send + Sync + 'static {
    /// Requête de contrôle SOAP (POST portant un en-tête SOAPACTION).
    async fn on_soap(&self, request: HttpRequest) -> HttpResponse {
        let _ = request;
        HttpResponse::not_implemented()
    }

    /// Requête d'événementiel GENA (SUBSCRIBE, UNSUBSCRIBE, NOTIFY).
    async fn on_gena(&self, request: HttpRequest) -> HttpResponse {
        let _ = request;
        HttpResponse::not_implemented()
    }

    /// Datagramme reçu sur un socket SSDP ; `reply` permet de répondre en
    /// unicast à l'émetteur.
    async fn on_ssdp(&self, packet: SsdpPacket, reply: Arc<SsdpReply>) {
        let _ = (packet, reply);
    }
}

/// Callbacks neutres : le cœur tourne seul, sans couche protocolaire.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallbacks;

#[async_trait]
impl UpnpCallbacks for NullCallbacks {}

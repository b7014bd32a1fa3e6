//! Énumération des interfaces réseau locales.
//!
//! Le système d'exploitation est interrogé via le trait [`AdapterSource`]
//! (implémentation réelle : [`SystemAdapters`] sur `get_if_addrs`), ce qui
//! permet d'injecter une liste d'interfaces fabriquée dans les tests.
//!
//! [`AdapterScan`] charge un instantané à la demande et le parcourt avec un
//! curseur ; seules les interfaces *valides* sont visitées : loopback, ou
//! (active ET multicast) avec une adresse IPv4/IPv6.

use std::net::{IpAddr, UdpSocket};

use get_if_addrs::IfAddr;
use tracing::warn;

use crate::addr::{AddrFamily, SockAddress};
use crate::errors::AdapterError;

/// Instantané d'une interface réseau.
#[derive(Debug, Clone)]
pub struct NetworkAdapter {
    /// Nom OS de l'interface (ex: "eth0", "lo", "en0").
    pub name: String,
    /// Index OS de l'interface, 0 = invalide/inconnu.
    pub index: u32,
    /// Adresse portée par l'interface (port 0).
    pub addr: SockAddress,
    /// Masque de sous-réseau associé (port 0).
    pub netmask: SockAddress,
    /// Longueur de préfixe dérivée du masque.
    pub prefix: u8,
    pub loopback: bool,
    pub up: bool,
    pub multicast: bool,
}

impl NetworkAdapter {
    /// Une interface est utilisable par la pile si elle est loopback, ou
    /// active et capable de multicast, et qu'elle porte bien une adresse.
    pub fn is_valid(&self) -> bool {
        (self.loopback || (self.up && self.multicast)) && !self.addr.is_unspecified()
    }

    pub fn family(&self) -> Option<AddrFamily> {
        self.addr.family()
    }
}

/// Source d'instantanés d'interfaces, substituable pour les tests.
pub trait AdapterSource: Send + Sync {
    fn snapshot(&self) -> Result<Vec<NetworkAdapter>, AdapterError>;
}

/// Implémentation réelle sur `get_if_addrs`.
///
/// `get_if_addrs` ne publie pas les drapeaux d'état : les interfaces
/// retournées sont des interfaces configurées, considérées actives et
/// capables de multicast. Le filtrage fin reste testé via des sources
/// fabriquées.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAdapters;

impl AdapterSource for SystemAdapters {
    fn snapshot(&self) -> Result<Vec<NetworkAdapter>, AdapterError> {
        let mut out = Vec::new();
        for iface in get_if_addrs::get_if_addrs()? {
            let (ip, mask): (IpAddr, IpAddr) = match &iface.addr {
                IfAddr::V4(v4) => (IpAddr::V4(v4.ip), IpAddr::V4(v4.netmask)),
                IfAddr::V6(v6) => (IpAddr::V6(v6.ip), IpAddr::V6(v6.netmask)),
            };
            let prefix = match prefix_from_netmask(mask) {
                Ok(p) => p,
                Err(e) => {
                    warn!("adapter {}: unusable netmask {}: {}", iface.name, mask, e);
                    0
                }
            };
            out.push(NetworkAdapter {
                index: interface_index(&iface.name),
                name: iface.name,
                addr: SockAddress::new(ip, 0),
                netmask: SockAddress::new(mask, 0),
                prefix,
                loopback: ip.is_loopback(),
                up: true,
                multicast: true,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BeforeFirst,
    At(usize),
    Exhausted,
}

/// Parcours d'un instantané d'interfaces.
///
/// Les accesseurs restent sûrs quand le curseur est épuisé : ils rendent des
/// valeurs neutres ("", adresse non spécifiée, 0) et ne paniquent jamais.
#[derive(Debug)]
pub struct AdapterScan {
    entries: Vec<NetworkAdapter>,
    cursor: Cursor,
}

impl AdapterScan {
    /// Crée un parcours vide ; appeler [`AdapterScan::load`] avant usage.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            cursor: Cursor::Exhausted,
        }
    }

    /// Charge un nouvel instantané depuis la source.
    ///
    /// Réappelable à volonté : l'instantané précédent est remplacé et le
    /// curseur repart du début.
    pub fn load(&mut self, source: &dyn AdapterSource) -> Result<(), AdapterError> {
        self.entries = source.snapshot()?;
        self.cursor = Cursor::BeforeFirst;
        Ok(())
    }

    /// Avance le curseur jusqu'à la prochaine interface valide.
    ///
    /// Retourne `false` quand il n'en reste plus ; le curseur reste alors
    /// épuisé (les appels suivants retournent aussi `false`).
    pub fn get_next(&mut self) -> bool {
        let mut i = match self.cursor {
            Cursor::BeforeFirst => 0,
            Cursor::At(i) => i + 1,
            Cursor::Exhausted => return false,
        };
        while i < self.entries.len() {
            if self.entries[i].is_valid() {
                self.cursor = Cursor::At(i);
                return true;
            }
            i += 1;
        }
        self.cursor = Cursor::Exhausted;
        false
    }

    /// Interface courante, `None` hors d'une entrée valide.
    pub fn current(&self) -> Option<&NetworkAdapter> {
        match self.cursor {
            Cursor::At(i) => self.entries.get(i),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        self.current().map(|a| a.name.as_str()).unwrap_or("")
    }

    pub fn sockaddr(&self) -> SockAddress {
        self.current().map(|a| a.addr).unwrap_or_default()
    }

    pub fn socknetmask(&self) -> SockAddress {
        self.current().map(|a| a.netmask).unwrap_or_default()
    }

    pub fn index(&self) -> u32 {
        self.current().map(|a| a.index).unwrap_or(0)
    }

    pub fn bitmask(&self) -> u8 {
        self.current().map(|a| a.prefix).unwrap_or(0)
    }

    /// Itérateur sur toutes les interfaces valides de l'instantané, sans
    /// toucher au curseur.
    pub fn valid_adapters(&self) -> impl Iterator<Item = &NetworkAdapter> {
        self.entries.iter().filter(|a| a.is_valid())
    }
}

impl Default for AdapterScan {
    fn default() -> Self {
        Self::new()
    }
}

/// Convertit un masque de sous-réseau en longueur de préfixe.
///
/// Compte les bits à 1 de tête puis vérifie que le reste est entièrement à
/// zéro ; un masque non contigu (ex: 255.0.255.0) est rejeté.
pub fn prefix_from_netmask(mask: IpAddr) -> Result<u8, AdapterError> {
    let (value, width) = match mask {
        IpAddr::V4(m) => (u128::from(u32::from(m)), 32u32),
        IpAddr::V6(m) => (u128::from(m), 128u32),
    };
    let aligned = value << (128 - width);
    let ones = aligned.leading_ones();
    let contiguous = ones == 128 || (aligned << ones) == 0;
    if contiguous {
        Ok(ones as u8)
    } else {
        Err(AdapterError::InvalidNetmask(mask.to_string()))
    }
}

/// Construit le masque de sous-réseau correspondant à une longueur de préfixe.
pub fn netmask_from_prefix(prefix: u8, family: AddrFamily) -> Result<IpAddr, AdapterError> {
    match family {
        AddrFamily::V4 => {
            if prefix > 32 {
                return Err(AdapterError::InvalidPrefix {
                    prefix,
                    family: "IPv4",
                });
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            Ok(IpAddr::V4(mask.into()))
        }
        AddrFamily::V6 => {
            if prefix > 128 {
                return Err(AdapterError::InvalidPrefix {
                    prefix,
                    family: "IPv6",
                });
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            Ok(IpAddr::V6(mask.into()))
        }
    }
}

/// Devine l'adresse IP locale de la machine.
///
/// Un socket UDP "connecté" vers un serveur DNS public révèle l'interface
/// que le système utiliserait pour sortir ; aucun datagramme n'est émis.
/// Retourne 127.0.0.1 si rien n'est trouvé.
pub fn guess_local_ip() -> IpAddr {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local) = socket.local_addr() {
                    return local.ip();
                }
            }
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        }
        Err(_) => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    }
}

/// Index OS d'une interface nommée, 0 si inconnue.
#[cfg(unix)]
pub fn interface_index(name: &str) -> u32 {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return 0;
    };
    unsafe { libc::if_nametoindex(cname.as_ptr()) }
}

/// Index OS d'une interface nommée ; non disponible hors Unix, le groupe
/// multicast est alors joint sur l'interface par défaut (index 0).
#[cfg(not(unix))]
pub fn interface_index(_name: &str) -> u32 {
    0
}

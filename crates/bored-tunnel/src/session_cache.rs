//! Backend TLS session resumption cache
//!
//! Every stream opens its own TLS connection to the same backend, so the
//! tickets from one handshake are offered on the next. The cache holds a
//! single endpoint and the most recently stored tickets win. A stale or
//! rejected ticket only costs a full handshake.
//!
//! rustls calls into the store from inside the handshake. The inner cache
//! lock is held only for a single map lookup or insert and never across I/O.

use rustls::client::{
    ClientSessionMemoryCache, ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue,
};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Shared session store with resumption counters
#[derive(Debug)]
pub struct SessionTicketCache {
    inner: ClientSessionMemoryCache,
    tickets_stored: AtomicU64,
    resumption_offers: AtomicU64,
}

impl SessionTicketCache {
    pub fn new() -> Self {
        Self {
            inner: ClientSessionMemoryCache::new(1),
            tickets_stored: AtomicU64::new(0),
            resumption_offers: AtomicU64::new(0),
        }
    }

    /// Tickets and sessions received from the backend
    pub fn tickets_stored(&self) -> u64 {
        self.tickets_stored.load(Ordering::Relaxed)
    }

    /// Handshakes that offered a cached ticket or session
    pub fn resumption_offers(&self) -> u64 {
        self.resumption_offers.load(Ordering::Relaxed)
    }
}

impl Default for SessionTicketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSessionStore for SessionTicketCache {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.inner.set_kx_hint(server_name, group);
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.inner.kx_hint(server_name)
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.tickets_stored.fetch_add(1, Ordering::Relaxed);
        trace!("Stored TLS 1.2 session for {:?}", server_name);
        self.inner.set_tls12_session(server_name, value);
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        let session = self.inner.tls12_session(server_name);
        if session.is_some() {
            self.resumption_offers.fetch_add(1, Ordering::Relaxed);
        }
        session
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.inner.remove_tls12_session(server_name);
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.tickets_stored.fetch_add(1, Ordering::Relaxed);
        trace!("Stored TLS 1.3 ticket for {:?}", server_name);
        self.inner.insert_tls13_ticket(server_name, value);
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        let ticket = self.inner.take_tls13_ticket(server_name);
        if ticket.is_some() {
            self.resumption_offers.fetch_add(1, Ordering::Relaxed);
        }
        ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cache_offers_nothing() {
        let cache = SessionTicketCache::new();
        let name = ServerName::try_from("backend.local").unwrap();

        assert!(cache.take_tls13_ticket(&name).is_none());
        assert!(cache.tls12_session(&name).is_none());
        assert_eq!(cache.resumption_offers(), 0);
        assert_eq!(cache.tickets_stored(), 0);
    }

    #[test]
    fn test_kx_hint_is_remembered() {
        let cache = SessionTicketCache::new();
        let name = ServerName::try_from("backend.local").unwrap();

        cache.set_kx_hint(name.clone(), NamedGroup::X25519);
        assert_eq!(cache.kx_hint(&name), Some(NamedGroup::X25519));
    }
}

//! # Transport Health
//!
//! `Connected(version) → Disconnected → Connected(new version)`.
//!
//! Each acquired transport handle gets a fresh [`Cookie`]. A death
//! notification carrying anything but the current cookie refers to a handle
//! that has already been replaced and is ignored. A genuine death:
//!
//! 1. invalidates the binding so new submits fail fast,
//! 2. drains the pending table and fails every record with `TransportUnavailable`,
//! 3. force-releases both lease classes,
//! 4. opens a new serial epoch,
//! 5. reconnects, retrying on the timer worker until it succeeds.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::EngineInner;
use crate::error::RilError;
use crate::stats::Fault;
use crate::transport::{Cookie, RadioTransport, TransportLink};
use crate::version::CapabilityVersion;

/// The currently acquired transport handle.
pub(crate) struct Binding {
    pub cookie: Cookie,
    pub transport: Arc<dyn RadioTransport>,
    pub version: CapabilityVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connected {
        version: CapabilityVersion,
        cookie: Cookie,
    },
    Disconnected,
    ShutDown,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

impl EngineInner {
    pub(crate) fn on_transport_died(&self, cookie: Cookie) {
        let current = self.current_cookie();
        if current != Some(cookie) {
            self.stats.fault(Fault::StaleDeath);
            debug!(%cookie, current = ?current, "stale death notification ignored");
            return;
        }
        self.reset_connection(cookie, "transport died");
    }

    /// Full reset of the connection identified by `cookie`. A no-op if that
    /// connection was already replaced.
    pub(crate) fn reset_connection(&self, cookie: Cookie, reason: &str) {
        let drained = {
            let _guard = self.reset_lock.lock().unwrap_or_else(|e| e.into_inner());
            if self.current_cookie() != Some(cookie) {
                return;
            }
            self.binding.store(None);
            self.table.drain_all()
        };

        warn!(%cookie, reason, pending = drained.len(), "transport lost, resetting");
        self.stats.reset();

        for req in drained {
            self.finish(req, Err(RilError::TransportUnavailable));
        }
        self.lease.force_release_all();
        let epoch = self.serials.reset();
        debug!(epoch, "serial space reset");

        self.reconnect();
    }

    /// Try to acquire a transport handle now; on failure keep retrying every
    /// `reconnect_interval`.
    pub(crate) fn reconnect(&self) {
        if self.connect() || self.is_shut_down() {
            return;
        }
        let this = self.this.clone();
        self.timers.schedule(self.config.reconnect_interval, move || {
            if let Some(inner) = this.upgrade() {
                inner.reconnect();
            }
        });
    }

    /// Returns `true` once a transport is bound.
    fn connect(&self) -> bool {
        let _guard = self.reset_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_shut_down() {
            return false;
        }
        if self.binding.load().is_some() {
            return true;
        }

        let cookie = Cookie(self.next_cookie.fetch_add(1, Ordering::Relaxed));
        let link = TransportLink {
            cookie,
            events: self.events.clone(),
        };
        match self.connector.connect(link) {
            Ok(transport) => {
                let version = transport.capability();
                self.binding.store(Some(Arc::new(Binding {
                    cookie,
                    transport,
                    version,
                })));
                self.stats.connected();
                info!(%cookie, %version, "transport connected");
                true
            }
            Err(e) => {
                self.stats.fault(Fault::ReconnectFailed);
                warn!(%cookie, error = %e, "transport connect failed");
                false
            }
        }
    }
}

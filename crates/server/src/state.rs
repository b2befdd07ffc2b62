//! Application state
//!
//! Shared by every handler. Per-connection state lives in each session; the
//! only process-wide mutable state is the connection registry.

use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use parley_agent::{Session, SessionConfig, SessionStatus, SharedServices};
use parley_config::Settings;

use crate::ServerError;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub services: SharedServices,
    pub session_config: SessionConfig,
    pub connections: ConnectionRegistry,
    /// None when metrics are disabled
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Settings) -> Result<Self, ServerError> {
        let services = SharedServices::from_settings(&config)?;
        Ok(Self::with_services(config, services))
    }

    pub fn with_services(config: Settings, services: SharedServices) -> Self {
        Self {
            session_config: SessionConfig::from_settings(&config),
            config: Arc::new(config),
            services,
            connections: ConnectionRegistry::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Registry listing entry
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub degraded: bool,
    pub messages: usize,
}

struct Entry {
    remote_addr: Option<String>,
    connected_at: DateTime<Utc>,
    session: Arc<Session>,
}

/// Live connections.
///
/// Entries are added when a socket is accepted and removed when its session
/// has finished; nothing else mutates them.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ConnectionRegistry {
    /// Register a connection unless `limit` is already reached
    pub fn try_insert(
        &self,
        session: Arc<Session>,
        remote_addr: Option<String>,
        limit: usize,
    ) -> Result<(), ServerError> {
        let mut inner = self.inner.lock();
        if inner.len() >= limit {
            return Err(ServerError::AtCapacity(limit));
        }
        inner.insert(
            session.connection_id().to_string(),
            Entry {
                remote_addr,
                connected_at: Utc::now(),
                session,
            },
        );
        Ok(())
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        self.inner.lock().remove(connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of every connection, oldest first
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .inner
            .lock()
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                connection_id: id.clone(),
                remote_addr: entry.remote_addr.clone(),
                connected_at: entry.connected_at,
                status: entry.session.status(),
                degraded: entry.session.is_degraded(),
                messages: entry.session.store().len(),
            })
            .collect();
        list.sort_by_key(|info| info.connected_at);
        list
    }
}

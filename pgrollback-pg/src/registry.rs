use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use pgrollback_core::{config::ProxyConfig, err::Result, web::SessionInfo};
use pgrollback_logging::{debug, info, warn};

use crate::{backend::BackendConnection, session::Session};

/// Process-wide mapping from test identifier to session.
///
/// The lock covers structural changes only and is never held across an
/// await point; backend connections are opened before taking it and the
/// entry is revalidated under the lock to avoid duplicate creations.
pub struct SessionRegistry {
    conf: &'static ProxyConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

enum Install {
    /// Our fresh session went in; an evicted stale entry may need teardown
    Installed(Option<Arc<Session>>),
    /// Another connection created a session while we were connecting
    Raced(Arc<Session>),
}

impl SessionRegistry {
    pub fn new(conf: &'static ProxyConfig) -> Self {
        Self {
            conf,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn conf(&self) -> &'static ProxyConfig {
        self.conf
    }

    /// Read-only lookup
    pub fn get(&self, test_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(test_id).cloned()
    }

    /// Returns the session for the supplied test id, creating it (or
    /// replacing a dead one) as needed.
    pub async fn get_or_create(&self, test_id: &str) -> Result<Arc<Session>> {
        let stale = self.get(test_id);

        if let Some(session) = stale.as_ref() {
            if session.healthy().await {
                return Ok(Arc::clone(session));
            }

            debug!("Session \"{}\" has a dead backend, replacing", test_id);
        }

        let backend = self.open_backend(test_id).await?;
        let session = Arc::new(Session::new(test_id, backend));
        self.spawn_keepalive(&session).await;

        let install = {
            let mut sessions = self.sessions.write().unwrap();

            match sessions.get(test_id) {
                Some(existing)
                    if stale
                        .as_ref()
                        .map(|s| !Arc::ptr_eq(existing, s))
                        .unwrap_or(true) =>
                {
                    Install::Raced(Arc::clone(existing))
                }
                _ => Install::Installed(
                    sessions.insert(test_id.to_string(), Arc::clone(&session)),
                ),
            }
        };

        match install {
            Install::Raced(existing) => {
                // Ours lost the race, tear it down quietly
                Self::teardown(session).await;
                Ok(existing)
            }
            Install::Installed(replaced) => {
                if let Some(old) = replaced {
                    Self::teardown(old).await;
                }

                info!("Created session \"{}\"", test_id);
                Ok(session)
            }
        }
    }

    /// Opens, configures and verifies a backend connection, then begins
    /// the outer transaction. Nothing is registered if any step fails.
    async fn open_backend(&self, test_id: &str) -> Result<BackendConnection> {
        let application_name = format!("pgrollback/{}", test_id);
        let mut backend =
            BackendConnection::connect(&self.conf.backend, &application_name).await?;

        let setup = async {
            backend
                .configure_session(self.conf.session.idle_timeout())
                .await?;
            backend.ping().await?;
            backend.begin_tx().await?;
            Result::<_>::Ok(())
        };
        let res = setup.await;

        match res {
            Ok(()) => Ok(backend),
            Err(err) => {
                let _ = backend.close().await;
                Err(err)
            }
        }
    }

    async fn spawn_keepalive(&self, session: &Arc<Session>) {
        let interval = match self.conf.session.keepalive_interval() {
            Some(interval) => interval,
            None => return,
        };

        let weak = Arc::downgrade(session);
        let test_id = session.test_id().to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let session = match weak.upgrade() {
                    Some(session) => session,
                    None => break,
                };

                let mut state = session.state().lock().await;

                if let Some(backend) = state.backend_opt_mut() {
                    if let Err(err) = backend.ping().await {
                        warn!("Keepalive ping failed for session \"{}\": {:?}", test_id, err);
                    }
                }
            }
        });

        session.state().lock().await.keepalive = Some(handle);
    }

    /// Destroys the session: rolls back the outer transaction, closes the
    /// backend connection and removes the entry. Returns false when no
    /// session exists for the id.
    pub async fn destroy(&self, test_id: &str) -> Result<bool> {
        let removed = self.sessions.write().unwrap().remove(test_id);

        match removed {
            Some(session) => {
                Self::teardown(session).await;
                info!("Destroyed session \"{}\"", test_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn teardown(session: Arc<Session>) {
        let mut state = session.state().lock().await;

        if let Some(keepalive) = state.keepalive.take() {
            keepalive.abort();
        }

        if let Some(backend) = state.take_backend() {
            // The backend may already be gone; destruction is idempotent
            if let Err(err) = backend.close().await {
                debug!("Error while closing backend connection: {:?}", err);
            }
        }
    }

    /// Destroys every session whose last activity is older than the
    /// configured idle timeout, returning how many were destroyed.
    pub async fn cleanup_expired(&self) -> usize {
        let idle_timeout = self.conf.session.idle_timeout();
        let mut destroyed = 0;

        for session in self.snapshot() {
            let age = Utc::now()
                .signed_duration_since(session.last_activity().await)
                .to_std()
                .unwrap_or_default();

            if age > idle_timeout {
                info!(
                    "Session \"{}\" idle for {:?}, destroying",
                    session.test_id(),
                    age
                );

                if self.destroy(session.test_id()).await.unwrap_or(false) {
                    destroyed += 1;
                }
            }
        }

        destroyed
    }

    /// Destroys every registered session. Used at process shutdown.
    pub async fn destroy_all(&self) {
        for session in self.snapshot() {
            let _ = self.destroy(session.test_id()).await;
        }
    }

    /// A point-in-time list of every session, ordered by test id
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().unwrap().values().cloned().collect();
        sessions.sort_by(|a, b| a.test_id().cmp(b.test_id()));
        sessions
    }

    /// Read-only views for the dashboard
    pub async fn infos(&self) -> Vec<SessionInfo> {
        let mut infos = vec![];

        for session in self.snapshot() {
            infos.push(session.info().await);
        }

        infos
    }

    /// Clears the query history of the supplied session. Returns false
    /// when no session exists for the id.
    pub async fn clear_history(&self, test_id: &str) -> bool {
        match self.get(test_id) {
            Some(session) => {
                session.state().lock().await.clear_history();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.test_id().to_string(), session);
    }
}

//! Access-token ownership and single-flight refresh.
//!
//! One [`AuthSessionManager`] is built per process and handed to the HTTP
//! layer. When a request comes back 401 the caller asks the manager for a
//! fresh credential: the first caller performs the refresh, everyone arriving
//! while it runs waits in FIFO order and receives the same outcome.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::error::{CoreResult, EduError};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::{RefreshRequest, RefreshResponse};

fn secret(s: &str) -> SecretString {
    SecretString::new(s.to_owned().into_boxed_str())
}

/// A bearer token tagged with the generation it was issued in.
///
/// The generation lets a 401 handler tell whether someone already refreshed
/// since its request went out.
#[derive(Debug)]
pub struct Credential {
    pub token: SecretString,
    pub generation: u64,
}

impl Credential {
    pub fn bearer(&self) -> &str {
        self.token.expose_secret()
    }
}

/// Token pair returned by a refresh.
#[derive(Debug)]
pub struct TokenPair {
    pub access: SecretString,
    /// None keeps the current refresh token.
    pub refresh: Option<SecretString>,
}

/// Persisted form of the session tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub trait TokenStore: Send + Sync {
    fn load(&self) -> CoreResult<Option<StoredTokens>>;
    fn save(&self, tokens: &StoredTokens) -> CoreResult<()>;
    fn clear(&self) -> CoreResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<StoredTokens>>,
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> CoreResult<Option<StoredTokens>> {
        Ok(self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, tokens: &StoredTokens) -> CoreResult<()> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> CoreResult<()> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }
}

/// JSON file holding the token pair.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> CoreResult<Option<StoredTokens>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let tokens = serde_json::from_slice(&bytes)
            .map_err(|e| EduError::Decode(format!("token file {}: {e}", self.path.display())))?;
        Ok(Some(tokens))
    }

    fn save(&self, tokens: &StoredTokens) -> CoreResult<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(tokens).map_err(|e| EduError::Other(e.into()))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn clear(&self) -> CoreResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Exchanges a refresh token for a new token pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> CoreResult<TokenPair>;
}

/// Calls `POST {base}/api/v1/auth/refresh`.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    http: HttpClient,
    url: String,
}

impl HttpTokenRefresher {
    pub fn new(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            url: format!("{}/api/v1/auth/refresh", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &SecretString) -> CoreResult<TokenPair> {
        let body = RefreshRequest {
            refresh_token: refresh_token.expose_secret().to_string(),
        };
        let resp: RefreshResponse = self
            .http
            .post_json(&self.url, &body, &[], &RequestCtx::default())
            .await?;
        Ok(TokenPair {
            access: secret(&resp.access_token),
            refresh: resp.refresh_token.as_deref().map(secret),
        })
    }
}

type Waiter = oneshot::Sender<Option<Credential>>;

#[derive(Default)]
struct AuthState {
    access: Option<SecretString>,
    refresh: Option<SecretString>,
    generation: u64,
    refreshing: bool,
    waiters: VecDeque<Waiter>,
}

impl AuthState {
    fn credential(&self) -> Option<Credential> {
        self.access.as_ref().map(|t| Credential {
            token: secret(t.expose_secret()),
            generation: self.generation,
        })
    }

    fn fail_waiters(&mut self) {
        self.refreshing = false;
        for w in self.waiters.drain(..) {
            let _ = w.send(None);
        }
    }
}

pub struct AuthSessionManager {
    state: Mutex<AuthState>,
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn TokenStore>,
    logged_out: watch::Sender<bool>,
}

impl std::fmt::Debug for AuthSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("AuthSessionManager")
            .field("has_token", &st.access.is_some())
            .field("generation", &st.generation)
            .field("refreshing", &st.refreshing)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}

/// Clears the refreshing flag if the refreshing future is dropped mid-flight,
/// so waiters are not stranded.
struct RefreshGuard<'a> {
    mgr: &'a AuthSessionManager,
    started: u64,
    armed: bool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.mgr.lock();
        // A sign-in or sign-out since then already settled the waiters.
        if st.generation == self.started {
            tracing::warn!("token refresh abandoned; failing queued requests");
            st.fail_waiters();
        }
    }
}

impl AuthSessionManager {
    /// Build a manager seeded from `store`.
    pub fn new(refresher: Arc<dyn TokenRefresher>, store: Arc<dyn TokenStore>) -> CoreResult<Self> {
        let mut state = AuthState::default();
        if let Some(saved) = store.load()? {
            state.access = Some(secret(&saved.access_token));
            state.refresh = saved.refresh_token.as_deref().map(secret);
        }
        let logged_out = state.access.is_none();
        Ok(Self {
            state: Mutex::new(state),
            refresher,
            store,
            logged_out: watch::Sender::new(logged_out),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Install a fresh token pair, e.g. after an interactive login.
    pub fn sign_in(&self, access: &str, refresh: Option<&str>) -> CoreResult<()> {
        {
            let mut st = self.lock();
            st.access = Some(secret(access));
            st.refresh = refresh.map(secret);
            st.generation += 1;
            // Requests queued behind a refresh can use the new login directly.
            st.refreshing = false;
            let waiters: Vec<Waiter> = st.waiters.drain(..).collect();
            for w in waiters {
                let _ = w.send(st.credential());
            }
        }
        self.store.save(&StoredTokens {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
        })?;
        self.logged_out.send_replace(false);
        Ok(())
    }

    pub fn credential(&self) -> Option<Credential> {
        self.lock().credential()
    }

    /// Fires `true` once the session is gone (refresh failure or sign-out).
    pub fn subscribe_logout(&self) -> watch::Receiver<bool> {
        self.logged_out.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().refreshing
    }

    pub fn pending_refresh_waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Drop all tokens and notify logout subscribers.
    pub fn sign_out(&self) {
        {
            let mut st = self.lock();
            st.access = None;
            st.refresh = None;
            st.generation += 1;
            st.fail_waiters();
        }
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "failed to clear stored tokens");
        }
        self.logged_out.send_replace(true);
    }

    /// Obtain a credential newer than `stale_generation`, refreshing at most
    /// once no matter how many callers hit a 401 concurrently.
    pub async fn refresh_after_unauthorized(&self, stale_generation: u64) -> CoreResult<Credential> {
        let (waiter, refresh_token) = {
            let mut st = self.lock();
            if st.generation != stale_generation {
                return st
                    .credential()
                    .ok_or_else(|| EduError::Unauthorized("signed out".into()));
            }
            if st.refreshing {
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                (Some(rx), None)
            } else {
                let Some(refresh) = st.refresh.as_ref().map(|r| secret(r.expose_secret())) else {
                    drop(st);
                    tracing::warn!("401 with no refresh token; signing out");
                    self.sign_out();
                    return Err(EduError::Unauthorized("no refresh token".into()));
                };
                st.refreshing = true;
                (None, Some(refresh))
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Some(cred)) => Ok(cred),
                _ => Err(EduError::Unauthorized("session refresh failed".into())),
            };
        }

        let Some(refresh_token) = refresh_token else {
            return Err(EduError::Unauthorized("session refresh failed".into()));
        };
        let mut guard = RefreshGuard {
            mgr: self,
            started: stale_generation,
            armed: true,
        };
        tracing::info!("refreshing access token");
        let outcome = self.refresher.refresh(&refresh_token).await;
        guard.armed = false;

        let mut st = self.lock();
        if st.generation != stale_generation {
            tracing::info!(
                refreshed = outcome.is_ok(),
                "session changed while refreshing; discarding refresh result"
            );
            return st
                .credential()
                .ok_or_else(|| EduError::Unauthorized("signed out".into()));
        }

        match outcome {
            Ok(pair) => {
                st.access = Some(pair.access);
                if let Some(r) = pair.refresh {
                    st.refresh = Some(r);
                }
                st.generation += 1;
                st.refreshing = false;
                let waiters: Vec<Waiter> = st.waiters.drain(..).collect();
                for w in waiters {
                    let _ = w.send(st.credential());
                }
                let stored = StoredTokens {
                    access_token: st
                        .access
                        .as_ref()
                        .map(|t| t.expose_secret().to_string())
                        .unwrap_or_default(),
                    refresh_token: st.refresh.as_ref().map(|t| t.expose_secret().to_string()),
                };
                let cred = st.credential();
                drop(st);
                if let Err(e) = self.store.save(&stored) {
                    tracing::warn!(error = %e, "failed to persist refreshed tokens");
                }
                cred.ok_or_else(|| EduError::Unauthorized("signed out".into()))
            }
            Err(e) => {
                drop(st);
                tracing::warn!(error = %e, "token refresh failed; signing out");
                self.sign_out();
                Err(EduError::Unauthorized(format!("session refresh failed: {e}")))
            }
        }
    }
}

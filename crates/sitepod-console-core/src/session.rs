//! Session state machine: `Loading -> {Authenticated, Unauthenticated}`.
//!
//! The record lives inside a `watch` channel owned by [`SessionManager`]. Only
//! the manager's operations replace it; everything else reads snapshots, either
//! directly, through a [`SessionReader`], or by subscribing to changes.
//!
//! Logins and the startup validation are serialized by one async gate, so two
//! logins never interleave their request and apply steps. `logout` and
//! `set_token` are synchronous and never wait on the gate.
//!
//! Every write that touches both the store and the in-memory record happens
//! under one sync lock, so storage and memory always agree on the token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex as AsyncMutex, watch};

use crate::auth::{
    ADMIN_AUTH_PATH, ADMIN_LOGIN_FAILED, ANONYMOUS_AUTH_PATH, ANONYMOUS_LOGIN_FAILED,
    AUTH_INFO_PATH, AdminAuthResponse, AnonymousAuthResponse, AuthInfoResponse, AuthInputError,
    AuthenticationError, IssuedSession, PASSWORD_AUTH_PATH, PASSWORD_LOGIN_FAILED,
    PasswordAuthRequest, PasswordAuthResponse, User, anonymous_failure_message,
    issued_from_admin, issued_from_anonymous, issued_from_password, normalize_identity,
    normalize_token,
};
use crate::config::ConsoleClientConfig;
use crate::storage::KeyValueStore;
use crate::transport::{HttpMethod, HttpRequest, HttpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Loading,
    Unauthenticated,
    Authenticated,
}

impl SessionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
        }
    }
}

/// Immutable copy of the session record. The token is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    #[serde(skip)]
    pub token: Option<String>,
    pub user: Option<User>,
    /// While true, `phase`/`user` are not yet trustworthy for UI decisions.
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl SessionSnapshot {
    fn unauthenticated() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            token: None,
            user: None,
            loading: false,
            expires_at: None,
        }
    }

    fn restoring(token: String) -> Self {
        Self {
            phase: SessionPhase::Loading,
            token: Some(token),
            user: None,
            loading: true,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }

    fn clear(&mut self) {
        self.phase = SessionPhase::Unauthenticated;
        self.token = None;
        self.user = None;
        self.expires_at = None;
    }

    fn is_restoring(&self, token: &str) -> bool {
        self.phase == SessionPhase::Loading && self.token.as_deref() == Some(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginFlow {
    Password,
    Admin,
    Anonymous,
}

impl LoginFlow {
    fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Admin => "admin",
            Self::Anonymous => "anonymous",
        }
    }

    fn fallback_message(self) -> &'static str {
        match self {
            Self::Password => PASSWORD_LOGIN_FAILED,
            Self::Admin => ADMIN_LOGIN_FAILED,
            Self::Anonymous => ANONYMOUS_LOGIN_FAILED,
        }
    }

    fn rejection(self, body: &str) -> AuthenticationError {
        match self {
            Self::Anonymous => AuthenticationError::rejected(anonymous_failure_message(body)),
            Self::Password | Self::Admin => AuthenticationError::rejected(self.fallback_message()),
        }
    }
}

/// Read-only view of the session. This is what the request gateway holds.
#[derive(Debug, Clone)]
pub struct SessionReader {
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionReader {
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.state.borrow().token.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ConsoleClientConfig,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn HttpTransport>,
    state: watch::Sender<SessionSnapshot>,
    operation_gate: Arc<AsyncMutex<()>>,
    /// Operations currently holding `loading`, including ones queued on the gate.
    in_flight: AtomicUsize,
    persist_lock: Mutex<()>,
}

impl SessionInner {
    fn persist_guard(&self) -> MutexGuard<'_, ()> {
        self.persist_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("SessionManager")
            .field("endpoint", &self.inner.config.endpoint)
            .field("phase", &snapshot.phase)
            .field("loading", &snapshot.loading)
            .finish_non_exhaustive()
    }
}

/// Holds `loading = true` for the lifetime of one operation, including when
/// the operation's future is dropped before completing. The flag drops back
/// to false only when the last in-flight operation releases it.
struct LoadingGuard<'a> {
    inner: &'a SessionInner,
}

impl<'a> LoadingGuard<'a> {
    fn begin(inner: &'a SessionInner) -> Self {
        inner.state.send_if_modified(|snapshot| {
            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            !std::mem::replace(&mut snapshot.loading, true)
        });
        Self { inner }
    }

    /// Takes over the count registered when the session was restored.
    fn adopt(inner: &'a SessionInner) -> Self {
        Self { inner }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let inner = self.inner;
        inner.state.send_if_modified(|snapshot| {
            let previous = inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            previous <= 1 && std::mem::replace(&mut snapshot.loading, false)
        });
    }
}

impl SessionManager {
    /// Builds the session from persisted storage. With a stored token the
    /// session starts in `Loading` and validation is spawned onto the current
    /// tokio runtime; without one it starts `Unauthenticated`.
    ///
    /// Must be called from within a tokio runtime when a token is stored.
    pub fn restore(
        config: ConsoleClientConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let persisted = match store.get(&config.token_storage_key) {
            Ok(token) => token.filter(|token| !token.trim().is_empty()),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read persisted session token");
                None
            }
        };

        let pending = usize::from(persisted.is_some());
        let initial = persisted
            .clone()
            .map_or_else(SessionSnapshot::unauthenticated, SessionSnapshot::restoring);
        let (state, _) = watch::channel(initial);
        let manager = Self {
            inner: Arc::new(SessionInner {
                config,
                store,
                transport,
                state,
                operation_gate: Arc::new(AsyncMutex::new(())),
                in_flight: AtomicUsize::new(pending),
                persist_lock: Mutex::new(()),
            }),
        };

        match persisted {
            Some(token) => {
                tracing::debug!("persisted session token found; validating");
                // Taken before spawning so no login can slip in ahead of validation.
                let gate = Arc::clone(&manager.inner.operation_gate);
                let held = Arc::clone(&gate).try_lock_owned().ok();
                let validator = manager.clone();
                tokio::spawn(async move {
                    let _loading = LoadingGuard::adopt(&validator.inner);
                    let _gate = match held {
                        Some(guard) => guard,
                        None => gate.lock_owned().await,
                    };
                    validator.validate_restored(&token).await;
                });
            }
            None => tracing::debug!("no persisted session token"),
        }

        manager
    }

    #[must_use]
    pub fn config(&self) -> &ConsoleClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.borrow().phase
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.inner.state.borrow().token.clone()
    }

    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.inner.state.borrow().user.clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn reader(&self) -> SessionReader {
        SessionReader {
            state: self.inner.state.subscribe(),
        }
    }

    /// Waits until no operation holds the loading flag. Never resolves if a
    /// request never resolves; there is no timeout.
    pub async fn ready(&self) -> SessionSnapshot {
        let mut changes = self.inner.state.subscribe();
        match changes.wait_for(|snapshot| !snapshot.loading).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    pub async fn login_with_password(
        &self,
        identity: &str,
        secret: &str,
    ) -> Result<User, AuthenticationError> {
        let identity = normalize_identity(identity)?;
        let request = self.credentials_request(PASSWORD_AUTH_PATH, &identity, secret)?;
        self.run_login(LoginFlow::Password, request, |response: PasswordAuthResponse| {
            issued_from_password(response, &identity)
        })
        .await
    }

    pub async fn login_as_admin(
        &self,
        identity: &str,
        secret: &str,
    ) -> Result<User, AuthenticationError> {
        let identity = normalize_identity(identity)?;
        let request = self.credentials_request(ADMIN_AUTH_PATH, &identity, secret)?;
        self.run_login(LoginFlow::Admin, request, |response: AdminAuthResponse| {
            issued_from_admin(response, &identity)
        })
        .await
    }

    pub async fn login_anonymous(&self) -> Result<User, AuthenticationError> {
        let request = HttpRequest::new(
            HttpMethod::Post,
            self.inner.config.server_url(ANONYMOUS_AUTH_PATH),
        );
        self.run_login(LoginFlow::Anonymous, request, issued_from_anonymous)
            .await
    }

    /// Adopts a token whose identity is already known (e.g. handed over by a
    /// landing page). No validation round-trip.
    pub fn set_token(&self, token: &str, user: User) -> Result<(), AuthenticationError> {
        let token = normalize_token(token)?;
        self.commit(IssuedSession {
            token,
            user,
            expires_at: None,
        })?;
        tracing::info!("session token adopted");
        Ok(())
    }

    /// Idempotent. A storage failure is logged, not returned.
    pub fn logout(&self) {
        {
            let _persist = self.inner.persist_guard();
            self.inner.state.send_modify(SessionSnapshot::clear);
            if let Err(error) = self.inner.store.remove(&self.inner.config.token_storage_key) {
                tracing::warn!(error = %error, "failed to remove persisted session token");
            }
        }
        tracing::info!("session cleared");
    }

    fn credentials_request(
        &self,
        path: &str,
        identity: &str,
        secret: &str,
    ) -> Result<HttpRequest, AuthenticationError> {
        if secret.is_empty() {
            return Err(AuthInputError::EmptySecret.into());
        }
        let body = serde_json::to_string(&PasswordAuthRequest {
            identity: identity.to_string(),
            password: secret.to_string(),
        })
        .map_err(|error| AuthenticationError::rejected(error.to_string()))?;
        Ok(HttpRequest::new(HttpMethod::Post, self.inner.config.server_url(path)).json_body(body))
    }

    async fn run_login<R, F>(
        &self,
        flow: LoginFlow,
        request: HttpRequest,
        issue: F,
    ) -> Result<User, AuthenticationError>
    where
        R: DeserializeOwned,
        F: FnOnce(R) -> Option<IssuedSession>,
    {
        // Marked before queueing on the gate so `ready()` keeps waiting.
        let _loading = LoadingGuard::begin(&self.inner);
        let _gate = self.inner.operation_gate.lock().await;

        let response = match self.inner.transport.send(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(flow = flow.as_str(), error = %error, "login request failed");
                return Err(AuthenticationError::rejected(flow.fallback_message()));
            }
        };

        if !response.is_success() {
            tracing::warn!(
                flow = flow.as_str(),
                status = response.status,
                "login rejected"
            );
            return Err(flow.rejection(&response.body));
        }

        let Some(issued) = serde_json::from_str::<R>(&response.body).ok().and_then(issue) else {
            tracing::warn!(flow = flow.as_str(), "login response carried no token");
            return Err(AuthenticationError::rejected(flow.fallback_message()));
        };

        let user = self.commit(issued)?;
        tracing::info!(
            flow = flow.as_str(),
            user_id = %user.id,
            is_admin = user.is_admin,
            is_anonymous = user.is_anonymous,
            "login succeeded"
        );
        Ok(user)
    }

    /// Persist first, then swap the in-memory record. A failed write leaves
    /// the session exactly as it was.
    fn commit(&self, issued: IssuedSession) -> Result<User, AuthenticationError> {
        let _persist = self.inner.persist_guard();
        self.inner
            .store
            .set(&self.inner.config.token_storage_key, &issued.token)?;
        let user = issued.user.clone();
        self.inner.state.send_modify(move |snapshot| {
            snapshot.phase = SessionPhase::Authenticated;
            snapshot.token = Some(issued.token);
            snapshot.user = Some(issued.user);
            snapshot.expires_at = issued.expires_at;
        });
        Ok(user)
    }

    async fn fetch_identity(&self, token: &str) -> Result<User, String> {
        let request = HttpRequest::new(
            HttpMethod::Get,
            self.inner.config.server_url(AUTH_INFO_PATH),
        )
        .bearer(token);
        let response = self
            .inner
            .transport
            .send(request)
            .await
            .map_err(|error| error.to_string())?;
        if !response.is_success() {
            return Err(format!("auth info returned status {}", response.status));
        }
        serde_json::from_str::<AuthInfoResponse>(&response.body)
            .map(User::from)
            .map_err(|error| format!("auth info decode failed: {error}"))
    }

    /// Any failure means the token is invalid. Nothing is surfaced to callers;
    /// the outcome is applied only if nothing replaced the restored token.
    async fn validate_restored(&self, token: &str) {
        let outcome = self.fetch_identity(token).await;
        let mut applied = None;

        let persist = self.inner.persist_guard();
        self.inner.state.send_if_modified(|snapshot| {
            let restoring = snapshot.is_restoring(token);
            if restoring {
                match outcome {
                    Ok(user) => {
                        snapshot.phase = SessionPhase::Authenticated;
                        snapshot.user = Some(user);
                        applied = Some(SessionPhase::Authenticated);
                    }
                    Err(reason) => {
                        tracing::warn!(reason = %reason, "persisted session token rejected");
                        snapshot.clear();
                        applied = Some(SessionPhase::Unauthenticated);
                    }
                }
            }
            restoring
        });

        if applied == Some(SessionPhase::Unauthenticated) {
            if let Err(error) = self.inner.store.remove(&self.inner.config.token_storage_key) {
                tracing::warn!(error = %error, "failed to purge rejected session token");
            }
        }
        drop(persist);

        match applied {
            Some(phase) => tracing::info!(phase = phase.as_str(), "session restore finished"),
            None => tracing::debug!("session changed during validation; restore result discarded"),
        }
    }
}

//! Sessions and the credential-keyed session registry.
//!
//! The registry builds at most one [`Session`] per [`CredentialKey`], even when
//! many callers ask for the same credential at once: the first caller installs
//! a shared construction future that every later caller awaits. A failed
//! construction is reported to every waiter and then dropped from the map, so
//! the next call retries. Sessions are never evicted.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::auth::{Auth, Authenticator, CredentialKey, Credentials};
use crate::config::{DownloadConfig, HttpSettings};
use crate::crypt::{CryptKey, CryptMarker};
use crate::error::{TransferError, TransferResult};
use crate::http::{ReqwestTransport, Transport};

/// One authenticated identity plus the transport it talks through.
pub struct Session {
    auth: Arc<dyn Auth>,
    settings: HttpSettings,
    transport: Arc<dyn Transport>,
    crypt_password: Option<Zeroizing<String>>,
    crypt_key: OnceCell<Arc<CryptKey>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("login", &self.auth.login())
            .field("anonymous", &self.auth.is_anonymous())
            .field("crypt", &self.has_crypt())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Assemble a session from its parts.
    pub fn new(
        auth: Arc<dyn Auth>,
        settings: HttpSettings,
        transport: Arc<dyn Transport>,
        crypt_password: Option<String>,
    ) -> Self {
        Self {
            auth,
            settings,
            transport,
            crypt_password: crypt_password.filter(|p| !p.is_empty()).map(Zeroizing::new),
            crypt_key: OnceCell::new(),
        }
    }

    /// Account login.
    pub fn login(&self) -> &str {
        self.auth.login()
    }

    /// Current access token, if authenticated.
    pub fn access_token(&self) -> Option<String> {
        self.auth.access_token()
    }

    /// True for sessions without an account.
    pub fn is_anonymous(&self) -> bool {
        self.auth.is_anonymous()
    }

    /// Endpoint settings.
    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Transport shared by every request of this session.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// True if the session can encrypt and decrypt.
    pub fn has_crypt(&self) -> bool {
        self.crypt_password.is_some()
    }

    /// The account key described by `marker`, derived once per session.
    pub async fn crypt_key(&self, marker: &CryptMarker) -> TransferResult<Arc<CryptKey>> {
        let password = self
            .crypt_password
            .as_ref()
            .ok_or_else(|| TransferError::Crypto("session has no crypt password".to_string()))?;
        let key = self
            .crypt_key
            .get_or_try_init(|| async {
                debug!(login = %self.login(), "deriving account crypt key");
                marker.unlock(password.as_str()).map(Arc::new)
            })
            .await?;
        if !marker.matches(key) {
            return Err(TransferError::Crypto(
                "crypt marker belongs to a different account key".to_string(),
            ));
        }
        Ok(key.clone())
    }

    /// The cached account key, or a freshly generated one.
    ///
    /// Only for accounts without crypto metadata; once the metadata exists the
    /// key is always derived from its salt through [`Session::crypt_key`].
    pub async fn account_key(&self) -> TransferResult<Arc<CryptKey>> {
        let password = self
            .crypt_password
            .as_ref()
            .ok_or_else(|| TransferError::Crypto("session has no crypt password".to_string()))?;
        let key = self
            .crypt_key
            .get_or_try_init(|| async { CryptKey::generate(password.as_str()).map(Arc::new) })
            .await?;
        Ok(key.clone())
    }
}

/// Builds the transport for a newly authenticated identity.
pub trait TransportFactory: Send + Sync {
    /// Transport for `auth`.
    fn create(&self, auth: &Arc<dyn Auth>) -> TransferResult<Arc<dyn Transport>>;
}

/// Every session shares one existing transport (tests, single-identity tools).
impl<T: Transport + 'static> TransportFactory for Arc<T> {
    fn create(&self, _auth: &Arc<dyn Auth>) -> TransferResult<Arc<dyn Transport>> {
        Ok(self.clone())
    }
}

/// One pooled reqwest client per identity, using that identity's cookie jar.
#[derive(Debug, Clone)]
pub struct ReqwestTransportFactory {
    settings: HttpSettings,
    download: DownloadConfig,
}

impl ReqwestTransportFactory {
    /// Factory for the given endpoint and timeout settings.
    pub fn new(settings: HttpSettings, download: DownloadConfig) -> Self {
        Self { settings, download }
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn create(&self, auth: &Arc<dyn Auth>) -> TransferResult<Arc<dyn Transport>> {
        Ok(Arc::new(ReqwestTransport::new(
            &self.settings,
            &self.download,
            auth.cookies(),
        )?))
    }
}

type SessionFuture = Shared<BoxFuture<'static, Result<Arc<Session>, String>>>;

/// Process-lifetime cache of sessions keyed by credential.
pub struct SessionRegistry {
    authenticator: Arc<dyn Authenticator>,
    transports: Arc<dyn TransportFactory>,
    settings: HttpSettings,
    sessions: DashMap<CredentialKey, SessionFuture>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        transports: Arc<dyn TransportFactory>,
        settings: HttpSettings,
    ) -> Self {
        Self {
            authenticator,
            transports,
            settings,
            sessions: DashMap::new(),
        }
    }

    /// The session for `credentials`, constructing it on first use.
    #[instrument(skip(self, credentials), fields(login = %credentials.login()))]
    pub async fn get_or_create(&self, credentials: &Credentials) -> TransferResult<Arc<Session>> {
        let key = credentials.key();

        let pending = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let pending = self.construct(credentials.clone()).boxed().shared();
                entry.insert(pending.clone());
                pending
            }
        };

        match pending.clone().await {
            Ok(session) => Ok(session),
            Err(reason) => {
                self.sessions
                    .remove_if(&key, |_, current| current.ptr_eq(&pending));
                warn!(%reason, "session construction failed");
                Err(TransferError::Authentication {
                    login: credentials.login().to_string(),
                    reason,
                })
            }
        }
    }

    fn construct(
        &self,
        credentials: Credentials,
    ) -> impl std::future::Future<Output = Result<Arc<Session>, String>> + Send + 'static {
        let authenticator = self.authenticator.clone();
        let transports = self.transports.clone();
        let settings = self.settings.clone();
        async move {
            let auth = authenticator
                .authenticate(&credentials)
                .await
                .map_err(|e| e.to_string())?;
            let transport = transports.create(&auth).map_err(|e| e.to_string())?;
            info!(login = %auth.login(), anonymous = auth.is_anonymous(), "session created");
            Ok(Arc::new(Session::new(
                auth,
                settings,
                transport,
                credentials.crypt_password().map(str::to_string),
            )))
        }
    }

    /// Number of cached (or in-flight) sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if no session has been requested yet.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// True if a session for `credentials` is cached or being built.
    pub fn contains(&self, credentials: &Credentials) -> bool {
        self.sessions.contains_key(&credentials.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::http::{HttpResponse, MockTransport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingAuthenticator {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self, credentials: &Credentials) -> TransferResult<Arc<dyn Auth>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && call == 0 {
                return Err(TransferError::Authentication {
                    login: credentials.login().to_string(),
                    reason: "bad password".to_string(),
                });
            }
            Ok(Arc::new(StaticAuth::new(credentials.login(), "tok")))
        }
    }

    fn registry(fail_first: bool) -> (Arc<SessionRegistry>, Arc<CountingAuthenticator>) {
        let authenticator = Arc::new(CountingAuthenticator {
            calls: AtomicUsize::new(0),
            fail_first,
        });
        let mock = Arc::new(MockTransport::new(|_| Ok(HttpResponse::from_bytes(200, ""))));
        let registry = SessionRegistry::new(
            authenticator.clone(),
            Arc::new(mock),
            HttpSettings::default(),
        );
        (Arc::new(registry), authenticator)
    }

    #[tokio::test]
    async fn test_concurrent_first_access_builds_once() {
        let (registry, authenticator) = registry(false);
        let creds = Credentials::new("user@example.com", "secret");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let creds = creds.clone();
                tokio::spawn(async move { registry.get_or_create(&creds).await })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_credentials_get_distinct_sessions() {
        let (registry, authenticator) = registry(false);
        let a = registry
            .get_or_create(&Credentials::new("a@example.com", "x"))
            .await
            .unwrap();
        let b = registry
            .get_or_create(&Credentials::new("b@example.com", "x"))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.login(), "a@example.com");
    }

    #[tokio::test]
    async fn test_failed_construction_reaches_all_waiters_and_is_not_cached() {
        let (registry, authenticator) = registry(true);
        let creds = Credentials::new("user@example.com", "secret");

        let first = {
            let registry = registry.clone();
            let creds = creds.clone();
            tokio::spawn(async move { registry.get_or_create(&creds).await })
        };
        let second = {
            let registry = registry.clone();
            let creds = creds.clone();
            tokio::spawn(async move { registry.get_or_create(&creds).await })
        };
        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(matches!(first, Err(TransferError::Authentication { .. })));
        assert!(matches!(second, Err(TransferError::Authentication { .. })));
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(&creds));

        let session = registry.get_or_create(&creds).await.unwrap();
        assert_eq!(session.access_token().as_deref(), Some("tok"));
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 2);
        assert!(registry.contains(&creds));
    }

    #[tokio::test]
    async fn test_session_crypt_key_is_cached_and_checked() {
        let mock: Arc<dyn Transport> =
            Arc::new(MockTransport::new(|_| Ok(HttpResponse::from_bytes(200, ""))));
        let session = Session::new(
            Arc::new(StaticAuth::new("u", "t")),
            HttpSettings::default(),
            mock.clone(),
            Some("pw".to_string()),
        );
        assert!(session.has_crypt());
        let account = CryptKey::generate("pw").unwrap();
        let marker = CryptMarker::new(&account).unwrap();
        let k1 = session.crypt_key(&marker).await.unwrap();
        let k2 = session.crypt_key(&marker).await.unwrap();
        assert!(Arc::ptr_eq(&k1, &k2));

        let foreign = CryptMarker::new(&CryptKey::generate("pw").unwrap()).unwrap();
        assert!(matches!(
            session.crypt_key(&foreign).await,
            Err(TransferError::Crypto(_))
        ));

        let plain = Session::new(
            Arc::new(StaticAuth::new("u", "t")),
            HttpSettings::default(),
            mock,
            Some(String::new()),
        );
        assert!(!plain.has_crypt());
        assert!(plain.account_key().await.is_err());
    }
}

//! Authentication collaborator surface.
//!
//! Token acquisition lives outside the pipeline; the pipeline only needs an
//! [`Auth`] that can hand out the current access token and cookie jar.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::TransferResult;

/// Login used by anonymous sessions.
pub const ANONYMOUS_LOGIN: &str = "anonym";

/// An authenticated (or anonymous) identity against the backend.
pub trait Auth: Send + Sync + fmt::Debug {
    /// Account login (e-mail).
    fn login(&self) -> &str;
    /// Current access token; implementations may refresh it behind this call.
    fn access_token(&self) -> Option<String>;
    /// Cookie jar shared by every request of this identity.
    fn cookies(&self) -> Arc<Jar>;
    /// True for sessions without an account.
    fn is_anonymous(&self) -> bool;
}

/// Login plus secret as supplied by the caller.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    login: String,
    secret: String,
    crypt_password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Credentials {{ login: {:?}, secret: [REDACTED], crypt: {} }}",
            self.login,
            self.crypt_password.is_some()
        )
    }
}

impl Credentials {
    /// Credentials for an account.
    pub fn new(login: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            secret: secret.into(),
            crypt_password: None,
        }
    }

    /// Attach the password unlocking encrypted folders of this account.
    pub fn with_crypt_password(mut self, password: impl Into<String>) -> Self {
        self.crypt_password = Some(password.into());
        self
    }

    /// Credentials for anonymous (public-link only) access.
    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_LOGIN, "")
    }

    /// The login.
    pub fn login(&self) -> &str {
        &self.login
    }

    /// The secret (password or token, depending on the authenticator).
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The crypt password, if the account may use encrypted folders.
    pub fn crypt_password(&self) -> Option<&str> {
        self.crypt_password.as_deref()
    }

    /// Registry key for this credential pair; the secret is only kept as a digest.
    pub fn key(&self) -> CredentialKey {
        let mut hasher = Sha256::new();
        hasher.update(self.login.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.secret.as_bytes());
        if let Some(password) = &self.crypt_password {
            hasher.update([1u8]);
            hasher.update(password.as_bytes());
        }
        CredentialKey {
            login: self.login.clone(),
            secret_digest: hasher.finalize().into(),
        }
    }
}

/// Identity of a credential pair for session caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    /// The login.
    pub login: String,
    /// SHA-256 over login, secret and crypt password.
    pub secret_digest: [u8; 32],
}

/// Turns credentials into an [`Auth`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate; failures surface to every caller waiting on this credential.
    async fn authenticate(&self, credentials: &Credentials) -> TransferResult<Arc<dyn Auth>>;
}

/// An identity holding an already-issued access token.
pub struct StaticAuth {
    login: String,
    token: Option<String>,
    cookies: Arc<Jar>,
}

impl fmt::Debug for StaticAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAuth")
            .field("login", &self.login)
            .field("anonymous", &self.is_anonymous())
            .finish_non_exhaustive()
    }
}

impl StaticAuth {
    /// Identity for `login` using `token`.
    pub fn new(login: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            token: Some(token.into()),
            cookies: Arc::new(Jar::default()),
        }
    }

    /// Anonymous identity.
    pub fn anonymous() -> Self {
        Self {
            login: ANONYMOUS_LOGIN.to_string(),
            token: None,
            cookies: Arc::new(Jar::default()),
        }
    }
}

impl Auth for StaticAuth {
    fn login(&self) -> &str {
        &self.login
    }

    fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn cookies(&self) -> Arc<Jar> {
        self.cookies.clone()
    }

    fn is_anonymous(&self) -> bool {
        self.token.is_none()
    }
}

/// Authenticator that treats the credential secret as a ready access token.
///
/// An empty secret or the anonymous login yields an anonymous identity.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator;

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> TransferResult<Arc<dyn Auth>> {
        if credentials.login() == ANONYMOUS_LOGIN || credentials.secret().is_empty() {
            return Ok(Arc::new(StaticAuth::anonymous()));
        }
        Ok(Arc::new(StaticAuth::new(
            credentials.login(),
            credentials.secret(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_key_distinguishes_secrets() {
        let a = Credentials::new("user@example.com", "one").key();
        let b = Credentials::new("user@example.com", "two").key();
        let a2 = Credentials::new("user@example.com", "one").key();
        assert_ne!(a, b);
        assert_eq!(a, a2);
        assert_eq!(a.login, "user@example.com");
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials::new("user@example.com", "hunter2");
        let dbg = format!("{:?}", creds);
        assert!(dbg.contains("user@example.com"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_crypt_password_changes_key() {
        let plain = Credentials::new("user@example.com", "tok");
        let crypt = plain.clone().with_crypt_password("pw");
        assert_ne!(plain.key(), crypt.key());
        assert_eq!(crypt.crypt_password(), Some("pw"));
        assert!(!format!("{:?}", crypt).contains("pw"));
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator
            .authenticate(&Credentials::new("user@example.com", "tok"))
            .await
            .unwrap();
        assert_eq!(auth.login(), "user@example.com");
        assert_eq!(auth.access_token().as_deref(), Some("tok"));
        assert!(!auth.is_anonymous());

        let anon = StaticAuthenticator
            .authenticate(&Credentials::anonymous())
            .await
            .unwrap();
        assert!(anon.is_anonymous());
        assert_eq!(anon.access_token(), None);
        assert_eq!(anon.login(), ANONYMOUS_LOGIN);
    }
}

//! Directory authentication.
//!
//! [`DirectoryAuthenticator`] turns a username, domain and password into a
//! [`Principal`] by binding against a directory server. Failures of any
//! kind, whether a rejected password, an unreachable server or a malformed
//! response, are reported as `None`; the cause is only logged.

use crate::connection::{ConnectionConfig, ConnectionState, LdapConnection};
use crate::error::{Error, Result};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default port for plain LDAP.
pub const LDAP_PORT: u16 = 389;

/// Default port for LDAPS.
pub const LDAPS_PORT: u16 = 636;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Username as supplied by the caller.
    pub username: String,
    /// Domain as supplied by the caller.
    pub domain: String,
    /// Name the bind was performed with.
    pub bind_name: String,
    /// Authorization identity reported by the server, if requested and known.
    pub authorization_id: Option<String>,
}

/// Authenticates users against a directory.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate `username` in `domain` with `credentials`.
    ///
    /// Returns `None` if the credentials are rejected or the directory can
    /// not be reached.
    async fn authenticate(
        &self,
        username: &str,
        domain: &str,
        credentials: &[u8],
        token: CancellationToken,
    ) -> Option<Principal>;
}

/// How a username and domain are combined into a bind name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindNameFormat {
    /// `user@domain`
    #[default]
    UserPrincipalName,
    /// `DOMAIN\user`
    DownLevelLogon,
}

impl BindNameFormat {
    /// Build the bind name.
    ///
    /// Usernames that are already qualified, and usernames without a domain,
    /// are used as they are.
    #[must_use]
    pub fn bind_name(self, username: &str, domain: &str) -> String {
        if domain.is_empty() || username.contains('@') || username.contains('\\') {
            return username.to_string();
        }

        match self {
            Self::UserPrincipalName => format!("{username}@{domain}"),
            Self::DownLevelLogon => format!("{domain}\\{username}"),
        }
    }
}

/// Configuration for a [`DirectoryAuthenticator`].
#[derive(Debug, Clone)]
pub struct AuthenticatorConfig {
    /// Directory server host.
    pub host: String,
    /// Directory server port.
    pub port: u16,
    /// Connection settings.
    pub connection: ConnectionConfig,
    /// Bind name format.
    pub bind_name_format: BindNameFormat,
    /// Ask the server for the authorization identity after a bind.
    pub resolve_authorization_id: bool,
}

impl AuthenticatorConfig {
    /// Plain LDAP to `host` on the default port.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: LDAP_PORT,
            connection: ConnectionConfig::default(),
            bind_name_format: BindNameFormat::default(),
            resolve_authorization_id: false,
        }
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connection settings.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set the bind name format.
    #[must_use]
    pub fn with_bind_name_format(mut self, format: BindNameFormat) -> Self {
        self.bind_name_format = format;
        self
    }

    /// Resolve the authorization identity with a "Who am I?" request.
    #[must_use]
    pub fn resolve_authorization_id(mut self) -> Self {
        self.resolve_authorization_id = true;
        self
    }
}

/// Authenticates with simple binds over a shared connection.
///
/// The connection is opened on first use and reused by later calls; binds
/// are serialized on it. A connection that was lost is replaced on the next
/// call. A caller whose token is cancelled while waiting for the connection
/// gives up without affecting the others.
pub struct DirectoryAuthenticator {
    config: AuthenticatorConfig,
    connection: Mutex<Option<LdapConnection>>,
}

impl DirectoryAuthenticator {
    /// Create an authenticator. No connection is made until the first call.
    #[must_use]
    pub fn new(config: AuthenticatorConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    /// The configuration of this authenticator.
    #[must_use]
    pub const fn config(&self) -> &AuthenticatorConfig {
        &self.config
    }

    /// Close the shared connection, if any.
    pub async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
    }

    async fn try_authenticate(
        &self,
        username: &str,
        domain: &str,
        credentials: &[u8],
        token: CancellationToken,
    ) -> Result<Option<Principal>> {
        let bind_name = self.config.bind_name_format.bind_name(username, domain);
        let mut slot = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled),
            slot = self.connection.lock() => slot,
        };

        let reusable = slot
            .as_ref()
            .is_some_and(|connection| connection.state() == ConnectionState::Open);
        if !reusable {
            if let Some(stale) = slot.take() {
                debug!("replacing lost directory connection");
                stale.close().await;
            }
            let open = LdapConnection::open(
                &self.config.host,
                self.config.port,
                self.config.connection.clone(),
            );
            let connection = tokio::select! {
                biased;
                () = token.cancelled() => return Err(Error::Cancelled),
                connection = open => connection?,
            };
            *slot = Some(connection);
        }

        let Some(connection) = slot.as_ref() else {
            return Ok(None);
        };

        let bound = connection
            .simple_bind(&bind_name, credentials, token.clone())
            .await;
        match bound {
            Ok(_) => {}
            Err(Error::Result(result)) => {
                info!(%bind_name, %result, "bind rejected");
                return Ok(None);
            }
            Err(e) => {
                // The bind may still be outstanding; do not reuse the connection.
                if let Some(connection) = slot.take() {
                    connection.close().await;
                }
                return Err(e);
            }
        }

        let authorization_id = if self.config.resolve_authorization_id {
            match connection.who_am_i(token).await {
                Ok(authorization_id) => authorization_id,
                Err(e) => {
                    debug!(error = %e, "failed to resolve authorization id");
                    None
                }
            }
        } else {
            None
        };

        Ok(Some(Principal {
            username: username.to_string(),
            domain: domain.to_string(),
            bind_name,
            authorization_id,
        }))
    }
}

#[async_trait]
impl Authenticator for DirectoryAuthenticator {
    #[instrument(skip(self, credentials, token))]
    async fn authenticate(
        &self,
        username: &str,
        domain: &str,
        credentials: &[u8],
        token: CancellationToken,
    ) -> Option<Principal> {
        if credentials.is_empty() {
            debug!("rejecting empty credentials");
            return None;
        }

        match self
            .try_authenticate(username, domain, credentials, token)
            .await
        {
            Ok(principal) => principal,
            Err(e) => {
                warn!(error = %e, "directory authentication failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for DirectoryAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryAuthenticator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_names() {
        assert_eq!(
            BindNameFormat::UserPrincipalName.bind_name("jdoe", "example.com"),
            "jdoe@example.com"
        );
        assert_eq!(
            BindNameFormat::DownLevelLogon.bind_name("jdoe", "EXAMPLE"),
            "EXAMPLE\\jdoe"
        );
        assert_eq!(BindNameFormat::DownLevelLogon.bind_name("jdoe", ""), "jdoe");
        assert_eq!(
            BindNameFormat::UserPrincipalName.bind_name("jdoe@other.org", "example.com"),
            "jdoe@other.org"
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = AuthenticatorConfig::new("ldap.example.com");
        assert_eq!(config.port, LDAP_PORT);
        assert_eq!(config.bind_name_format, BindNameFormat::UserPrincipalName);
        assert!(!config.resolve_authorization_id);
    }

    #[tokio::test]
    async fn test_empty_credentials_are_rejected_offline() {
        // Nothing listens on port 1; empty credentials never reach it.
        let authenticator =
            DirectoryAuthenticator::new(AuthenticatorConfig::new("127.0.0.1").with_port(1));
        let principal = authenticator
            .authenticate("jdoe", "example.com", b"", CancellationToken::new())
            .await;
        assert!(principal.is_none());
        assert!(authenticator.connection.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_maps_to_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let authenticator =
            DirectoryAuthenticator::new(AuthenticatorConfig::new("127.0.0.1").with_port(port));
        let principal = authenticator
            .authenticate("jdoe", "example.com", b"secret", CancellationToken::new())
            .await;
        assert!(principal.is_none());
    }
}

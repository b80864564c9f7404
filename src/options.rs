//! Connection options and the builder that maps configuration onto them.

use std::{collections::BTreeMap, fmt, time::Duration};

use tracing::debug;
use validator::Validate;

use crate::{
    config::ConnectConfig,
    error::BridgeError,
    tls::{build_socket_factory, PemSource, SocketFactory, TlsIdentity},
};

/// Options consumed by a single connect.
///
/// Built fresh for each connect and never changed afterwards. Unset fields
/// leave the client's own defaults in place.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    connection_timeout: Option<Duration>,
    keep_alive: Option<Duration>,
    username: Option<String>,
    password: Option<String>,
    clean_session: Option<bool>,
    socket_factory: Option<SocketFactory>,
    tls_properties: BTreeMap<String, String>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = Some(clean_session);
        self
    }

    pub fn with_socket_factory(mut self, factory: SocketFactory) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    pub fn with_tls_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.tls_properties = properties;
        self
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn clean_session(&self) -> Option<bool> {
        self.clean_session
    }

    pub fn socket_factory(&self) -> Option<&SocketFactory> {
        self.socket_factory.as_ref()
    }

    pub fn tls_properties(&self) -> &BTreeMap<String, String> {
        &self.tls_properties
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("connection_timeout", &self.connection_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("clean_session", &self.clean_session)
            .field("socket_factory", &self.socket_factory)
            .field("tls_properties", &self.tls_properties)
            .finish()
    }
}

/// Maps a connection configuration onto connect options.
///
/// If any of `caFile`, `certFile` or `keyFile` is set, the TLS identity is
/// built and attached as the socket factory; reading those files is the only
/// I/O performed.
///
/// # Errors
/// - `Validation` if the configuration violates its constraints
/// - `Tls(..)` if the identity material is unreadable or unusable
pub fn build_connect_options(config: &ConnectConfig) -> Result<ConnectOptions, BridgeError> {
    config.validate()?;

    let mut options = ConnectOptions::new();

    if let Some(seconds) = config.timeout {
        options = options.with_connection_timeout(Duration::from_secs(seconds));
    }
    if let Some(seconds) = config.keep_alive {
        options = options.with_keep_alive(Duration::from_secs(seconds));
    }
    if let Some(username) = &config.username {
        options = options.with_username(username.clone());
    }
    if let Some(password) = &config.password {
        options = options.with_password(password.clone());
    }
    if let Some(clean_session) = config.clean_session {
        options = options.with_clean_session(clean_session);
    }

    if config.has_tls_material() {
        let identity = TlsIdentity {
            ca: config.ca_file.clone().map(PemSource::Path),
            certificate: config.cert_file.clone().map(PemSource::Path),
            key: config.key_file.clone().map(PemSource::Path),
            password: config.key_password.clone(),
        };
        if let Some(factory) = build_socket_factory(&identity)? {
            options = options.with_socket_factory(factory);
        }
    }

    if !config.ssl_properties.is_empty() {
        debug!(
            "Carrying {} raw TLS properties",
            config.ssl_properties.len()
        );
        options = options.with_tls_properties(config.ssl_properties.clone());
    }

    Ok(options)
}

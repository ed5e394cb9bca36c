//! Config for the LDAP address book.
use std::{path::PathBuf, sync::Arc, time::Duration};

use ldap3::{LdapConnSettings, Scope};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// LDAP configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
	/// The URL to connect to the server with. Supports ldap, ldaps, and ldapi
	/// schemes
	pub url: Url,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// LDAP protocol version to speak. StartTLS needs version 3.
	#[serde(default = "default_protocol_version")]
	pub protocol_version: u8,
	/// The DN under which contact entries live
	pub base_dn: String,
	/// How deep below the base DN searches reach
	#[serde(default)]
	pub scope: SearchScope,
	/// Limits passed through to the server on every search
	#[serde(default)]
	pub limits: SearchLimits,
}

/// The default protocol version
const fn default_protocol_version() -> u8 {
	3
}

/// Configuration for how to connect to the LDAP server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,

	/// LDAP operation timeout. For search per reply.
	pub operation_timeout: Duration,

	/// TLS config
	pub tls: TLSConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self { timeout: 5, operation_timeout: Duration::from_secs(30), tls: TLSConfig::default() }
	}
}

/// When to encrypt the connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
	/// Stay in plaintext
	Never,
	/// Refuse to continue unless StartTLS succeeds
	Always,
	/// Try StartTLS and fall back to plaintext if it fails
	#[default]
	WhenPossible,
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TLSConfig {
	/// Whether to upgrade plaintext connections with the StartTLS extended
	/// operation. Ignored for `ldaps` URLs, which are encrypted from the start.
	#[serde(default)]
	pub policy: TlsPolicy,

	/// Disable verification of TLS certificates
	#[serde(default)]
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

/// Search depth below the base DN
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
	/// Only direct children of the base DN
	#[default]
	OneLevel,
	/// The whole subtree below the base DN
	Subtree,
}

impl From<SearchScope> for Scope {
	fn from(scope: SearchScope) -> Self {
		match scope {
			SearchScope::OneLevel => Scope::OneLevel,
			SearchScope::Subtree => Scope::Subtree,
		}
	}
}

/// Server-side search limits. Zero means no limit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SearchLimits {
	/// Maximum number of entries returned per search
	pub size_limit: i32,
	/// Maximum number of seconds the server spends on a search
	pub time_limit: i32,
}

impl Default for SearchLimits {
	fn default() -> Self {
		Self { size_limit: 100, time_limit: 0 }
	}
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	///
	/// StartTLS is never enabled here; the connection decides when to
	/// negotiate it according to the [`TlsPolicy`].
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let pem = tokio::fs::read(path).await?;
			let mut roots = RootCertStore::empty();
			let (added, _) = roots.add_parsable_certificates(&rustls_pemfile::certs(
				&mut pem.as_slice(),
			)?);
			if added == 0 {
				return Err(Error::Invalid("Could not read root certificate".to_owned()));
			}
			let builder = ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);

			let client_config =
				match (&self.tls.client_key_path, &self.tls.client_certificate_path) {
					(Some(key_path), Some(cert_path)) => {
						let certs = rustls_pemfile::certs(
							&mut tokio::fs::read(cert_path).await?.as_slice(),
						)?
						.into_iter()
						.map(Certificate)
						.collect();
						let key = rustls_pemfile::pkcs8_private_keys(
							&mut tokio::fs::read(key_path).await?.as_slice(),
						)?
						.into_iter()
						.next()
						.map(PrivateKey)
						.ok_or_else(|| Error::Invalid("No PKCS8 key in client key file".to_owned()))?;
						builder.with_client_auth_cert(certs, key).map_err(|_| {
							Error::Invalid("Could not read client certificates".to_owned())
						})?
					}
					(None, None) => builder.with_no_client_auth(),
					_ => Err(Error::Invalid(
						"Both a client certificate and key file in PKCS8 format must be specified"
							.to_owned(),
					))?,
				};
			settings = settings.set_config(Arc::new(client_config));
		}
		Ok(settings)
	}
}

//! Session management: connecting, TLS, binding and capability discovery.
use std::{fmt, str::FromStr};

use ldap3::Scope;
use tracing::{debug, info, warn};

use crate::{
	catalog::SchemaExtension,
	config::{Config, TlsPolicy},
	entry::SearchEntryExt,
	error::{Error, Status},
	filter::escape_filter_value,
	transport::Transport,
};

/// OID of the StartTLS extended operation
const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Attributes read from the root DSE
const ROOT_DSE_ATTRIBUTES: [&str; 6] = [
	"supportedControl",
	"supportedExtension",
	"supportedSASLMechanisms",
	"supportedLDAPVersion",
	"subschemaSubentry",
	"schemaNamingContext",
];

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	/// No connection
	Disconnected,
	/// Bring-up in progress
	Connecting,
	/// Connected, but no identity has authenticated
	BoundAnonymous,
	/// Authenticated
	Connected,
}

/// What is known about the server's schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaState {
	/// Nothing could be read yet; recheck after authenticating
	#[default]
	Unknown,
	/// The server doesn't publish a schema
	Unavailable,
	/// The schema was read
	Discovered,
}

/// What the server supports, learned while connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
	/// Negotiated protocol version
	pub protocol_version: u8,
	/// Whether the connection is encrypted
	pub tls_active: bool,
	/// Whether the server advertises StartTLS
	pub starttls_supported: bool,
	/// OIDs of supported controls
	pub supported_controls: Vec<String>,
	/// OIDs of supported extended operations
	pub supported_extensions: Vec<String>,
	/// Advertised SASL mechanisms
	pub sasl_mechanisms: Vec<String>,
	/// DN of the schema entry
	pub schema_dn: Option<String>,
	/// Whether the schema has been read
	pub schema: SchemaState,
	/// Whether `evolutionPerson` is defined
	pub person_schema: bool,
	/// Whether `calEntry` is defined
	pub calendar_schema: bool,
}

impl ServerCapabilities {
	/// Whether attributes of the extension can be stored
	#[must_use]
	pub fn supports(&self, extension: SchemaExtension) -> bool {
		match extension {
			SchemaExtension::Person => self.person_schema,
			SchemaExtension::Calendar => self.calendar_schema,
		}
	}
}

/// How a user identifies themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
	/// Simple bind with a DN
	SimpleBindDn,
	/// Simple bind as the entry holding an e-mail address
	SimpleEmail,
}

impl AuthMethod {
	/// The name the address book knows the method by
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			AuthMethod::SimpleBindDn => "ldap/simple-binddn",
			AuthMethod::SimpleEmail => "ldap/simple-email",
		}
	}
}

impl FromStr for AuthMethod {
	type Err = Error;

	fn from_str(name: &str) -> Result<Self, Self::Err> {
		[AuthMethod::SimpleBindDn, AuthMethod::SimpleEmail]
			.into_iter()
			.find(|method| method.name() == name)
			.ok_or_else(|| Error::Unsupported(format!("Authentication method {name}")))
	}
}

/// Credentials of the authenticated user, kept for rebinding
#[derive(Clone)]
struct Identity {
	/// Bind DN
	dn: String,
	/// Password
	password: String,
}

impl fmt::Debug for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Identity").field("dn", &self.dn).field("password", &"<redacted>").finish()
	}
}

/// A session with one directory server.
#[derive(Debug)]
pub struct Connection<T> {
	/// Configuration
	config: Config,
	/// The client library
	transport: T,
	/// Lifecycle state
	state: ConnectionState,
	/// What the server supports
	capabilities: ServerCapabilities,
	/// Who to rebind as after reconnecting
	identity: Option<Identity>,
}

impl<T: Transport> Connection<T> {
	/// A disconnected session
	#[must_use]
	pub fn new(config: Config, transport: T) -> Self {
		Self {
			config,
			transport,
			state: ConnectionState::Disconnected,
			capabilities: ServerCapabilities::default(),
			identity: None,
		}
	}

	/// The configuration
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Current lifecycle state
	pub fn state(&self) -> ConnectionState {
		self.state
	}

	/// What the server supports
	pub fn capabilities(&self) -> &ServerCapabilities {
		&self.capabilities
	}

	/// The DN bound as, if authenticated
	pub fn bound_dn(&self) -> Option<&str> {
		self.identity.as_ref().map(|identity| identity.dn.as_str())
	}

	/// The transport, for issuing requests
	pub fn transport_mut(&mut self) -> &mut T {
		&mut self.transport
	}

	/// Authentication methods available on this server
	pub fn supported_auth_methods(&self) -> Vec<String> {
		[AuthMethod::SimpleBindDn, AuthMethod::SimpleEmail]
			.into_iter()
			.map(|method| method.name().to_owned())
			.chain(self.capabilities.sasl_mechanisms.iter().map(|mechanism| format!("sasl/{mechanism}")))
			.collect()
	}

	/// Open the connection, negotiate TLS, bind anonymously and discover
	/// what the server supports.
	pub async fn connect(&mut self) -> Result<(), Error> {
		self.state = ConnectionState::Connecting;
		let result = self.bring_up().await;
		if result.is_err() {
			self.state = ConnectionState::Disconnected;
		}
		result
	}

	/// The steps of [`Self::connect`]
	async fn bring_up(&mut self) -> Result<(), Error> {
		let url = self.config.url.clone();
		info!(%url, "Connecting to directory server");
		self.transport.connect(&url).await?;

		let ldaps = url.scheme() == "ldaps";
		self.capabilities = ServerCapabilities {
			protocol_version: self.config.protocol_version,
			tls_active: ldaps,
			..ServerCapabilities::default()
		};
		if !ldaps {
			self.negotiate_tls().await?;
		}

		self.bind_anonymously().await?;
		self.state = ConnectionState::BoundAnonymous;
		self.discover().await
	}

	/// Apply the TLS policy to a plaintext connection
	async fn negotiate_tls(&mut self) -> Result<(), Error> {
		let version = self.config.protocol_version;
		match self.config.connection.tls.policy {
			TlsPolicy::Never => {}
			TlsPolicy::Always => {
				if version < 3 {
					return Err(Error::TlsRequired(format!("LDAPv{version} has no StartTLS")));
				}
				self.transport
					.start_tls()
					.await
					.map_err(|err| Error::TlsRequired(err.to_string()))?;
				self.capabilities.tls_active = true;
			}
			TlsPolicy::WhenPossible if version < 3 => {
				debug!("Not attempting StartTLS on LDAPv{version}");
			}
			TlsPolicy::WhenPossible => match self.transport.start_tls().await {
				Ok(()) => self.capabilities.tls_active = true,
				Err(err) => {
					warn!("StartTLS failed, continuing unencrypted: {err}");
					let url = self.config.url.clone();
					self.transport.connect(&url).await?;
				}
			},
		}
		Ok(())
	}

	/// Bind anonymously. Only an unreachable server is fatal.
	async fn bind_anonymously(&mut self) -> Result<(), Error> {
		match self.transport.simple_bind(None, "").await {
			Ok(result) if result.rc == 0 => debug!("Bound anonymously"),
			Ok(result) => warn!(rc = result.rc, "Anonymous bind refused: {}", result.text),
			Err(err) if err.is_server_down() => return Err(err.into()),
			Err(err) => warn!("Anonymous bind failed: {err}"),
		}
		Ok(())
	}

	/// Read the root DSE and the schema
	async fn discover(&mut self) -> Result<(), Error> {
		let root = match self
			.transport
			.search_entries("", Scope::Base, "(objectClass=*)", &ROOT_DSE_ATTRIBUTES)
			.await
		{
			Ok(entries) => entries.into_iter().next(),
			Err(err) if err.is_server_down() => return Err(err.into()),
			Err(err) => {
				warn!("Could not read root DSE: {err}");
				None
			}
		};

		let Some(root) = root else {
			info!("Root DSE not readable, rechecking after authentication");
			self.capabilities.schema = SchemaState::Unknown;
			return Ok(());
		};
		let capabilities = &mut self.capabilities;
		capabilities.supported_controls = root.attr_values("supportedControl").to_vec();
		capabilities.supported_extensions = root.attr_values("supportedExtension").to_vec();
		capabilities.sasl_mechanisms = root.attr_values("supportedSASLMechanisms").to_vec();
		capabilities.starttls_supported =
			capabilities.supported_extensions.iter().any(|oid| oid == STARTTLS_OID);
		if let Some(highest) = root
			.attr_values("supportedLDAPVersion")
			.iter()
			.filter_map(|version| version.parse::<u8>().ok())
			.max()
		{
			capabilities.protocol_version = capabilities.protocol_version.min(highest);
		}
		capabilities.schema_dn = root
			.attr_first("subschemaSubentry")
			.or_else(|| root.attr_first("schemaNamingContext"))
			.map(str::to_owned);
		self.check_schema().await
	}

	/// Look for the auxiliary object classes in the schema
	async fn check_schema(&mut self) -> Result<(), Error> {
		let Some(schema_dn) = self.capabilities.schema_dn.clone() else {
			debug!("Server publishes no schema");
			self.capabilities.schema = SchemaState::Unavailable;
			return Ok(());
		};

		let definitions = match self
			.transport
			.search_entries(&schema_dn, Scope::Base, "(objectClass=*)", &["objectClasses"])
			.await
		{
			Ok(entries) => entries
				.first()
				.map(|entry| entry.attr_values("objectClasses").to_vec())
				.unwrap_or_default(),
			Err(err) if err.is_server_down() => return Err(err.into()),
			Err(err) => {
				debug!("Could not read schema at {schema_dn}: {err}");
				Vec::new()
			}
		};

		if definitions.is_empty() {
			info!("Schema not readable, rechecking after authentication");
			self.capabilities.schema = SchemaState::Unknown;
			return Ok(());
		}

		let defined = |class: SchemaExtension| {
			definitions.iter().any(|definition| {
				object_class_names(definition)
					.iter()
					.any(|name| name.eq_ignore_ascii_case(class.object_class()))
			})
		};
		self.capabilities.person_schema = defined(SchemaExtension::Person);
		self.capabilities.calendar_schema = defined(SchemaExtension::Calendar);
		self.capabilities.schema = SchemaState::Discovered;
		info!(
			person = self.capabilities.person_schema,
			calendar = self.capabilities.calendar_schema,
			"Discovered schema"
		);
		Ok(())
	}

	/// Bind as a user. Retried once after reconnecting if the server went
	/// away.
	pub async fn authenticate(
		&mut self,
		method: AuthMethod,
		user: &str,
		password: &str,
	) -> Result<(), Error> {
		match self.bind_as(method, user, password).await {
			Err(Error::Transport(err)) if err.is_server_down() => {
				warn!("Server went away while authenticating: {err}");
				self.connect().await?;
				self.bind_as(method, user, password).await
			}
			result => result,
		}
	}

	/// Resolve the bind DN and bind
	async fn bind_as(&mut self, method: AuthMethod, user: &str, password: &str) -> Result<(), Error> {
		let dn = match method {
			AuthMethod::SimpleBindDn => user.to_owned(),
			AuthMethod::SimpleEmail => self.resolve_email(user).await?,
		};
		self.bind(Identity { dn, password: password.to_owned() }).await
	}

	/// Find the entry a mail address belongs to
	async fn resolve_email(&mut self, email: &str) -> Result<String, Error> {
		let filter = format!("(mail={})", escape_filter_value(email));
		let base = self.config.base_dn.clone();
		let entries = self.transport.search_entries(&base, Scope::Subtree, &filter, &["1.1"]).await?;
		if entries.len() > 1 {
			warn!(count = entries.len(), "Address {email} is not unique, using the first entry");
		}
		entries
			.into_iter()
			.next()
			.map(|entry| entry.dn)
			.ok_or(Error::Refused(Status::PermissionDenied))
	}

	/// Simple bind as `identity`, remembering it on success
	async fn bind(&mut self, identity: Identity) -> Result<(), Error> {
		let result = self.transport.simple_bind(Some(&identity.dn), &identity.password).await?;
		if result.rc != 0 {
			debug!(rc = result.rc, dn = %identity.dn, "Bind refused: {}", result.text);
			return Err(Error::Refused(Status::from(&result)));
		}
		info!(dn = %identity.dn, "Authenticated");
		self.identity = Some(identity);
		self.state = ConnectionState::Connected;

		match self.capabilities.schema {
			SchemaState::Unknown if self.capabilities.schema_dn.is_none() => self.discover().await?,
			SchemaState::Unknown => self.check_schema().await?,
			_ => {}
		}
		Ok(())
	}

	/// Connect again and rebind as the authenticated user, if any.
	pub async fn reconnect(&mut self) -> Result<(), Error> {
		info!("Reconnecting to directory server");
		self.connect().await?;
		if let Some(identity) = self.identity.clone() {
			self.bind(identity).await?;
		}
		Ok(())
	}
}

/// The names an RFC 4512 object class definition declares, e.g.
/// `( 1.2.3 NAME ( 'a' 'b' ) SUP top )` declares `a` and `b`.
fn object_class_names(definition: &str) -> Vec<&str> {
	let Some((_, rest)) = definition.split_once(" NAME ") else {
		return Vec::new();
	};
	let rest = rest.trim_start();
	match rest.strip_prefix('(') {
		Some(list) => quoted(list.split_once(')').map_or(list, |(names, _)| names)).collect(),
		None => quoted(rest).take(1).collect(),
	}
}

/// The single-quoted strings in `text`
fn quoted(text: &str) -> impl Iterator<Item = &str> {
	text.split('\'').skip(1).step_by(2)
}

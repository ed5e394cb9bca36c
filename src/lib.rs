//! Keep an address book in an LDAP directory.
//!
//! The library turns address book requests (create, remove, modify, fetch and
//! search contacts) into LDAP operations, multiplexes them over a single
//! connection and maps directory entries to [`Contact`] records and back.
//! Requests don't wait for the server: each one is registered under the
//! message id of its outstanding LDAP request, and polling the [`Engine`]
//! dispatches results as they arrive. A server that goes away is reconnected
//! to once per request before the request fails.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate which
//! is used here for interfacing with LDAP is an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! A minimal example of running the client might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use url::Url;
//! use ldap_book::{
//!     config::{Config, ConnectionConfig, SearchLimits, SearchScope},
//!     connection::AuthMethod,
//!     contact::{Contact, Field},
//!     engine::{Engine, ViewEvent},
//!     query::Query,
//!     transport::LdapTransport,
//! };
//!
//! // Configuration can also be deserialized with serde. It's hand-constructed
//! // here for demonstration purposes.
//! let config = Config {
//!     url: Url::parse("ldap://localhost")?,
//!     connection: ConnectionConfig::default(),
//!     protocol_version: 3,
//!     base_dn: "ou=contacts,dc=example,dc=com".to_owned(),
//!     scope: SearchScope::OneLevel,
//!     limits: SearchLimits::default(),
//! };
//!
//! let transport = LdapTransport::new(config.connection.clone());
//! let (mut engine, mut events) = Engine::new(config, transport);
//! engine.connect().await?;
//! engine.authenticate(AuthMethod::SimpleBindDn, "cn=admin,dc=example,dc=com", "verysecret").await?;
//!
//! let mut contact = Contact::new();
//! contact.set_text(Field::FullName, "Jane Doe");
//! contact.set_text(Field::FamilyName, "Doe");
//! engine.create(contact).await;
//!
//! let mut view = engine.search(&Query::parse(r#"(beginswith "full_name" "Ja")"#)?).await;
//! engine.run_until_idle().await;
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("Received event: {event:#?}");
//! }
//! while let Ok(ViewEvent::Entry(contact)) = view.receiver.try_recv() {
//!     println!("Found contact: {contact:#?}");
//! }
//!
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Only simple binds are supported. SASL mechanisms are listed but can't be
//!   used.
//! * Searches are not paged; the configured size limit bounds them.
//! * Updated contacts are only seen when searched for. There is no support for
//!   [persistent search] or [content synchronization].
//!
//! [persistent search]: https://datatracker.ietf.org/doc/html/draft-ietf-ldapext-psearch-03
//! [content synchronization]: https://www.rfc-editor.org/rfc/rfc4533.html

pub mod catalog;
pub mod config;
pub mod connection;
pub mod contact;
pub mod diff;
pub mod dn;
pub mod engine;
pub mod entry;
pub mod error;
pub mod filter;
pub mod query;
pub mod transport;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	config::{Config, ConnectionConfig, SearchLimits, SearchScope, TLSConfig, TlsPolicy},
	connection::{AuthMethod, Connection, ConnectionState, ServerCapabilities},
	contact::{Contact, Field, FieldValue},
	engine::{BookEvent, BookView, Engine, RequestId, ViewEvent},
	entry::SearchEntryExt,
	error::{Error, Status, TransportError},
	filter::{QueryCompiler, SearchFilter},
	query::Query,
	transport::{LdapTransport, Transport},
};

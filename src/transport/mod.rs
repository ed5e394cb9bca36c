//! The contract between the operation engine and an LDAP client library.
//!
//! Requests are issued without waiting: every issuing call hands back the
//! message id under which the result will later show up in
//! [`Transport::poll_result`]. The engine correlates the two.
use std::time::Duration;

use ldap3::{LdapResult, Scope, SearchEntry};
use url::Url;

use crate::{diff::AttributeOp, error::TransportError};

mod ldap;

pub use self::ldap::LdapTransport;

/// Correlation token of an outstanding request
pub type MessageId = i32;

/// Parameters of a search request
#[derive(Debug, Clone)]
pub struct SearchRequest {
	/// The entry to search below
	pub base: String,
	/// How far below `base` to look
	pub scope: Scope,
	/// RFC 2254 filter
	pub filter: String,
	/// Attributes to return
	pub attributes: Vec<String>,
	/// Maximum number of entries, 0 for the server's limit
	pub size_limit: i32,
	/// Maximum time in seconds, 0 for the server's limit
	pub time_limit: i32,
}

/// What a completed protocol message carries
#[derive(Debug, Clone)]
pub enum ResultKind {
	/// One entry of a search. More messages follow for the same id.
	SearchEntry(SearchEntry),
	/// The end of a search
	SearchDone(LdapResult),
	/// Result of an add
	Add(LdapResult),
	/// Result of a modify
	Modify(LdapResult),
	/// Result of a modify-DN
	Rename(LdapResult),
	/// Result of a delete
	Delete(LdapResult),
}

impl ResultKind {
	/// Whether no further messages follow for the same id
	#[must_use]
	pub fn is_final(&self) -> bool {
		!matches!(self, ResultKind::SearchEntry(_))
	}
}

/// A message received from the server
#[derive(Debug, Clone)]
pub struct Message {
	/// The id of the request this answers
	pub id: MessageId,
	/// The payload
	pub kind: ResultKind,
}

/// An LDAP client connection.
///
/// All methods are called from a single task; implementations need not be
/// thread safe.
#[allow(async_fn_in_trait)]
pub trait Transport {
	/// Open a connection to the server, dropping any previous one.
	async fn connect(&mut self, url: &Url) -> Result<(), TransportError>;

	/// Upgrade the open connection to TLS.
	async fn start_tls(&mut self) -> Result<(), TransportError>;

	/// Bind with a DN and password, or anonymously when `dn` is `None`.
	async fn simple_bind(
		&mut self,
		dn: Option<&str>,
		password: &str,
	) -> Result<LdapResult, TransportError>;

	/// Run a search to completion, returning its entries. Used for the
	/// synchronous lookups done while connecting and authenticating.
	async fn search_entries(
		&mut self,
		base: &str,
		scope: Scope,
		filter: &str,
		attributes: &[&str],
	) -> Result<Vec<SearchEntry>, TransportError>;

	/// Issue a search.
	fn search(&mut self, request: &SearchRequest) -> Result<MessageId, TransportError>;

	/// Issue an add of a new entry.
	fn add(&mut self, dn: &str, attributes: &[AttributeOp]) -> Result<MessageId, TransportError>;

	/// Issue a modify of an existing entry.
	fn modify(&mut self, dn: &str, ops: &[AttributeOp]) -> Result<MessageId, TransportError>;

	/// Issue a modify-DN, replacing the first RDN and keeping the parent.
	fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<MessageId, TransportError>;

	/// Issue a delete.
	fn delete(&mut self, dn: &str) -> Result<MessageId, TransportError>;

	/// Abandon an outstanding request. No further messages arrive for it.
	fn abandon(&mut self, id: MessageId) -> Result<(), TransportError>;

	/// Wait up to `timeout` for the next message. An error means the
	/// connection is gone.
	async fn poll_result(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError>;
}

//! [`Transport`] over the `ldap3` async client
use std::{
	collections::{HashMap, HashSet},
	fmt,
	future::Future,
	time::Duration,
};

use ldap3::{LdapConnAsync, LdapError, LdapResult, Mod, Scope, SearchEntry, SearchOptions};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};
use url::Url;

use super::{Message, MessageId, ResultKind, SearchRequest, Transport};
use crate::{
	catalog::AttributeValues,
	config::ConnectionConfig,
	diff::{AttributeOp, ModOp},
	error::{TransportError, RC_OTHER, RC_SERVER_DOWN},
};

/// What request tasks and the connection driver report back
type Report = Result<Message, TransportError>;

/// Runs every request on its own task and funnels the results through a
/// channel, handing out message ids locally.
pub struct LdapTransport {
	/// Connection settings
	config: ConnectionConfig,
	/// The URL of the open connection
	url: Option<Url>,
	/// Handle for issuing requests, `None` while disconnected
	ldap: Option<ldap3::Ldap>,
	/// Task driving the connection
	driver: Option<JoinHandle<()>>,
	/// Requests still running
	in_flight: HashMap<MessageId, JoinHandle<()>>,
	/// The next message id to hand out
	next_id: MessageId,
	/// Sending half given to tasks of the current connection
	sender: mpsc::UnboundedSender<Report>,
	/// Where results arrive
	receiver: mpsc::UnboundedReceiver<Report>,
}

impl fmt::Debug for LdapTransport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LdapTransport")
			.field("url", &self.url)
			.field("connected", &self.ldap.is_some())
			.field("in_flight", &self.in_flight.len())
			.finish_non_exhaustive()
	}
}

/// Sends the messages of one request
#[derive(Debug)]
struct Reply {
	/// The request's id
	id: MessageId,
	/// Channel to the poller
	sender: mpsc::UnboundedSender<Report>,
}

impl Reply {
	/// Deliver a message. The poller may have gone away, which is fine.
	fn send(&self, kind: ResultKind) {
		if self.sender.send(Ok(Message { id: self.id, kind })).is_err() {
			debug!(id = self.id, "Dropping result for closed connection");
		}
	}
}

impl LdapTransport {
	/// A disconnected transport using the given settings
	#[must_use]
	pub fn new(config: ConnectionConfig) -> Self {
		let (sender, receiver) = mpsc::unbounded_channel();
		Self {
			config,
			url: None,
			ldap: None,
			driver: None,
			in_flight: HashMap::new(),
			next_id: 1,
			sender,
			receiver,
		}
	}

	/// Drop the connection and everything running on it
	fn close(&mut self) {
		if let Some(driver) = self.driver.take() {
			driver.abort();
		}
		for (_, task) in self.in_flight.drain() {
			task.abort();
		}
		self.ldap = None;
		// Stale results must not leak into the next connection
		(self.sender, self.receiver) = mpsc::unbounded_channel();
	}

	/// Open a connection, optionally negotiating StartTLS right away
	async fn open(&mut self, url: &Url, starttls: bool) -> Result<(), TransportError> {
		self.close();
		let settings = self
			.config
			.to_settings()
			.await
			.map_err(|err| TransportError::Other(err.to_string()))?
			.set_starttls(starttls);
		let (conn, ldap) = LdapConnAsync::from_url_with_settings(settings, url).await?;

		let sender = self.sender.clone();
		self.driver = Some(tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
			// Ignored if the transport moved on to another connection
			let _ = sender.send(Err(TransportError::ServerDown("Connection closed".to_owned())));
		}));
		self.ldap = Some(ldap);
		self.url = Some(url.clone());
		Ok(())
	}

	/// A request handle with the operation timeout applied. A connection
	/// the server closed while nobody was polling counts as disconnected.
	fn handle(&mut self) -> Result<ldap3::Ldap, TransportError> {
		let mut ldap = self.ldap.clone().ok_or_else(not_connected)?;
		if ldap.is_closed() || self.driver.as_ref().map_or(true, JoinHandle::is_finished) {
			debug!("Connection was closed by the server");
			self.close();
			return Err(TransportError::ServerDown("Connection closed".to_owned()));
		}
		ldap.with_timeout(self.config.operation_timeout);
		Ok(ldap)
	}

	/// The next id not used by a running request
	fn allocate_id(&mut self) -> MessageId {
		loop {
			let id = self.next_id;
			self.next_id = if id == MessageId::MAX { 1 } else { id + 1 };
			if !self.in_flight.contains_key(&id) {
				return id;
			}
		}
	}

	/// Run a request on its own task
	fn issue<F, Fut>(&mut self, run: F) -> Result<MessageId, TransportError>
	where
		F: FnOnce(ldap3::Ldap, Reply) -> Fut,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let ldap = self.handle()?;
		let id = self.allocate_id();
		let reply = Reply { id, sender: self.sender.clone() };
		self.in_flight.insert(id, tokio::spawn(run(ldap, reply)));
		Ok(id)
	}
}

impl Transport for LdapTransport {
	async fn connect(&mut self, url: &Url) -> Result<(), TransportError> {
		self.open(url, false).await
	}

	async fn start_tls(&mut self) -> Result<(), TransportError> {
		let url = self.url.clone().ok_or_else(not_connected)?;
		self.open(&url, true).await.map_err(|err| match err {
			TransportError::ServerDown(reason) => TransportError::ServerDown(reason),
			other => TransportError::Tls(other.to_string()),
		})
	}

	async fn simple_bind(
		&mut self,
		dn: Option<&str>,
		password: &str,
	) -> Result<LdapResult, TransportError> {
		let mut ldap = self.handle()?;
		Ok(ldap.simple_bind(dn.unwrap_or_default(), password).await?)
	}

	async fn search_entries(
		&mut self,
		base: &str,
		scope: Scope,
		filter: &str,
		attributes: &[&str],
	) -> Result<Vec<SearchEntry>, TransportError> {
		let mut ldap = self.handle()?;
		let (entries, _) = ldap.search(base, scope, filter, attributes.to_vec()).await?.success()?;
		Ok(entries.into_iter().filter(|entry| !entry.is_ref()).map(SearchEntry::construct).collect())
	}

	fn search(&mut self, request: &SearchRequest) -> Result<MessageId, TransportError> {
		let request = request.clone();
		self.issue(move |mut ldap, reply| async move {
			ldap.with_search_options(
				SearchOptions::new().sizelimit(request.size_limit).timelimit(request.time_limit),
			);
			let mut stream = match ldap
				.streaming_search(&request.base, request.scope, &request.filter, request.attributes)
				.await
			{
				Ok(stream) => stream,
				Err(err) => return reply.send(ResultKind::SearchDone(failed(err))),
			};
			loop {
				match stream.next().await {
					Ok(Some(entry)) if entry.is_ref() || entry.is_intermediate() => {}
					Ok(Some(entry)) => {
						reply.send(ResultKind::SearchEntry(SearchEntry::construct(entry)));
					}
					Ok(None) => break,
					Err(err) => return reply.send(ResultKind::SearchDone(failed(err))),
				}
			}
			reply.send(ResultKind::SearchDone(stream.finish().await));
		})
	}

	fn add(&mut self, dn: &str, attributes: &[AttributeOp]) -> Result<MessageId, TransportError> {
		let dn = dn.to_owned();
		let attributes: Vec<_> = attributes
			.iter()
			.map(|op| (op.attribute.as_bytes().to_vec(), value_set(&op.values)))
			.collect();
		self.issue(move |mut ldap, reply| async move {
			let result = ldap.add(&dn, attributes).await.unwrap_or_else(failed);
			reply.send(ResultKind::Add(result));
		})
	}

	fn modify(&mut self, dn: &str, ops: &[AttributeOp]) -> Result<MessageId, TransportError> {
		let dn = dn.to_owned();
		let mods: Vec<_> = ops.iter().map(to_mod).collect();
		self.issue(move |mut ldap, reply| async move {
			let result = ldap.modify(&dn, mods).await.unwrap_or_else(failed);
			reply.send(ResultKind::Modify(result));
		})
	}

	fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<MessageId, TransportError> {
		let dn = dn.to_owned();
		let new_rdn = new_rdn.to_owned();
		self.issue(move |mut ldap, reply| async move {
			let result = ldap.modifydn(&dn, &new_rdn, true, None).await.unwrap_or_else(failed);
			reply.send(ResultKind::Rename(result));
		})
	}

	fn delete(&mut self, dn: &str) -> Result<MessageId, TransportError> {
		let dn = dn.to_owned();
		self.issue(move |mut ldap, reply| async move {
			let result = ldap.delete(&dn).await.unwrap_or_else(failed);
			reply.send(ResultKind::Delete(result));
		})
	}

	fn abandon(&mut self, id: MessageId) -> Result<(), TransportError> {
		if let Some(task) = self.in_flight.remove(&id) {
			task.abort();
		}
		Ok(())
	}

	async fn poll_result(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
		match tokio::time::timeout(timeout, self.receiver.recv()).await {
			Ok(Some(Ok(message))) => {
				if message.kind.is_final() {
					self.in_flight.remove(&message.id);
				}
				Ok(Some(message))
			}
			Ok(Some(Err(err))) => {
				self.close();
				Err(err)
			}
			Ok(None) | Err(_) => Ok(None),
		}
	}
}

impl Drop for LdapTransport {
	fn drop(&mut self) {
		self.close();
	}
}

/// The error for requests issued while disconnected
fn not_connected() -> TransportError {
	TransportError::ServerDown("Not connected".to_owned())
}

/// A locally synthesized result for a request that failed client side
fn failed(err: LdapError) -> LdapResult {
	let (rc, text) = match TransportError::from(err) {
		TransportError::Rejected { rc, text } => (rc, text),
		err @ TransportError::ServerDown(_) => (RC_SERVER_DOWN, err.to_string()),
		err => (RC_OTHER, err.to_string()),
	};
	LdapResult { rc, matched: String::new(), text, refs: Vec::new(), ctrls: Vec::new() }
}

/// Attribute values as the set `ldap3` expects
fn value_set(values: &AttributeValues) -> HashSet<Vec<u8>> {
	values.to_bytes().into_iter().collect()
}

/// Convert an [`AttributeOp`] to an `ldap3` modification
fn to_mod(op: &AttributeOp) -> Mod<Vec<u8>> {
	let attribute = op.attribute.as_bytes().to_vec();
	let values = value_set(&op.values);
	match op.op {
		ModOp::Add => Mod::Add(attribute, values),
		ModOp::Replace => Mod::Replace(attribute, values),
		ModOp::Delete => Mod::Delete(attribute, values),
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashSet;

	use ldap3::{LdapError, Mod};

	use super::{failed, to_mod, LdapTransport};
	use crate::{
		catalog::AttributeValues,
		config::ConnectionConfig,
		diff::AttributeOp,
		transport::{SearchRequest, Transport},
	};

	#[test]
	fn modifications() {
		let op = AttributeOp::replace("mail", AttributeValues::Text(vec!["a@example.org".to_owned()]));
		let Mod::Replace(attribute, values) = to_mod(&op) else { panic!("not a replace") };
		assert_eq!(attribute, b"mail");
		assert_eq!(values, HashSet::from([b"a@example.org".to_vec()]));

		let Mod::Delete(attribute, values) = to_mod(&AttributeOp::delete("title")) else {
			panic!("not a delete")
		};
		assert_eq!(attribute, b"title");
		assert!(values.is_empty(), "an empty delete removes the whole attribute");
	}

	#[test]
	fn failures_become_results() {
		assert_eq!(failed(LdapError::EndOfStream).rc, 81);
		assert_eq!(failed(LdapError::FilterParsing).rc, 80);
	}

	#[tokio::test]
	async fn requests_need_a_connection() {
		let mut transport = LdapTransport::new(ConnectionConfig::default());
		let request = SearchRequest {
			base: "dc=example".to_owned(),
			scope: ldap3::Scope::Base,
			filter: "(objectClass=*)".to_owned(),
			attributes: Vec::new(),
			size_limit: 0,
			time_limit: 0,
		};
		assert!(transport.search(&request).unwrap_err().is_server_down());
		assert!(transport.delete("cn=x").unwrap_err().is_server_down());
		assert!(transport.simple_bind(None, "").await.unwrap_err().is_server_down());
		assert!(transport.poll_result(std::time::Duration::from_millis(1)).await.unwrap().is_none());
	}
}

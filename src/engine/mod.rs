//! The operation engine: issues requests, tracks them by message id and
//! dispatches their results.
//!
//! Everything runs on the caller's task. Requests are issued without waiting
//! for the server; [`Engine::poll`] (or [`Engine::run_until_idle`]) feeds the
//! results to the outstanding operations, which report back through the
//! [`BookEvent`] channel returned by [`Engine::new`] and, for searches,
//! through their [`BookView`].
use std::{fmt, time::Duration};

use ldap3::{Scope, SearchEntry};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use self::table::{ModifyPhase, OperationTable, PendingOperation, Request};
use crate::{
	catalog::{self, AttributeValues},
	config::{Config, SearchScope},
	connection::{AuthMethod, Connection, ServerCapabilities},
	contact::Contact,
	diff::{self, AttributeOp},
	dn,
	entry::SearchEntryExt,
	error::{Error, Status, TransportError},
	filter::{QueryCompiler, SearchFilter},
	query::Query,
	transport::{Message, MessageId, ResultKind, SearchRequest, Transport},
};

mod table;

pub use self::table::POLL_INTERVAL;

/// How long a poll waits for the transport to produce a result
pub const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Object class every contact search is restricted to
const CONTACT_CLASS: &str = "person";

/// Identifies a logical request towards the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Notifications for the address book
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookEvent {
	/// A contact was created. Carries the contact with its new id on success.
	Created {
		/// The request
		request: RequestId,
		/// Outcome
		status: Status,
		/// The stored contact
		contact: Option<Contact>,
	},
	/// Contacts were removed
	Removed {
		/// The request
		request: RequestId,
		/// Outcome
		status: Status,
		/// Ids of the removed contacts
		ids: Vec<String>,
	},
	/// A contact was modified. Carries the contact, with its id updated if
	/// the entry was renamed.
	Modified {
		/// The request
		request: RequestId,
		/// Outcome
		status: Status,
		/// The stored contact
		contact: Option<Contact>,
	},
	/// A contact was read
	Fetched {
		/// The request
		request: RequestId,
		/// Outcome
		status: Status,
		/// The contact, if found
		contact: Option<Contact>,
	},
	/// Advisory progress text
	Status(String),
}

/// Results of a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
	/// A matching contact
	Entry(Contact),
	/// The search finished. Nothing follows.
	Done(Status),
}

/// The consumer end of a search. Dropping it detaches from the search, which
/// still runs to completion on the wire.
#[derive(Debug)]
pub struct BookView {
	/// The search request
	pub request: RequestId,
	/// Where results arrive
	pub receiver: mpsc::UnboundedReceiver<ViewEvent>,
}

impl BookView {
	/// Collect all entries and the final status of a finished search
	pub fn drain(&mut self) -> (Vec<Contact>, Option<Status>) {
		let mut contacts = Vec::new();
		while let Ok(event) = self.receiver.try_recv() {
			match event {
				ViewEvent::Entry(contact) => contacts.push(contact),
				ViewEvent::Done(status) => return (contacts, Some(status)),
			}
		}
		(contacts, None)
	}
}

/// Multiplexes logical address book requests over one connection.
#[derive(Debug)]
pub struct Engine<T> {
	/// The session
	connection: Connection<T>,
	/// Outstanding operations
	table: OperationTable,
	/// Where notifications go
	events: mpsc::UnboundedSender<BookEvent>,
	/// The last request id handed out
	last_request: u64,
}

impl<T: Transport> Engine<T> {
	/// Create an engine talking to a server through `transport`. Also returns
	/// the receiver for its notifications.
	#[must_use]
	pub fn new(config: Config, transport: T) -> (Self, mpsc::UnboundedReceiver<BookEvent>) {
		let (events, receiver) = mpsc::unbounded_channel();
		let engine = Engine {
			connection: Connection::new(config, transport),
			table: OperationTable::default(),
			events,
			last_request: 0,
		};
		(engine, receiver)
	}

	/// The session
	pub fn connection(&self) -> &Connection<T> {
		&self.connection
	}

	/// The session, mutably
	pub fn connection_mut(&mut self) -> &mut Connection<T> {
		&mut self.connection
	}

	/// What the server supports
	pub fn capabilities(&self) -> &ServerCapabilities {
		self.connection.capabilities()
	}

	/// Number of requests waiting for the server
	pub fn pending_operations(&self) -> usize {
		self.table.len()
	}

	/// Whether the poll timer is running
	pub fn is_polling(&self) -> bool {
		self.table.is_polling()
	}

	/// Connect to the server
	pub async fn connect(&mut self) -> Result<(), Error> {
		self.status("Connecting to LDAP server…");
		self.connection.connect().await
	}

	/// Authenticate, see [`Connection::authenticate`]
	pub async fn authenticate(
		&mut self,
		method: AuthMethod,
		user: &str,
		password: &str,
	) -> Result<(), Error> {
		self.connection.authenticate(method, user, password).await
	}

	/// Store a new contact below the configured base. The contact is named
	/// by its full name.
	pub async fn create(&mut self, mut contact: Contact) -> RequestId {
		let request = self.next_request();
		let Some(dn) = dn::contact_dn(&contact, &self.connection.config().base_dn) else {
			warn!(%request, "Cannot create a contact without a name");
			let kind = Request::Create { contact };
			self.complete(PendingOperation { request, kind }, Status::OtherError);
			return request;
		};
		contact.set_id(dn.clone());

		let capabilities = self.connection.capabilities();
		let classes = diff::creation_object_classes(capabilities);
		let mut attributes = vec![AttributeOp::add(
			"objectClass",
			AttributeValues::Text(classes.into_iter().map(str::to_owned).collect()),
		)];
		attributes.extend(diff::diff(None, &contact, capabilities).ops);

		debug!(%request, %dn, "Creating contact");
		let op = PendingOperation { request, kind: Request::Create { contact } };
		self.start(op, |transport| transport.add(&dn, &attributes)).await;
		request
	}

	/// Delete a contact
	pub async fn remove(&mut self, id: &str) -> RequestId {
		let request = self.next_request();
		debug!(%request, id, "Removing contact");
		let op = PendingOperation { request, kind: Request::Remove { id: id.to_owned() } };
		self.start(op, |transport| transport.delete(id)).await;
		request
	}

	/// Update a stored contact to match `contact`. Its id names the entry.
	pub async fn modify(&mut self, contact: Contact) -> RequestId {
		let request = self.next_request();
		let Some(dn) = contact.id().map(str::to_owned) else {
			warn!(%request, "Cannot modify a contact without an id");
			let kind = Request::Modify { contact, phase: ModifyPhase::Write };
			self.complete(PendingOperation { request, kind }, Status::OtherError);
			return request;
		};

		debug!(%request, %dn, "Modifying contact");
		let lookup = self.lookup(&dn);
		let kind = Request::Modify { contact, phase: ModifyPhase::Lookup { existing: None } };
		self.start(PendingOperation { request, kind }, |transport| transport.search(&lookup)).await;
		request
	}

	/// Read a single contact
	pub async fn get(&mut self, id: &str) -> RequestId {
		let request = self.next_request();
		debug!(%request, id, "Fetching contact");
		let lookup = self.lookup(id);
		let op = PendingOperation { request, kind: Request::Get { id: id.to_owned(), found: None } };
		self.start(op, |transport| transport.search(&lookup)).await;
		request
	}

	/// Search the configured scope for contacts matching a query
	pub async fn search(&mut self, query: &Query) -> BookView {
		match QueryCompiler::new(self.connection.capabilities()).compile(query) {
			Ok(filter) => {
				let scope = self.connection.config().scope;
				self.search_filter(&filter, scope).await
			}
			Err(err) => {
				debug!("Rejecting query {query:?}: {err}");
				let (view, sender) = self.open_view();
				// The receiver is still alive in `view`
				let _ = sender.send(ViewEvent::Done(Status::InvalidQuery));
				view
			}
		}
	}

	/// Search for contacts matching a compiled filter
	pub async fn search_filter(&mut self, filter: &SearchFilter, scope: SearchScope) -> BookView {
		let config = self.connection.config();
		let search = SearchRequest {
			base: config.base_dn.clone(),
			scope: scope.into(),
			filter: filter.restricted_to(CONTACT_CLASS).to_string(),
			attributes: readable_attributes(),
			size_limit: config.limits.size_limit,
			time_limit: config.limits.time_limit,
		};
		let (view, sender) = self.open_view();
		self.status("Searching…");
		debug!(request = %view.request, filter = %search.filter, "Searching");
		let op = PendingOperation { request: view.request, kind: Request::Search { view: sender } };
		self.start(op, |transport| transport.search(&search)).await;
		view
	}

	/// Stop a request without notifying anyone
	pub fn cancel(&mut self, request: RequestId) {
		let Some(id) = self.table.find(request) else {
			debug!(%request, "Nothing to cancel");
			return;
		};
		self.table.remove(id);
		if let Err(err) = self.connection.transport_mut().abandon(id) {
			warn!(%request, "Failed to abandon message {id}: {err}");
		}
	}

	/// Abandon everything outstanding, failing each request
	pub fn teardown(&mut self) {
		for (id, op) in self.table.drain() {
			if let Err(err) = self.connection.transport_mut().abandon(id) {
				debug!("Failed to abandon message {id}: {err}");
			}
			self.complete(op, Status::OtherError);
		}
	}

	/// Dispatch whatever results the transport has ready. Returns the number
	/// of messages handled.
	pub async fn poll(&mut self) -> usize {
		let mut handled = 0;
		loop {
			match self.connection.transport_mut().poll_result(POLL_TIMEOUT).await {
				Ok(Some(message)) => {
					self.dispatch(message).await;
					handled += 1;
				}
				Ok(None) => return handled,
				Err(err) => {
					self.recover(&err).await;
					return handled;
				}
			}
		}
	}

	/// Poll on every timer tick until nothing is outstanding
	pub async fn run_until_idle(&mut self) {
		while self.table.is_polling() {
			self.table.timer().tick().await;
			self.poll().await;
		}
	}

	/// Handle a lost connection: everything issued on it is gone
	async fn recover(&mut self, err: &TransportError) {
		warn!("Lost connection to LDAP server: {err}");
		self.status("Reconnecting to LDAP server…");
		if let Err(err) = self.connection.reconnect().await {
			warn!("Reconnecting failed: {err}");
		}
		self.fail_pending(Status::Unavailable);
	}

	/// Fail everything in the table
	fn fail_pending(&mut self, status: Status) {
		for (id, op) in self.table.drain() {
			debug!(request = %op.request, "Failing message {id}");
			self.complete(op, status);
		}
	}

	/// Issue a request, reconnecting and retrying once if the server went
	/// away.
	async fn issue<F>(&mut self, mut send: F) -> Result<MessageId, Status>
	where
		F: FnMut(&mut T) -> Result<MessageId, TransportError>,
	{
		match send(self.connection.transport_mut()) {
			Ok(id) => return Ok(id),
			Err(err) if err.is_server_down() => warn!("Server unreachable: {err}"),
			Err(err) => return Err(err.status()),
		}

		self.status("Reconnecting to LDAP server…");
		if let Err(err) = self.connection.reconnect().await {
			warn!("Reconnecting failed: {err}");
			return Err(Status::Unavailable);
		}
		// Requests issued on the old connection won't be answered
		self.fail_pending(Status::Unavailable);

		send(self.connection.transport_mut()).map_err(|err| {
			warn!("Request failed after reconnecting: {err}");
			err.status()
		})
	}

	/// Issue the first request of a new operation
	async fn start<F>(&mut self, op: PendingOperation, send: F)
	where
		F: FnMut(&mut T) -> Result<MessageId, TransportError>,
	{
		match self.issue(send).await {
			Ok(id) => {
				if let Err(op) = self.table.insert(id, op) {
					error!(request = %op.request, "Message id {id} is already pending");
					self.complete(op, Status::OtherError);
				}
			}
			Err(status) => self.complete(op, status),
		}
	}

	/// Issue the next request of a checked out operation
	async fn reissue<F>(&mut self, op: PendingOperation, send: F)
	where
		F: FnMut(&mut T) -> Result<MessageId, TransportError>,
	{
		match self.issue(send).await {
			Ok(id) => self.checkin(id, op),
			Err(status) => self.conclude(op, status),
		}
	}

	/// Return a checked out operation to the table
	fn checkin(&mut self, id: MessageId, op: PendingOperation) {
		if let Err(op) = self.table.checkin(id, op) {
			error!(request = %op.request, "Message id {id} is already pending");
			self.conclude(op, Status::OtherError);
		}
	}

	/// Finish a checked out operation
	fn conclude(&mut self, op: PendingOperation, status: Status) {
		self.table.finish();
		self.complete(op, status);
	}

	/// Feed a message to its operation
	async fn dispatch(&mut self, message: Message) {
		let Message { id, kind: result } = message;
		let Some(PendingOperation { request, kind }) = self.table.checkout(id) else {
			debug!("Dropping result for unknown message id {id}");
			return;
		};

		match (kind, result) {
			(Request::Search { view }, ResultKind::SearchEntry(entry)) => {
				if view.send(ViewEvent::Entry(Contact::from_entry(&entry))).is_err() {
					debug!(%request, "View detached, dropping entry");
				}
				self.checkin(id, PendingOperation { request, kind: Request::Search { view } });
			}
			(Request::Get { id: dn, found: None }, ResultKind::SearchEntry(entry)) => {
				let found = Some(Contact::from_entry(&entry));
				self.checkin(id, PendingOperation { request, kind: Request::Get { id: dn, found } });
			}
			(kind @ (Request::Search { .. } | Request::Get { .. }), ResultKind::SearchDone(result))
			| (kind @ Request::Create { .. }, ResultKind::Add(result))
			| (kind @ Request::Remove { .. }, ResultKind::Delete(result)) => {
				self.conclude(PendingOperation { request, kind }, Status::from(&result));
			}
			(Request::Modify { contact, phase }, result) => {
				self.advance_modify(id, request, contact, phase, result).await;
			}
			(kind, result) => {
				error!(%request, "Unexpected result {result:?}");
				self.conclude(PendingOperation { request, kind }, Status::OtherError);
			}
		}
	}

	/// Step a modification forward
	async fn advance_modify(
		&mut self,
		id: MessageId,
		request: RequestId,
		mut contact: Contact,
		phase: ModifyPhase,
		result: ResultKind,
	) {
		let op = |contact, phase| PendingOperation { request, kind: Request::Modify { contact, phase } };
		match (phase, result) {
			(ModifyPhase::Lookup { existing: None }, ResultKind::SearchEntry(entry)) => {
				let phase = ModifyPhase::Lookup { existing: Some(entry) };
				self.checkin(id, op(contact, phase));
			}
			(ModifyPhase::Lookup { existing }, ResultKind::SearchDone(result)) => {
				match (existing, Status::from(&result)) {
					(Some(entry), Status::Success) => self.write(request, contact, entry).await,
					(None, Status::Success) => {
						self.conclude(op(contact, ModifyPhase::Write), Status::NotFound);
					}
					(_, status) => self.conclude(op(contact, ModifyPhase::Write), status),
				}
			}
			(ModifyPhase::Rename { ops, new_dn }, ResultKind::Rename(result)) => {
				let status = Status::from(&result);
				if !status.is_success() {
					self.conclude(op(contact, ModifyPhase::Write), status);
					return;
				}
				debug!(%request, %new_dn, "Renamed entry");
				contact.set_id(new_dn.clone());
				self.reissue(op(contact, ModifyPhase::Write), |transport| {
					transport.modify(&new_dn, &ops)
				})
				.await;
			}
			(ModifyPhase::Write, ResultKind::Modify(result)) => {
				self.conclude(op(contact, ModifyPhase::Write), Status::from(&result));
			}
			(phase, result) => {
				error!(%request, ?phase, "Unexpected result {result:?} while modifying");
				self.conclude(op(contact, ModifyPhase::Write), Status::OtherError);
			}
		}
	}

	/// Write the difference between `existing` and `contact`, renaming first
	/// if the name changed
	async fn write(&mut self, request: RequestId, contact: Contact, existing: SearchEntry) {
		let capabilities = self.connection.capabilities();
		let diff = diff::diff(Some(&existing), &contact, capabilities);
		if diff.is_empty() {
			debug!(%request, "Nothing changed");
			let kind = Request::Modify { contact, phase: ModifyPhase::Write };
			self.conclude(PendingOperation { request, kind }, Status::Success);
			return;
		}

		let missing = diff::missing_object_classes(existing.object_classes(), capabilities);
		let mut ops = diff.ops;
		if let Some(classes) = diff::object_class_op(&missing) {
			ops.insert(0, classes);
		}

		let dn = existing.dn;
		let rename = diff.naming_changed.then(|| dn::contact_rdn(&contact)).flatten().filter(|rdn| {
			// Entries named by something else keep their DN
			dn::rdn_attribute(rdn).eq_ignore_ascii_case(dn::rdn_attribute(&dn))
		});

		match rename {
			Some(rdn) => {
				let new_dn = dn::with_rdn(&dn, &rdn);
				debug!(%request, %dn, %new_dn, "Renaming entry");
				let kind = Request::Modify { contact, phase: ModifyPhase::Rename { ops, new_dn } };
				self.reissue(PendingOperation { request, kind }, |transport| {
					transport.rename(&dn, &rdn)
				})
				.await;
			}
			None => {
				let kind = Request::Modify { contact, phase: ModifyPhase::Write };
				self.reissue(PendingOperation { request, kind }, |transport| {
					transport.modify(&dn, &ops)
				})
				.await;
			}
		}
	}

	/// Deliver the terminal status of an operation
	fn complete(&self, op: PendingOperation, status: Status) {
		let PendingOperation { request, kind } = op;
		debug!(%request, %status, "Request finished");
		let success = status.is_success();
		let event = match kind {
			Request::Create { contact } => {
				BookEvent::Created { request, status, contact: success.then_some(contact) }
			}
			Request::Remove { id } => BookEvent::Removed { request, status, ids: vec![id] },
			Request::Modify { contact, .. } => {
				BookEvent::Modified { request, status, contact: success.then_some(contact) }
			}
			Request::Get { found, .. } => {
				let status = if success && found.is_none() { Status::NotFound } else { status };
				BookEvent::Fetched { request, status, contact: found }
			}
			Request::Search { view } => {
				if view.send(ViewEvent::Done(status)).is_err() {
					debug!(%request, "View detached before the search finished");
				}
				return;
			}
		};
		self.emit(event);
	}

	/// Send a notification
	fn emit(&self, event: BookEvent) {
		if self.events.send(event).is_err() {
			debug!("Nobody is listening for events");
		}
	}

	/// Send advisory progress text
	fn status(&self, text: &str) {
		info!("{text}");
		self.emit(BookEvent::Status(text.to_owned()));
	}

	/// A fresh request id
	fn next_request(&mut self) -> RequestId {
		self.last_request += 1;
		RequestId(self.last_request)
	}

	/// A view for a new search request
	fn open_view(&mut self) -> (BookView, mpsc::UnboundedSender<ViewEvent>) {
		let (sender, receiver) = mpsc::unbounded_channel();
		(BookView { request: self.next_request(), receiver }, sender)
	}

	/// A base-scope read of one entry
	fn lookup(&self, dn: &str) -> SearchRequest {
		SearchRequest {
			base: dn.to_owned(),
			scope: Scope::Base,
			filter: "(objectClass=*)".to_owned(),
			attributes: readable_attributes(),
			size_limit: 0,
			time_limit: self.connection.config().limits.time_limit,
		}
	}
}

/// The attributes contact reads ask for
fn readable_attributes() -> Vec<String> {
	catalog::readable_attributes().into_iter().map(str::to_owned).collect()
}

#![allow(dead_code, clippy::unwrap_used, clippy::missing_docs_in_private_items)]
use std::{
	cell::RefCell,
	collections::{BTreeMap, HashMap, VecDeque},
	error::Error,
	rc::Rc,
	time::Duration,
};

use ldap3::{LdapConnAsync, LdapResult, Scope, SearchEntry};
use ldap_book::{
	catalog::AttributeValues,
	config::{Config, ConnectionConfig, SearchLimits, SearchScope, TlsPolicy},
	diff::{AttributeOp, ModOp},
	dn,
	transport::{Message, MessageId, ResultKind, SearchRequest, Transport},
	TransportError,
};
use url::Url;

pub const BASE_DN: &str = "ou=contacts,dc=example,dc=org";
pub const SCHEMA_DN: &str = "cn=subschema";

pub fn config(policy: TlsPolicy) -> Config {
	let mut connection = ConnectionConfig::default();
	connection.tls.policy = policy;
	Config {
		url: Url::parse("ldap://localhost:1389").unwrap(),
		connection,
		protocol_version: 3,
		base_dn: BASE_DN.to_owned(),
		scope: SearchScope::OneLevel,
		limits: SearchLimits::default(),
	}
}

pub fn ldap_result(rc: u32) -> LdapResult {
	LdapResult { rc, matched: String::new(), text: String::new(), refs: Vec::new(), ctrls: Vec::new() }
}

pub fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
	SearchEntry {
		dn: dn.to_owned(),
		attrs: attrs
			.iter()
			.map(|(name, values)| {
				((*name).to_owned(), values.iter().map(|value| (*value).to_owned()).collect())
			})
			.collect(),
		bin_attrs: HashMap::new(),
	}
}

/// Scripted server state shared between a test and its transport
#[derive(Debug)]
pub struct MockState {
	/// Entries by DN
	pub directory: BTreeMap<String, SearchEntry>,
	/// Messages ready for polling
	pub queue: VecDeque<Result<Message, TransportError>>,
	/// Messages held back until released
	pub held: Vec<(MessageId, VecDeque<ResultKind>)>,
	/// Queue results as soon as requests are issued
	pub auto_release: bool,
	/// The next message id handed out
	pub next_id: MessageId,
	/// Every call fails with "server down", including connecting
	pub down: bool,
	/// Fail this many issuing calls with "server down"
	pub fail_issues: usize,
	/// Result of StartTLS
	pub starttls_ok: bool,
	/// Result code of anonymous binds
	pub anonymous_rc: u32,
	/// Passwords by bind DN
	pub users: HashMap<String, String>,
	/// The root DSE
	pub root_dse: Option<SearchEntry>,
	/// Object class definitions in the schema entry
	pub object_classes: Vec<String>,
	/// Hide the schema from anonymous sessions
	pub schema_requires_auth: bool,
	/// Hide the root DSE from anonymous sessions
	pub root_dse_requires_auth: bool,
	/// The DN currently bound as
	pub bound: Option<String>,
	/// Number of connects
	pub connects: usize,
	/// Number of StartTLS attempts
	pub starttls_attempts: usize,
	/// Number of issuing calls, successful or not
	pub issued: usize,
	/// Log of requests sent over the wire
	pub requests: Vec<String>,
	/// Abandoned message ids
	pub abandoned: Vec<MessageId>,
}

impl Default for MockState {
	fn default() -> Self {
		Self {
			directory: BTreeMap::new(),
			queue: VecDeque::new(),
			held: Vec::new(),
			auto_release: true,
			next_id: 1,
			down: false,
			fail_issues: 0,
			starttls_ok: true,
			anonymous_rc: 0,
			users: HashMap::new(),
			root_dse: Some(entry(
				"",
				&[
					("supportedLDAPVersion", &["3"]),
					("supportedExtension", &["1.3.6.1.4.1.1466.20037"]),
					("supportedSASLMechanisms", &["DIGEST-MD5", "EXTERNAL"]),
					("subschemaSubentry", &[SCHEMA_DN]),
				],
			)),
			object_classes: vec![
				"( 2.5.6.6 NAME 'person' SUP top STRUCTURAL MUST ( sn $ cn ) )".to_owned(),
				"( 1.3.6.1.4.1.8506.1.3.1 NAME 'evolutionPerson' SUP inetOrgPerson STRUCTURAL )"
					.to_owned(),
			],
			schema_requires_auth: false,
			root_dse_requires_auth: false,
			bound: None,
			connects: 0,
			starttls_attempts: 0,
			issued: 0,
			requests: Vec::new(),
			abandoned: Vec::new(),
		}
	}
}

/// An in-memory [`Transport`] answering from a [`MockState`]
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
	pub state: Rc<RefCell<MockState>>,
}

impl MockTransport {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
		f(&mut self.state.borrow_mut())
	}

	pub fn insert(&self, entry: SearchEntry) {
		self.with(|state| state.directory.insert(entry.dn.clone(), entry));
	}

	pub fn get(&self, dn: &str) -> Option<SearchEntry> {
		self.with(|state| state.directory.get(dn).cloned())
	}

	pub fn requests(&self) -> Vec<String> {
		self.with(|state| state.requests.clone())
	}

	/// Queue held results one message per request at a time
	pub fn release_round_robin(&self) {
		self.with(|state| {
			let mut held = std::mem::take(&mut state.held);
			while !held.is_empty() {
				for (id, messages) in &mut held {
					if let Some(kind) = messages.pop_front() {
						state.queue.push_back(Ok(Message { id: *id, kind }));
					}
				}
				held.retain(|(_, messages)| !messages.is_empty());
			}
		});
	}

	/// Run a request against the directory
	fn issue(
		&self,
		request: String,
		respond: impl FnOnce(&mut MockState) -> Vec<ResultKind>,
	) -> Result<MessageId, TransportError> {
		self.with(|state| {
			state.issued += 1;
			if state.down {
				return Err(down());
			}
			if state.fail_issues > 0 {
				state.fail_issues -= 1;
				return Err(down());
			}
			let id = state.next_id;
			state.next_id += 1;
			state.requests.push(request);
			let messages: VecDeque<_> = respond(state).into();
			if state.auto_release {
				state.queue.extend(messages.into_iter().map(|kind| Ok(Message { id, kind })));
			} else {
				state.held.push((id, messages));
			}
			Ok(id)
		})
	}
}

fn down() -> TransportError {
	TransportError::ServerDown("connection refused".to_owned())
}

/// Whether `entry` is matched by the few filters the tests use
fn matches(entry: &SearchEntry, filter: &str) -> bool {
	let Some(rest) = filter.strip_prefix("(mail=") else {
		return true;
	};
	let address = rest.trim_end_matches(')');
	entry.attrs.get("mail").map_or(false, |values| values.iter().any(|value| value == address))
}

fn in_scope(dn: &str, base: &str, scope: Scope) -> bool {
	match scope {
		Scope::Base => dn.eq_ignore_ascii_case(base),
		Scope::OneLevel => dn::split_first(dn).1.map_or(false, |parent| parent.eq_ignore_ascii_case(base)),
		Scope::Subtree => {
			dn.eq_ignore_ascii_case(base)
				|| dn.to_ascii_lowercase().ends_with(&format!(",{}", base.to_ascii_lowercase()))
		}
	}
}

fn apply(entry: &mut SearchEntry, op: &AttributeOp) {
	let AttributeValues::Text(values) = &op.values else {
		entry.bin_attrs.insert(op.attribute.clone(), op.values.to_bytes());
		return;
	};
	match op.op {
		ModOp::Add => entry.attrs.entry(op.attribute.clone()).or_default().extend(values.clone()),
		ModOp::Replace => {
			entry.attrs.insert(op.attribute.clone(), values.clone());
		}
		ModOp::Delete => {
			entry.attrs.remove(&op.attribute);
		}
	}
}

impl Transport for MockTransport {
	async fn connect(&mut self, _url: &Url) -> Result<(), TransportError> {
		self.with(|state| {
			state.connects += 1;
			state.bound = None;
			state.queue.clear();
			state.held.clear();
			if state.down {
				Err(down())
			} else {
				Ok(())
			}
		})
	}

	async fn start_tls(&mut self) -> Result<(), TransportError> {
		self.with(|state| {
			state.starttls_attempts += 1;
			if state.starttls_ok {
				Ok(())
			} else {
				Err(TransportError::Tls("handshake failed".to_owned()))
			}
		})
	}

	async fn simple_bind(
		&mut self,
		dn: Option<&str>,
		password: &str,
	) -> Result<LdapResult, TransportError> {
		self.with(|state| {
			if state.down {
				return Err(down());
			}
			let Some(dn) = dn else {
				return Ok(ldap_result(state.anonymous_rc));
			};
			if state.users.get(dn).map(String::as_str) == Some(password) {
				state.bound = Some(dn.to_owned());
				Ok(ldap_result(0))
			} else {
				Ok(ldap_result(49))
			}
		})
	}

	async fn search_entries(
		&mut self,
		base: &str,
		scope: Scope,
		filter: &str,
		_attributes: &[&str],
	) -> Result<Vec<SearchEntry>, TransportError> {
		self.with(|state| {
			if state.down {
				return Err(down());
			}
			if base.is_empty() {
				if state.root_dse_requires_auth && state.bound.is_none() {
					return Ok(Vec::new());
				}
				return Ok(state.root_dse.clone().into_iter().collect());
			}
			if base == SCHEMA_DN {
				if state.schema_requires_auth && state.bound.is_none() {
					return Ok(Vec::new());
				}
				let classes: Vec<&str> = state.object_classes.iter().map(String::as_str).collect();
				return Ok(vec![entry(SCHEMA_DN, &[("objectClasses", &classes)])]);
			}
			Ok(state
				.directory
				.values()
				.filter(|entry| in_scope(&entry.dn, base, scope) && matches(entry, filter))
				.cloned()
				.collect())
		})
	}

	fn search(&mut self, request: &SearchRequest) -> Result<MessageId, TransportError> {
		let log = format!("search {} {}", request.base, request.filter);
		self.issue(log, |state| {
			if matches!(request.scope, Scope::Base) && !state.directory.contains_key(&request.base) {
				return vec![ResultKind::SearchDone(ldap_result(32))];
			}
			let found: Vec<_> = state
				.directory
				.values()
				.filter(|entry| in_scope(&entry.dn, &request.base, request.scope))
				.cloned()
				.collect();
			let limit = usize::try_from(request.size_limit).unwrap();
			let truncated = limit > 0 && found.len() > limit;
			let mut messages: Vec<_> = found
				.into_iter()
				.take(if truncated { limit } else { usize::MAX })
				.map(ResultKind::SearchEntry)
				.collect();
			messages.push(ResultKind::SearchDone(ldap_result(if truncated { 4 } else { 0 })));
			messages
		})
	}

	fn add(&mut self, dn: &str, attributes: &[AttributeOp]) -> Result<MessageId, TransportError> {
		self.issue(format!("add {dn}"), |state| {
			if state.directory.contains_key(dn) {
				return vec![ResultKind::Add(ldap_result(68))];
			}
			let mut new = entry(dn, &[]);
			for op in attributes {
				apply(&mut new, op);
			}
			state.directory.insert(dn.to_owned(), new);
			vec![ResultKind::Add(ldap_result(0))]
		})
	}

	fn modify(&mut self, dn: &str, ops: &[AttributeOp]) -> Result<MessageId, TransportError> {
		let summary: Vec<_> = ops.iter().map(|op| format!("{:?} {}", op.op, op.attribute)).collect();
		self.issue(format!("modify {dn} [{}]", summary.join(", ")), |state| {
			let Some(existing) = state.directory.get_mut(dn) else {
				return vec![ResultKind::Modify(ldap_result(32))];
			};
			for op in ops {
				apply(existing, op);
			}
			vec![ResultKind::Modify(ldap_result(0))]
		})
	}

	fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<MessageId, TransportError> {
		self.issue(format!("rename {dn} {new_rdn}"), |state| {
			let new_dn = dn::with_rdn(dn, new_rdn);
			if state.directory.contains_key(&new_dn) {
				return vec![ResultKind::Rename(ldap_result(68))];
			}
			let Some(mut moved) = state.directory.remove(dn) else {
				return vec![ResultKind::Rename(ldap_result(32))];
			};
			let (attribute, value) = new_rdn.split_once('=').unwrap();
			moved.attrs.insert(attribute.to_owned(), vec![value.to_owned()]);
			moved.dn = new_dn.clone();
			state.directory.insert(new_dn, moved);
			vec![ResultKind::Rename(ldap_result(0))]
		})
	}

	fn delete(&mut self, dn: &str) -> Result<MessageId, TransportError> {
		self.issue(format!("delete {dn}"), |state| {
			let rc = if state.directory.remove(dn).is_some() { 0 } else { 32 };
			vec![ResultKind::Delete(ldap_result(rc))]
		})
	}

	fn abandon(&mut self, id: MessageId) -> Result<(), TransportError> {
		self.with(|state| {
			state.abandoned.push(id);
			state.queue.retain(|message| !matches!(message, Ok(message) if message.id == id));
			state.held.retain(|(held, _)| *held != id);
		});
		Ok(())
	}

	async fn poll_result(&mut self, _timeout: Duration) -> Result<Option<Message>, TransportError> {
		self.with(|state| state.queue.pop_front().transpose())
	}
}

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?;
	Ok(ldap)
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("ou={},dc=example,dc=org", ou),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

/// Delete an organizational unit and everything below it
pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	let base = format!("ou={},dc=example,dc=org", ou);
	let (children, _) =
		ldap.search(&base, Scope::OneLevel, "(objectClass=*)", vec!["1.1"]).await?.success()?;
	for child in children {
		ldap.delete(&SearchEntry::construct(child).dn).await?.success()?;
	}
	ldap.delete(&base).await?.success()?;
	Ok(())
}

pub async fn ldap_add_contact(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	sn: &str,
	mail: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("cn={},{}", cn, BASE_DN),
		vec![
			("objectClass", ["inetOrgPerson"].into()),
			("sn", [sn].into()),
			("mail", [mail].into()),
		],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_search_contact(
	ldap: &mut ldap3::Ldap,
	cn: &str,
) -> Result<Option<SearchEntry>, Box<dyn Error>> {
	let result = ldap
		.search(&format!("cn={},{}", cn, BASE_DN), Scope::Base, "(objectClass=*)", vec!["*"])
		.await?;
	if result.1.rc == 32 {
		return Ok(None);
	}
	let (entries, _) = result.success()?;
	Ok(entries.into_iter().next().map(SearchEntry::construct))
}

//! Error codes and the status taxonomy delivered to callers.
use std::fmt;

use ldap3::{LdapError, LdapResult};

use crate::{filter::CompileError, query::QueryError};

/// LDAP result code for a server that went away mid-operation. Not a protocol
/// value, but the code the C client libraries synthesize for it.
pub(crate) const RC_SERVER_DOWN: u32 = 81;
/// Catch-all LDAP result code used for locally synthesized failures.
pub(crate) const RC_OTHER: u32 = 80;

/// The terminal status of a logical request, as delivered to the consumer.
///
/// Every request resolves to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
	/// The request completed.
	Success,
	/// The entry does not exist, or the DN was malformed.
	NotFound,
	/// The bound identity may not perform the request.
	PermissionDenied,
	/// The server could not be reached, even after reconnecting.
	Unavailable,
	/// An entry with the same DN already exists.
	AlreadyExists,
	/// The search expression could not be turned into a filter.
	InvalidQuery,
	/// A search hit the size limit; entries up to the limit were delivered.
	SizeLimitExceeded,
	/// A search hit the time limit; entries found so far were delivered.
	TimeLimitExceeded,
	/// Anything else, including unexpected results and internal logic errors.
	OtherError,
}

impl Status {
	/// Map an LDAP result code to a status.
	#[must_use]
	pub fn from_rc(rc: u32) -> Self {
		match rc {
			0 => Status::Success,
			3 => Status::TimeLimitExceeded,
			4 => Status::SizeLimitExceeded,
			// noSuchAttribute, noSuchObject, invalidDNSyntax
			16 | 32 | 34 => Status::NotFound,
			// strongerAuthRequired, inappropriateAuthentication,
			// invalidCredentials, insufficientAccessRights
			8 | 48 | 49 | 50 => Status::PermissionDenied,
			// busy, unavailable, and the client-side server down/connect errors
			51 | 52 | RC_SERVER_DOWN | 91 => Status::Unavailable,
			68 => Status::AlreadyExists,
			_ => Status::OtherError,
		}
	}

	/// Whether the status represents a successful outcome.
	#[must_use]
	pub fn is_success(self) -> bool {
		self == Status::Success
	}
}

impl From<&LdapResult> for Status {
	fn from(result: &LdapResult) -> Self {
		Status::from_rc(result.rc)
	}
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let text = match self {
			Status::Success => "success",
			Status::NotFound => "not found",
			Status::PermissionDenied => "permission denied",
			Status::Unavailable => "server unavailable",
			Status::AlreadyExists => "already exists",
			Status::InvalidQuery => "invalid query",
			Status::SizeLimitExceeded => "size limit exceeded",
			Status::TimeLimitExceeded => "time limit exceeded",
			Status::OtherError => "other error",
		};
		f.write_str(text)
	}
}

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	/// The server is unreachable. This is the only failure that triggers a
	/// reconnect.
	#[error("Server unreachable: {0}")]
	ServerDown(String),
	/// The server answered with a non-success result code.
	#[error("Server returned result code {rc}: {text}")]
	Rejected {
		/// LDAP result code
		rc: u32,
		/// Diagnostic message sent by the server
		text: String,
	},
	/// TLS could not be negotiated.
	#[error("TLS negotiation failed: {0}")]
	Tls(String),
	/// The transport was used incorrectly or failed in an unexpected way.
	#[error("Transport failure: {0}")]
	Other(String),
}

impl TransportError {
	/// Whether the failure means the server went away.
	#[must_use]
	pub fn is_server_down(&self) -> bool {
		matches!(self, TransportError::ServerDown(_))
	}

	/// The status a caller should see for this failure.
	#[must_use]
	pub fn status(&self) -> Status {
		match self {
			TransportError::ServerDown(_) | TransportError::Tls(_) => Status::Unavailable,
			TransportError::Rejected { rc, .. } => Status::from_rc(*rc),
			TransportError::Other(_) => Status::OtherError,
		}
	}
}

impl From<LdapError> for TransportError {
	fn from(err: LdapError) -> Self {
		match err {
			LdapError::LdapResult { result } => {
				TransportError::Rejected { rc: result.rc, text: result.text }
			}
			LdapError::Io { .. }
			| LdapError::EndOfStream
			| LdapError::OpSend { .. }
			| LdapError::ResultRecv { .. }
			| LdapError::Timeout { .. } => TransportError::ServerDown(err.to_string()),
			other => TransportError::Other(other.to_string()),
		}
	}
}

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The TLS policy demands encryption that could not be established.
	#[error("TLS required but unavailable: {0}")]
	TlsRequired(String),
	/// The server refused the request.
	#[error("Request refused: {0}")]
	Refused(Status),
	/// The requested operation is not supported by this backend.
	#[error("Unsupported: {0}")]
	Unsupported(String),
	/// Configuration or input data was malformed.
	#[error("Invalid: {0}")]
	Invalid(String),
	/// The underlying transport failed.
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Reading TLS material from disk failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// A query string could not be parsed.
	#[error(transparent)]
	Query(#[from] QueryError),
	/// A query could not be compiled to a filter.
	#[error(transparent)]
	Compile(#[from] CompileError),
}

impl Error {
	/// The status a caller should see for this error.
	#[must_use]
	pub fn status(&self) -> Status {
		match self {
			Error::TlsRequired(_) => Status::Unavailable,
			Error::Refused(status) => *status,
			Error::Transport(err) => err.status(),
			Error::Query(_) | Error::Compile(_) => Status::InvalidQuery,
			Error::Unsupported(_) | Error::Invalid(_) | Error::Io(_) => Status::OtherError,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{Error, Status, TransportError};

	#[test]
	fn result_codes() {
		assert_eq!(Status::from_rc(0), Status::Success);
		assert_eq!(Status::from_rc(32), Status::NotFound);
		assert_eq!(Status::from_rc(34), Status::NotFound);
		assert_eq!(Status::from_rc(50), Status::PermissionDenied);
		assert_eq!(Status::from_rc(49), Status::PermissionDenied);
		assert_eq!(Status::from_rc(52), Status::Unavailable);
		assert_eq!(Status::from_rc(81), Status::Unavailable);
		assert_eq!(Status::from_rc(68), Status::AlreadyExists);
		assert_eq!(Status::from_rc(4), Status::SizeLimitExceeded);
		assert_eq!(Status::from_rc(65), Status::OtherError, "objectClassViolation is not special");
	}

	#[test]
	fn only_server_down_reconnects() {
		assert!(TransportError::ServerDown("gone".to_owned()).is_server_down());
		assert!(!TransportError::Rejected { rc: 52, text: String::new() }.is_server_down());
		assert_eq!(
			TransportError::Rejected { rc: 52, text: String::new() }.status(),
			Status::Unavailable
		);
		assert_eq!(TransportError::Other("bad".to_owned()).status(), Status::OtherError);
	}

	#[test]
	fn error_status() {
		assert_eq!(Error::Refused(Status::PermissionDenied).status(), Status::PermissionDenied);
		assert_eq!(Error::TlsRequired("no".to_owned()).status(), Status::Unavailable);
		assert_eq!(
			Error::Transport(TransportError::ServerDown("x".to_owned())).status(),
			Status::Unavailable
		);
	}
}

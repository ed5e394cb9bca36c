//! Distinguished name handling (RFC 4514).
use crate::{
	catalog,
	contact::{Contact, Field},
};

/// Escape an attribute value for use in an RDN.
///
/// `, + " \ < > ;` and `=` are backslash-escaped, NUL is hex-escaped, and a
/// leading `#` or space and a trailing space are hex-escaped.
#[must_use]
pub fn escape_value(value: &str) -> String {
	let mut escaped = String::with_capacity(value.len() * 2);
	let last = value.chars().count().saturating_sub(1);

	for (i, ch) in value.chars().enumerate() {
		match ch {
			',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
				escaped.push('\\');
				escaped.push(ch);
			}
			'\0' => escaped.push_str("\\00"),
			' ' if i == 0 || i == last => escaped.push_str("\\20"),
			'#' if i == 0 => escaped.push_str("\\23"),
			ch => escaped.push(ch),
		}
	}
	escaped
}

/// Split a DN into its first RDN and the parent DN, honouring escapes.
#[must_use]
pub fn split_first(dn: &str) -> (&str, Option<&str>) {
	let mut escaped = false;
	for (i, ch) in dn.char_indices() {
		match ch {
			_ if escaped => escaped = false,
			'\\' => escaped = true,
			',' => return (&dn[..i], Some(dn[i + 1..].trim_start())),
			_ => {}
		}
	}
	(dn, None)
}

/// The attribute type naming an entry, e.g. `cn` for `cn=Jane,dc=example`
#[must_use]
pub fn rdn_attribute(dn: &str) -> &str {
	let (rdn, _) = split_first(dn);
	rdn.split_once('=').map_or(rdn, |(attribute, _)| attribute.trim())
}

/// The RDN a contact should be named by, if it has a name
#[must_use]
pub fn contact_rdn(contact: &Contact) -> Option<String> {
	let descriptor = catalog::attribute_for(Field::FullName)?;
	let name = contact.text(Field::FullName).filter(|name| !name.is_empty())?;
	Some(format!("{}={}", descriptor.attribute, escape_value(name)))
}

/// The DN for a new contact below `base`
#[must_use]
pub fn contact_dn(contact: &Contact, base: &str) -> Option<String> {
	contact_rdn(contact).map(|rdn| format!("{rdn},{base}"))
}

/// `dn` with its first RDN replaced
#[must_use]
pub fn with_rdn(dn: &str, rdn: &str) -> String {
	match split_first(dn) {
		(_, Some(parent)) => format!("{rdn},{parent}"),
		(_, None) => rdn.to_owned(),
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{contact_dn, escape_value, rdn_attribute, split_first, with_rdn};
	use crate::contact::{Contact, Field};

	#[test]
	fn escape_simple() {
		assert_eq!(escape_value("John Doe"), "John Doe");
		assert_eq!(escape_value(""), "");
	}

	#[test]
	fn escape_special_chars() {
		assert_eq!(escape_value("a,b"), "a\\,b");
		assert_eq!(escape_value("a+b"), "a\\+b");
		assert_eq!(escape_value("a\"b"), "a\\\"b");
		assert_eq!(escape_value("a\\b"), "a\\\\b");
		assert_eq!(escape_value("a<b>"), "a\\<b\\>");
		assert_eq!(escape_value("a;b=c"), "a\\;b\\=c");
		assert_eq!(escape_value("a\0b"), "a\\00b");
	}

	#[test]
	fn escape_leading_and_trailing() {
		assert_eq!(escape_value(" admin "), "\\20admin\\20");
		assert_eq!(escape_value("#admin"), "\\23admin");
		assert_eq!(escape_value("admin#1"), "admin#1");
		// position is counted in characters, not bytes
		assert_eq!(escape_value("Zoë "), "Zoë\\20");
	}

	#[test]
	fn escape_injection() {
		assert_eq!(escape_value("Doe, John,dc=evil"), "Doe\\, John\\,dc\\=evil");
	}

	#[test]
	fn splitting() {
		assert_eq!(
			split_first("cn=Doe\\, John,ou=contacts,dc=example"),
			("cn=Doe\\, John", Some("ou=contacts,dc=example"))
		);
		assert_eq!(split_first("dc=org"), ("dc=org", None));
		assert_eq!(rdn_attribute("uid=jdoe,dc=example"), "uid");
		assert_eq!(rdn_attribute("CN = x"), "CN");
	}

	#[test]
	fn naming() {
		let mut contact = Contact::new();
		assert_eq!(contact_dn(&contact, "dc=example"), None);
		contact.set_text(Field::FullName, "Doe, John");
		assert_eq!(contact_dn(&contact, "dc=example").unwrap(), "cn=Doe\\, John,dc=example");
		assert_eq!(
			with_rdn("cn=Old,ou=contacts,dc=example", "cn=New"),
			"cn=New,ou=contacts,dc=example"
		);
	}
}

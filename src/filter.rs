//! Compiles search expressions into RFC 2254 filter strings.
use std::fmt;

use crate::{
	catalog::{self, FieldDescriptor, FieldKind, SchemaExtension},
	connection::ServerCapabilities,
	contact::Field,
	query::Query,
};

/// Pseudo field name matching any cataloged attribute
pub const ANY_FIELD: &str = "x-any-field";

/// A filter that cannot match any entry, used for unknown fields
const NEVER_MATCH: &str = "(!(objectClass=*))";

/// An escaped, ready to send LDAP filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter(String);

impl SearchFilter {
	/// Wrap an already escaped filter string.
	#[must_use]
	pub fn new(filter: impl Into<String>) -> Self {
		Self(filter.into())
	}

	/// The filter text
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Restrict the filter to entries of an object class
	#[must_use]
	pub fn restricted_to(&self, object_class: &str) -> Self {
		Self(format!("(&(objectClass={object_class}){})", self.0))
	}
}

impl fmt::Display for SearchFilter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Reasons a query cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
	/// No part of the expression refers to a known field.
	#[error("Query does not refer to any known field")]
	Unresolvable,
}

/// Escape a value for use in a filter assertion (RFC 2254 section 4).
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
	let mut escaped = String::with_capacity(value.len());
	for ch in value.chars() {
		match ch {
			'*' => escaped.push_str("\\2a"),
			'(' => escaped.push_str("\\28"),
			')' => escaped.push_str("\\29"),
			'\\' => escaped.push_str("\\5c"),
			'\0' => escaped.push_str("\\00"),
			ch => escaped.push(ch),
		}
	}
	escaped
}

/// Where substring text goes in an assertion
#[derive(Debug, Clone, Copy)]
enum Substring {
	/// `*text*`
	Any,
	/// `text*`
	Initial,
	/// `*text`
	Final,
}

/// Boolean combinators
#[derive(Debug, Clone, Copy)]
enum Combinator {
	/// `(&...)`
	And,
	/// `(|...)`
	Or,
	/// `(!...)`
	Not,
}

/// Pending work on the evaluation stack
enum Frame<'q> {
	/// Compile an expression, pushing its fragment
	Visit(&'q Query),
	/// Pop this many fragments and combine them
	Combine(Combinator, usize),
}

/// A compiled sub-expression
#[derive(Debug)]
struct Fragment {
	/// Filter text
	filter: String,
	/// Whether any known field contributed to it
	resolved: bool,
}

impl Fragment {
	/// A fragment for a known field
	fn resolved(filter: String) -> Self {
		Self { filter, resolved: true }
	}

	/// A fragment for an unknown field
	fn unresolved() -> Self {
		Self { filter: NEVER_MATCH.to_owned(), resolved: false }
	}
}

/// Compiles [`Query`] trees against the field catalog.
#[derive(Debug, Clone, Copy)]
pub struct QueryCompiler {
	/// Whether the server knows the `evolutionPerson` attributes
	person_schema: bool,
}

impl QueryCompiler {
	/// A compiler for a server with the given capabilities
	#[must_use]
	pub fn new(capabilities: &ServerCapabilities) -> Self {
		Self { person_schema: capabilities.supports(SchemaExtension::Person) }
	}

	/// Compile a query.
	///
	/// Unknown fields compile to a filter that never matches. Only a query in
	/// which no field at all is known fails.
	pub fn compile(&self, query: &Query) -> Result<SearchFilter, CompileError> {
		let mut work = vec![Frame::Visit(query)];
		let mut fragments: Vec<Fragment> = Vec::new();

		while let Some(frame) = work.pop() {
			match frame {
				Frame::Visit(Query::And(children)) => {
					push_children(&mut work, Combinator::And, children);
				}
				Frame::Visit(Query::Or(children)) => {
					push_children(&mut work, Combinator::Or, children);
				}
				Frame::Visit(Query::Not(child)) => {
					work.push(Frame::Combine(Combinator::Not, 1));
					work.push(Frame::Visit(child));
				}
				Frame::Visit(Query::Contains(field, text)) => {
					fragments.push(self.substring(field, text, Substring::Any));
				}
				Frame::Visit(Query::BeginsWith(field, text)) => {
					fragments.push(self.begins_with(field, text));
				}
				Frame::Visit(Query::EndsWith(field, text)) => {
					fragments.push(self.substring(field, text, Substring::Final));
				}
				Frame::Visit(Query::Is(field, text)) => fragments.push(self.is(field, text)),
				Frame::Visit(Query::Exists(field)) => fragments.push(self.exists(field)),
				Frame::Combine(combinator, count) => {
					let children = fragments.split_off(fragments.len().saturating_sub(count));
					fragments.push(combine(combinator, children));
				}
			}
		}

		match fragments.pop() {
			Some(fragment) if fragment.resolved => Ok(SearchFilter(fragment.filter)),
			_ => Err(CompileError::Unresolvable),
		}
	}

	/// `contains` and `endswith`
	fn substring(&self, field: &str, text: &str, position: Substring) -> Fragment {
		if field == ANY_FIELD {
			let alternatives: Vec<_> = catalog::descriptors()
				.iter()
				.filter(|descriptor| descriptor.kind != FieldKind::Binary)
				.map(|descriptor| substring_assertion(descriptor.attribute, text, position))
				.collect();
			return Fragment::resolved(any_of(alternatives));
		}
		match catalog::by_name(field) {
			Some(descriptor) => {
				Fragment::resolved(substring_assertion(descriptor.attribute, text, position))
			}
			None => Fragment::unresolved(),
		}
	}

	/// `beginswith`, which has special cases for the name fields
	fn begins_with(&self, field: &str, text: &str) -> Fragment {
		let Some(descriptor) = catalog::by_name(field) else {
			return self.substring(field, text, Substring::Initial);
		};
		let attr = |field| attribute(field, descriptor);
		match descriptor.field {
			Field::FullName => Fragment::resolved(any_of(vec![
				substring_assertion(attr(Field::FullName), text, Substring::Initial),
				substring_assertion(attr(Field::FamilyName), text, Substring::Initial),
			])),
			// Undefined attribute types never match, not even negated
			Field::FileAs if !self.person_schema => Fragment::resolved(substring_assertion(
				attr(Field::FamilyName),
				text,
				Substring::Initial,
			)),
			Field::FileAs => {
				// Entries without the extension attribute sort by surname
				let file_as = attr(Field::FileAs);
				Fragment::resolved(any_of(vec![
					substring_assertion(file_as, text, Substring::Initial),
					format!(
						"(&(!({file_as}=*)){})",
						substring_assertion(attr(Field::FamilyName), text, Substring::Initial)
					),
				]))
			}
			_ => Fragment::resolved(substring_assertion(descriptor.attribute, text, Substring::Initial)),
		}
	}

	/// `is`
	fn is(&self, field: &str, text: &str) -> Fragment {
		match catalog::by_name(field) {
			Some(descriptor) => Fragment::resolved(format!(
				"({}={})",
				descriptor.attribute,
				escape_filter_value(text)
			)),
			None if field == ANY_FIELD => self.substring(field, text, Substring::Any),
			None => Fragment::unresolved(),
		}
	}

	/// `exists`
	fn exists(&self, field: &str) -> Fragment {
		if field == ANY_FIELD {
			return Fragment::resolved(any_of(
				catalog::descriptors().iter().map(|descriptor| presence(descriptor.attribute)).collect(),
			));
		}
		match catalog::by_name(field) {
			Some(descriptor) => Fragment::resolved(presence(descriptor.attribute)),
			None => Fragment::unresolved(),
		}
	}
}

/// Schedule children for evaluation followed by their combination
fn push_children<'q>(work: &mut Vec<Frame<'q>>, combinator: Combinator, children: &'q [Query]) {
	work.push(Frame::Combine(combinator, children.len()));
	work.extend(children.iter().rev().map(Frame::Visit));
}

/// Combine compiled children
fn combine(combinator: Combinator, children: Vec<Fragment>) -> Fragment {
	match combinator {
		Combinator::Not => match children.into_iter().next() {
			Some(child) if child.resolved => Fragment::resolved(format!("(!{})", child.filter)),
			_ => Fragment::unresolved(),
		},
		Combinator::And => {
			if !children.iter().any(|child| child.resolved) {
				return Fragment::unresolved();
			}
			let filters = children.into_iter().map(|child| child.filter).collect();
			Fragment::resolved(wrap('&', filters))
		}
		Combinator::Or => {
			// Unknown alternatives can't match anyway
			let filters: Vec<_> = children
				.into_iter()
				.filter(|child| child.resolved)
				.map(|child| child.filter)
				.collect();
			if filters.is_empty() {
				return Fragment::unresolved();
			}
			Fragment::resolved(any_of(filters))
		}
	}
}

/// The attribute of a field, falling back to the given descriptor's
fn attribute(field: Field, fallback: &'static FieldDescriptor) -> &'static str {
	catalog::attribute_for(field).map_or(fallback.attribute, |descriptor| descriptor.attribute)
}

/// `(|...)` unless there is only one alternative
fn any_of(filters: Vec<String>) -> String {
	wrap('|', filters)
}

/// Wrap filters in a combinator, leaving single filters bare
fn wrap(operator: char, mut filters: Vec<String>) -> String {
	if filters.len() == 1 {
		return filters.remove(0);
	}
	format!("({operator}{})", filters.concat())
}

/// `(attr=*)`
fn presence(attribute: &str) -> String {
	format!("({attribute}=*)")
}

/// A substring assertion. Empty text asserts presence.
fn substring_assertion(attribute: &str, text: &str, position: Substring) -> String {
	if text.is_empty() {
		return presence(attribute);
	}
	let text = escape_filter_value(text);
	match position {
		Substring::Any => format!("({attribute}=*{text}*)"),
		Substring::Initial => format!("({attribute}={text}*)"),
		Substring::Final => format!("({attribute}=*{text})"),
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use proptest::prelude::*;

	use super::{escape_filter_value, CompileError, QueryCompiler, ANY_FIELD};
	use crate::{catalog, connection::ServerCapabilities, query::Query};

	/// Reverse [`escape_filter_value`]
	fn unescape(value: &str) -> String {
		let mut bytes = Vec::new();
		let mut rest = value.as_bytes();
		while let Some((&first, tail)) = rest.split_first() {
			if first == b'\\' && tail.len() >= 2 {
				let hex = std::str::from_utf8(&tail[..2]).unwrap();
				bytes.push(u8::from_str_radix(hex, 16).unwrap());
				rest = &tail[2..];
			} else {
				bytes.push(first);
				rest = tail;
			}
		}
		String::from_utf8(bytes).unwrap()
	}

	fn compiler(person_schema: bool) -> QueryCompiler {
		let mut capabilities = ServerCapabilities::default();
		capabilities.person_schema = person_schema;
		QueryCompiler::new(&capabilities)
	}

	fn compile(query: &str) -> Result<String, CompileError> {
		compiler(true).compile(&Query::parse(query).unwrap()).map(|f| f.as_str().to_owned())
	}

	#[test]
	fn escaping() {
		assert_eq!(escape_filter_value("John Doe"), "John Doe");
		assert_eq!(escape_filter_value("John*"), "John\\2a");
		assert_eq!(escape_filter_value("(admin)"), "\\28admin\\29");
		assert_eq!(escape_filter_value("a\\b"), "a\\5cb");
		assert_eq!(escape_filter_value("a\0b"), "a\\00b");
	}

	proptest! {
		#[test]
		fn escaping_round_trips(value in "[a-z*()\\\\\\x00 ]{0,24}") {
			let escaped = escape_filter_value(&value);
			prop_assert!(!escaped.contains(['*', '(', ')', '\0']));
			prop_assert_eq!(unescape(&escaped), value);
		}
	}

	#[test]
	fn contains_without_reserved_characters() {
		assert_eq!(compile(r#"(contains "full_name" "o'")"#), Ok("(cn=*o'*)".to_owned()));
	}

	#[test]
	fn contains_escapes() {
		assert_eq!(compile(r#"(contains "email" "a*b")"#), Ok("(mail=*a\\2ab*)".to_owned()));
	}

	#[test]
	fn empty_contains_is_presence() {
		assert_eq!(compile(r#"(contains "email" "")"#), Ok("(mail=*)".to_owned()));
		assert_eq!(compile(r#"(endswith "email" "")"#), Ok("(mail=*)".to_owned()));
	}

	#[test]
	fn leaves() {
		assert_eq!(compile(r#"(is "org" "ACME")"#), Ok("(o=ACME)".to_owned()));
		assert_eq!(compile(r#"(endswith "email" ".org")"#), Ok("(mail=*.org)".to_owned()));
		assert_eq!(compile(r#"(beginswith "title" "Dr")"#), Ok("(title=Dr*)".to_owned()));
		assert_eq!(compile(r#"(exists "note")"#), Ok("(note=*)".to_owned()));
	}

	#[test]
	fn combinators() {
		assert_eq!(
			compile(r#"(and (is "org" "A") (or (exists "email") (not (exists "mobile_phone"))))"#),
			Ok("(&(o=A)(|(mail=*)(!(mobile=*))))".to_owned())
		);
		assert_eq!(compile(r#"(and (is "org" "A"))"#), Ok("(o=A)".to_owned()));
	}

	#[test]
	fn exists_any_field_enumerates_catalog() {
		let expected: String = catalog::descriptors()
			.iter()
			.map(|descriptor| format!("({}=*)", descriptor.attribute))
			.collect();
		assert_eq!(
			compiler(true).compile(&Query::exists(ANY_FIELD)).unwrap().as_str(),
			format!("(|{expected})")
		);
		assert!(compile(r#"(exists "x-any-field")"#).unwrap().starts_with("(|(cn=*)(sn=*)(givenName=*)"));
	}

	#[test]
	fn contains_any_field_skips_binary() {
		let filter = compile(r#"(contains "x-any-field" "bob")"#).unwrap();
		assert!(filter.starts_with("(|(cn=*bob*)(sn=*bob*)"));
		assert!(!filter.contains("jpegPhoto"));
	}

	#[test]
	fn begins_with_full_name_checks_surname() {
		assert_eq!(
			compile(r#"(beginswith "full_name" "Sm")"#),
			Ok("(|(cn=Sm*)(sn=Sm*))".to_owned())
		);
	}

	#[test]
	fn begins_with_file_as_fallback() {
		let query = Query::begins_with("file_as", "Sm");
		assert_eq!(
			compiler(true).compile(&query).unwrap().as_str(),
			"(|(fileAs=Sm*)(&(!(fileAs=*))(sn=Sm*)))"
		);
		assert_eq!(compiler(false).compile(&query).unwrap().as_str(), "(sn=Sm*)");
	}

	#[test]
	fn unknown_fields() {
		assert_eq!(compile(r#"(contains "bogus" "x")"#), Err(CompileError::Unresolvable));
		assert_eq!(compile(r#"(not (exists "bogus"))"#), Err(CompileError::Unresolvable));
		assert_eq!(
			compile(r#"(or (contains "bogus" "x") (is "org" "A"))"#),
			Ok("(o=A)".to_owned())
		);
		assert_eq!(
			compile(r#"(and (contains "bogus" "x") (is "org" "A"))"#),
			Ok("(&(!(objectClass=*))(o=A))".to_owned()),
			"an unknown field inside a conjunction makes it unsatisfiable"
		);
	}
}

//! Computes the attribute operations that turn one contact into another.
use ldap3::SearchEntry;

use crate::{
	catalog::{self, AttributeValues, FieldDescriptor},
	connection::ServerCapabilities,
	contact::Contact,
};

/// Object classes every contact entry is created with
pub const BASE_OBJECT_CLASSES: [&str; 4] = ["top", "person", "organizationalPerson", "inetOrgPerson"];

/// Kind of change applied to an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
	/// Add values to an attribute that had none
	Add,
	/// Replace all values
	Replace,
	/// Remove the attribute
	Delete,
}

/// A single change to one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeOp {
	/// LDAP attribute name
	pub attribute: String,
	/// What to do with it
	pub op: ModOp,
	/// New values. Empty for [`ModOp::Delete`], which removes all values.
	pub values: AttributeValues,
}

impl AttributeOp {
	/// Add `values` to `attribute`
	#[must_use]
	pub fn add(attribute: impl Into<String>, values: AttributeValues) -> Self {
		Self { attribute: attribute.into(), op: ModOp::Add, values }
	}

	/// Replace the values of `attribute`
	#[must_use]
	pub fn replace(attribute: impl Into<String>, values: AttributeValues) -> Self {
		Self { attribute: attribute.into(), op: ModOp::Replace, values }
	}

	/// Delete `attribute` entirely
	#[must_use]
	pub fn delete(attribute: impl Into<String>) -> Self {
		Self {
			attribute: attribute.into(),
			op: ModOp::Delete,
			values: AttributeValues::Text(Vec::new()),
		}
	}
}

/// The result of comparing an entry with a desired contact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
	/// Changes in catalog order
	pub ops: Vec<AttributeOp>,
	/// Whether the attribute naming the entry is among the changes
	pub naming_changed: bool,
}

impl Diff {
	/// Whether nothing needs to be written
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}
}

/// Compare `current` (or nothing, when creating) with `desired`.
///
/// Attributes of unsupported schema extensions are never touched. Write-only
/// attributes are only sent on creation since they can't be read back.
#[must_use]
pub fn diff(
	current: Option<&SearchEntry>,
	desired: &Contact,
	capabilities: &ServerCapabilities,
) -> Diff {
	let current = current.map(Contact::from_entry);
	let mut diff = Diff::default();

	for descriptor in catalog::descriptors() {
		if !is_supported(descriptor, capabilities) {
			continue;
		}
		if current.is_some() && descriptor.is_write_only() {
			continue;
		}

		let before = current.as_ref().and_then(|contact| encoded(descriptor, contact));
		let after = encoded(descriptor, desired);
		let op = match (before, after) {
			(None, Some(after)) => AttributeOp::add(descriptor.attribute, after),
			(Some(_), None) => AttributeOp::delete(descriptor.attribute),
			(Some(before), Some(after)) if !descriptor.same(&before, &after) => {
				AttributeOp::replace(descriptor.attribute, after)
			}
			_ => continue,
		};
		diff.naming_changed |= descriptor.is_naming();
		diff.ops.push(op);
	}
	diff
}

/// The object classes a new entry needs on a server with `capabilities`
#[must_use]
pub fn creation_object_classes(capabilities: &ServerCapabilities) -> Vec<&'static str> {
	let mut classes = BASE_OBJECT_CLASSES.to_vec();
	classes.extend(missing_object_classes(&[], capabilities));
	classes
}

/// Supported auxiliary classes that `existing` lacks. Compared
/// case-insensitively, so applying the result twice adds nothing.
#[must_use]
pub fn missing_object_classes(
	existing: &[String],
	capabilities: &ServerCapabilities,
) -> Vec<&'static str> {
	catalog::SchemaExtension::ALL
		.into_iter()
		.filter(|extension| capabilities.supports(*extension))
		.map(catalog::SchemaExtension::object_class)
		.filter(|class| !existing.iter().any(|have| have.eq_ignore_ascii_case(class)))
		.collect()
}

/// The operation adding `missing` object classes, if there are any
#[must_use]
pub fn object_class_op(missing: &[&str]) -> Option<AttributeOp> {
	(!missing.is_empty()).then(|| {
		AttributeOp::add(
			"objectClass",
			AttributeValues::Text(missing.iter().map(|class| (*class).to_owned()).collect()),
		)
	})
}

/// Whether the server can store the attribute
fn is_supported(descriptor: &FieldDescriptor, capabilities: &ServerCapabilities) -> bool {
	descriptor.schema.map_or(true, |extension| capabilities.supports(extension))
}

/// The field's encoded values, with empty strings counting as absent
fn encoded(descriptor: &FieldDescriptor, contact: &Contact) -> Option<AttributeValues> {
	let values = match descriptor.encode(contact)? {
		AttributeValues::Text(values) => {
			AttributeValues::Text(values.into_iter().filter(|value| !value.is_empty()).collect())
		}
		binary @ AttributeValues::Binary(_) => binary,
	};
	(!values.is_empty()).then_some(values)
}

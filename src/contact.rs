//! The contact record exchanged with the address book.
use std::{collections::BTreeMap, fmt, str::FromStr};

use ldap3::SearchEntry;
use time::Date;

use crate::catalog;

/// Declares [`Field`] together with its textual names.
macro_rules! fields {
	($($(#[$doc:meta])* $variant:ident => $name:literal,)*) => {
		/// Abstract contact field identifiers.
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
		pub enum Field {
			$($(#[$doc])* $variant,)*
		}

		impl Field {
			/// Every field, in declaration order.
			pub const ALL: &'static [Field] = &[$(Field::$variant,)*];

			/// The name used for this field in search expressions.
			#[must_use]
			pub fn name(self) -> &'static str {
				match self {
					$(Field::$variant => $name,)*
				}
			}
		}
	};
}

fields! {
	/// Formatted name, also used to name the entry
	FullName => "full_name",
	/// Surname
	FamilyName => "family_name",
	/// Given name
	GivenName => "given_name",
	/// Nickname
	Nickname => "nickname",
	/// The name the contact is sorted under
	FileAs => "file_as",
	/// E-mail addresses
	Email => "email",
	/// Business phone numbers
	BusinessPhone => "business_phone",
	/// Home phone numbers
	HomePhone => "home_phone",
	/// Mobile phone
	MobilePhone => "mobile_phone",
	/// Car phone
	CarPhone => "car_phone",
	/// Primary phone
	PrimaryPhone => "primary_phone",
	/// Business fax
	BusinessFax => "business_fax",
	/// Home fax
	HomeFax => "home_fax",
	/// Other phone
	OtherPhone => "other_phone",
	/// Pager
	Pager => "pager",
	/// ISDN number
	Isdn => "isdn",
	/// Telex number
	Telex => "telex",
	/// Radio
	Radio => "radio",
	/// Assistant's phone
	AssistantPhone => "assistant_phone",
	/// Company switchboard
	CompanyPhone => "company_phone",
	/// Organization
	Org => "org",
	/// Organizational unit
	OrgUnit => "org_unit",
	/// Office or room
	Office => "office",
	/// Job title
	Title => "title",
	/// Business role
	Role => "role",
	/// Manager's name
	Manager => "manager",
	/// Assistant's name
	Assistant => "assistant",
	/// Work address, one line per address line
	WorkAddress => "address_label_work",
	/// Home address
	HomeAddress => "address_label_home",
	/// Other address
	OtherAddress => "address_label_other",
	/// Home page
	HomepageUrl => "homepage_url",
	/// Spouse's name
	Spouse => "spouse",
	/// Free-form note
	Note => "note",
	/// Birthday
	Birthday => "birth_date",
	/// Wedding anniversary
	Anniversary => "anniversary",
	/// Categories
	Categories => "categories",
	/// Preferred mail client
	Mailer => "mailer",
	/// Calendar URI
	CalendarUri => "calendar_uri",
	/// Free/busy URL
	FreeBusyUrl => "freebusy_url",
	/// iCalendar URL
	IcsCalendar => "ics_calendar",
	/// JPEG photo
	Photo => "photo",
	/// X.509 certificate, DER encoded
	Certificate => "x509_cert",
	/// Initial password. Only ever written, servers don't hand it back.
	Password => "password",
}

impl fmt::Display for Field {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Returned when parsing an unknown field name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown field {0}")]
pub struct UnknownField(pub String);

impl FromStr for Field {
	type Err = UnknownField;

	fn from_str(name: &str) -> Result<Self, Self::Err> {
		Field::ALL
			.iter()
			.copied()
			.find(|field| field.name() == name)
			.ok_or_else(|| UnknownField(name.to_owned()))
	}
}

/// The value of a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
	/// Free text. Multi-line for addresses.
	Text(String),
	/// A list of values, such as e-mail addresses
	List(Vec<String>),
	/// A calendar date
	Date(Date),
	/// Raw bytes
	Binary(Vec<u8>),
}

/// A contact, optionally tied to the directory entry it was read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
	/// DN of the backing entry, if the contact exists in the directory
	id: Option<String>,
	/// Values of the populated fields
	fields: BTreeMap<Field, FieldValue>,
}

impl Contact {
	/// An empty contact without an id
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Decodes a directory entry into a contact.
	///
	/// Attributes without a catalog entry are ignored, as are values that don't
	/// decode.
	#[must_use]
	pub fn from_entry(entry: &SearchEntry) -> Self {
		let mut contact = Contact { id: Some(entry.dn.clone()), fields: BTreeMap::new() };
		for descriptor in catalog::descriptors() {
			if let Some(value) = descriptor.decode(entry) {
				contact.fields.insert(descriptor.field, value);
			}
		}
		contact
	}

	/// The DN of the backing entry
	#[must_use]
	pub fn id(&self) -> Option<&str> {
		self.id.as_deref()
	}

	/// Ties the contact to an entry
	pub fn set_id(&mut self, id: impl Into<String>) {
		self.id = Some(id.into());
	}

	/// The raw value of a field
	#[must_use]
	pub fn get(&self, field: Field) -> Option<&FieldValue> {
		self.fields.get(&field)
	}

	/// Set a field to an arbitrary value. Empty text and lists clear it.
	pub fn set(&mut self, field: Field, value: FieldValue) {
		let empty = match &value {
			FieldValue::Text(text) => text.is_empty(),
			FieldValue::List(values) => values.is_empty(),
			FieldValue::Binary(bytes) => bytes.is_empty(),
			FieldValue::Date(_) => false,
		};
		if empty {
			self.fields.remove(&field);
		} else {
			self.fields.insert(field, value);
		}
	}

	/// The text of a field, if it holds text
	#[must_use]
	pub fn text(&self, field: Field) -> Option<&str> {
		match self.fields.get(&field) {
			Some(FieldValue::Text(text)) => Some(text.as_str()),
			_ => None,
		}
	}

	/// Set a text field
	pub fn set_text(&mut self, field: Field, text: impl Into<String>) {
		self.set(field, FieldValue::Text(text.into()));
	}

	/// The values of a multi-valued field
	#[must_use]
	pub fn values(&self, field: Field) -> &[String] {
		match self.fields.get(&field) {
			Some(FieldValue::List(values)) => values.as_slice(),
			_ => &[],
		}
	}

	/// Set a multi-valued field. Empty values are dropped.
	pub fn set_values<I, S>(&mut self, field: Field, values: I)
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let values = values.into_iter().map(Into::into).filter(|value| !value.is_empty()).collect();
		self.set(field, FieldValue::List(values));
	}

	/// The date stored in a field
	#[must_use]
	pub fn date(&self, field: Field) -> Option<Date> {
		match self.fields.get(&field) {
			Some(FieldValue::Date(date)) => Some(*date),
			_ => None,
		}
	}

	/// Set a date field
	pub fn set_date(&mut self, field: Field, date: Date) {
		self.set(field, FieldValue::Date(date));
	}

	/// The bytes stored in a binary field
	#[must_use]
	pub fn binary(&self, field: Field) -> Option<&[u8]> {
		match self.fields.get(&field) {
			Some(FieldValue::Binary(bytes)) => Some(bytes.as_slice()),
			_ => None,
		}
	}

	/// Set a binary field
	pub fn set_binary(&mut self, field: Field, bytes: Vec<u8>) {
		self.set(field, FieldValue::Binary(bytes));
	}

	/// Clear a field
	pub fn remove(&mut self, field: Field) -> Option<FieldValue> {
		self.fields.remove(&field)
	}

	/// Iterate over the populated fields in field order
	pub fn fields(&self) -> impl Iterator<Item = (Field, &FieldValue)> {
		self.fields.iter().map(|(field, value)| (*field, value))
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use ldap3::SearchEntry;
	use time::macros::date;

	use super::{Contact, Field, FieldValue};

	#[test]
	fn field_names_round_trip() {
		for field in Field::ALL {
			assert_eq!(field.name().parse::<Field>().unwrap(), *field);
		}
		assert!("x-any-field".parse::<Field>().is_err());
	}

	#[test]
	fn empty_values_clear() {
		let mut contact = Contact::new();
		contact.set_text(Field::Note, "hello");
		assert_eq!(contact.text(Field::Note), Some("hello"));
		contact.set_text(Field::Note, "");
		assert_eq!(contact.get(Field::Note), None);

		contact.set_values(Field::Email, ["", ""]);
		assert_eq!(contact.get(Field::Email), None);
		contact.set_values(Field::Email, ["a@example.org", "", "b@example.org"]);
		assert_eq!(contact.values(Field::Email), ["a@example.org", "b@example.org"]);
	}

	#[test]
	fn from_entry() {
		let entry = SearchEntry {
			dn: "cn=Jane Doe,ou=contacts,dc=example,dc=org".to_owned(),
			attrs: HashMap::from([
				("cn".to_owned(), vec!["Jane Doe".to_owned()]),
				("SN".to_owned(), vec!["Doe".to_owned()]),
				("mail".to_owned(), vec!["jane@example.org".to_owned(), "jd@example.org".to_owned()]),
				("birthDate".to_owned(), vec!["1984-02-29".to_owned()]),
				("postalAddress".to_owned(), vec!["1 Main St$Springfield".to_owned()]),
				("userPassword".to_owned(), vec!["secret".to_owned()]),
				("unrelated".to_owned(), vec!["ignored".to_owned()]),
			]),
			bin_attrs: HashMap::new(),
		};
		let contact = Contact::from_entry(&entry);

		assert_eq!(contact.id(), Some("cn=Jane Doe,ou=contacts,dc=example,dc=org"));
		assert_eq!(contact.text(Field::FullName), Some("Jane Doe"));
		assert_eq!(contact.text(Field::FamilyName), Some("Doe"));
		assert_eq!(contact.values(Field::Email), ["jane@example.org", "jd@example.org"]);
		assert_eq!(contact.date(Field::Birthday), Some(date!(1984 - 02 - 29)));
		assert_eq!(
			contact.get(Field::WorkAddress),
			Some(&FieldValue::Text("1 Main St\nSpringfield".to_owned()))
		);
		assert_eq!(contact.get(Field::Password), None, "write-only fields are never read");
	}
}

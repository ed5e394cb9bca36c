//! Mapping between contact fields and LDAP attributes.
//!
//! The catalog is a static table, built at compile time and never mutated.
//! Its order is significant: it is the order in which creation requests list
//! attributes and in which "any field" searches enumerate them.
use ldap3::SearchEntry;
use time::{format_description::FormatItem, Date};
use tracing::debug;

use crate::{
	contact::{Contact, Field, FieldValue},
	entry::SearchEntryExt,
};

/// Format of date attributes, e.g. `birthDate: 1984-02-29`
pub const DATE_FORMAT: &[FormatItem<'_>] = time::macros::format_description!("[year]-[month]-[day]");

/// Auxiliary schema a field depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaExtension {
	/// The `evolutionPerson` object class
	Person,
	/// The `calEntry` object class from RFC 2739
	Calendar,
}

impl SchemaExtension {
	/// Every extension the backend knows about
	pub const ALL: [SchemaExtension; 2] = [SchemaExtension::Person, SchemaExtension::Calendar];

	/// The auxiliary object class providing the extension's attributes
	#[must_use]
	pub fn object_class(self) -> &'static str {
		match self {
			SchemaExtension::Person => "evolutionPerson",
			SchemaExtension::Calendar => "calEntry",
		}
	}
}

/// Properties of a field beyond its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(u8);

impl FieldFlags {
	/// No flags
	pub const NONE: FieldFlags = FieldFlags(0);
	/// The attribute can be written but is never returned by the server
	pub const WRITE_ONLY: FieldFlags = FieldFlags(1);
	/// The attribute names the entry
	pub const NAMING: FieldFlags = FieldFlags(1 << 1);

	/// Whether all flags in `other` are set
	#[must_use]
	pub const fn contains(self, other: FieldFlags) -> bool {
		self.0 & other.0 == other.0
	}
}

/// How a multi-valued or structured field is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
	/// A list stored in a fixed number of attribute values
	Slots(usize),
	/// A list of any length
	List,
	/// A multi-line address in RFC 4517 `PostalAddress` syntax
	PostalAddress,
	/// A calendar date, see [`DATE_FORMAT`]
	Date,
}

/// Storage kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
	/// A single text value, compared verbatim
	String,
	/// Encoded by a codec and compared semantically
	Complex(Codec),
	/// A single binary value
	Binary,
}

/// Values of one attribute as they go over the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValues {
	/// Textual values
	Text(Vec<String>),
	/// Binary values
	Binary(Vec<Vec<u8>>),
}

impl AttributeValues {
	/// The values as byte strings
	#[must_use]
	pub fn to_bytes(&self) -> Vec<Vec<u8>> {
		match self {
			AttributeValues::Text(values) => values.iter().map(|v| v.as_bytes().to_vec()).collect(),
			AttributeValues::Binary(values) => values.clone(),
		}
	}

	/// Whether there are no values
	#[must_use]
	pub fn is_empty(&self) -> bool {
		match self {
			AttributeValues::Text(values) => values.is_empty(),
			AttributeValues::Binary(values) => values.is_empty(),
		}
	}
}

/// Describes how one contact field maps to one LDAP attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
	/// The contact field
	pub field: Field,
	/// The LDAP attribute name
	pub attribute: &'static str,
	/// How values are stored
	pub kind: FieldKind,
	/// Additional properties
	pub flags: FieldFlags,
	/// The auxiliary schema the attribute belongs to, if any
	pub schema: Option<SchemaExtension>,
}

impl FieldDescriptor {
	/// A plain string field
	const fn string(field: Field, attribute: &'static str) -> Self {
		Self { field, attribute, kind: FieldKind::String, flags: FieldFlags::NONE, schema: None }
	}

	/// A field stored through a codec
	const fn complex(field: Field, attribute: &'static str, codec: Codec) -> Self {
		Self { kind: FieldKind::Complex(codec), ..Self::string(field, attribute) }
	}

	/// A binary field
	const fn binary(field: Field, attribute: &'static str) -> Self {
		Self { kind: FieldKind::Binary, ..Self::string(field, attribute) }
	}

	/// Marks the field as belonging to `evolutionPerson`
	const fn person(self) -> Self {
		Self { schema: Some(SchemaExtension::Person), ..self }
	}

	/// Marks the field as belonging to `calEntry`
	const fn calendar(self) -> Self {
		Self { schema: Some(SchemaExtension::Calendar), ..self }
	}

	/// Sets flags on the field
	const fn flagged(self, flags: FieldFlags) -> Self {
		Self { flags, ..self }
	}

	/// Whether the field is never returned by the server
	#[must_use]
	pub const fn is_write_only(&self) -> bool {
		self.flags.contains(FieldFlags::WRITE_ONLY)
	}

	/// Whether the field names the entry
	#[must_use]
	pub const fn is_naming(&self) -> bool {
		self.flags.contains(FieldFlags::NAMING)
	}

	/// Encode the field of a contact into attribute values. `None` if the
	/// field is absent or encodes to nothing.
	#[must_use]
	pub fn encode(&self, contact: &Contact) -> Option<AttributeValues> {
		let value = contact.get(self.field)?;
		let values = match (self.kind, value) {
			(FieldKind::String, FieldValue::Text(text)) => AttributeValues::Text(vec![text.clone()]),
			(FieldKind::Binary, FieldValue::Binary(bytes)) => {
				AttributeValues::Binary(vec![bytes.clone()])
			}
			(FieldKind::Complex(codec), value) => AttributeValues::Text(codec.encode(value)?),
			(kind, value) => {
				debug!(field = %self.field, ?kind, ?value, "Value does not fit field kind");
				return None;
			}
		};
		(!values.is_empty()).then_some(values)
	}

	/// Decode the attribute from an entry. Write-only attributes never decode.
	#[must_use]
	pub fn decode(&self, entry: &SearchEntry) -> Option<FieldValue> {
		if self.is_write_only() {
			return None;
		}
		let value = match self.kind {
			FieldKind::String => {
				entry.attr_first(self.attribute).map(|text| FieldValue::Text(text.to_owned()))
			}
			FieldKind::Binary => entry
				.bin_attr_values(self.attribute)
				.first()
				.map(|bytes| FieldValue::Binary(bytes.to_vec())),
			FieldKind::Complex(codec) => codec.decode(entry.attr_values(self.attribute)),
		};
		value.filter(|value| !matches!(value, FieldValue::Text(text) if text.is_empty()))
	}

	/// Whether two encoded values are semantically equal
	#[must_use]
	pub fn same(&self, left: &AttributeValues, right: &AttributeValues) -> bool {
		match (self.kind, left, right) {
			(FieldKind::Complex(codec), AttributeValues::Text(left), AttributeValues::Text(right)) => {
				codec.same(left, right)
			}
			_ => left == right,
		}
	}
}

impl Codec {
	/// Encode a field value into attribute values
	fn encode(self, value: &FieldValue) -> Option<Vec<String>> {
		let encoded = match (self, value) {
			(Codec::Slots(slots), FieldValue::List(values)) => {
				values.iter().filter(|v| !v.is_empty()).take(slots).cloned().collect()
			}
			(Codec::List, FieldValue::List(values)) => {
				values.iter().filter(|v| !v.is_empty()).cloned().collect()
			}
			(Codec::Slots(_) | Codec::List, FieldValue::Text(text)) => vec![text.clone()],
			(Codec::PostalAddress, FieldValue::Text(text)) => vec![encode_postal_address(text)],
			(Codec::Date, FieldValue::Date(date)) => vec![date.format(DATE_FORMAT).ok()?],
			_ => return None,
		};
		Some(encoded)
	}

	/// Decode attribute values into a field value
	fn decode(self, values: &[String]) -> Option<FieldValue> {
		let first = values.first();
		match self {
			Codec::Slots(slots) => {
				Some(FieldValue::List(values.iter().take(slots).cloned().collect()))
					.filter(|_| !values.is_empty())
			}
			Codec::List => Some(FieldValue::List(values.to_vec())).filter(|_| !values.is_empty()),
			Codec::PostalAddress => first.map(|value| FieldValue::Text(decode_postal_address(value))),
			Codec::Date => {
				let value = first?;
				match Date::parse(value, DATE_FORMAT) {
					Ok(date) => Some(FieldValue::Date(date)),
					Err(err) => {
						debug!("Ignoring malformed date {value:?}: {err}");
						None
					}
				}
			}
		}
	}

	/// Semantic comparison of encoded values
	fn same(self, left: &[String], right: &[String]) -> bool {
		match self {
			Codec::Slots(_) | Codec::List => {
				let mut left = left.to_vec();
				let mut right = right.to_vec();
				left.sort_unstable();
				right.sort_unstable();
				left == right
			}
			Codec::PostalAddress => {
				let decode = |values: &[String]| {
					values.iter().map(|value| decode_postal_address(value)).collect::<Vec<_>>()
				};
				decode(left) == decode(right)
			}
			Codec::Date => {
				let parse = |values: &[String]| {
					values.first().map(|value| Date::parse(value, DATE_FORMAT).map_err(|_| value.clone()))
				};
				parse(left) == parse(right)
			}
		}
	}
}

/// Encode newline separated address lines as an RFC 4517 `PostalAddress`
fn encode_postal_address(text: &str) -> String {
	text.lines()
		.map(|line| line.replace('\\', "\\5C").replace('$', "\\24"))
		.collect::<Vec<_>>()
		.join("$")
}

/// Decode an RFC 4517 `PostalAddress` into newline separated lines
fn decode_postal_address(value: &str) -> String {
	value
		.split('$')
		.map(|line| line.replace("\\24", "$").replace("\\5C", "\\").replace("\\5c", "\\"))
		.collect::<Vec<_>>()
		.join("\n")
}

/// The catalog, in enumeration order
static CATALOG: &[FieldDescriptor] = &[
	FieldDescriptor::string(Field::FullName, "cn").flagged(FieldFlags::NAMING),
	FieldDescriptor::string(Field::FamilyName, "sn"),
	FieldDescriptor::string(Field::GivenName, "givenName"),
	FieldDescriptor::string(Field::Nickname, "displayName"),
	FieldDescriptor::string(Field::FileAs, "fileAs").person(),
	FieldDescriptor::complex(Field::Email, "mail", Codec::Slots(4)),
	FieldDescriptor::complex(Field::BusinessPhone, "telephoneNumber", Codec::Slots(2)),
	FieldDescriptor::complex(Field::HomePhone, "homePhone", Codec::Slots(2)),
	FieldDescriptor::string(Field::MobilePhone, "mobile"),
	FieldDescriptor::string(Field::CarPhone, "carPhone").person(),
	FieldDescriptor::string(Field::PrimaryPhone, "primaryPhone").person(),
	FieldDescriptor::string(Field::BusinessFax, "facsimileTelephoneNumber"),
	FieldDescriptor::string(Field::HomeFax, "homeFacsimileTelephoneNumber").person(),
	FieldDescriptor::string(Field::OtherPhone, "otherPhone").person(),
	FieldDescriptor::string(Field::Pager, "pager"),
	FieldDescriptor::string(Field::Isdn, "internationalISDNNumber"),
	FieldDescriptor::string(Field::Telex, "telexNumber"),
	FieldDescriptor::string(Field::Radio, "radio").person(),
	FieldDescriptor::string(Field::AssistantPhone, "assistantPhone").person(),
	FieldDescriptor::string(Field::CompanyPhone, "companyPhone").person(),
	FieldDescriptor::string(Field::Org, "o"),
	FieldDescriptor::string(Field::OrgUnit, "ou"),
	FieldDescriptor::string(Field::Office, "roomNumber"),
	FieldDescriptor::string(Field::Title, "title"),
	FieldDescriptor::string(Field::Role, "businessRole").person(),
	FieldDescriptor::string(Field::Manager, "managerName").person(),
	FieldDescriptor::string(Field::Assistant, "assistantName").person(),
	FieldDescriptor::complex(Field::WorkAddress, "postalAddress", Codec::PostalAddress),
	FieldDescriptor::complex(Field::HomeAddress, "homePostalAddress", Codec::PostalAddress),
	FieldDescriptor::complex(Field::OtherAddress, "otherPostalAddress", Codec::PostalAddress)
		.person(),
	FieldDescriptor::string(Field::HomepageUrl, "labeledURI"),
	FieldDescriptor::string(Field::Spouse, "spouseName").person(),
	FieldDescriptor::string(Field::Note, "note").person(),
	FieldDescriptor::complex(Field::Birthday, "birthDate", Codec::Date).person(),
	FieldDescriptor::complex(Field::Anniversary, "anniversary", Codec::Date).person(),
	FieldDescriptor::complex(Field::Categories, "category", Codec::List).person(),
	FieldDescriptor::string(Field::Mailer, "mailer").person(),
	FieldDescriptor::string(Field::IcsCalendar, "icsCalendar").person(),
	FieldDescriptor::string(Field::CalendarUri, "calCalURI").calendar(),
	FieldDescriptor::string(Field::FreeBusyUrl, "calFBURL").calendar(),
	FieldDescriptor::binary(Field::Photo, "jpegPhoto"),
	FieldDescriptor::binary(Field::Certificate, "userCertificate"),
	FieldDescriptor::string(Field::Password, "userPassword").flagged(FieldFlags::WRITE_ONLY),
];

/// Every descriptor, in catalog order
#[must_use]
pub fn descriptors() -> &'static [FieldDescriptor] {
	CATALOG
}

/// The descriptor of a contact field
#[must_use]
pub fn attribute_for(field: Field) -> Option<&'static FieldDescriptor> {
	CATALOG.iter().find(|descriptor| descriptor.field == field)
}

/// The descriptor of an LDAP attribute, matched case-insensitively
#[must_use]
pub fn field_for(attribute: &str) -> Option<&'static FieldDescriptor> {
	CATALOG.iter().find(|descriptor| descriptor.attribute.eq_ignore_ascii_case(attribute))
}

/// The descriptor for a field name as used in search expressions
#[must_use]
pub fn by_name(name: &str) -> Option<&'static FieldDescriptor> {
	name.parse().ok().and_then(attribute_for)
}

/// The attribute names to request when reading contacts
#[must_use]
pub fn readable_attributes() -> Vec<&'static str> {
	std::iter::once("objectClass")
		.chain(CATALOG.iter().filter(|d| !d.is_write_only()).map(|d| d.attribute))
		.collect()
}

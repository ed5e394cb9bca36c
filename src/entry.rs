//! Helper methods for extracting data from search results.
//!
//! Attribute names are case-insensitive in LDAP, and servers are free to
//! return them in a different case than they were requested in.
use ldap3::SearchEntry;

/// An extension trait for [`SearchEntry`] that provides convenience methods for
/// extracting data.
pub trait SearchEntryExt {
	/// All textual values of an attribute, matched case-insensitively. Empty if
	/// the attribute is absent.
	fn attr_values(&self, attr: &str) -> &[String];

	/// All values of an attribute in binary form, whichever map the client
	/// library sorted them into.
	fn bin_attr_values(&self, attr: &str) -> Vec<&[u8]>;

	/// Get the first value of an attribute.
	fn attr_first(&self, attr: &str) -> Option<&str> {
		self.attr_values(attr).first().map(String::as_str)
	}

	/// The object classes of the entry.
	fn object_classes(&self) -> &[String] {
		self.attr_values("objectClass")
	}
}

impl SearchEntryExt for SearchEntry {
	fn attr_values(&self, attr: &str) -> &[String] {
		if let Some(values) = self.attrs.get(attr) {
			return values;
		}
		self.attrs
			.iter()
			.find(|(name, _)| name.eq_ignore_ascii_case(attr))
			.map_or(&[][..], |(_, values)| values.as_slice())
	}

	fn bin_attr_values(&self, attr: &str) -> Vec<&[u8]> {
		let textual = self.attr_values(attr).iter().map(String::as_bytes);
		let binary = self
			.bin_attrs
			.iter()
			.filter(|(name, _)| name.eq_ignore_ascii_case(attr))
			.flat_map(|(_, values)| values.iter().map(Vec::as_slice));
		textual.chain(binary).collect()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use ldap3::SearchEntry;

	use super::SearchEntryExt;

	#[test]
	fn attr_first() {
		let entry = SearchEntry {
			dn: String::from("dontcare"),
			attrs: [(
				String::from("cn"),
				vec![String::from("Foo Bar"), String::from("Bar McBaz")],
			)]
			.into_iter()
			.collect(),
			bin_attrs: HashMap::default(),
		};
		assert_eq!(
			entry.attr_first("attribute_does_not_exist"),
			None,
			"Undefined attributes should return None"
		);
		assert_eq!(entry.attr_first("cn"), Some("Foo Bar"), "Should return the first value");
		assert_eq!(entry.attr_first("CN"), Some("Foo Bar"), "Names are case-insensitive");
		assert_ne!(entry.attr_first("cn"), Some("Bar McBaz"), "Should return the correct value");
	}

	#[test]
	fn binary_values() {
		let entry = SearchEntry {
			dn: String::from("dontcare"),
			attrs: HashMap::default(),
			bin_attrs: [(String::from("jpegPhoto"), vec![vec![0xff, 0xd8, 0xff]])]
				.into_iter()
				.collect(),
		};
		let expected: Vec<&[u8]> = vec![&[0xff, 0xd8, 0xff]];
		assert_eq!(entry.bin_attr_values("jpegphoto"), expected);
		assert!(entry.attr_values("jpegPhoto").is_empty());
		assert!(entry.object_classes().is_empty());
	}
}

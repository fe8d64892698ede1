//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Provider-assigned identifier of a machine created by a target.
    MachineId
);

string_newtype!(
    /// Hex blake3 digest of a resource bundle.
    BundleDigest
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_display_and_as_ref() {
        let id = MachineId::new("vm-42");
        assert_eq!(id.to_string(), "vm-42");
        assert_eq!(id.as_str(), "vm-42");
        assert_eq!(AsRef::<str>::as_ref(&id), "vm-42");
    }

    #[test]
    fn machine_id_serde_is_plain_string() {
        let id = MachineId::new("i-0abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"i-0abc\"");
        let back: MachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn digest_compares_with_str() {
        let d = BundleDigest::from("abc");
        assert_eq!(d, "abc");
        assert_eq!(d.into_inner(), "abc");
    }
}

//! Permissive deserialization helpers for service declarations.
//!
//! Layered configuration sources do not agree on scalar types: an environment variable such as `DRYDOCK_VERSION=8.14`
//! arrives as a float, and `DRYDOCK_EXPORT=1` as an integer. These helpers, used through `serde_with`, accept the
//! scalar forms an operator would reasonably write.

use std::fmt;

use serde::{
    de::{Error, Unexpected, Visitor},
    Deserializer,
};
use serde_with::DeserializeAs;

/// Permissively deserializes a boolean.
///
/// Accepts a native boolean, the strings `true`/`false`/`1`/`0` (case insensitive, surrounding whitespace ignored), or
/// the numbers `1` and `0`.
pub struct PermissiveBool;

impl<'de> DeserializeAs<'de, bool> for PermissiveBool {
    fn deserialize_as<D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BoolVisitor;

        impl Visitor<'_> for BoolVisitor {
            type Value = bool;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a boolean, or a string or number representing one")
            }

            fn visit_bool<E: Error>(self, value: bool) -> Result<bool, E> {
                Ok(value)
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<bool, E> {
                match value.trim().to_lowercase().as_str() {
                    "true" | "1" => Ok(true),
                    "false" | "0" => Ok(false),
                    _ => Err(Error::invalid_value(
                        Unexpected::Str(value),
                        &"\"true\", \"false\", \"1\" or \"0\"",
                    )),
                }
            }

            fn visit_i64<E: Error>(self, value: i64) -> Result<bool, E> {
                match value {
                    0 => Ok(false),
                    1 => Ok(true),
                    _ => Err(Error::invalid_value(Unexpected::Signed(value), &"0 or 1")),
                }
            }

            fn visit_u64<E: Error>(self, value: u64) -> Result<bool, E> {
                match value {
                    0 => Ok(false),
                    1 => Ok(true),
                    _ => Err(Error::invalid_value(Unexpected::Unsigned(value), &"0 or 1")),
                }
            }
        }

        deserializer.deserialize_any(BoolVisitor)
    }
}

/// Permissively deserializes a string.
///
/// Numbers and booleans are converted to their textual form, so `version: 8.14` and `version: "8.14"` are equivalent.
/// Floats are rendered with the shortest representation that round-trips, which means `1.10` becomes `1.1`: values
/// whose trailing zeroes matter must be quoted.
pub struct PermissiveString;

impl<'de> DeserializeAs<'de, String> for PermissiveString {
    fn deserialize_as<D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StringVisitor;

        impl Visitor<'_> for StringVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string, number or boolean")
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<String, E> {
                Ok(value.to_string())
            }

            fn visit_string<E: Error>(self, value: String) -> Result<String, E> {
                Ok(value)
            }

            fn visit_bool<E: Error>(self, value: bool) -> Result<String, E> {
                Ok(value.to_string())
            }

            fn visit_i64<E: Error>(self, value: i64) -> Result<String, E> {
                Ok(value.to_string())
            }

            fn visit_u64<E: Error>(self, value: u64) -> Result<String, E> {
                Ok(value.to_string())
            }

            fn visit_f64<E: Error>(self, value: f64) -> Result<String, E> {
                Ok(value.to_string())
            }
        }

        deserializer.deserialize_any(StringVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;
    use serde_with::serde_as;

    use super::*;

    #[serde_as]
    #[derive(Deserialize)]
    struct Flags {
        #[serde_as(as = "PermissiveBool")]
        export: bool,
        #[serde_as(as = "PermissiveString")]
        version: String,
    }

    fn parse(value: serde_json::Value) -> Result<Flags, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[test]
    fn bool_accepts_common_forms() {
        for (raw, expected) in [
            (json!(true), true),
            (json!("TRUE"), true),
            (json!(" 1 "), true),
            (json!(1), true),
            (json!("false"), false),
            (json!(0), false),
        ] {
            let flags = parse(json!({ "export": raw, "version": "1" })).unwrap();
            assert_eq!(flags.export, expected, "input: {}", raw);
        }
    }

    #[test]
    fn bool_rejects_other_values() {
        assert!(parse(json!({ "export": "maybe", "version": "1" })).is_err());
        assert!(parse(json!({ "export": 2, "version": "1" })).is_err());
    }

    #[test]
    fn string_accepts_scalars() {
        assert_eq!(parse(json!({ "export": false, "version": 8.14 })).unwrap().version, "8.14");
        assert_eq!(parse(json!({ "export": false, "version": 7 })).unwrap().version, "7");
        assert_eq!(parse(json!({ "export": false, "version": "1.10" })).unwrap().version, "1.10");
    }

    #[test]
    fn string_rejects_structures() {
        assert!(parse(json!({ "export": false, "version": ["1"] })).is_err());
    }
}

//! Extension types for the value codec.
//!
//! MessagePack reserves an `ext` family of values: a signed type tag plus an
//! opaque byte body. The engine carries such values through untouched as
//! [`Value::Ext`]; applications that want typed payloads (numeric arrays,
//! timestamps, ...) implement [`Extension`] once per type. On the way out the
//! Rust type picks the encoder. On the way in, an [`ExtensionRegistry`] built
//! once at startup maps each tag to its decoder, so a server can reject
//! malformed payloads before any handler sees them.

use std::any::Any;
use std::collections::HashMap;

use rmpv::Value;

use crate::DecodeError;

/// A typed payload carried in a MessagePack `ext` value.
pub trait Extension: Sized {
    /// The ext type tag. Negative tags are reserved by MessagePack itself.
    const TAG: i8;

    /// Serialises the payload body.
    fn encode_body(&self) -> Vec<u8>;

    /// Parses a payload body previously produced by [`Extension::encode_body`].
    fn decode_body(body: &[u8]) -> Result<Self, DecodeError>;

    /// Wraps the payload in a [`Value::Ext`].
    fn to_value(&self) -> Value {
        Value::Ext(Self::TAG, self.encode_body())
    }

    /// Extracts a payload from a value.
    ///
    /// Returns `Ok(None)` if `value` is not an ext value with this type's tag.
    fn from_value(value: &Value) -> Result<Option<Self>, DecodeError> {
        match value {
            Value::Ext(tag, body) if *tag == Self::TAG => Self::decode_body(body).map(Some),
            _ => Ok(None),
        }
    }
}

type BodyDecoder = fn(&[u8]) -> Result<Box<dyn Any + Send>, DecodeError>;

fn decode_boxed<E>(body: &[u8]) -> Result<Box<dyn Any + Send>, DecodeError>
where
    E: Extension + Send + 'static,
{
    Ok(Box::new(E::decode_body(body)?))
}

/// The extension types known to a process, keyed by tag.
///
/// Ext values whose tag is not registered pass through as opaque
/// [`Value::Ext`]s.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    decoders: HashMap<i8, BodyDecoder>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `E` under [`Extension::TAG`], replacing any earlier type
    /// registered with the same tag.
    pub fn register<E>(mut self) -> Self
    where
        E: Extension + Send + 'static,
    {
        self.decoders.insert(E::TAG, decode_boxed::<E>);
        self
    }

    /// Returns `true` if a type is registered for `tag`.
    pub fn contains(&self, tag: i8) -> bool {
        self.decoders.contains_key(&tag)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes `value` with the type registered for its tag.
    ///
    /// Returns `Ok(None)` for values that are not ext values and for tags
    /// with no registered type. Use `downcast` on the result to recover the
    /// concrete type.
    pub fn decode(&self, value: &Value) -> Result<Option<Box<dyn Any + Send>>, DecodeError> {
        match value {
            Value::Ext(tag, body) => match self.decoders.get(tag) {
                Some(decoder) => decoder(body).map(Some),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Checks that every registered ext value nested anywhere in `values`
    /// decodes.
    pub fn check(&self, values: &[Value]) -> Result<(), DecodeError> {
        if self.decoders.is_empty() {
            return Ok(());
        }
        let mut stack: Vec<&Value> = values.iter().collect();
        while let Some(value) = stack.pop() {
            match value {
                Value::Array(items) => stack.extend(items),
                Value::Map(entries) => {
                    for (key, item) in entries {
                        stack.push(key);
                        stack.push(item);
                    }
                }
                Value::Ext(tag, body) => {
                    if let Some(decoder) = self.decoders.get(tag) {
                        decoder(body)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("ExtensionRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Little-endian packed `f64` array, the shape numeric-array plugins use.
    #[derive(Debug, PartialEq)]
    struct F64Array(Vec<f64>);

    impl Extension for F64Array {
        const TAG: i8 = 17;

        fn encode_body(&self) -> Vec<u8> {
            self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
        }

        fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
            if body.len() % 8 != 0 {
                return Err(DecodeError::InvalidField {
                    field: "ext",
                    reason: format!("{} bytes is not a whole number of f64s", body.len()),
                });
            }
            Ok(Self(
                body.chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            ))
        }
    }

    #[test]
    fn extension_value_carries_tag_and_body() {
        let array = F64Array(vec![1.5, -2.0]);
        let value = array.to_value();
        assert!(matches!(&value, Value::Ext(17, body) if body.len() == 16));
        assert_eq!(F64Array::from_value(&value).unwrap(), Some(array));
    }

    #[test]
    fn other_values_are_not_claimed() {
        assert_eq!(F64Array::from_value(&Value::from(1)).unwrap(), None);
        assert_eq!(
            F64Array::from_value(&Value::Ext(3, vec![0; 8])).unwrap(),
            None
        );
    }

    #[test]
    fn corrupt_body_is_a_decode_error() {
        assert!(F64Array::from_value(&Value::Ext(17, vec![0; 5])).is_err());
    }

    #[test]
    fn registry_decodes_by_tag() {
        let registry = ExtensionRegistry::new().register::<F64Array>();
        assert!(registry.contains(17));
        assert_eq!(registry.len(), 1);

        let decoded = registry
            .decode(&F64Array(vec![4.0]).to_value())
            .unwrap()
            .unwrap();
        let array = decoded.downcast::<F64Array>().unwrap();
        assert_eq!(*array, F64Array(vec![4.0]));

        assert!(registry.decode(&Value::Ext(3, vec![1])).unwrap().is_none());
        assert!(registry.decode(&Value::from("x")).unwrap().is_none());
    }

    #[test]
    fn check_finds_corrupt_payloads_at_any_depth() {
        let registry = ExtensionRegistry::new().register::<F64Array>();
        let good = vec![
            Value::from(1),
            Value::Array(vec![F64Array(vec![1.0, 2.0]).to_value()]),
            Value::Ext(3, vec![1, 2, 3]),
        ];
        assert!(registry.check(&good).is_ok());

        let nested_bad = vec![Value::Map(vec![(
            Value::from("samples"),
            Value::Array(vec![Value::Ext(17, vec![0; 9])]),
        )])];
        assert!(registry.check(&nested_bad).is_err());

        assert!(ExtensionRegistry::new().check(&nested_bad).is_ok());
    }
}

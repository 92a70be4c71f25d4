//! Canonical value model for hashing
//!
//! Any `Serialize` value is captured as a [`Canonical`] tree through serde's
//! data model. Unlike `serde_json::Value`, floats keep their exact bits, so
//! `NaN`, `inf`, `-inf` and `None` stay distinct. Integers of every width
//! normalize to one variant, and map entries are sorted by key.

use serde::ser::{self, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Canonical {
    Null,
    Bool(bool),
    Int(i128),
    /// Only for values above `i128::MAX`
    UInt(u128),
    /// IEEE-754 bits, with every NaN mapped to one payload
    Float(u64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Canonical>),
    /// Sorted by key
    Map(Vec<(Canonical, Canonical)>),
}

impl Canonical {
    pub(crate) fn float(value: f64) -> Self {
        if value.is_nan() {
            Canonical::Float(f64::NAN.to_bits())
        } else {
            Canonical::Float(value.to_bits())
        }
    }

    fn map(mut entries: Vec<(Canonical, Canonical)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Canonical::Map(entries)
    }

    fn variant(variant: &'static str, value: Canonical) -> Self {
        Canonical::Map(vec![(Canonical::Str(variant.to_string()), value)])
    }

    /// Same tree `to_canonical` builds for the value this JSON was serialized from
    pub(crate) fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Canonical::Null,
            Value::Bool(b) => Canonical::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Canonical::Int(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    Canonical::Int(i128::from(u))
                } else {
                    Canonical::float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Canonical::Str(s.clone()),
            Value::Array(items) => Canonical::Seq(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Canonical::map(
                map.iter()
                    .map(|(k, v)| (Canonical::Str(k.clone()), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub(crate) struct CanonicalError(String);

impl ser::Error for CanonicalError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CanonicalError(msg.to_string())
    }
}

pub(crate) fn to_canonical<T: Serialize + ?Sized>(value: &T) -> Result<Canonical, CanonicalError> {
    value.serialize(CanonicalSerializer)
}

struct CanonicalSerializer;

impl ser::Serializer for CanonicalSerializer {
    type Ok = Canonical;
    type Error = CanonicalError;
    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = VariantSeqBuilder;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = VariantMapBuilder;

    fn serialize_bool(self, v: bool) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_i16(self, v: i16) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_i32(self, v: i32) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_i64(self, v: i64) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_i128(self, v: i128) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(v))
    }

    fn serialize_u8(self, v: u8) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_u16(self, v: u16) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_u32(self, v: u32) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_u64(self, v: u64) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Int(i128::from(v)))
    }

    fn serialize_u128(self, v: u128) -> Result<Canonical, CanonicalError> {
        Ok(i128::try_from(v)
            .map(Canonical::Int)
            .unwrap_or(Canonical::UInt(v)))
    }

    fn serialize_f32(self, v: f32) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::float(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::float(v))
    }

    fn serialize_char(self, v: char) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Str(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Canonical, CanonicalError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Str(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Canonical, CanonicalError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::variant(variant, to_canonical(value)?))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, CanonicalError> {
        Ok(SeqBuilder {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, CanonicalError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqBuilder, CanonicalError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqBuilder, CanonicalError> {
        Ok(VariantSeqBuilder {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapBuilder, CanonicalError> {
        Ok(MapBuilder {
            entries: Vec::with_capacity(len.unwrap_or(0)),
            pending_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapBuilder, CanonicalError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantMapBuilder, CanonicalError> {
        Ok(VariantMapBuilder {
            variant,
            entries: Vec::with_capacity(len),
        })
    }
}

struct SeqBuilder {
    items: Vec<Canonical>,
}

impl SeqBuilder {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonicalError> {
        self.items.push(to_canonical(value)?);
        Ok(())
    }
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = Canonical;
    type Error = CanonicalError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonicalError> {
        self.push(value)
    }

    fn end(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Seq(self.items))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = Canonical;
    type Error = CanonicalError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonicalError> {
        self.push(value)
    }

    fn end(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Seq(self.items))
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = Canonical;
    type Error = CanonicalError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonicalError> {
        self.push(value)
    }

    fn end(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::Seq(self.items))
    }
}

struct VariantSeqBuilder {
    variant: &'static str,
    items: Vec<Canonical>,
}

impl ser::SerializeTupleVariant for VariantSeqBuilder {
    type Ok = Canonical;
    type Error = CanonicalError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonicalError> {
        self.items.push(to_canonical(value)?);
        Ok(())
    }

    fn end(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::variant(self.variant, Canonical::Seq(self.items)))
    }
}

struct MapBuilder {
    entries: Vec<(Canonical, Canonical)>,
    pending_key: Option<Canonical>,
}

impl ser::SerializeMap for MapBuilder {
    type Ok = Canonical;
    type Error = CanonicalError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CanonicalError> {
        self.pending_key = Some(to_canonical(key)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonicalError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| CanonicalError("map value serialized before its key".to_string()))?;
        self.entries.push((key, to_canonical(value)?));
        Ok(())
    }

    fn end(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::map(self.entries))
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = Canonical;
    type Error = CanonicalError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CanonicalError> {
        self.entries
            .push((Canonical::Str(key.to_string()), to_canonical(value)?));
        Ok(())
    }

    fn end(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::map(self.entries))
    }
}

struct VariantMapBuilder {
    variant: &'static str,
    entries: Vec<(Canonical, Canonical)>,
}

impl ser::SerializeStructVariant for VariantMapBuilder {
    type Ok = Canonical;
    type Error = CanonicalError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CanonicalError> {
        self.entries
            .push((Canonical::Str(key.to_string()), to_canonical(value)?));
        Ok(())
    }

    fn end(self) -> Result<Canonical, CanonicalError> {
        Ok(Canonical::variant(self.variant, Canonical::map(self.entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_non_finite_floats_stay_distinct() {
        let nan = to_canonical(&f64::NAN).unwrap();
        let inf = to_canonical(&f64::INFINITY).unwrap();
        let neg_inf = to_canonical(&f64::NEG_INFINITY).unwrap();
        let none = to_canonical(&None::<f64>).unwrap();

        assert_ne!(nan, inf);
        assert_ne!(inf, neg_inf);
        assert_ne!(nan, none);
        assert_eq!(none, Canonical::Null);
        assert_eq!(to_canonical(&-f64::NAN).unwrap(), nan);
    }

    #[test]
    fn test_integer_widths_normalize() {
        assert_eq!(to_canonical(&7u8).unwrap(), to_canonical(&7i64).unwrap());
        assert_eq!(to_canonical(&7u128).unwrap(), Canonical::Int(7));
        assert_eq!(to_canonical(&u128::MAX).unwrap(), Canonical::UInt(u128::MAX));
        assert_ne!(to_canonical(&1i32).unwrap(), to_canonical(&1.0f64).unwrap());
    }

    #[test]
    fn test_maps_and_structs_sort_keys() {
        #[derive(Serialize)]
        struct Point {
            y: i32,
            x: i32,
        }

        let hash_map: HashMap<&str, i32> = HashMap::from([("y", 2), ("x", 1)]);
        let tree_map: BTreeMap<&str, i32> = BTreeMap::from([("x", 1), ("y", 2)]);
        let point = to_canonical(&Point { y: 2, x: 1 }).unwrap();

        assert_eq!(to_canonical(&hash_map).unwrap(), to_canonical(&tree_map).unwrap());
        assert_eq!(point, to_canonical(&tree_map).unwrap());
    }

    #[test]
    fn test_enum_variants() {
        #[derive(Serialize)]
        enum Shape {
            Empty,
            Circle(f64),
            Rect { w: u32, h: u32 },
        }

        assert_eq!(
            to_canonical(&Shape::Empty).unwrap(),
            Canonical::Str("Empty".to_string())
        );
        assert_ne!(
            to_canonical(&Shape::Circle(1.0)).unwrap(),
            to_canonical(&Shape::Circle(-1.0)).unwrap()
        );
        assert_eq!(
            to_canonical(&Shape::Rect { w: 1, h: 2 }).unwrap(),
            Canonical::variant(
                "Rect",
                Canonical::Map(vec![
                    (Canonical::Str("h".to_string()), Canonical::Int(2)),
                    (Canonical::Str("w".to_string()), Canonical::Int(1)),
                ])
            )
        );
    }

    #[test]
    fn test_from_json_matches_serialized_form() {
        let value = json!({"b": [1, -2, 2.5, null], "a": {"k": "v", "t": true}});
        assert_eq!(Canonical::from_json(&value), to_canonical(&value).unwrap());
    }

    #[test]
    fn test_serialize_errors_propagate() {
        struct Broken;
        impl Serialize for Broken {
            fn serialize<S: ser::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
                Err(ser::Error::custom("not serializable"))
            }
        }

        let err = to_canonical(&vec![Broken]).unwrap_err();
        assert_eq!(err.to_string(), "not serializable");
    }
}

//! MessagePack codec for arrays of generic objects.
//!
//! The payload is one msgpack array: the elements in row-major order, then
//! the encoded dtype, then the shape. Tuples are written as
//! `{"__type__": "tuple", "value": [...]}` maps so they survive the trip.
//! A map that itself has a `"__type__"` key is written as
//! `{"__type__": "dict", "value": [[key, value], ...]}` so it cannot be
//! mistaken for a tagged tuple.

use std::fmt;

use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::array::{ObjectArray, element_count};
use crate::codecs::CodecConfig;
use crate::error::{ZarrError, ZarrResult};
use crate::metadata::dtype::{decode_dtype, encode_dtype};
use crate::types::ObjectValue;

pub const CODEC_ID: &str = "msgpack3";

const TYPE_KEY: &str = "__type__";
const TUPLE_TAG: &str = "tuple";
const DICT_TAG: &str = "dict";
const VALUE_KEY: &str = "value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPackCodec {
    /// Decode msgpack strings to bytes instead of text.
    #[serde(default)]
    pub raw: bool,
    /// Write floats as 32-bit.
    #[serde(default)]
    pub use_single_float: bool,
    #[serde(default = "default_use_bin_type")]
    pub use_bin_type: bool,
}

fn default_use_bin_type() -> bool {
    true
}

impl Default for MsgPackCodec {
    fn default() -> Self {
        Self {
            raw: false,
            use_single_float: false,
            use_bin_type: true,
        }
    }
}

impl MsgPackCodec {
    /// The filter entry persisted in `.zarray`.
    pub fn config(&self) -> CodecConfig {
        CodecConfig::new(CODEC_ID)
            .with("raw", self.raw)
            .with("use_single_float", self.use_single_float)
            .with("use_bin_type", self.use_bin_type)
    }

    pub fn from_config(config: &CodecConfig) -> ZarrResult<Self> {
        if config.id != CODEC_ID {
            return Err(ZarrError::Codec(format!(
                "expected codec id {CODEC_ID}, got {}",
                config.id
            )));
        }
        serde_json::from_value(Value::Object(config.config.clone()))
            .map_err(|e| ZarrError::Codec(format!("Failed to parse MsgPackCodec: {e}")))
    }

    /// Encode an object array into a self-describing msgpack payload.
    pub fn encode(&self, array: &ObjectArray) -> ZarrResult<Vec<u8>> {
        if !self.use_bin_type {
            // rmp-serde always writes byte strings as bin.
            return Err(ZarrError::Encode(
                "msgpack encoding without use_bin_type is not supported".into(),
            ));
        }
        let (dtype, _) = encode_dtype(array.dtype())?;
        log::debug!("msgpack encoding: dtype {:?} -> {dtype}", array.dtype());

        let trailer = [
            descr_to_object(&dtype, false),
            ObjectValue::Tuple(
                array
                    .shape()
                    .iter()
                    .map(|&d| ObjectValue::UInt(d as u64))
                    .collect(),
            ),
        ];
        let payload = Payload {
            elements: array.elements(),
            trailer: &trailer,
            single_float: self.use_single_float,
        };
        rmp_serde::to_vec(&payload).map_err(|e| ZarrError::Encode(e.to_string()))
    }

    /// Decode a payload produced by [`MsgPackCodec::encode`].
    pub fn decode(&self, bytes: &[u8]) -> ZarrResult<ObjectArray> {
        let mut de = rmp_serde::Deserializer::new(bytes);
        let value = ObjectSeed { raw: self.raw }
            .deserialize(&mut de)
            .map_err(|e| ZarrError::ObjectCodecDecode(e.to_string()))?;

        let ObjectValue::List(mut items) = value else {
            return Err(ZarrError::ObjectCodecDecode(
                "payload is not a sequence".into(),
            ));
        };
        let (Some(shape), Some(dtype)) = (items.pop(), items.pop()) else {
            return Err(ZarrError::ObjectCodecDecode(
                "payload is missing its dtype and shape trailer".into(),
            ));
        };

        let shape = decode_shape(&shape)?;
        let dtype = decode_dtype(&object_to_descr(&dtype)?)
            .map_err(|e| ZarrError::ObjectCodecDecode(e.to_string()))?;
        log::debug!(
            "msgpack decoding: dtype {dtype:?}, shape {shape:?}, {} elements",
            items.len()
        );

        let expected = element_count(&shape).ok_or_else(|| {
            ZarrError::ObjectCodecDecode(format!("shape {shape:?} overflows usize"))
        })?;
        if items.len() != expected {
            return Err(ZarrError::ObjectCodecDecode(format!(
                "{} elements do not fill shape {shape:?}",
                items.len()
            )));
        }
        ObjectArray::new(dtype, shape, items)
    }
}

// ---------------------------------------------------------------------------
// Trailer conversion
// ---------------------------------------------------------------------------

/// Mirror numpy's `descr`: a structured dtype is a list of field tuples,
/// field shapes are tuples as well.
fn descr_to_object(dtype: &Value, is_field: bool) -> ObjectValue {
    match dtype {
        Value::Array(items) if is_field => ObjectValue::Tuple(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| match (i, item) {
                    (1, nested @ Value::Array(_)) => descr_to_object(nested, false),
                    (2, Value::Array(dims)) => {
                        ObjectValue::Tuple(dims.iter().map(ObjectValue::from_json).collect())
                    }
                    _ => ObjectValue::from_json(item),
                })
                .collect(),
        ),
        Value::Array(fields) => {
            ObjectValue::List(fields.iter().map(|f| descr_to_object(f, true)).collect())
        }
        other => ObjectValue::from_json(other),
    }
}

fn object_to_descr(value: &ObjectValue) -> ZarrResult<Value> {
    Ok(match value {
        ObjectValue::String(s) => Value::String(s.clone()),
        ObjectValue::Bytes(b) => Value::String(
            String::from_utf8(b.clone())
                .map_err(|e| ZarrError::ObjectCodecDecode(format!("dtype is not UTF-8: {e}")))?,
        ),
        ObjectValue::Int(i) => Value::from(*i),
        ObjectValue::UInt(u) => Value::from(*u),
        ObjectValue::List(items) | ObjectValue::Tuple(items) => {
            Value::Array(items.iter().map(object_to_descr).collect::<ZarrResult<_>>()?)
        }
        ObjectValue::Map(_) => match tuple_items(value) {
            Some(items) => {
                Value::Array(items.iter().map(object_to_descr).collect::<ZarrResult<_>>()?)
            }
            None => {
                return Err(ZarrError::ObjectCodecDecode(format!(
                    "unexpected dtype entry {value:?}"
                )));
            }
        },
        other => {
            return Err(ZarrError::ObjectCodecDecode(format!(
                "unexpected dtype entry {other:?}"
            )));
        }
    })
}

fn decode_shape(value: &ObjectValue) -> ZarrResult<Vec<usize>> {
    let dims = match value {
        ObjectValue::List(items) | ObjectValue::Tuple(items) => items.as_slice(),
        other => tuple_items(other).ok_or_else(|| {
            ZarrError::ObjectCodecDecode(format!("shape must be a sequence, got {other:?}"))
        })?,
    };
    dims.iter()
        .map(|d| match d {
            ObjectValue::Int(i) => usize::try_from(*i).ok(),
            ObjectValue::UInt(u) => usize::try_from(*u).ok(),
            _ => None,
        })
        .map(|d| {
            d.ok_or_else(|| ZarrError::ObjectCodecDecode(format!("invalid shape {value:?}")))
        })
        .collect()
}

/// Items of a tuple map whose keys came back as bytes (`raw` mode).
fn tuple_items(value: &ObjectValue) -> Option<&[ObjectValue]> {
    let ObjectValue::Map(entries) = value else {
        return None;
    };
    let text = |v: &ObjectValue| match v {
        ObjectValue::String(s) => Some(s.as_bytes().to_vec()),
        ObjectValue::Bytes(b) => Some(b.clone()),
        _ => None,
    };
    let lookup = |key: &str| {
        entries
            .iter()
            .find(|(k, _)| text(k).as_deref() == Some(key.as_bytes()))
            .map(|(_, v)| v)
    };
    if lookup(TYPE_KEY).and_then(text).as_deref() != Some(TUPLE_TAG.as_bytes()) {
        return None;
    }
    match lookup(VALUE_KEY)? {
        ObjectValue::List(items) => Some(items.as_slice()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

struct Payload<'a> {
    elements: &'a [ObjectValue],
    trailer: &'a [ObjectValue; 2],
    single_float: bool,
}

impl Serialize for Payload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.elements.len() + self.trailer.len()))?;
        for value in self.elements.iter().chain(self.trailer.iter()) {
            seq.serialize_element(&Packed {
                value,
                single_float: self.single_float,
            })?;
        }
        seq.end()
    }
}

struct Packed<'a> {
    value: &'a ObjectValue,
    single_float: bool,
}

impl Packed<'_> {
    fn wrap<'b>(&self, value: &'b ObjectValue) -> Packed<'b> {
        Packed {
            value,
            single_float: self.single_float,
        }
    }
}

impl Serialize for Packed<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value {
            ObjectValue::Nil => serializer.serialize_unit(),
            ObjectValue::Bool(b) => serializer.serialize_bool(*b),
            ObjectValue::Int(i) => serializer.serialize_i64(*i),
            ObjectValue::UInt(u) => serializer.serialize_u64(*u),
            ObjectValue::Float(f) if self.single_float => serializer.serialize_f32(*f as f32),
            ObjectValue::Float(f) => serializer.serialize_f64(*f),
            ObjectValue::String(s) => serializer.serialize_str(s),
            ObjectValue::Bytes(b) => serializer.serialize_bytes(b),
            ObjectValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&self.wrap(item))?;
                }
                seq.end()
            }
            ObjectValue::Tuple(items) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(TYPE_KEY, TUPLE_TAG)?;
                map.serialize_key(VALUE_KEY)?;
                map.serialize_value(&PackedSeq {
                    items,
                    single_float: self.single_float,
                })?;
                map.end()
            }
            ObjectValue::Map(entries) if entries.iter().any(|(k, _)| is_key(k, TYPE_KEY)) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(TYPE_KEY, DICT_TAG)?;
                map.serialize_key(VALUE_KEY)?;
                map.serialize_value(&PackedPairs {
                    entries,
                    single_float: self.single_float,
                })?;
                map.end()
            }
            ObjectValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(&self.wrap(k), &self.wrap(v))?;
                }
                map.end()
            }
        }
    }
}

struct PackedSeq<'a> {
    items: &'a [ObjectValue],
    single_float: bool,
}

impl Serialize for PackedSeq<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.items.len()))?;
        for value in self.items {
            seq.serialize_element(&Packed {
                value,
                single_float: self.single_float,
            })?;
        }
        seq.end()
    }
}

struct PackedPairs<'a> {
    entries: &'a [(ObjectValue, ObjectValue)],
    single_float: bool,
}

impl Serialize for PackedPairs<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for (key, value) in self.entries {
            let key = Packed {
                value: key,
                single_float: self.single_float,
            };
            let value = Packed {
                value,
                single_float: self.single_float,
            };
            seq.serialize_element(&(key, value))?;
        }
        seq.end()
    }
}

fn is_key(key: &ObjectValue, name: &str) -> bool {
    matches!(key, ObjectValue::String(s) if s == name)
}

// ---------------------------------------------------------------------------
// Deserialization
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct ObjectSeed {
    raw: bool,
}

impl<'de> DeserializeSeed<'de> for ObjectSeed {
    type Value = ObjectValue;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ObjectSeed {
    type Value = ObjectValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a msgpack value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(ObjectValue::Nil)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(ObjectValue::Nil)
    }

    fn visit_some<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(ObjectValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(ObjectValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => ObjectValue::Int(i),
            Err(_) => ObjectValue::UInt(v),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(ObjectValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(if self.raw {
            ObjectValue::Bytes(v.as_bytes().to_vec())
        } else {
            ObjectValue::String(v.to_string())
        })
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(ObjectValue::Bytes(v.to_vec()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element_seed(self)? {
            items.push(item);
        }
        Ok(ObjectValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::new();
        while let Some(key) = map.next_key_seed(self)? {
            let value = map.next_value_seed(self)?;
            entries.push((key, value));
        }
        Ok(unwrap_tagged(entries))
    }
}

/// Undo the tuple and dict tags; any other map is kept as is.
fn unwrap_tagged(mut entries: Vec<(ObjectValue, ObjectValue)>) -> ObjectValue {
    let tag = entries.iter().find_map(|(k, v)| match v {
        ObjectValue::String(s) if is_key(k, TYPE_KEY) => Some(s.clone()),
        _ => None,
    });
    let value_pos = entries
        .iter()
        .position(|(k, v)| is_key(k, VALUE_KEY) && matches!(v, ObjectValue::List(_)));
    let (Some(tag), Some(pos)) = (tag, value_pos) else {
        return ObjectValue::Map(entries);
    };

    match tag.as_str() {
        TUPLE_TAG => {
            if let (_, ObjectValue::List(items)) = entries.swap_remove(pos) {
                return ObjectValue::Tuple(items);
            }
        }
        DICT_TAG if is_pair_list(&entries[pos].1) => {
            if let (_, ObjectValue::List(pairs)) = entries.swap_remove(pos) {
                return ObjectValue::Map(
                    pairs
                        .into_iter()
                        .filter_map(|pair| match pair {
                            ObjectValue::List(kv) => {
                                let mut kv = kv.into_iter();
                                Some((kv.next()?, kv.next()?))
                            }
                            _ => None,
                        })
                        .collect(),
                );
            }
        }
        _ => {}
    }
    ObjectValue::Map(entries)
}

fn is_pair_list(value: &ObjectValue) -> bool {
    matches!(value, ObjectValue::List(pairs)
        if pairs.iter().all(|p| matches!(p, ObjectValue::List(kv) if kv.len() == 2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Endian, VlenHint};
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<ObjectValue> {
        items.iter().map(|s| ObjectValue::from(*s)).collect()
    }

    #[test]
    fn string_array_round_trip() {
        let codec = MsgPackCodec::default();
        let array =
            ObjectArray::new(DataType::object(), vec![3], strings(&["foo", "bar", "baz"])).unwrap();
        let decoded = codec.decode(&codec.encode(&array).unwrap()).unwrap();
        assert_eq!(decoded, array);
        assert_eq!(decoded.dtype(), &DataType::object());
        assert_eq!(decoded.shape(), &[3]);
    }

    #[test]
    fn payload_layout() {
        let codec = MsgPackCodec::default();
        let array = ObjectArray::new(DataType::object(), vec![2], strings(&["a", "b"])).unwrap();
        let bytes = codec.encode(&array).unwrap();
        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!(["a", "b", "|O", {"__type__": "tuple", "value": [2]}])
        );
    }

    #[test]
    fn mixed_elements_and_tuples() {
        let codec = MsgPackCodec::default();
        let elements = vec![
            ObjectValue::Nil,
            ObjectValue::Int(-7),
            ObjectValue::UInt(u64::MAX),
            ObjectValue::Float(f64::NAN),
            ObjectValue::Bytes(vec![0, 159, 146, 150]),
            ObjectValue::List(vec![1i64.into(), "x".into()]),
            ObjectValue::Tuple(vec![true.into(), ObjectValue::Nil]),
            ObjectValue::Map(vec![(
                ObjectValue::from("__type__"),
                ObjectValue::from("not a tuple"),
            )]),
        ];
        let array = ObjectArray::new(DataType::object(), vec![2, 4], elements).unwrap();
        let decoded = codec.decode(&codec.encode(&array).unwrap()).unwrap();
        assert_eq!(decoded, array);
        assert_eq!(decoded.get(&[1, 2]), Some(&ObjectValue::Tuple(vec![true.into(), ObjectValue::Nil])));
    }

    #[test]
    fn structured_dtype_trailer() {
        let dtype = DataType::structured(vec![
            ("id", DataType::uint(2, Endian::Big).unwrap()),
            ("name", DataType::vlen(VlenHint::Text)),
        ]);
        let codec = MsgPackCodec::default();
        let array = ObjectArray::new(
            dtype,
            vec![1],
            vec![ObjectValue::Tuple(vec![1i64.into(), "one".into()])],
        )
        .unwrap();
        let decoded = codec.decode(&codec.encode(&array).unwrap()).unwrap();
        // The legacy vlen hint comes back as a plain object field.
        assert_eq!(
            decoded.dtype(),
            &DataType::structured(vec![
                ("id", DataType::uint(2, Endian::Big).unwrap()),
                ("name", DataType::object()),
            ])
        );
        assert_eq!(decoded.elements(), array.elements());
    }

    #[test]
    fn single_float_and_raw() {
        let codec = MsgPackCodec {
            raw: true,
            use_single_float: true,
            use_bin_type: true,
        };
        let array = ObjectArray::new(
            DataType::object(),
            vec![2],
            vec![ObjectValue::Float(0.1), "txt".into()],
        )
        .unwrap();
        let decoded = codec.decode(&codec.encode(&array).unwrap()).unwrap();
        assert_eq!(decoded.elements()[0], ObjectValue::Float(0.1f32 as f64));
        assert_eq!(decoded.elements()[1], ObjectValue::Bytes(b"txt".to_vec()));
        assert_eq!(decoded.shape(), &[2]);
        assert_eq!(decoded.dtype(), &DataType::object());
    }

    #[test]
    fn bin_type_is_required() {
        let codec = MsgPackCodec {
            use_bin_type: false,
            ..Default::default()
        };
        let array = ObjectArray::new(DataType::object(), vec![0], vec![]).unwrap();
        assert!(matches!(codec.encode(&array), Err(ZarrError::Encode(_))));
    }

    #[test]
    fn malformed_payloads() {
        let codec = MsgPackCodec::default();
        let only_items = rmp_serde::to_vec(&vec!["foo"]).unwrap();
        assert!(matches!(
            codec.decode(&only_items),
            Err(ZarrError::ObjectCodecDecode(_))
        ));

        let short = rmp_serde::to_vec(&("foo", "|O", vec![2u32])).unwrap();
        let err = codec.decode(&short).unwrap_err();
        assert!(matches!(err, ZarrError::ObjectCodecDecode(_)));
        assert!(err.to_string().contains("shape"));

        assert!(matches!(
            codec.decode(&[0xc1]),
            Err(ZarrError::ObjectCodecDecode(_))
        ));
        assert!(codec.decode(&rmp_serde::to_vec(&7u8).unwrap()).is_err());

        let huge = rmp_serde::to_vec(&("|O", vec![1u64 << 32, 1u64 << 32, 4u64])).unwrap();
        let err = codec.decode(&huge).unwrap_err();
        assert!(matches!(err, ZarrError::ObjectCodecDecode(_)));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn maps_with_a_type_key_stay_maps() {
        let codec = MsgPackCodec::default();
        let lookalike = ObjectValue::Map(vec![
            ("__type__".into(), "tuple".into()),
            ("value".into(), ObjectValue::List(vec![1i64.into()])),
        ]);
        let dict_lookalike = ObjectValue::Map(vec![
            ("__type__".into(), "dict".into()),
            ("value".into(), ObjectValue::List(vec![])),
            (2i64.into(), ObjectValue::Nil),
        ]);
        let array = ObjectArray::new(
            DataType::object(),
            vec![3],
            vec![
                lookalike.clone(),
                dict_lookalike.clone(),
                ObjectValue::Tuple(vec![1i64.into()]),
            ],
        )
        .unwrap();
        let decoded = codec.decode(&codec.encode(&array).unwrap()).unwrap();
        assert_eq!(decoded.get(&[0]), Some(&lookalike));
        assert_eq!(decoded.get(&[1]), Some(&dict_lookalike));
        assert_eq!(decoded.get(&[2]), Some(&ObjectValue::Tuple(vec![1i64.into()])));

        // Maps without the key keep the plain msgpack map form.
        let plain = ObjectValue::Map(vec![("a".into(), 1i64.into())]);
        let array = ObjectArray::new(DataType::object(), vec![1], vec![plain.clone()]).unwrap();
        let bytes = codec.encode(&array).unwrap();
        let raw: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(raw[0], json!({"a": 1}));
        assert_eq!(codec.decode(&bytes).unwrap().get(&[0]), Some(&plain));
    }

    #[test]
    fn config_round_trip() {
        let config = MsgPackCodec::default().config();
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"id": "msgpack3", "raw": false, "use_single_float": false, "use_bin_type": true})
        );
        assert_eq!(MsgPackCodec::from_config(&config).unwrap(), MsgPackCodec::default());
        assert_eq!(
            MsgPackCodec::from_config(&CodecConfig::new("msgpack3")).unwrap(),
            MsgPackCodec::default()
        );
        assert!(MsgPackCodec::from_config(&CodecConfig::new("vlen-utf8")).is_err());
    }
}

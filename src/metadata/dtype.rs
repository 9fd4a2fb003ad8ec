//! NumPy-style dtype strings and structured field lists.
//!
//! A primitive type is written as a type string such as `"<f8"`, `"|S10"`
//! or `"<M8[ns]"`. A structured type is a JSON list of `[name, type]` or
//! `[name, type, shape]` entries, where `type` may itself be a list.

use std::collections::HashSet;

use serde_json::Value;

use crate::error::{ZarrError, ZarrResult};
use crate::types::{DataType, Endian, Field, PrimitiveType, TimeUnit, TypeKind};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a dtype to its JSON form.
///
/// The returned flag is true when any field carried the legacy
/// variable-length object hint; such fields are written as the canonical
/// `"|O"` code and the owning array needs the msgpack object codec.
pub fn encode_dtype(dtype: &DataType) -> ZarrResult<(Value, bool)> {
    let mut varlen = false;
    let encoded = match dtype {
        DataType::Primitive(p) => Value::String(encode_primitive(p, &mut varlen)),
        DataType::Structured { fields, size } => encode_fields(fields, *size, &mut varlen)?,
        DataType::SubArray { .. } => {
            return Err(ZarrError::Encode(
                "sub-array dtypes must be split from the array shape before encoding".into(),
            ));
        }
    };
    Ok((encoded, varlen))
}

/// Render a primitive type as a type string, e.g. `<i4`.
pub fn type_str(p: &PrimitiveType) -> String {
    let order = p.byte_order.symbol();
    match p.kind {
        TypeKind::Object => "|O".to_string(),
        TypeKind::Unicode => format!("{order}U{}", p.size / 4),
        TypeKind::Datetime | TypeKind::Timedelta => match p.time_unit {
            Some(unit) => format!("{order}{}{}[{}]", p.kind.code(), p.size, unit.as_str()),
            None => format!("{order}{}{}", p.kind.code(), p.size),
        },
        kind => format!("{order}{}{}", kind.code(), p.size),
    }
}

fn encode_primitive(p: &PrimitiveType, varlen: &mut bool) -> String {
    if p.kind == TypeKind::Object && p.vlen.is_some() {
        log::trace!("recovering legacy vlen object field as |O");
        *varlen = true;
    }
    type_str(p)
}

fn encode_fields(fields: &[Field], size: usize, varlen: &mut bool) -> ZarrResult<Value> {
    let mut entries = Vec::with_capacity(fields.len());
    let mut cursor = 0;
    for field in fields {
        if field.offset > cursor {
            entries.push(padding(field.offset - cursor));
        } else if field.offset < cursor {
            return Err(ZarrError::Encode(format!(
                "field '{}' overlaps the previous field",
                field.name
            )));
        }
        cursor = field.offset.saturating_add(field.dtype.size());

        let name = Value::String(field.name.clone());
        let (base, shape) = flatten_subarray(&field.dtype);
        let encoded = match base {
            DataType::Primitive(p) => Value::String(encode_primitive(p, varlen)),
            DataType::Structured { fields, size } => encode_fields(fields, *size, varlen)?,
            DataType::SubArray { .. } => {
                return Err(ZarrError::Encode(format!(
                    "field '{}' has an unflattened sub-array type",
                    field.name
                )));
            }
        };
        if shape.is_empty() {
            entries.push(Value::Array(vec![name, encoded]));
        } else {
            let shape = shape.into_iter().map(Value::from).collect();
            entries.push(Value::Array(vec![name, encoded, Value::Array(shape)]));
        }
    }
    if size > cursor {
        entries.push(padding(size - cursor));
    }
    Ok(Value::Array(entries))
}

fn padding(bytes: usize) -> Value {
    Value::Array(vec![Value::String(String::new()), Value::String(format!("|V{bytes}"))])
}

/// Collapse nested sub-arrays into one base type and a combined shape.
fn flatten_subarray(dtype: &DataType) -> (&DataType, Vec<usize>) {
    let mut shape = Vec::new();
    let mut current = dtype;
    while let DataType::SubArray { base, shape: dims } = current {
        shape.extend_from_slice(dims);
        current = base;
    }
    (current, shape)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a dtype from its JSON form (type string or field list).
pub fn decode_dtype(value: &Value) -> ZarrResult<DataType> {
    match value {
        Value::String(s) => parse_type_str(s),
        Value::Array(entries) => decode_fields(entries),
        other => Err(ZarrError::TypeDecode(format!(
            "expected a type string or a field list, got {other}"
        ))),
    }
}

fn decode_fields(entries: &[Value]) -> ZarrResult<DataType> {
    let mut fields = Vec::with_capacity(entries.len());
    let mut names = HashSet::new();
    let mut offset: usize = 0;

    for (index, entry) in entries.iter().enumerate() {
        let parts = match entry.as_array() {
            Some(parts) if parts.len() == 2 || parts.len() == 3 => parts,
            _ => {
                return Err(ZarrError::TypeDecode(format!(
                    "field entry must be [name, type] or [name, type, shape], got {entry}"
                )));
            }
        };
        let name = parts[0].as_str().ok_or_else(|| {
            ZarrError::TypeDecode(format!("field name must be a string, got {}", parts[0]))
        })?;
        let mut dtype = decode_dtype(&parts[1])?;
        if let Some(shape) = parts.get(2) {
            // numpy treats a `()` shape as no sub-array at all
            let shape = decode_shape(shape)?;
            if !shape.is_empty() {
                dtype = DataType::subarray(dtype, shape);
            }
        }
        let size = dtype.checked_size().ok_or_else(|| {
            ZarrError::TypeDecode(format!("field '{name}' is too large"))
        })?;
        let end = offset.checked_add(size).ok_or_else(|| {
            ZarrError::TypeDecode(format!("field '{name}' ends past usize::MAX"))
        })?;

        // Unnamed void entries are layout padding, not fields.
        if name.is_empty() && matches!(dtype, DataType::Primitive(_)) && dtype.kind() == TypeKind::Void {
            offset = end;
            continue;
        }
        let name = if name.is_empty() {
            format!("f{index}")
        } else {
            name.to_string()
        };
        if !names.insert(name.clone()) {
            return Err(ZarrError::TypeDecode(format!("duplicate field name '{name}'")));
        }

        fields.push(Field {
            name,
            dtype,
            offset,
        });
        offset = end;
    }

    DataType::structured_with_offsets(fields, offset)
}

fn decode_shape(value: &Value) -> ZarrResult<Vec<usize>> {
    let as_dim = |v: &Value| {
        v.as_u64()
            .and_then(|d| usize::try_from(d).ok())
            .ok_or_else(|| ZarrError::TypeDecode(format!("invalid sub-array dimension {v}")))
    };
    match value {
        Value::Array(dims) => dims.iter().map(as_dim).collect(),
        // numpy accepts a bare integer for one-dimensional sub-arrays
        Value::Number(_) => Ok(vec![as_dim(value)?]),
        other => Err(ZarrError::TypeDecode(format!("invalid sub-array shape {other}"))),
    }
}

/// Parse a NumPy type string (e.g. `"<f8"`, `">i4"`, `"|b1"`, `"<M8[ns]"`).
/// A missing byte-order prefix means native order.
pub fn parse_type_str(s: &str) -> ZarrResult<DataType> {
    let err = |reason: String| ZarrError::TypeDecode(format!("{reason} in '{s}'"));

    let mut chars = s.chars();
    let (byte_order, code) = match chars.next() {
        Some('<') => (Endian::Little, chars.next()),
        Some('>') => (Endian::Big, chars.next()),
        Some('|') => (Endian::NotApplicable, chars.next()),
        Some('=') => (Endian::native(), chars.next()),
        first => (Endian::native(), first),
    };
    let code = code.ok_or_else(|| err("missing type code".into()))?;
    let kind = TypeKind::from_code(code).ok_or_else(|| err(format!("unknown type code '{code}'")))?;
    let rest = chars.as_str();

    match kind {
        TypeKind::Object => match rest {
            "" | "8" => Ok(DataType::object()),
            _ => Err(err(format!("invalid object size '{rest}'"))),
        },
        TypeKind::Datetime | TypeKind::Timedelta => {
            let (size, unit) = parse_with_time_unit(rest).map_err(err)?;
            if size != 8 {
                return Err(err(format!("unsupported size {size} for {kind}")));
            }
            if kind == TypeKind::Datetime {
                DataType::datetime(unit, byte_order)
            } else {
                DataType::timedelta(unit, byte_order)
            }
        }
        _ => {
            let count: usize = rest
                .parse()
                .map_err(|_| err(format!("invalid byte size '{rest}'")))?;
            let size = if kind == TypeKind::Unicode { count * 4 } else { count };
            DataType::primitive(kind, size, byte_order).map_err(|e| match e {
                ZarrError::TypeDecode(reason) => err(reason),
                other => other,
            })
        }
    }
}

fn parse_with_time_unit(s: &str) -> Result<(usize, Option<TimeUnit>), String> {
    let (size_str, unit) = match s.find('[') {
        Some(bracket_pos) => {
            let rest = &s[bracket_pos + 1..];
            let unit = rest
                .strip_suffix(']')
                .ok_or("Missing closing bracket in datetime format")?;
            (&s[..bracket_pos], Some(unit.parse::<TimeUnit>()?))
        }
        None => (s, None),
    };
    let byte_size: usize = size_str
        .parse()
        .map_err(|_| format!("Invalid byte size in datetime format: {size_str}"))?;
    Ok((byte_size, unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VlenHint;
    use serde_json::json;

    fn round_trip(dtype: &DataType) -> DataType {
        let (encoded, varlen) = encode_dtype(dtype).unwrap();
        assert!(!varlen);
        decode_dtype(&encoded).unwrap()
    }

    #[test]
    fn primitive_strings() {
        for s in [
            "|b1", "|i1", "<i2", ">i4", "<i8", "|u1", ">u2", "<u4", "<u8", "<f2", ">f4", "<f8",
            "<c8", ">c16", "|S10", "<U3", ">U1", "|V7", "|O", "<M8[ns]", ">m8[D]", "<M8",
        ] {
            let dtype = parse_type_str(s).unwrap();
            let (encoded, varlen) = encode_dtype(&dtype).unwrap();
            assert_eq!(encoded, json!(s), "{s}");
            assert!(!varlen);
        }
    }

    #[test]
    fn unicode_width_is_in_characters() {
        let dtype = parse_type_str("<U5").unwrap();
        assert_eq!(dtype.size(), 20);
        assert_eq!(dtype.kind(), TypeKind::Unicode);
    }

    #[test]
    fn single_byte_types_drop_byte_order() {
        assert_eq!(parse_type_str("<i1").unwrap(), parse_type_str("|i1").unwrap());
        assert_eq!(parse_type_str("<S4").unwrap(), parse_type_str("|S4").unwrap());
        assert_eq!(parse_type_str("O").unwrap(), DataType::object());
    }

    #[test]
    fn invalid_type_strings() {
        for s in ["", "<", "<x4", "<f3", "<i", "|b2", "<M4[ns]", "<M8[fortnight]", "<M8[ns", "|O4"] {
            assert!(
                matches!(parse_type_str(s), Err(ZarrError::TypeDecode(_))),
                "{s} should not parse"
            );
        }
        assert!(matches!(decode_dtype(&json!(4)), Err(ZarrError::TypeDecode(_))));
        assert!(matches!(decode_dtype(&json!([["a"]])), Err(ZarrError::TypeDecode(_))));
        assert!(matches!(
            decode_dtype(&json!([["a", "<i4"], ["a", "<f8"]])),
            Err(ZarrError::TypeDecode(_))
        ));
    }

    #[test]
    fn structured_with_nested_and_subarray_fields() {
        let json = json!([
            ["id", "<i8"],
            ["pos", "<f4", [3]],
            ["meta", [["flag", "|b1"], ["code", "|S4"]]],
            ["grid", [["v", ">u2"]], [2, 2]]
        ]);
        let dtype = decode_dtype(&json).unwrap();
        assert_eq!(dtype.size(), 8 + 12 + 5 + 8);
        let (encoded, varlen) = encode_dtype(&dtype).unwrap();
        assert_eq!(encoded, json);
        assert!(!varlen);
        assert_eq!(round_trip(&dtype), dtype);

        let scalar_shape = decode_dtype(&json!([["a", "<i4", []], ["b", "|u1", []]])).unwrap();
        assert_eq!(
            scalar_shape,
            DataType::structured(vec![
                ("a", DataType::int(4, Endian::Little).unwrap()),
                ("b", DataType::uint(1, Endian::NotApplicable).unwrap()),
            ])
        );
        assert_eq!(
            encode_dtype(&scalar_shape).unwrap().0,
            json!([["a", "<i4"], ["b", "|u1"]])
        );
        assert_eq!(round_trip(&scalar_shape), scalar_shape);
    }

    #[test]
    fn oversized_fields_are_rejected() {
        for json in [
            json!([["a", "<f8", [4294967296u64, 4294967296u64]]]),
            json!([["a", "<f8", [usize::MAX]]]),
            json!([["a", "|u1", [usize::MAX]], ["b", "|u1"]]),
            json!([["a", "|V18446744073709551615"], ["b", "|u1"]]),
            json!([["", "|V18446744073709551615"], ["", "|V1"]]),
        ] {
            assert!(
                matches!(decode_dtype(&json), Err(ZarrError::TypeDecode(_))),
                "{json}"
            );
        }
    }

    #[test]
    fn padding_becomes_offsets() {
        let json = json!([["a", "|u1"], ["", "|V3"], ["b", "<i4"], ["", "|V4"]]);
        let dtype = decode_dtype(&json).unwrap();
        let DataType::Structured { fields, size } = &dtype else {
            panic!("expected structured type");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].offset, 4);
        assert_eq!(*size, 12);
        assert_eq!(encode_dtype(&dtype).unwrap().0, json);
    }

    #[test]
    fn legacy_vlen_fields_are_canonicalised() {
        let dtype = DataType::structured(vec![
            ("id", DataType::int(4, Endian::Little).unwrap()),
            ("name", DataType::vlen(VlenHint::Text)),
            (
                "inner",
                DataType::structured(vec![("blob", DataType::vlen(VlenHint::Binary))]),
            ),
        ]);
        let (encoded, varlen) = encode_dtype(&dtype).unwrap();
        assert!(varlen);
        assert_eq!(
            encoded,
            json!([["id", "<i4"], ["name", "|O"], ["inner", [["blob", "|O"]]]])
        );
        // The text/binary hint does not survive the round trip.
        let decoded = decode_dtype(&encoded).unwrap();
        assert_ne!(decoded, dtype);
        assert!(decoded.has_object());

        let (_, plain) = encode_dtype(&DataType::object()).unwrap();
        assert!(!plain);
    }

    #[test]
    fn top_level_subarray_is_rejected() {
        let dtype = DataType::subarray(DataType::float(8, Endian::Little).unwrap(), vec![2]);
        assert!(matches!(encode_dtype(&dtype), Err(ZarrError::Encode(_))));
    }
}

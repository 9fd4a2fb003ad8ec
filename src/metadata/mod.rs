pub mod dtype;
pub mod v2;

use base64::{Engine, prelude::BASE64_STANDARD};
use half::f16;
use num_complex::Complex;
use serde_json::Value;

use crate::error::{ZarrError, ZarrResult};
use crate::types::{
    DataType, ObjectValue, PrimitiveType, TypeKind, ZarrValue, bytes_to_value, default_scalar,
    strip_nuls, value_to_bytes,
};

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a fill value from its JSON form, given the element type.
///
/// JSON `null` means "no fill value" for every type. Sub-array types are
/// decoded against their base type.
pub fn decode_fill_value(value: &Value, dtype: &DataType) -> ZarrResult<Option<ZarrValue>> {
    if value.is_null() {
        return Ok(None);
    }
    let (base, _) = dtype.subarray_split();
    let decoded = match base {
        DataType::Primitive(p) => decode_primitive(value, p)?,
        structured => decode_void(value, structured)?,
    };
    Ok(Some(decoded))
}

fn decode_primitive(value: &Value, p: &PrimitiveType) -> ZarrResult<ZarrValue> {
    match p.kind {
        TypeKind::Float => decode_float(value, p.kind, p.size),
        TypeKind::Complex => {
            let parts = value
                .as_array()
                .filter(|parts| parts.len() == 2)
                .ok_or_else(|| ZarrError::fill(p.kind, format!("expected [real, imag], got {value}")))?;
            let re = decode_float(&parts[0], p.kind, p.size / 2)?;
            let im = decode_float(&parts[1], p.kind, p.size / 2)?;
            Ok(match (re, im) {
                (ZarrValue::Float32(re), ZarrValue::Float32(im)) => {
                    ZarrValue::Complex64(Complex::new(re, im))
                }
                (re, im) => ZarrValue::Complex128(Complex::new(as_f64(&re), as_f64(&im))),
            })
        }
        TypeKind::Bytes => {
            let raw = match value {
                Value::String(s) => match BASE64_STANDARD.decode(s) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // Values written before fill values were base64
                        // encoded (e.g. "0") are taken verbatim.
                        log::debug!("fill value {s:?} is not base64 ({e}), using it verbatim");
                        s.as_bytes().to_vec()
                    }
                },
                Value::Number(n) => n.to_string().into_bytes(),
                other => return Err(ZarrError::fill(p.kind, format!("expected a string, got {other}"))),
            };
            if raw.len() > p.size {
                return Err(ZarrError::fill(
                    p.kind,
                    format!("{} bytes do not fit in {}", raw.len(), p.size),
                ));
            }
            Ok(ZarrValue::Bytes(strip_nuls(&raw).to_vec()))
        }
        TypeKind::Void => decode_void(value, &DataType::Primitive(p.clone())),
        TypeKind::Unicode => match value {
            Value::String(s) => Ok(ZarrValue::String(s.clone())),
            other => Err(ZarrError::fill(p.kind, format!("expected a string, got {other}"))),
        },
        TypeKind::Bool => match value {
            Value::Bool(b) => Ok(ZarrValue::Bool(*b)),
            Value::Number(_) => Ok(ZarrValue::Bool(integer_literal(value, p.kind)? != 0)),
            other => Err(ZarrError::fill(p.kind, format!("expected a bool, got {other}"))),
        },
        TypeKind::Int | TypeKind::UInt => {
            let v = integer_literal(value, p.kind)?;
            Ok(match (p.kind, p.size) {
                (TypeKind::Int, 1) => ZarrValue::Int8(narrow(v, p)?),
                (TypeKind::Int, 2) => ZarrValue::Int16(narrow(v, p)?),
                (TypeKind::Int, 4) => ZarrValue::Int32(narrow(v, p)?),
                (TypeKind::Int, _) => ZarrValue::Int64(narrow(v, p)?),
                (_, 1) => ZarrValue::UInt8(narrow(v, p)?),
                (_, 2) => ZarrValue::UInt16(narrow(v, p)?),
                (_, 4) => ZarrValue::UInt32(narrow(v, p)?),
                (_, _) => ZarrValue::UInt64(narrow(v, p)?),
            })
        }
        TypeKind::Datetime | TypeKind::Timedelta => {
            let count = match value {
                Value::String(s) if s == "NaT" => i64::MIN,
                _ => narrow(integer_literal(value, p.kind)?, p)?,
            };
            Ok(if p.kind == TypeKind::Datetime {
                ZarrValue::DateTime64(count)
            } else {
                ZarrValue::TimeDelta64(count)
            })
        }
        TypeKind::Object => Ok(ZarrValue::Object(ObjectValue::from_json(value))),
    }
}

/// Float fill values: the three special tokens, otherwise a numeric literal
/// narrowed to `size` bytes.
fn decode_float(value: &Value, kind: TypeKind, size: usize) -> ZarrResult<ZarrValue> {
    let f = match value {
        Value::String(s) if s == "NaN" => f64::NAN,
        Value::String(s) if s == "Infinity" => f64::INFINITY,
        Value::String(s) if s == "-Infinity" => f64::NEG_INFINITY,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .ok_or_else(|| ZarrError::fill(kind, format!("{s:?} is not a number")))?,
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ZarrError::fill(kind, format!("{n} is not a number")))?,
        other => return Err(ZarrError::fill(kind, format!("expected a number, got {other}"))),
    };

    let narrowed = match size {
        2 => ZarrValue::Float16(f16::from_f64(f)),
        4 => ZarrValue::Float32(f as f32),
        _ => ZarrValue::Float64(f),
    };
    if f.is_finite() && as_f64(&narrowed).is_infinite() {
        return Err(ZarrError::fill(
            kind,
            format!("{f} does not fit in a {size}-byte float"),
        ));
    }
    Ok(narrowed)
}

fn as_f64(value: &ZarrValue) -> f64 {
    match value {
        ZarrValue::Float16(v) => v.to_f64(),
        ZarrValue::Float32(v) => f64::from(*v),
        ZarrValue::Float64(v) => *v,
        _ => f64::NAN,
    }
}

/// Read an integer literal. Integral floats and numeric strings are
/// accepted the way numpy accepts them.
fn integer_literal(value: &Value, kind: TypeKind) -> ZarrResult<i128> {
    let invalid = || ZarrError::fill(kind, format!("{value} is not an integer"));
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i128::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(i128::from(u))
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 2f64.powi(64))
                    .map(|f| f as i128)
                    .ok_or_else(invalid)
            }
        }
        Value::String(s) => s.trim().parse::<i128>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn narrow<T: TryFrom<i128>>(v: i128, p: &PrimitiveType) -> ZarrResult<T> {
    T::try_from(v).map_err(|_| {
        ZarrError::fill(p.kind, format!("{v} does not fit in {} bytes", p.size))
    })
}

/// Raw and structured fill values are base64 encoded bytes of one element.
fn decode_void(value: &Value, dtype: &DataType) -> ZarrResult<ZarrValue> {
    let kind = dtype.kind();
    let encoded = value
        .as_str()
        .ok_or_else(|| ZarrError::fill(kind, format!("expected a base64 string, got {value}")))?;
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|source| ZarrError::InvalidBase64 { kind, source })?;

    if dtype.has_object() {
        if bytes.len() != dtype.size() {
            return Err(ZarrError::fill(
                kind,
                format!("{} bytes do not match item size {}", bytes.len(), dtype.size()),
            ));
        }
        // Object references cannot be restored from bytes; only the all-zero
        // pattern (an empty record) is accepted.
        return if bytes.iter().all(|b| *b == 0) {
            Ok(default_scalar(dtype))
        } else {
            Err(ZarrError::fill(
                TypeKind::Object,
                "non-zero fill value is not supported for a structured dtype containing objects",
            ))
        };
    }
    bytes_to_value(dtype, &bytes)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a fill value to its JSON form; the inverse of [`decode_fill_value`].
pub fn encode_fill_value(value: Option<&ZarrValue>, dtype: &DataType) -> ZarrResult<Value> {
    let Some(value) = value else {
        return Ok(Value::Null);
    };
    let (base, _) = dtype.subarray_split();
    match base {
        DataType::Primitive(p) => encode_primitive(value, p),
        other => encode_void(value, other),
    }
}

fn encode_primitive(value: &ZarrValue, p: &PrimitiveType) -> ZarrResult<Value> {
    let mismatch = || ZarrError::fill(p.kind, format!("value {value:?} does not match the dtype"));
    match (p.kind, value) {
        (TypeKind::Float, ZarrValue::Float16(_) | ZarrValue::Float32(_) | ZarrValue::Float64(_)) => {
            if value_to_bytes(&DataType::Primitive(p.clone()), value).is_err() {
                return Err(mismatch());
            }
            Ok(encode_float(as_f64(value)))
        }
        (TypeKind::Complex, ZarrValue::Complex64(c)) if p.size == 8 => Ok(Value::Array(vec![
            encode_float(f64::from(c.re)),
            encode_float(f64::from(c.im)),
        ])),
        (TypeKind::Complex, ZarrValue::Complex128(c)) if p.size == 16 => {
            Ok(Value::Array(vec![encode_float(c.re), encode_float(c.im)]))
        }
        (TypeKind::Bool, ZarrValue::Bool(b)) => Ok(Value::Bool(*b)),
        (TypeKind::Int, ZarrValue::Int8(v)) if p.size == 1 => Ok(Value::from(*v)),
        (TypeKind::Int, ZarrValue::Int16(v)) if p.size == 2 => Ok(Value::from(*v)),
        (TypeKind::Int, ZarrValue::Int32(v)) if p.size == 4 => Ok(Value::from(*v)),
        (TypeKind::Int, ZarrValue::Int64(v)) if p.size == 8 => Ok(Value::from(*v)),
        (TypeKind::UInt, ZarrValue::UInt8(v)) if p.size == 1 => Ok(Value::from(*v)),
        (TypeKind::UInt, ZarrValue::UInt16(v)) if p.size == 2 => Ok(Value::from(*v)),
        (TypeKind::UInt, ZarrValue::UInt32(v)) if p.size == 4 => Ok(Value::from(*v)),
        (TypeKind::UInt, ZarrValue::UInt64(v)) if p.size == 8 => Ok(Value::from(*v)),
        (TypeKind::Bytes, ZarrValue::Bytes(b)) if b.len() <= p.size => {
            Ok(Value::String(BASE64_STANDARD.encode(b)))
        }
        (TypeKind::Unicode, ZarrValue::String(s)) => Ok(Value::String(s.clone())),
        (TypeKind::Datetime, ZarrValue::DateTime64(v))
        | (TypeKind::Timedelta, ZarrValue::TimeDelta64(v)) => Ok(Value::from(*v)),
        (TypeKind::Void, ZarrValue::Raw(_)) => encode_void(value, &DataType::Primitive(p.clone())),
        (TypeKind::Object, ZarrValue::Object(obj)) => obj
            .to_json()
            .map_err(|e| ZarrError::fill(p.kind, e.to_string())),
        _ => Err(mismatch()),
    }
}

fn encode_float(f: f64) -> Value {
    if f.is_nan() {
        Value::String("NaN".into())
    } else if f == f64::INFINITY {
        Value::String("Infinity".into())
    } else if f == f64::NEG_INFINITY {
        Value::String("-Infinity".into())
    } else {
        // Finite, so `from_f64` cannot fail.
        serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

fn encode_void(value: &ZarrValue, dtype: &DataType) -> ZarrResult<Value> {
    let bytes = value_to_bytes(dtype, value)?;
    if dtype.has_object() && bytes.iter().any(|b| *b != 0) {
        return Err(ZarrError::fill(
            TypeKind::Object,
            "non-zero fill value is not supported for a structured dtype containing objects",
        ));
    }
    Ok(Value::String(BASE64_STANDARD.encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endian;
    use serde_json::json;

    fn f8() -> DataType {
        DataType::float(8, Endian::Little).unwrap()
    }

    fn round_trip(value: ZarrValue, dtype: &DataType) {
        let encoded = encode_fill_value(Some(&value), dtype).unwrap();
        let decoded = decode_fill_value(&encoded, dtype).unwrap();
        assert_eq!(decoded, Some(value), "{encoded}");
    }

    #[test]
    fn null_is_absent_for_every_type() {
        for dtype in [f8(), DataType::object(), DataType::bool()] {
            assert_eq!(decode_fill_value(&Value::Null, &dtype).unwrap(), None);
            assert_eq!(encode_fill_value(None, &dtype).unwrap(), Value::Null);
        }
    }

    #[test]
    fn float_special_tokens() {
        let dtype = f8();
        for (token, expected) in [
            ("NaN", f64::NAN),
            ("Infinity", f64::INFINITY),
            ("-Infinity", f64::NEG_INFINITY),
        ] {
            let decoded = decode_fill_value(&json!(token), &dtype).unwrap().unwrap();
            assert_eq!(decoded, ZarrValue::Float64(expected));
            assert_eq!(encode_fill_value(Some(&decoded), &dtype).unwrap(), json!(token));
        }
        // Tokens are case-sensitive.
        assert!(decode_fill_value(&json!("nan"), &dtype).is_err());
        assert!(decode_fill_value(&json!("infinity"), &dtype).is_err());
    }

    #[test]
    fn float_widths() {
        let f2 = DataType::float(2, Endian::Little).unwrap();
        let f4 = DataType::float(4, Endian::Big).unwrap();
        round_trip(ZarrValue::Float16(f16::from_f32(1.5)), &f2);
        round_trip(ZarrValue::Float32(0.1), &f4);
        round_trip(ZarrValue::Float64(-2.5e300), &f8());
        assert_eq!(
            decode_fill_value(&json!(3), &f4).unwrap(),
            Some(ZarrValue::Float32(3.0))
        );
        assert!(matches!(
            decode_fill_value(&json!(1e300), &f4),
            Err(ZarrError::UnsupportedFillValue { kind: TypeKind::Float, .. })
        ));
        assert!(encode_fill_value(Some(&ZarrValue::Float32(1.0)), &f8()).is_err());
    }

    #[test]
    fn complex_pairs() {
        let c16 = DataType::complex(16, Endian::Little).unwrap();
        let c8 = DataType::complex(8, Endian::Little).unwrap();
        let decoded = decode_fill_value(&json!(["NaN", "-Infinity"]), &c16).unwrap();
        assert_eq!(
            decoded,
            Some(ZarrValue::Complex128(Complex::new(f64::NAN, f64::NEG_INFINITY)))
        );
        round_trip(ZarrValue::Complex128(Complex::new(f64::INFINITY, 2.0)), &c16);
        round_trip(ZarrValue::Complex64(Complex::new(1.25, f32::NAN)), &c8);
        assert!(decode_fill_value(&json!(1.0), &c16).is_err());
        assert!(decode_fill_value(&json!([1.0]), &c16).is_err());
    }

    #[test]
    fn integers_must_fit_their_width() {
        let i1 = DataType::int(1, Endian::NotApplicable).unwrap();
        let u2 = DataType::uint(2, Endian::Little).unwrap();
        let u8_type = DataType::uint(8, Endian::Little).unwrap();
        assert_eq!(decode_fill_value(&json!(-128), &i1).unwrap(), Some(ZarrValue::Int8(-128)));
        assert!(matches!(
            decode_fill_value(&json!(128), &i1),
            Err(ZarrError::UnsupportedFillValue { kind: TypeKind::Int, .. })
        ));
        assert!(decode_fill_value(&json!(-1), &u2).is_err());
        assert!(decode_fill_value(&json!(1.5), &u2).is_err());
        assert_eq!(decode_fill_value(&json!(7.0), &u2).unwrap(), Some(ZarrValue::UInt16(7)));
        round_trip(ZarrValue::UInt64(u64::MAX), &u8_type);
        round_trip(ZarrValue::Int8(-3), &i1);
    }

    #[test]
    fn bool_and_time_values() {
        round_trip(ZarrValue::Bool(true), &DataType::bool());
        assert_eq!(
            decode_fill_value(&json!(0), &DataType::bool()).unwrap(),
            Some(ZarrValue::Bool(false))
        );
        let m8 = DataType::datetime(Some(crate::types::TimeUnit::Nanosecond), Endian::Little).unwrap();
        round_trip(ZarrValue::DateTime64(1_600_000_000_000_000_000), &m8);
        assert_eq!(
            decode_fill_value(&json!("NaT"), &m8).unwrap(),
            Some(ZarrValue::DateTime64(i64::MIN))
        );
        let td = DataType::timedelta(None, Endian::Big).unwrap();
        round_trip(ZarrValue::TimeDelta64(-5), &td);
    }

    #[test]
    fn byte_strings_fall_back_to_verbatim() {
        let s3 = DataType::primitive(TypeKind::Bytes, 3, Endian::NotApplicable).unwrap();
        assert_eq!(
            decode_fill_value(&json!("0"), &s3).unwrap(),
            Some(ZarrValue::Bytes(b"0".to_vec()))
        );
        assert_eq!(
            decode_fill_value(&json!(0), &s3).unwrap(),
            Some(ZarrValue::Bytes(b"0".to_vec()))
        );
        assert_eq!(
            decode_fill_value(&json!("YWJj"), &s3).unwrap(),
            Some(ZarrValue::Bytes(b"abc".to_vec()))
        );
        assert!(decode_fill_value(&json!("YWJjZA=="), &s3).is_err());
        assert_eq!(
            encode_fill_value(Some(&ZarrValue::Bytes(b"ab".to_vec())), &s3).unwrap(),
            json!("YWI=")
        );
        round_trip(ZarrValue::Bytes(b"xyz".to_vec()), &s3);
    }

    #[test]
    fn unicode_passes_through() {
        let u4 = DataType::primitive(TypeKind::Unicode, 16, Endian::Little).unwrap();
        assert_eq!(
            decode_fill_value(&json!("héé"), &u4).unwrap(),
            Some(ZarrValue::String("héé".into()))
        );
        round_trip(ZarrValue::String("abcd".into()), &u4);
        // Width is not enforced in either direction.
        round_trip(ZarrValue::String("longer than four".into()), &u4);
        assert!(decode_fill_value(&json!(4), &u4).is_err());
    }

    #[test]
    fn raw_void_values() {
        let v4 = DataType::primitive(TypeKind::Void, 4, Endian::NotApplicable).unwrap();
        round_trip(ZarrValue::Raw(vec![1, 2, 3, 4]), &v4);
        assert!(matches!(
            decode_fill_value(&json!("not base64!"), &v4),
            Err(ZarrError::InvalidBase64 { kind: TypeKind::Void, .. })
        ));
        assert!(decode_fill_value(&json!("AQI="), &v4).is_err());
    }

    #[test]
    fn structured_values_use_the_record_layout() {
        let dtype = DataType::structured(vec![
            ("a", DataType::int(2, Endian::Little).unwrap()),
            ("b", DataType::float(4, Endian::Big).unwrap()),
        ]);
        let value = ZarrValue::Record(vec![ZarrValue::Int16(1), ZarrValue::Float32(2.0)]);
        let encoded = encode_fill_value(Some(&value), &dtype).unwrap();
        // 01 00 | 40 00 00 00
        assert_eq!(encoded, json!(BASE64_STANDARD.encode([1u8, 0, 0x40, 0, 0, 0])));
        round_trip(value, &dtype);
    }

    #[test]
    fn structured_object_fill_must_be_zero() {
        let dtype = DataType::structured(vec![
            ("id", DataType::int(4, Endian::Little).unwrap()),
            ("name", DataType::object()),
        ]);
        let zeros = json!(BASE64_STANDARD.encode([0u8; 12]));
        assert_eq!(
            decode_fill_value(&zeros, &dtype).unwrap(),
            Some(ZarrValue::Record(vec![
                ZarrValue::Int32(0),
                ZarrValue::Object(ObjectValue::Nil)
            ]))
        );
        for short in [String::new(), BASE64_STANDARD.encode([0u8; 4])] {
            assert!(matches!(
                decode_fill_value(&json!(short), &dtype),
                Err(ZarrError::UnsupportedFillValue { .. })
            ));
        }
        let mut bytes = [0u8; 12];
        bytes[0] = 1;
        assert!(matches!(
            decode_fill_value(&json!(BASE64_STANDARD.encode(bytes)), &dtype),
            Err(ZarrError::UnsupportedFillValue { kind: TypeKind::Object, .. })
        ));
        round_trip(default_scalar(&dtype), &dtype);
        let named = ZarrValue::Record(vec![
            ZarrValue::Int32(0),
            ZarrValue::Object(ObjectValue::from("x")),
        ]);
        assert!(encode_fill_value(Some(&named), &dtype).is_err());
    }

    #[test]
    fn subarray_types_use_their_base() {
        let dtype = DataType::subarray(f8(), vec![2, 2]);
        assert_eq!(
            decode_fill_value(&json!("NaN"), &dtype).unwrap(),
            Some(ZarrValue::Float64(f64::NAN))
        );
        assert_eq!(
            encode_fill_value(Some(&ZarrValue::Float64(0.5)), &dtype).unwrap(),
            json!(0.5)
        );
    }

    #[test]
    fn object_values_convert_through_json() {
        let dtype = DataType::object();
        let decoded = decode_fill_value(&json!(0), &dtype).unwrap();
        assert_eq!(decoded, Some(ZarrValue::Object(ObjectValue::Int(0))));
        round_trip(ZarrValue::Object(ObjectValue::from("")), &dtype);
        assert!(
            encode_fill_value(Some(&ZarrValue::Object(ObjectValue::Bytes(vec![1]))), &dtype)
                .is_err()
        );
    }
}

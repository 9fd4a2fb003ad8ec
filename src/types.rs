use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use num_complex::Complex;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use crate::array::element_count;
use crate::error::{ZarrError, ZarrResult};

// ---------------------------------------------------------------------------
// Endian
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
    NotApplicable,
}

impl Endian {
    /// Byte order of the host.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub(crate) fn symbol(self) -> char {
        match self {
            Endian::Little => '<',
            Endian::Big => '>',
            Endian::NotApplicable => '|',
        }
    }
}

// ---------------------------------------------------------------------------
// ArrayOrder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArrayOrder {
    #[default]
    C,
    F,
}

// ---------------------------------------------------------------------------
// TypeKind
// ---------------------------------------------------------------------------

/// The closed set of element kinds a primitive type can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Bool,
    Int,
    UInt,
    Float,
    Complex,
    /// Fixed-width byte string (`S`).
    Bytes,
    /// Fixed-width UCS-4 string (`U`).
    Unicode,
    /// Generic object (`O`).
    Object,
    Datetime,
    Timedelta,
    /// Raw bytes (`V`). Structured and sub-array types also report this kind.
    Void,
}

impl TypeKind {
    /// The one-letter numpy type code.
    pub fn code(self) -> char {
        match self {
            TypeKind::Bool => 'b',
            TypeKind::Int => 'i',
            TypeKind::UInt => 'u',
            TypeKind::Float => 'f',
            TypeKind::Complex => 'c',
            TypeKind::Bytes => 'S',
            TypeKind::Unicode => 'U',
            TypeKind::Object => 'O',
            TypeKind::Datetime => 'M',
            TypeKind::Timedelta => 'm',
            TypeKind::Void => 'V',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            'b' => TypeKind::Bool,
            'i' => TypeKind::Int,
            'u' => TypeKind::UInt,
            'f' => TypeKind::Float,
            'c' => TypeKind::Complex,
            'S' => TypeKind::Bytes,
            'U' => TypeKind::Unicode,
            'O' => TypeKind::Object,
            'M' => TypeKind::Datetime,
            'm' => TypeKind::Timedelta,
            'V' => TypeKind::Void,
            _ => return None,
        })
    }

    /// Kinds whose values have no byte order.
    fn is_byte_order_free(self) -> bool {
        matches!(
            self,
            TypeKind::Bool | TypeKind::Bytes | TypeKind::Object | TypeKind::Void
        )
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Bool => "bool",
            TypeKind::Int => "int",
            TypeKind::UInt => "uint",
            TypeKind::Float => "float",
            TypeKind::Complex => "complex",
            TypeKind::Bytes => "bytes",
            TypeKind::Unicode => "unicode",
            TypeKind::Object => "object",
            TypeKind::Datetime => "datetime64",
            TypeKind::Timedelta => "timedelta64",
            TypeKind::Void => "void",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// TimeUnit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
    Picosecond,
    Femtosecond,
    Attosecond,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Year => "Y",
            TimeUnit::Month => "M",
            TimeUnit::Week => "W",
            TimeUnit::Day => "D",
            TimeUnit::Hour => "h",
            TimeUnit::Minute => "m",
            TimeUnit::Second => "s",
            TimeUnit::Millisecond => "ms",
            TimeUnit::Microsecond => "us",
            TimeUnit::Nanosecond => "ns",
            TimeUnit::Picosecond => "ps",
            TimeUnit::Femtosecond => "fs",
            TimeUnit::Attosecond => "as",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Y" => TimeUnit::Year,
            "M" => TimeUnit::Month,
            "W" => TimeUnit::Week,
            "D" => TimeUnit::Day,
            "h" => TimeUnit::Hour,
            "m" => TimeUnit::Minute,
            "s" => TimeUnit::Second,
            "ms" => TimeUnit::Millisecond,
            "us" => TimeUnit::Microsecond,
            "ns" => TimeUnit::Nanosecond,
            "ps" => TimeUnit::Picosecond,
            "fs" => TimeUnit::Femtosecond,
            "as" => TimeUnit::Attosecond,
            _ => return Err(format!("Unknown time unit: {s}")),
        })
    }
}

// ---------------------------------------------------------------------------
// DataType  (element type descriptor)
// ---------------------------------------------------------------------------

/// h5py-style hint attached to an object field to say it holds
/// variable-length text or bytes. Only ever produced by callers; the dtype
/// decoder never emits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VlenHint {
    Text,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimitiveType {
    pub kind: TypeKind,
    /// Item size in bytes. For `U` this is four bytes per character.
    pub size: usize,
    pub byte_order: Endian,
    /// Only set for datetime/timedelta; `None` is the generic unit.
    pub time_unit: Option<TimeUnit>,
    pub vlen: Option<VlenHint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub dtype: DataType,
    /// Byte offset of the field inside the record.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Primitive(PrimitiveType),
    Structured { fields: Vec<Field>, size: usize },
    SubArray { base: Box<DataType>, shape: Vec<usize> },
}

/// Size of an object reference inside a record.
pub(crate) const OBJECT_SIZE: usize = 8;

impl DataType {
    /// Build a primitive type, checking the kind/width combination and
    /// normalising the byte order the way numpy does.
    pub fn primitive(kind: TypeKind, size: usize, byte_order: Endian) -> ZarrResult<Self> {
        let valid = match kind {
            TypeKind::Bool => size == 1,
            TypeKind::Int | TypeKind::UInt => matches!(size, 1 | 2 | 4 | 8),
            TypeKind::Float => matches!(size, 2 | 4 | 8),
            TypeKind::Complex => matches!(size, 8 | 16),
            TypeKind::Bytes | TypeKind::Void => size > 0,
            TypeKind::Unicode => size > 0 && size % 4 == 0,
            TypeKind::Object => size == OBJECT_SIZE,
            TypeKind::Datetime | TypeKind::Timedelta => size == 8,
        };
        if !valid {
            return Err(ZarrError::TypeDecode(format!(
                "unsupported size {size} for {kind} type"
            )));
        }

        let byte_order = if kind.is_byte_order_free() || size == 1 {
            Endian::NotApplicable
        } else if byte_order == Endian::NotApplicable {
            Endian::native()
        } else {
            byte_order
        };

        Ok(DataType::Primitive(PrimitiveType {
            kind,
            size,
            byte_order,
            time_unit: None,
            vlen: None,
        }))
    }

    pub fn bool() -> Self {
        Self::fixed(TypeKind::Bool, 1, Endian::NotApplicable)
    }

    pub fn int(size: usize, byte_order: Endian) -> ZarrResult<Self> {
        Self::primitive(TypeKind::Int, size, byte_order)
    }

    pub fn uint(size: usize, byte_order: Endian) -> ZarrResult<Self> {
        Self::primitive(TypeKind::UInt, size, byte_order)
    }

    pub fn float(size: usize, byte_order: Endian) -> ZarrResult<Self> {
        Self::primitive(TypeKind::Float, size, byte_order)
    }

    pub fn complex(size: usize, byte_order: Endian) -> ZarrResult<Self> {
        Self::primitive(TypeKind::Complex, size, byte_order)
    }

    /// The canonical generic-object type (`|O`).
    pub fn object() -> Self {
        Self::fixed(TypeKind::Object, OBJECT_SIZE, Endian::NotApplicable)
    }

    /// An object type carrying the legacy variable-length hint.
    pub fn vlen(hint: VlenHint) -> Self {
        DataType::Primitive(PrimitiveType {
            kind: TypeKind::Object,
            size: OBJECT_SIZE,
            byte_order: Endian::NotApplicable,
            time_unit: None,
            vlen: Some(hint),
        })
    }

    pub fn datetime(unit: Option<TimeUnit>, byte_order: Endian) -> ZarrResult<Self> {
        Self::time(TypeKind::Datetime, unit, byte_order)
    }

    pub fn timedelta(unit: Option<TimeUnit>, byte_order: Endian) -> ZarrResult<Self> {
        Self::time(TypeKind::Timedelta, unit, byte_order)
    }

    fn time(kind: TypeKind, unit: Option<TimeUnit>, byte_order: Endian) -> ZarrResult<Self> {
        let mut dtype = Self::primitive(kind, 8, byte_order)?;
        if let DataType::Primitive(p) = &mut dtype {
            p.time_unit = unit;
        }
        Ok(dtype)
    }

    fn fixed(kind: TypeKind, size: usize, byte_order: Endian) -> Self {
        DataType::Primitive(PrimitiveType {
            kind,
            size,
            byte_order,
            time_unit: None,
            vlen: None,
        })
    }

    /// A packed structured type: each field starts where the previous ended.
    pub fn structured<S: Into<String>>(fields: Vec<(S, DataType)>) -> Self {
        let mut offset = 0;
        let fields = fields
            .into_iter()
            .map(|(name, dtype)| {
                let field = Field {
                    name: name.into(),
                    offset,
                    dtype,
                };
                offset = offset.saturating_add(field.dtype.size());
                field
            })
            .collect();
        DataType::Structured {
            fields,
            size: offset,
        }
    }

    /// A structured type with explicit field offsets and total item size.
    /// Fields must be in ascending offset order and must not overlap.
    pub fn structured_with_offsets(fields: Vec<Field>, size: usize) -> ZarrResult<Self> {
        let mut end = 0;
        for field in &fields {
            if field.name.is_empty() {
                return Err(ZarrError::TypeDecode("field names must not be empty".into()));
            }
            if field.offset < end {
                return Err(ZarrError::TypeDecode(format!(
                    "field '{}' at offset {} overlaps the previous field",
                    field.name, field.offset
                )));
            }
            let size = field.dtype.checked_size().ok_or_else(|| {
                ZarrError::TypeDecode(format!("field '{}' is too large", field.name))
            })?;
            end = field.offset.checked_add(size).ok_or_else(|| {
                ZarrError::TypeDecode(format!("field '{}' ends past usize::MAX", field.name))
            })?;
        }
        if size < end {
            return Err(ZarrError::TypeDecode(format!(
                "record size {size} is smaller than its fields ({end} bytes)"
            )));
        }
        Ok(DataType::Structured { fields, size })
    }

    pub fn subarray(base: DataType, shape: Vec<usize>) -> Self {
        DataType::SubArray {
            base: Box::new(base),
            shape,
        }
    }

    /// Item size in bytes. Saturates at `usize::MAX` for sub-arrays too
    /// large to address; see [`DataType::checked_size`].
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    /// Item size in bytes, `None` on overflow.
    pub fn checked_size(&self) -> Option<usize> {
        match self {
            DataType::Primitive(p) => Some(p.size),
            DataType::Structured { size, .. } => Some(*size),
            DataType::SubArray { base, shape } => {
                element_count(shape).and_then(|n| base.checked_size()?.checked_mul(n))
            }
        }
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            DataType::Primitive(p) => p.kind,
            DataType::Structured { .. } | DataType::SubArray { .. } => TypeKind::Void,
        }
    }

    /// True if the type, or any field nested in it, is a generic object.
    pub fn has_object(&self) -> bool {
        match self {
            DataType::Primitive(p) => p.kind == TypeKind::Object,
            DataType::Structured { fields, .. } => fields.iter().any(|f| f.dtype.has_object()),
            DataType::SubArray { base, .. } => base.has_object(),
        }
    }

    /// Split a sub-array type into its base type and trailing dimensions.
    /// Any other type is returned as-is with no extra dimensions.
    pub fn subarray_split(&self) -> (&DataType, &[usize]) {
        match self {
            DataType::SubArray { base, shape } => (base, shape),
            other => (other, &[]),
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectValue  (generic object elements)
// ---------------------------------------------------------------------------

/// A dynamically typed element of an object array.
#[derive(Debug, Clone)]
pub enum ObjectValue {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<ObjectValue>),
    /// A sequence that must stay distinct from `List` across the wire.
    Tuple(Vec<ObjectValue>),
    Map(Vec<(ObjectValue, ObjectValue)>),
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        use ObjectValue::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (UInt(a), UInt(b)) => a == b,
            (Int(i), UInt(u)) | (UInt(u), Int(i)) => u64::try_from(*i).is_ok_and(|i| i == *u),
            (Float(a), Float(b)) => float_eq(*a, *b),
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) | (Tuple(a), Tuple(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for ObjectValue {
    fn from(s: &str) -> Self {
        ObjectValue::String(s.to_string())
    }
}

impl From<String> for ObjectValue {
    fn from(s: String) -> Self {
        ObjectValue::String(s)
    }
}

impl From<i64> for ObjectValue {
    fn from(v: i64) -> Self {
        ObjectValue::Int(v)
    }
}

impl From<f64> for ObjectValue {
    fn from(v: f64) -> Self {
        ObjectValue::Float(v)
    }
}

impl From<bool> for ObjectValue {
    fn from(v: bool) -> Self {
        ObjectValue::Bool(v)
    }
}

impl ObjectValue {
    /// Convert a JSON value into an object value. JSON arrays become lists.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ObjectValue::Nil,
            serde_json::Value::Bool(b) => ObjectValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ObjectValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    ObjectValue::UInt(u)
                } else {
                    ObjectValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => ObjectValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                ObjectValue::List(items.iter().map(ObjectValue::from_json).collect())
            }
            serde_json::Value::Object(map) => ObjectValue::Map(
                map.iter()
                    .map(|(k, v)| (ObjectValue::String(k.clone()), ObjectValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON. Bytes, non-finite floats and non-string map
    /// keys have no JSON form.
    pub fn to_json(&self) -> ZarrResult<serde_json::Value> {
        Ok(match self {
            ObjectValue::Nil => serde_json::Value::Null,
            ObjectValue::Bool(b) => serde_json::Value::Bool(*b),
            ObjectValue::Int(i) => serde_json::Value::from(*i),
            ObjectValue::UInt(u) => serde_json::Value::from(*u),
            ObjectValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| ZarrError::Encode(format!("{f} has no JSON representation")))?,
            ObjectValue::String(s) => serde_json::Value::String(s.clone()),
            ObjectValue::Bytes(_) => {
                return Err(ZarrError::Encode("bytes object has no JSON representation".into()));
            }
            ObjectValue::List(items) | ObjectValue::Tuple(items) => serde_json::Value::Array(
                items.iter().map(ObjectValue::to_json).collect::<ZarrResult<_>>()?,
            ),
            ObjectValue::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    let ObjectValue::String(key) = k else {
                        return Err(ZarrError::Encode(format!(
                            "map key {k:?} has no JSON representation"
                        )));
                    };
                    map.insert(key.clone(), v.to_json()?);
                }
                serde_json::Value::Object(map)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// ZarrValue  (typed scalar / record)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ZarrValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float16(f16),
    Float32(f32),
    Float64(f64),
    Complex64(Complex<f32>),
    Complex128(Complex<f64>),
    /// Fixed-width byte string, without trailing NULs.
    Bytes(Vec<u8>),
    String(String),
    DateTime64(i64),
    TimeDelta64(i64),
    /// Unstructured raw bytes of exactly the item size.
    Raw(Vec<u8>),
    /// One value per field of a structured type, in field order.
    Record(Vec<ZarrValue>),
    /// Row-major elements of a sub-array field.
    Array(Vec<ZarrValue>),
    Object(ObjectValue),
}

fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

// NaN compares equal to NaN so fill values round-trip under `==`.
impl PartialEq for ZarrValue {
    fn eq(&self, other: &Self) -> bool {
        use ZarrValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (Int8(a), Int8(b)) => a == b,
            (Int16(a), Int16(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (Int64(a), Int64(b)) => a == b,
            (UInt8(a), UInt8(b)) => a == b,
            (UInt16(a), UInt16(b)) => a == b,
            (UInt32(a), UInt32(b)) => a == b,
            (UInt64(a), UInt64(b)) => a == b,
            (Float16(a), Float16(b)) => float_eq(a.to_f64(), b.to_f64()),
            (Float32(a), Float32(b)) => float_eq(f64::from(*a), f64::from(*b)),
            (Float64(a), Float64(b)) => float_eq(*a, *b),
            (Complex64(a), Complex64(b)) => {
                float_eq(f64::from(a.re), f64::from(b.re))
                    && float_eq(f64::from(a.im), f64::from(b.im))
            }
            (Complex128(a), Complex128(b)) => float_eq(a.re, b.re) && float_eq(a.im, b.im),
            (Bytes(a), Bytes(b)) | (Raw(a), Raw(b)) => a == b,
            (String(a), String(b)) => a == b,
            (DateTime64(a), DateTime64(b)) | (TimeDelta64(a), TimeDelta64(b)) => a == b,
            (Record(a), Record(b)) | (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            _ => false,
        }
    }
}

/// Default zero/false/empty value for a data type. Object slots are `Nil`.
pub fn default_scalar(dtype: &DataType) -> ZarrValue {
    match dtype {
        DataType::Primitive(p) => match (p.kind, p.size) {
            (TypeKind::Bool, _) => ZarrValue::Bool(false),
            (TypeKind::Int, 1) => ZarrValue::Int8(0),
            (TypeKind::Int, 2) => ZarrValue::Int16(0),
            (TypeKind::Int, 4) => ZarrValue::Int32(0),
            (TypeKind::Int, _) => ZarrValue::Int64(0),
            (TypeKind::UInt, 1) => ZarrValue::UInt8(0),
            (TypeKind::UInt, 2) => ZarrValue::UInt16(0),
            (TypeKind::UInt, 4) => ZarrValue::UInt32(0),
            (TypeKind::UInt, _) => ZarrValue::UInt64(0),
            (TypeKind::Float, 2) => ZarrValue::Float16(f16::ZERO),
            (TypeKind::Float, 4) => ZarrValue::Float32(0.0),
            (TypeKind::Float, _) => ZarrValue::Float64(0.0),
            (TypeKind::Complex, 8) => ZarrValue::Complex64(Complex::new(0.0, 0.0)),
            (TypeKind::Complex, _) => ZarrValue::Complex128(Complex::new(0.0, 0.0)),
            (TypeKind::Bytes, _) => ZarrValue::Bytes(Vec::new()),
            (TypeKind::Unicode, _) => ZarrValue::String(String::new()),
            (TypeKind::Object, _) => ZarrValue::Object(ObjectValue::Nil),
            (TypeKind::Datetime, _) => ZarrValue::DateTime64(0),
            (TypeKind::Timedelta, _) => ZarrValue::TimeDelta64(0),
            (TypeKind::Void, size) => ZarrValue::Raw(vec![0; size]),
        },
        DataType::Structured { fields, .. } => {
            ZarrValue::Record(fields.iter().map(|f| default_scalar(&f.dtype)).collect())
        }
        DataType::SubArray { base, shape } => {
            let count = element_count(shape).unwrap_or(0);
            ZarrValue::Array(vec![default_scalar(base); count])
        }
    }
}

// ---------------------------------------------------------------------------
// Raw bytes <-> typed value
// ---------------------------------------------------------------------------

macro_rules! read_endian {
    ($cursor:expr, $endian:expr, $method:ident) => {
        match $endian {
            Endian::Big => $cursor.$method::<BigEndian>(),
            Endian::Little | Endian::NotApplicable => $cursor.$method::<LittleEndian>(),
        }
    };
}

macro_rules! write_endian {
    ($out:expr, $endian:expr, $method:ident, $value:expr) => {
        match $endian {
            Endian::Big => $out.$method::<BigEndian>($value),
            Endian::Little | Endian::NotApplicable => $out.$method::<LittleEndian>($value),
        }
    };
}

/// Interpret exactly `dtype.size()` bytes as a single value. Fields are read
/// at their declared offsets; padding is ignored.
pub fn bytes_to_value(dtype: &DataType, data: &[u8]) -> ZarrResult<ZarrValue> {
    if data.len() != dtype.size() {
        return Err(ZarrError::fill(
            dtype.kind(),
            format!("expected {} bytes, got {}", dtype.size(), data.len()),
        ));
    }
    match dtype {
        DataType::Primitive(p) => read_primitive(p, data),
        DataType::Structured { fields, .. } => fields
            .iter()
            .map(|f| {
                let end = f.offset.checked_add(f.dtype.size());
                let bytes = end.and_then(|end| data.get(f.offset..end)).ok_or_else(|| {
                    ZarrError::fill(
                        TypeKind::Void,
                        format!("field '{}' lies outside the record", f.name),
                    )
                })?;
                bytes_to_value(&f.dtype, bytes)
            })
            .collect::<ZarrResult<_>>()
            .map(ZarrValue::Record),
        DataType::SubArray { base, .. } => {
            let item = base.size();
            if item == 0 {
                return Ok(ZarrValue::Array(Vec::new()));
            }
            data.chunks(item)
                .map(|chunk| bytes_to_value(base, chunk))
                .collect::<ZarrResult<_>>()
                .map(ZarrValue::Array)
        }
    }
}

fn read_primitive(p: &PrimitiveType, data: &[u8]) -> ZarrResult<ZarrValue> {
    let mut cursor = Cursor::new(data);
    let endian = p.byte_order;
    let io_err = |e: std::io::Error| ZarrError::fill(p.kind, format!("failed to read value: {e}"));

    let value = match (p.kind, p.size) {
        (TypeKind::Bool, _) => ZarrValue::Bool(data[0] != 0),
        (TypeKind::Int, 1) => ZarrValue::Int8(data[0] as i8),
        (TypeKind::Int, 2) => ZarrValue::Int16(read_endian!(cursor, endian, read_i16).map_err(io_err)?),
        (TypeKind::Int, 4) => ZarrValue::Int32(read_endian!(cursor, endian, read_i32).map_err(io_err)?),
        (TypeKind::Int, _) => ZarrValue::Int64(read_endian!(cursor, endian, read_i64).map_err(io_err)?),
        (TypeKind::UInt, 1) => ZarrValue::UInt8(data[0]),
        (TypeKind::UInt, 2) => ZarrValue::UInt16(read_endian!(cursor, endian, read_u16).map_err(io_err)?),
        (TypeKind::UInt, 4) => ZarrValue::UInt32(read_endian!(cursor, endian, read_u32).map_err(io_err)?),
        (TypeKind::UInt, _) => ZarrValue::UInt64(read_endian!(cursor, endian, read_u64).map_err(io_err)?),
        (TypeKind::Float, 2) => ZarrValue::Float16(f16::from_bits(
            read_endian!(cursor, endian, read_u16).map_err(io_err)?,
        )),
        (TypeKind::Float, 4) => ZarrValue::Float32(read_endian!(cursor, endian, read_f32).map_err(io_err)?),
        (TypeKind::Float, _) => ZarrValue::Float64(read_endian!(cursor, endian, read_f64).map_err(io_err)?),
        (TypeKind::Complex, 8) => {
            let re = read_endian!(cursor, endian, read_f32).map_err(io_err)?;
            let im = read_endian!(cursor, endian, read_f32).map_err(io_err)?;
            ZarrValue::Complex64(Complex::new(re, im))
        }
        (TypeKind::Complex, _) => {
            let re = read_endian!(cursor, endian, read_f64).map_err(io_err)?;
            let im = read_endian!(cursor, endian, read_f64).map_err(io_err)?;
            ZarrValue::Complex128(Complex::new(re, im))
        }
        (TypeKind::Bytes, _) => ZarrValue::Bytes(strip_nuls(data).to_vec()),
        (TypeKind::Unicode, size) => {
            let mut text = String::with_capacity(size / 4);
            for _ in 0..size / 4 {
                let code = read_endian!(cursor, endian, read_u32).map_err(io_err)?;
                let ch = char::from_u32(code).ok_or_else(|| {
                    ZarrError::fill(p.kind, format!("invalid code point {code:#x}"))
                })?;
                text.push(ch);
            }
            ZarrValue::String(text.trim_end_matches('\0').to_string())
        }
        (TypeKind::Datetime, _) => {
            ZarrValue::DateTime64(read_endian!(cursor, endian, read_i64).map_err(io_err)?)
        }
        (TypeKind::Timedelta, _) => {
            ZarrValue::TimeDelta64(read_endian!(cursor, endian, read_i64).map_err(io_err)?)
        }
        (TypeKind::Void, _) => ZarrValue::Raw(data.to_vec()),
        (TypeKind::Object, _) => {
            // Only a null reference can be materialised from bytes.
            if data.iter().any(|b| *b != 0) {
                return Err(ZarrError::fill(
                    p.kind,
                    "object references cannot be read from raw bytes",
                ));
            }
            ZarrValue::Object(ObjectValue::Nil)
        }
    };
    Ok(value)
}

pub(crate) fn strip_nuls(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &data[..end]
}

/// Serialise a value into exactly `dtype.size()` bytes. Padding is zeroed.
pub fn value_to_bytes(dtype: &DataType, value: &ZarrValue) -> ZarrResult<Vec<u8>> {
    let mut out = Vec::with_capacity(dtype.size());
    write_value(dtype, value, &mut out)?;
    Ok(out)
}

fn write_value(dtype: &DataType, value: &ZarrValue, out: &mut Vec<u8>) -> ZarrResult<()> {
    match (dtype, value) {
        (DataType::Primitive(p), _) => write_primitive(p, value, out),
        (DataType::Structured { fields, size }, ZarrValue::Record(values)) => {
            if fields.len() != values.len() {
                return Err(ZarrError::fill(
                    TypeKind::Void,
                    format!("record has {} values for {} fields", values.len(), fields.len()),
                ));
            }
            let start = out.len();
            for (field, v) in fields.iter().zip(values) {
                out.resize(start + field.offset, 0);
                write_value(&field.dtype, v, out)?;
            }
            out.resize(start + size, 0);
            Ok(())
        }
        (DataType::SubArray { base, shape }, ZarrValue::Array(values)) => {
            let count = element_count(shape).ok_or_else(|| {
                ZarrError::fill(base.kind(), format!("sub-array shape {shape:?} overflows"))
            })?;
            if values.len() != count {
                return Err(ZarrError::fill(
                    base.kind(),
                    format!("sub-array has {} values, expected {count}", values.len()),
                ));
            }
            values.iter().try_for_each(|v| write_value(base, v, out))
        }
        (dtype, value) => Err(mismatch(dtype.kind(), value)),
    }
}

fn mismatch(kind: TypeKind, value: &ZarrValue) -> ZarrError {
    ZarrError::fill(kind, format!("value {value:?} does not match the dtype"))
}

fn write_primitive(p: &PrimitiveType, value: &ZarrValue, out: &mut Vec<u8>) -> ZarrResult<()> {
    let endian = p.byte_order;
    let io_err = |e: std::io::Error| ZarrError::fill(p.kind, format!("failed to write value: {e}"));

    match (p.kind, p.size, value) {
        (TypeKind::Bool, _, ZarrValue::Bool(b)) => out.push(u8::from(*b)),
        (TypeKind::Int, 1, ZarrValue::Int8(v)) => out.write_i8(*v).map_err(io_err)?,
        (TypeKind::Int, 2, ZarrValue::Int16(v)) => write_endian!(out, endian, write_i16, *v).map_err(io_err)?,
        (TypeKind::Int, 4, ZarrValue::Int32(v)) => write_endian!(out, endian, write_i32, *v).map_err(io_err)?,
        (TypeKind::Int, 8, ZarrValue::Int64(v)) => write_endian!(out, endian, write_i64, *v).map_err(io_err)?,
        (TypeKind::UInt, 1, ZarrValue::UInt8(v)) => out.push(*v),
        (TypeKind::UInt, 2, ZarrValue::UInt16(v)) => write_endian!(out, endian, write_u16, *v).map_err(io_err)?,
        (TypeKind::UInt, 4, ZarrValue::UInt32(v)) => write_endian!(out, endian, write_u32, *v).map_err(io_err)?,
        (TypeKind::UInt, 8, ZarrValue::UInt64(v)) => write_endian!(out, endian, write_u64, *v).map_err(io_err)?,
        (TypeKind::Float, 2, ZarrValue::Float16(v)) => {
            write_endian!(out, endian, write_u16, v.to_bits()).map_err(io_err)?
        }
        (TypeKind::Float, 4, ZarrValue::Float32(v)) => write_endian!(out, endian, write_f32, *v).map_err(io_err)?,
        (TypeKind::Float, 8, ZarrValue::Float64(v)) => write_endian!(out, endian, write_f64, *v).map_err(io_err)?,
        (TypeKind::Complex, 8, ZarrValue::Complex64(c)) => {
            write_endian!(out, endian, write_f32, c.re).map_err(io_err)?;
            write_endian!(out, endian, write_f32, c.im).map_err(io_err)?;
        }
        (TypeKind::Complex, 16, ZarrValue::Complex128(c)) => {
            write_endian!(out, endian, write_f64, c.re).map_err(io_err)?;
            write_endian!(out, endian, write_f64, c.im).map_err(io_err)?;
        }
        (TypeKind::Bytes, size, ZarrValue::Bytes(b)) => {
            if b.len() > size {
                return Err(ZarrError::fill(
                    p.kind,
                    format!("{} bytes do not fit in {size}", b.len()),
                ));
            }
            out.extend_from_slice(b);
            out.resize(out.len() + size - b.len(), 0);
        }
        (TypeKind::Unicode, size, ZarrValue::String(s)) => {
            let chars = s.chars().count();
            if chars * 4 > size {
                return Err(ZarrError::fill(
                    p.kind,
                    format!("{chars} characters do not fit in {}", size / 4),
                ));
            }
            for ch in s.chars() {
                write_endian!(out, endian, write_u32, u32::from(ch)).map_err(io_err)?;
            }
            out.resize(out.len() + size - chars * 4, 0);
        }
        (TypeKind::Datetime, _, ZarrValue::DateTime64(v))
        | (TypeKind::Timedelta, _, ZarrValue::TimeDelta64(v)) => {
            write_endian!(out, endian, write_i64, *v).map_err(io_err)?
        }
        (TypeKind::Void, size, ZarrValue::Raw(b)) if b.len() == size => out.extend_from_slice(b),
        (TypeKind::Object, size, ZarrValue::Object(ObjectValue::Nil)) => {
            out.resize(out.len() + size, 0)
        }
        (TypeKind::Object, _, ZarrValue::Object(_)) => {
            return Err(ZarrError::fill(
                p.kind,
                "only null object references can be written as raw bytes",
            ));
        }
        _ => return Err(mismatch(p.kind, value)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_normalises_byte_order() {
        let b = DataType::primitive(TypeKind::Int, 1, Endian::Little).unwrap();
        assert_eq!(b, DataType::int(1, Endian::NotApplicable).unwrap());
        let s = DataType::primitive(TypeKind::Bytes, 5, Endian::Big).unwrap();
        assert!(matches!(
            s,
            DataType::Primitive(PrimitiveType {
                byte_order: Endian::NotApplicable,
                ..
            })
        ));
        assert!(DataType::float(3, Endian::Little).is_err());
        assert!(DataType::primitive(TypeKind::Unicode, 6, Endian::Little).is_err());
    }

    #[test]
    fn structured_layout_is_packed() {
        let dtype = DataType::structured(vec![
            ("a", DataType::int(4, Endian::Little).unwrap()),
            ("b", DataType::float(8, Endian::Little).unwrap()),
            (
                "c",
                DataType::subarray(DataType::uint(2, Endian::Big).unwrap(), vec![2, 3]),
            ),
        ]);
        assert_eq!(dtype.size(), 4 + 8 + 12);
        let DataType::Structured { fields, .. } = &dtype else {
            panic!("expected structured type");
        };
        assert_eq!(fields.iter().map(|f| f.offset).collect::<Vec<_>>(), vec![0, 4, 12]);
        assert!(!dtype.has_object());
    }

    #[test]
    fn overlapping_offsets_are_rejected() {
        let i4 = DataType::int(4, Endian::Little).unwrap();
        let fields = vec![
            Field { name: "a".into(), dtype: i4.clone(), offset: 0 },
            Field { name: "b".into(), dtype: i4, offset: 2 },
        ];
        assert!(DataType::structured_with_offsets(fields, 8).is_err());
    }

    #[test]
    fn record_bytes_round_trip() {
        let dtype = DataType::structured(vec![
            ("x", DataType::int(2, Endian::Big).unwrap()),
            ("name", DataType::primitive(TypeKind::Unicode, 12, Endian::Little).unwrap()),
            ("flag", DataType::bool()),
        ]);
        let value = ZarrValue::Record(vec![
            ZarrValue::Int16(-2),
            ZarrValue::String("hi".into()),
            ZarrValue::Bool(true),
        ]);
        let bytes = value_to_bytes(&dtype, &value).unwrap();
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[..2], &[0xff, 0xfe]);
        assert_eq!(bytes_to_value(&dtype, &bytes).unwrap(), value);
    }

    #[test]
    fn nan_values_compare_equal() {
        assert_eq!(ZarrValue::Float64(f64::NAN), ZarrValue::Float64(f64::NAN));
        assert_ne!(ZarrValue::Float64(f64::NAN), ZarrValue::Float32(f32::NAN));
        assert_eq!(ObjectValue::Int(3), ObjectValue::UInt(3));
        assert_ne!(ObjectValue::Int(-1), ObjectValue::UInt(u64::MAX));
    }

    #[test]
    fn default_record_has_nil_objects() {
        let dtype = DataType::structured(vec![
            ("id", DataType::int(8, Endian::Little).unwrap()),
            ("label", DataType::object()),
        ]);
        assert!(dtype.has_object());
        assert_eq!(
            default_scalar(&dtype),
            ZarrValue::Record(vec![ZarrValue::Int64(0), ZarrValue::Object(ObjectValue::Nil)])
        );
    }
}

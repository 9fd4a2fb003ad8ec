use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::array::cartesian_indices;
use crate::codecs::{CodecConfig, ObjectCodec, find_object_codec};
use crate::codecs::msgpack::MsgPackCodec;
use crate::error::{ZarrError, ZarrResult};
use crate::metadata::dtype::{decode_dtype, encode_dtype};
use crate::metadata::{decode_fill_value, encode_fill_value};
use crate::types::{ArrayOrder, DataType, ZarrValue};

/// The only storage format version this crate understands.
pub const ZARR_FORMAT: u64 = 2;

// ---------------------------------------------------------------------------
// Metadata source
// ---------------------------------------------------------------------------

/// Where a metadata record comes from: raw JSON text, or a mapping that has
/// already been parsed (e.g. an entry of consolidated metadata).
#[derive(Debug, Clone, Copy)]
pub enum MetadataSource<'a> {
    Json(&'a [u8]),
    Parsed(&'a Map<String, Value>),
}

impl<'a> From<&'a [u8]> for MetadataSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        MetadataSource::Json(bytes)
    }
}

impl<'a> From<&'a str> for MetadataSource<'a> {
    fn from(text: &'a str) -> Self {
        MetadataSource::Json(text.as_bytes())
    }
}

impl<'a> From<&'a String> for MetadataSource<'a> {
    fn from(text: &'a String) -> Self {
        MetadataSource::Json(text.as_bytes())
    }
}

impl<'a> From<&'a Map<String, Value>> for MetadataSource<'a> {
    fn from(map: &'a Map<String, Value>) -> Self {
        MetadataSource::Parsed(map)
    }
}

fn parse_metadata(source: MetadataSource<'_>) -> ZarrResult<Cow<'_, Map<String, Value>>> {
    match source {
        MetadataSource::Json(bytes) => Ok(Cow::Owned(serde_json::from_slice(bytes)?)),
        MetadataSource::Parsed(map) => Ok(Cow::Borrowed(map)),
    }
}

fn check_format(meta: &Map<String, Value>) -> ZarrResult<()> {
    match meta.get("zarr_format") {
        // 2.0 is accepted too; only the numeric value matters.
        Some(v) if v.as_f64() == Some(ZARR_FORMAT as f64) => Ok(()),
        other => Err(ZarrError::UnsupportedFormat(other.cloned())),
    }
}

// ---------------------------------------------------------------------------
// ChunkKeySeparator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChunkKeySeparator {
    #[default]
    #[serde(rename = ".")]
    Dot,
    #[serde(rename = "/")]
    Slash,
}

impl ChunkKeySeparator {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKeySeparator::Dot => ".",
            ChunkKeySeparator::Slash => "/",
        }
    }
}

/// Custom serde for `ArrayOrder`
impl Serialize for ArrayOrder {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ArrayOrder::C => serializer.serialize_str("C"),
            ArrayOrder::F => serializer.serialize_str("F"),
        }
    }
}

impl<'de> Deserialize<'de> for ArrayOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "C" => Ok(ArrayOrder::C),
            "F" => Ok(ArrayOrder::F),
            _ => Err(serde::de::Error::custom(format!("Unknown order: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ArrayMetadata
// ---------------------------------------------------------------------------

/// Decoded `.zarray` record.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMetadata {
    pub zarr_format: u64,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: DataType,
    pub compressor: Option<CodecConfig>,
    pub fill_value: Option<ZarrValue>,
    pub order: ArrayOrder,
    pub filters: Option<Vec<CodecConfig>>,
    pub dimension_separator: ChunkKeySeparator,
}

/// The persisted JSON layout. Field order matches the sorted key order
/// zarr-python writes.
#[derive(Debug, Serialize, Deserialize)]
struct ArrayMetadataJson {
    chunks: Vec<usize>,
    #[serde(deserialize_with = "Option::deserialize")]
    compressor: Option<CodecConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dimension_separator: Option<ChunkKeySeparator>,
    dtype: Value,
    fill_value: Value,
    #[serde(deserialize_with = "Option::deserialize")]
    filters: Option<Vec<CodecConfig>>,
    order: ArrayOrder,
    shape: Vec<usize>,
    #[serde(skip_deserializing, default = "default_zarr_format")]
    zarr_format: u64,
}

fn default_zarr_format() -> u64 {
    ZARR_FORMAT
}

impl ArrayMetadata {
    /// A C-ordered array with no compressor, filters or fill value.
    pub fn new(shape: Vec<usize>, chunks: Vec<usize>, dtype: DataType) -> Self {
        Self {
            zarr_format: ZARR_FORMAT,
            shape,
            chunks,
            dtype,
            compressor: None,
            fill_value: None,
            order: ArrayOrder::C,
            filters: None,
            dimension_separator: ChunkKeySeparator::Dot,
        }
    }

    /// Number of chunks along each dimension.
    pub fn chunk_grid_shape(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(self.chunks.iter())
            .map(|(s, c)| if *c == 0 { 0 } else { s.div_ceil(*c) })
            .collect()
    }

    /// The object codec in the filter chain, if there is one.
    pub fn object_codec(&self) -> ZarrResult<Option<ObjectCodec>> {
        find_object_codec(self.filters.as_deref().unwrap_or_default())
    }

    /// Storage keys of every chunk, in row-major chunk-grid order.
    pub fn chunk_keys(&self) -> Vec<String> {
        let sep = self.dimension_separator.as_str();
        cartesian_indices(&self.chunk_grid_shape())
            .into_iter()
            .map(|idx| {
                idx.iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(sep)
            })
            .collect()
    }
}

/// Decode array metadata from JSON text or an already-parsed mapping.
///
/// A missing or unexpected `zarr_format` fails with
/// [`ZarrError::UnsupportedFormat`]; anything else that goes wrong while
/// reading the fields is reported as [`ZarrError::MetadataDecode`].
pub fn decode_array_metadata<'a>(
    source: impl Into<MetadataSource<'a>>,
) -> ZarrResult<ArrayMetadata> {
    let meta = parse_metadata(source.into())?;
    check_format(&meta)?;
    extract_array_metadata(meta.into_owned()).map_err(ZarrError::metadata)
}

fn extract_array_metadata(meta: Map<String, Value>) -> ZarrResult<ArrayMetadata> {
    let raw: ArrayMetadataJson = serde_json::from_value(Value::Object(meta))?;

    if raw.shape.len() != raw.chunks.len() {
        return Err(ZarrError::Metadata(format!(
            "shape {:?} and chunks {:?} have different lengths",
            raw.shape, raw.chunks
        )));
    }
    if raw.chunks.contains(&0) {
        return Err(ZarrError::Metadata(format!(
            "chunk lengths must be positive, got {:?}",
            raw.chunks
        )));
    }

    let dtype = decode_dtype(&raw.dtype)?;
    let fill_value = decode_fill_value(&raw.fill_value, &dtype)?;
    log::debug!("decoded array metadata: dtype {} -> {dtype:?}", raw.dtype);

    Ok(ArrayMetadata {
        zarr_format: ZARR_FORMAT,
        shape: raw.shape,
        chunks: raw.chunks,
        dtype,
        compressor: raw.compressor,
        fill_value,
        order: raw.order,
        filters: raw.filters,
        dimension_separator: raw.dimension_separator.unwrap_or_default(),
    })
}

/// Encode array metadata as JSON text.
///
/// A sub-array dtype is split: its dimensions are appended to `shape` and
/// `chunks` and only the base type is written. If the dtype needs the
/// msgpack object codec, its configuration is appended to a copy of the
/// filter chain unless already present.
pub fn encode_array_metadata(meta: &ArrayMetadata) -> ZarrResult<String> {
    let (dtype, sub_shape) = meta.dtype.subarray_split();
    let (encoded_dtype, varlen) = encode_dtype(dtype)?;

    let mut filters = meta.filters.clone().unwrap_or_default();
    if varlen && find_object_codec(&filters)?.is_none() {
        let object_codec = MsgPackCodec::default().config();
        log::debug!("appending {} filter for variable-length fields", object_codec.id);
        filters.push(object_codec);
    }

    let record = ArrayMetadataJson {
        chunks: meta.chunks.iter().chain(sub_shape).copied().collect(),
        compressor: meta.compressor.clone(),
        dimension_separator: (meta.dimension_separator != ChunkKeySeparator::Dot)
            .then_some(meta.dimension_separator),
        dtype: encoded_dtype,
        fill_value: encode_fill_value(meta.fill_value.as_ref(), &meta.dtype)?,
        filters: (!filters.is_empty()).then_some(filters),
        order: meta.order,
        shape: meta.shape.iter().chain(sub_shape).copied().collect(),
        zarr_format: ZARR_FORMAT,
    };
    Ok(serde_json::to_string_pretty(&record)?)
}

// ---------------------------------------------------------------------------
// GroupMetadata
// ---------------------------------------------------------------------------

/// Decoded `.zgroup` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupMetadata {
    pub zarr_format: u64,
}

impl Default for GroupMetadata {
    fn default() -> Self {
        Self {
            zarr_format: ZARR_FORMAT,
        }
    }
}

pub fn decode_group_metadata<'a>(
    source: impl Into<MetadataSource<'a>>,
) -> ZarrResult<GroupMetadata> {
    let meta = parse_metadata(source.into())?;
    check_format(&meta)?;
    Ok(GroupMetadata::default())
}

/// Group metadata carries no state besides the format version.
pub fn encode_group_metadata() -> ZarrResult<String> {
    Ok(serde_json::to_string_pretty(&GroupMetadata::default())?)
}

// ---------------------------------------------------------------------------
// Consolidated metadata
// ---------------------------------------------------------------------------

const ARRAY_KEY: &str = ".zarray";
const GROUP_KEY: &str = ".zgroup";

/// A parsed `.zmetadata` document: every `.zarray`/`.zgroup`/`.zattrs`
/// record of a hierarchy keyed by its store path.
#[derive(Debug, Clone)]
pub struct ConsolidatedMetadata {
    pub zarr_consolidated_format: u64,
    pub metadata: Map<String, Value>,
}

impl ConsolidatedMetadata {
    /// Parse consolidated `.zmetadata` JSON.
    pub fn parse(json_bytes: &[u8]) -> ZarrResult<Self> {
        let raw: Value = serde_json::from_slice(json_bytes)?;
        let obj = raw
            .as_object()
            .ok_or_else(|| ZarrError::Metadata("Expected JSON object".into()))?;

        let format = obj
            .get("zarr_consolidated_format")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        if format != 1 {
            return Err(ZarrError::Metadata(
                "Metadata is not in zarr-consolidated-v1 format".into(),
            ));
        }

        let metadata = obj
            .get("metadata")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ZarrError::Metadata("Missing 'metadata' field".into()))?
            .clone();

        Ok(ConsolidatedMetadata {
            zarr_consolidated_format: format,
            metadata,
        })
    }

    /// Paths of all arrays, `""` being the root.
    pub fn array_paths(&self) -> Vec<String> {
        self.paths_with(ARRAY_KEY)
    }

    pub fn group_paths(&self) -> Vec<String> {
        self.paths_with(GROUP_KEY)
    }

    fn paths_with(&self, suffix: &str) -> Vec<String> {
        self.metadata
            .keys()
            .filter_map(|key| key.strip_suffix(suffix))
            .filter(|prefix| prefix.is_empty() || prefix.ends_with('/'))
            .map(|prefix| prefix.trim_end_matches('/').to_string())
            .collect()
    }

    fn entry(&self, path: &str, suffix: &str) -> ZarrResult<Option<&Map<String, Value>>> {
        let path = path.trim_matches('/');
        let key = if path.is_empty() {
            suffix.to_string()
        } else {
            format!("{path}/{suffix}")
        };
        match self.metadata.get(&key) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(ZarrError::Metadata(format!(
                "entry '{key}' is not an object: {other}"
            ))),
        }
    }

    /// Decode the array at `path`, if there is one.
    pub fn array(&self, path: &str) -> ZarrResult<Option<ArrayMetadata>> {
        self.entry(path, ARRAY_KEY)?
            .map(decode_array_metadata)
            .transpose()
    }

    /// Decode the group at `path`, if there is one.
    pub fn group(&self, path: &str) -> ZarrResult<Option<GroupMetadata>> {
        self.entry(path, GROUP_KEY)?
            .map(decode_group_metadata)
            .transpose()
    }

    /// Decode every array in the hierarchy.
    pub fn arrays(&self) -> ZarrResult<BTreeMap<String, ArrayMetadata>> {
        let mut arrays = BTreeMap::new();
        for path in self.array_paths() {
            if let Some(md) = self.array(&path)? {
                arrays.insert(path, md);
            }
        }
        Ok(arrays)
    }
}

pub mod msgpack;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::array::ObjectArray;
use crate::error::ZarrResult;
use msgpack::MsgPackCodec;

// ---------------------------------------------------------------------------
// CodecConfig
// ---------------------------------------------------------------------------

/// A compressor or filter entry of `.zarray`: an `id` plus whatever
/// parameters that codec takes. Parameters are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub id: String,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl CodecConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: Map::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }
}

// ---------------------------------------------------------------------------
// Object codec lookup
// ---------------------------------------------------------------------------

/// Object codecs this crate can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectCodec {
    MsgPack(MsgPackCodec),
}

impl ObjectCodec {
    pub fn encode(&self, array: &ObjectArray) -> ZarrResult<Vec<u8>> {
        match self {
            ObjectCodec::MsgPack(codec) => codec.encode(array),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> ZarrResult<ObjectArray> {
        match self {
            ObjectCodec::MsgPack(codec) => codec.decode(bytes),
        }
    }

    pub fn config(&self) -> CodecConfig {
        match self {
            ObjectCodec::MsgPack(codec) => codec.config(),
        }
    }
}

/// Parse a single filter entry, `Ok(None)` if it is not an object codec.
pub fn parse_object_codec(config: &CodecConfig) -> ZarrResult<Option<ObjectCodec>> {
    match config.id.as_str() {
        msgpack::CODEC_ID => Ok(Some(ObjectCodec::MsgPack(MsgPackCodec::from_config(
            config,
        )?))),
        _ => Ok(None),
    }
}

/// Find the object codec in a filter chain, if any.
pub fn find_object_codec(filters: &[CodecConfig]) -> ZarrResult<Option<ObjectCodec>> {
    for config in filters {
        if let Some(codec) = parse_object_codec(config)? {
            return Ok(Some(codec));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZarrError;
    use crate::types::ObjectValue;
    use serde_json::json;

    #[test]
    fn codec_config_flattens_parameters() {
        let config: CodecConfig =
            serde_json::from_value(json!({"id": "zlib", "level": 1})).unwrap();
        assert_eq!(config, CodecConfig::new("zlib").with("level", 1));
        assert_eq!(config.get("level"), Some(&json!(1)));
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"id": "zlib", "level": 1})
        );
        assert!(serde_json::from_value::<CodecConfig>(json!({"level": 1})).is_err());
    }

    #[test]
    fn object_codec_lookup() {
        let chain = vec![
            CodecConfig::new("delta").with("dtype", "<i4"),
            CodecConfig::new("msgpack3")
                .with("raw", false)
                .with("use_single_float", true)
                .with("use_bin_type", true),
        ];
        let Some(ObjectCodec::MsgPack(codec)) = find_object_codec(&chain).unwrap() else {
            panic!("msgpack codec not found");
        };
        assert!(codec.use_single_float);
        assert_eq!(find_object_codec(&chain[..1]).unwrap(), None);

        let bad = CodecConfig::new("msgpack3").with("raw", "yes");
        assert!(matches!(parse_object_codec(&bad), Err(ZarrError::Codec(_))));
    }

    #[test]
    fn object_codec_dispatch() {
        let chain = vec![MsgPackCodec::default().config()];
        let codec = find_object_codec(&chain).unwrap().unwrap();
        assert_eq!(codec.config(), chain[0]);

        let array = ObjectArray::new(
            crate::types::DataType::object(),
            vec![2],
            vec!["a".into(), ObjectValue::Tuple(vec![1i64.into()])],
        )
        .unwrap();
        let bytes = codec.encode(&array).unwrap();
        assert_eq!(bytes, MsgPackCodec::default().encode(&array).unwrap());
        assert_eq!(codec.decode(&bytes).unwrap(), array);
    }
}

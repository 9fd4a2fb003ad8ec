pub mod array;
pub mod codecs;
pub mod error;
pub mod metadata;
pub mod types;

// Re-export key types at crate root for convenience.
pub use array::ObjectArray;
pub use codecs::msgpack::MsgPackCodec;
pub use codecs::{CodecConfig, ObjectCodec};
pub use error::{ZarrError, ZarrResult};
pub use metadata::dtype::{decode_dtype, encode_dtype};
pub use metadata::v2::{
    ArrayMetadata, ChunkKeySeparator, ConsolidatedMetadata, GroupMetadata, MetadataSource,
    decode_array_metadata, decode_group_metadata, encode_array_metadata, encode_group_metadata,
};
pub use metadata::{decode_fill_value, encode_fill_value};
pub use types::{
    ArrayOrder, DataType, Endian, Field, ObjectValue, PrimitiveType, TimeUnit, TypeKind,
    VlenHint, ZarrValue,
};

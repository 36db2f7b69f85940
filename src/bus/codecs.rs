//! # Built-in codecs.
//!
//! One codec per plain body type, each with a fixed reserved system id:
//!
//! | id | name            | body type           |
//! |----|-----------------|---------------------|
//! | 0  | null            | `()`                |
//! | 1  | string          | `String`            |
//! | 2  | buffer          | `bytes::Bytes`      |
//! | 3  | bytearray       | `Vec<u8>`           |
//! | 4  | byte            | `i8`                |
//! | 5  | short           | `i16`               |
//! | 6  | int             | `i32`               |
//! | 7  | long            | `i64`               |
//! | 8  | float           | `f32`               |
//! | 9  | double          | `f64`               |
//! | 10 | boolean         | `bool`              |
//! | 11 | json            | `serde_json::Value` |
//! | 12 | replyexception  | [`ReplyError`]      |
//!
//! Length-prefixed fields use a big-endian `u32`. All built-in body types are
//! value types, so the local transform is a plain clone.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;

use crate::bus::codec::MessageCodec;
use crate::error::{CodecError, ReplyError, ReplyFailure};

fn mismatch(codec: &'static str) -> CodecError {
    CodecError::BodyTypeMismatch { codec }
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        reason: reason.into(),
    }
}

fn get_len_prefixed(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    if buf.remaining() < 4 {
        return Err(malformed("truncated length prefix"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(malformed("truncated length-prefixed payload"));
    }
    Ok(buf.split_to(len))
}

fn put_len_prefixed(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

struct NullCodec;

impl MessageCodec for NullCodec {
    fn name(&self) -> &str {
        "null"
    }

    fn system_id(&self) -> i8 {
        0
    }

    fn encode_to_wire(
        &self,
        _buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        body.downcast_ref::<()>().ok_or_else(|| mismatch("null"))?;
        Ok(())
    }

    fn decode_from_wire(&self, _buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        Ok(Box::new(()))
    }

    fn transform(&self, _body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
        Box::new(())
    }
}

struct StringCodec;

impl MessageCodec for StringCodec {
    fn name(&self) -> &str {
        "string"
    }

    fn system_id(&self) -> i8 {
        1
    }

    fn encode_to_wire(
        &self,
        buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        let s = body.downcast_ref::<String>().ok_or_else(|| mismatch("string"))?;
        put_len_prefixed(buf, s.as_bytes());
        Ok(())
    }

    fn decode_from_wire(&self, buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        let payload = get_len_prefixed(buf)?;
        let s = String::from_utf8(payload.to_vec()).map_err(|_| malformed("invalid utf-8"))?;
        Ok(Box::new(s))
    }

    fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
        Box::new(body.downcast_ref::<String>().cloned().unwrap_or_default())
    }
}

struct BufferCodec;

impl MessageCodec for BufferCodec {
    fn name(&self) -> &str {
        "buffer"
    }

    fn system_id(&self) -> i8 {
        2
    }

    fn encode_to_wire(
        &self,
        buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        let b = body.downcast_ref::<Bytes>().ok_or_else(|| mismatch("buffer"))?;
        put_len_prefixed(buf, b);
        Ok(())
    }

    fn decode_from_wire(&self, buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        Ok(Box::new(get_len_prefixed(buf)?))
    }

    fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
        // Bytes is immutable; sharing the backing storage is safe.
        Box::new(body.downcast_ref::<Bytes>().cloned().unwrap_or_default())
    }
}

struct ByteArrayCodec;

impl MessageCodec for ByteArrayCodec {
    fn name(&self) -> &str {
        "bytearray"
    }

    fn system_id(&self) -> i8 {
        3
    }

    fn encode_to_wire(
        &self,
        buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        let b = body
            .downcast_ref::<Vec<u8>>()
            .ok_or_else(|| mismatch("bytearray"))?;
        put_len_prefixed(buf, b);
        Ok(())
    }

    fn decode_from_wire(&self, buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        Ok(Box::new(get_len_prefixed(buf)?.to_vec()))
    }

    fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
        Box::new(body.downcast_ref::<Vec<u8>>().cloned().unwrap_or_default())
    }
}

macro_rules! numeric_codec {
    ($codec:ident, $ty:ty, $name:literal, $id:literal, $put:ident, $get:ident, $size:literal) => {
        struct $codec;

        impl MessageCodec for $codec {
            fn name(&self) -> &str {
                $name
            }

            fn system_id(&self) -> i8 {
                $id
            }

            fn encode_to_wire(
                &self,
                buf: &mut BytesMut,
                body: &(dyn Any + Send + Sync),
            ) -> Result<(), CodecError> {
                let v = body.downcast_ref::<$ty>().ok_or_else(|| mismatch($name))?;
                buf.$put(*v);
                Ok(())
            }

            fn decode_from_wire(
                &self,
                buf: &mut Bytes,
            ) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
                if buf.remaining() < $size {
                    return Err(malformed(concat!("truncated ", $name)));
                }
                Ok(Box::new(buf.$get()))
            }

            fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
                Box::new(body.downcast_ref::<$ty>().copied().unwrap_or_default())
            }
        }
    };
}

numeric_codec!(ByteCodec, i8, "byte", 4, put_i8, get_i8, 1);
numeric_codec!(ShortCodec, i16, "short", 5, put_i16, get_i16, 2);
numeric_codec!(IntCodec, i32, "int", 6, put_i32, get_i32, 4);
numeric_codec!(LongCodec, i64, "long", 7, put_i64, get_i64, 8);
numeric_codec!(FloatCodec, f32, "float", 8, put_f32, get_f32, 4);
numeric_codec!(DoubleCodec, f64, "double", 9, put_f64, get_f64, 8);

struct BooleanCodec;

impl MessageCodec for BooleanCodec {
    fn name(&self) -> &str {
        "boolean"
    }

    fn system_id(&self) -> i8 {
        10
    }

    fn encode_to_wire(
        &self,
        buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        let v = body.downcast_ref::<bool>().ok_or_else(|| mismatch("boolean"))?;
        buf.put_u8(u8::from(*v));
        Ok(())
    }

    fn decode_from_wire(&self, buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        if buf.remaining() < 1 {
            return Err(malformed("truncated boolean"));
        }
        Ok(Box::new(buf.get_u8() != 0))
    }

    fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
        Box::new(body.downcast_ref::<bool>().copied().unwrap_or_default())
    }
}

struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn system_id(&self) -> i8 {
        11
    }

    fn encode_to_wire(
        &self,
        buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        let v = body
            .downcast_ref::<serde_json::Value>()
            .ok_or_else(|| mismatch("json"))?;
        let text = serde_json::to_vec(v).map_err(|e| malformed(e.to_string()))?;
        put_len_prefixed(buf, &text);
        Ok(())
    }

    fn decode_from_wire(&self, buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        let payload = get_len_prefixed(buf)?;
        let v: serde_json::Value =
            serde_json::from_slice(&payload).map_err(|e| malformed(e.to_string()))?;
        Ok(Box::new(v))
    }

    fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
        // Deep copy: json values are mutable trees.
        Box::new(
            body.downcast_ref::<serde_json::Value>()
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )
    }
}

struct ReplyExceptionCodec;

impl MessageCodec for ReplyExceptionCodec {
    fn name(&self) -> &str {
        "replyexception"
    }

    fn system_id(&self) -> i8 {
        12
    }

    fn encode_to_wire(
        &self,
        buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        let e = body
            .downcast_ref::<ReplyError>()
            .ok_or_else(|| mismatch("replyexception"))?;
        buf.put_u8(e.kind.to_int());
        buf.put_i32(e.code);
        if e.message.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_u8(1);
            put_len_prefixed(buf, e.message.as_bytes());
        }
        Ok(())
    }

    fn decode_from_wire(&self, buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        if buf.remaining() < 6 {
            return Err(malformed("truncated reply exception"));
        }
        let kind = ReplyFailure::from_int(buf.get_u8());
        let code = buf.get_i32();
        let message = if buf.get_u8() != 0 {
            let payload = get_len_prefixed(buf)?;
            String::from_utf8(payload.to_vec()).map_err(|_| malformed("invalid utf-8"))?
        } else {
            String::new()
        };
        Ok(Box::new(ReplyError { kind, code, message }))
    }

    fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
        Box::new(
            body.downcast_ref::<ReplyError>()
                .cloned()
                .unwrap_or_else(|| ReplyError::new(ReplyFailure::RecipientFailure, "")),
        )
    }
}

static BUILTINS: Lazy<Vec<Arc<dyn MessageCodec>>> = Lazy::new(|| {
    vec![
        Arc::new(NullCodec),
        Arc::new(StringCodec),
        Arc::new(BufferCodec),
        Arc::new(ByteArrayCodec),
        Arc::new(ByteCodec),
        Arc::new(ShortCodec),
        Arc::new(IntCodec),
        Arc::new(LongCodec),
        Arc::new(FloatCodec),
        Arc::new(DoubleCodec),
        Arc::new(BooleanCodec),
        Arc::new(JsonCodec),
        Arc::new(ReplyExceptionCodec),
    ]
});

static BY_TYPE: Lazy<HashMap<TypeId, Arc<dyn MessageCodec>>> = Lazy::new(|| {
    let b = &*BUILTINS;
    let mut map: HashMap<TypeId, Arc<dyn MessageCodec>> = HashMap::new();
    map.insert(TypeId::of::<()>(), Arc::clone(&b[0]));
    map.insert(TypeId::of::<String>(), Arc::clone(&b[1]));
    map.insert(TypeId::of::<Bytes>(), Arc::clone(&b[2]));
    map.insert(TypeId::of::<Vec<u8>>(), Arc::clone(&b[3]));
    map.insert(TypeId::of::<i8>(), Arc::clone(&b[4]));
    map.insert(TypeId::of::<i16>(), Arc::clone(&b[5]));
    map.insert(TypeId::of::<i32>(), Arc::clone(&b[6]));
    map.insert(TypeId::of::<i64>(), Arc::clone(&b[7]));
    map.insert(TypeId::of::<f32>(), Arc::clone(&b[8]));
    map.insert(TypeId::of::<f64>(), Arc::clone(&b[9]));
    map.insert(TypeId::of::<bool>(), Arc::clone(&b[10]));
    map.insert(TypeId::of::<serde_json::Value>(), Arc::clone(&b[11]));
    map.insert(TypeId::of::<ReplyError>(), Arc::clone(&b[12]));
    map
});

/// Built-in codec for the runtime type of `body`, if one exists.
pub(crate) fn builtin_for(body: &(dyn Any + Send + Sync)) -> Option<Arc<dyn MessageCodec>> {
    BY_TYPE.get(&body.type_id()).map(Arc::clone)
}

/// Whether `name` collides with a built-in codec name.
pub(crate) fn is_builtin_name(name: &str) -> bool {
    BUILTINS.iter().any(|c| c.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(
        codec: &dyn MessageCodec,
        body: Box<dyn Any + Send + Sync>,
    ) -> Box<dyn Any + Send + Sync> {
        let mut buf = BytesMut::new();
        codec.encode_to_wire(&mut buf, body.as_ref()).unwrap();
        let mut wire = buf.freeze();
        let decoded = codec.decode_from_wire(&mut wire).unwrap();
        assert!(wire.is_empty(), "codec left trailing bytes");
        decoded
    }

    #[test]
    fn test_string_codec_wire_format() {
        let mut buf = BytesMut::new();
        StringCodec
            .encode_to_wire(&mut buf, &String::from("hi"))
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 2, b'h', b'i']);
        let decoded = round_trip(&StringCodec, Box::new(String::from("héllo")));
        assert_eq!(decoded.downcast_ref::<String>().unwrap(), "héllo");
    }

    #[test]
    fn test_numeric_codecs_are_big_endian() {
        let mut buf = BytesMut::new();
        IntCodec.encode_to_wire(&mut buf, &0x0102_0304i32).unwrap();
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
        let decoded = round_trip(&LongCodec, Box::new(-5i64));
        assert_eq!(*decoded.downcast_ref::<i64>().unwrap(), -5);
        let decoded = round_trip(&DoubleCodec, Box::new(1.5f64));
        assert_eq!(*decoded.downcast_ref::<f64>().unwrap(), 1.5);
    }

    #[test]
    fn test_json_codec_round_trip() {
        let v = serde_json::json!({"a": [1, 2], "b": "x"});
        let decoded = round_trip(&JsonCodec, Box::new(v.clone()));
        assert_eq!(decoded.downcast_ref::<serde_json::Value>().unwrap(), &v);
    }

    #[test]
    fn test_reply_exception_round_trip() {
        let e = ReplyError::recipient(7, "nope");
        let decoded = round_trip(&ReplyExceptionCodec, Box::new(e));
        let e = decoded.downcast_ref::<ReplyError>().unwrap();
        assert_eq!(e.kind, ReplyFailure::RecipientFailure);
        assert_eq!(e.code, 7);
        assert_eq!(e.message, "nope");

        let empty = ReplyError::new(ReplyFailure::Timeout, "");
        let decoded = round_trip(&ReplyExceptionCodec, Box::new(empty));
        let e = decoded.downcast_ref::<ReplyError>().unwrap();
        assert_eq!(e.kind, ReplyFailure::Timeout);
        assert!(e.message.is_empty());
    }

    #[test]
    fn test_body_type_mismatch_is_rejected() {
        let mut buf = BytesMut::new();
        let err = StringCodec.encode_to_wire(&mut buf, &42i32).unwrap_err();
        assert!(matches!(err, CodecError::BodyTypeMismatch { codec: "string" }));
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let mut buf = Bytes::from_static(&[0, 0, 0, 9, b'x']);
        assert!(StringCodec.decode_from_wire(&mut buf).is_err());
        let mut buf = Bytes::from_static(&[1, 2]);
        assert!(IntCodec.decode_from_wire(&mut buf).is_err());
    }

    #[test]
    fn test_builtin_lookup_covers_all_ids() {
        for (i, codec) in BUILTINS.iter().enumerate() {
            assert_eq!(codec.system_id(), i as i8);
        }
        let body: Box<dyn Any + Send + Sync> = Box::new(3.5f32);
        assert_eq!(builtin_for(body.as_ref()).unwrap().name(), "float");
        assert!(is_builtin_name("json"));
        assert!(!is_builtin_name("mine"));
    }
}

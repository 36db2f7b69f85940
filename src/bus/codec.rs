//! # Message codecs and codec resolution.
//!
//! A [`MessageCodec`] owns two independent jobs:
//!
//! - the wire form (`encode_to_wire`/`decode_from_wire`), unused for local
//!   delivery but part of the contract so a codec written today survives a
//!   clustered transport tomorrow;
//! - the local [`MessageCodec::transform`], producing the copy a receiver
//!   sees so mutation never leaks between sender and receivers.
//!
//! [`CodecManager`] resolves the codec for a body. Resolution order:
//!
//! 1. explicit codec name from the delivery options (user codecs only)
//! 2. built-in codec matching the body's runtime type
//! 3. user default codec registered for the body's runtime type
//!
//! ## Rules
//! - User codecs must report `system_id() == -1`; built-in ids are reserved.
//! - Names are unique across user and built-in codecs.
//! - At most one default codec per body type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use crate::bus::codecs;
use crate::error::{BusError, CodecError};

/// Encodes, decodes and locally transforms one body type.
pub trait MessageCodec: Send + Sync {
    /// Unique codec name; resolves explicit `codec_name` delivery options.
    fn name(&self) -> &str;

    /// Reserved id for built-in codecs. User codecs keep the default `-1`.
    fn system_id(&self) -> i8 {
        -1
    }

    /// Appends the wire form of `body` to `buf`.
    ///
    /// Fails with [`CodecError::BodyTypeMismatch`] when `body` is not the
    /// type this codec handles.
    fn encode_to_wire(
        &self,
        buf: &mut BytesMut,
        body: &(dyn Any + Send + Sync),
    ) -> Result<(), CodecError>;

    /// Decodes one value from the front of `buf`.
    fn decode_from_wire(&self, buf: &mut Bytes) -> Result<Box<dyn Any + Send + Sync>, CodecError>;

    /// Produces the copy handed to a local receiver.
    ///
    /// Immutable bodies may be returned as cheap clones; mutable bodies must
    /// be deep-copied so no state is shared across delivery.
    fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync>;
}

/// Registry of user codecs plus per-type defaults.
pub(crate) struct CodecManager {
    user: RwLock<HashMap<String, Arc<dyn MessageCodec>>>,
    default_by_type: RwLock<HashMap<TypeId, Arc<dyn MessageCodec>>>,
}

impl CodecManager {
    pub(crate) fn new() -> CodecManager {
        CodecManager {
            user: RwLock::new(HashMap::new()),
            default_by_type: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a named user codec.
    pub(crate) fn register(&self, codec: Arc<dyn MessageCodec>) -> Result<(), BusError> {
        let id = codec.system_id();
        if id != -1 {
            return Err(BusError::SystemCodecId { id });
        }
        let name = codec.name().to_string();
        if codecs::is_builtin_name(&name) {
            return Err(BusError::DuplicateCodec { name });
        }
        let mut user = self.user.write();
        if user.contains_key(&name) {
            return Err(BusError::DuplicateCodec { name });
        }
        user.insert(name, codec);
        Ok(())
    }

    /// Removes a named user codec. Returns whether it was present.
    pub(crate) fn unregister(&self, name: &str) -> bool {
        self.user.write().remove(name).is_some()
    }

    /// Registers a codec used by default for bodies of `type_id`.
    pub(crate) fn register_default(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<(), BusError> {
        let id = codec.system_id();
        if id != -1 {
            return Err(BusError::SystemCodecId { id });
        }
        let mut defaults = self.default_by_type.write();
        if defaults.contains_key(&type_id) {
            return Err(BusError::DuplicateDefaultCodec { type_name });
        }
        defaults.insert(type_id, codec);
        Ok(())
    }

    /// Removes the default codec for `type_id`. Returns whether one existed.
    pub(crate) fn unregister_default(&self, type_id: TypeId) -> bool {
        self.default_by_type.write().remove(&type_id).is_some()
    }

    /// Resolves the codec for `body`.
    ///
    /// `type_name` is only used to build the error message.
    pub(crate) fn lookup(
        &self,
        body: &(dyn Any + Send + Sync),
        type_name: &'static str,
        codec_name: Option<&str>,
    ) -> Result<Arc<dyn MessageCodec>, BusError> {
        if let Some(name) = codec_name {
            return match self.user.read().get(name) {
                Some(codec) => Ok(Arc::clone(codec)),
                None => Err(BusError::UnknownCodec {
                    name: name.to_string(),
                }),
            };
        }
        if let Some(codec) = codecs::builtin_for(body) {
            return Ok(codec);
        }
        if let Some(codec) = self.default_by_type.read().get(&body.type_id()) {
            return Ok(Arc::clone(codec));
        }
        Err(BusError::NoCodecForType { type_name })
    }
}

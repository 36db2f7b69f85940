//! Error types used by the corebus runtime and event bus.
//!
//! This module defines the error surface of the crate:
//!
//! - [`RuntimeError`]: errors raised by the runtime itself (timers, lifecycle).
//! - [`BusError`]: synchronous precondition violations on the event bus
//!   (codec resolution, duplicate registration, lifecycle misuse).
//! - [`ReplyError`] / [`ReplyFailure`]: asynchronous failures delivered to a
//!   reply handler (no handlers, timeout, recipient failure).
//! - [`CodecError`]: wire-format and body-type violations inside a codec.
//!
//! All types provide `as_label()` returning a short stable snake_case label
//! for logs and metrics.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type carried by blocking-work results and exception handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// # Errors produced by the corebus runtime.
///
/// These represent misuse of the runtime itself, not failures of user tasks.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A timer was scheduled with a delay below the 1 ms minimum.
    #[error("cannot schedule a timer with delay {delay:?}, minimum is 1 ms")]
    InvalidTimerDelay {
        /// The rejected delay.
        delay: Duration,
    },

    /// The runtime has been closed; no further work is accepted.
    #[error("runtime is closed")]
    Closed,
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::InvalidTimerDelay { .. } => "runtime_invalid_timer_delay",
            RuntimeError::Closed => "runtime_closed",
        }
    }
}

/// # Synchronous errors raised by event bus operations.
///
/// These surface at the call site of `send`/`publish`/`consumer`/codec
/// registration, never through an asynchronous callback.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// The bus has not been started yet.
    #[error("event bus is not started")]
    NotStarted,

    /// `start` was called on a bus that is already running.
    #[error("event bus is already started")]
    AlreadyStarted,

    /// No codec is registered for the runtime type of the body.
    #[error("no message codec for type: {type_name}")]
    NoCodecForType {
        /// Type name of the rejected body.
        type_name: &'static str,
    },

    /// An explicit codec name did not resolve to a registered codec.
    #[error("no message codec registered with name: {name}")]
    UnknownCodec {
        /// The unresolved codec name.
        name: String,
    },

    /// A codec with the same name is already registered.
    #[error("a codec is already registered with name: {name}")]
    DuplicateCodec {
        /// The conflicting codec name.
        name: String,
    },

    /// A default codec is already registered for the body type.
    #[error("a default codec is already registered for type: {type_name}")]
    DuplicateDefaultCodec {
        /// The conflicting body type.
        type_name: &'static str,
    },

    /// User codecs must report a system id of -1; built-in ids are reserved.
    #[error("cannot register a codec with reserved system id {id}")]
    SystemCodecId {
        /// The reserved id the codec tried to claim.
        id: i8,
    },

    /// The consumer has no handler attached or was already unregistered.
    #[error("consumer is not registered")]
    NotRegistered,
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::NotStarted => "bus_not_started",
            BusError::AlreadyStarted => "bus_already_started",
            BusError::NoCodecForType { .. } => "bus_no_codec_for_type",
            BusError::UnknownCodec { .. } => "bus_unknown_codec",
            BusError::DuplicateCodec { .. } => "bus_duplicate_codec",
            BusError::DuplicateDefaultCodec { .. } => "bus_duplicate_default_codec",
            BusError::SystemCodecId { .. } => "bus_system_codec_id",
            BusError::NotRegistered => "bus_not_registered",
        }
    }
}

/// Classification of an asynchronous reply failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyFailure {
    /// No reply arrived within the configured timeout.
    Timeout,
    /// The address had no live consumer at send time.
    NoHandlers,
    /// The recipient called `fail` with an application-level code/message.
    RecipientFailure,
}

impl ReplyFailure {
    /// Stable wire value of the failure kind.
    pub fn to_int(self) -> u8 {
        match self {
            ReplyFailure::Timeout => 0,
            ReplyFailure::NoHandlers => 1,
            ReplyFailure::RecipientFailure => 2,
        }
    }

    /// Decodes a wire value; unknown values map to `RecipientFailure`.
    pub fn from_int(i: u8) -> ReplyFailure {
        match i {
            0 => ReplyFailure::Timeout,
            1 => ReplyFailure::NoHandlers,
            _ => ReplyFailure::RecipientFailure,
        }
    }
}

impl fmt::Display for ReplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplyFailure::Timeout => "TIMEOUT",
            ReplyFailure::NoHandlers => "NO_HANDLERS",
            ReplyFailure::RecipientFailure => "RECIPIENT_FAILURE",
        };
        f.write_str(s)
    }
}

/// # Failure delivered to a reply handler.
///
/// Carries the failure kind, an application-defined code (meaningful for
/// [`ReplyFailure::RecipientFailure`], `-1` otherwise) and a human-readable
/// message. Travels through the reply-exception codec like any other body.
#[derive(Error, Clone, Debug)]
#[error("({kind}, {code}) {message}")]
pub struct ReplyError {
    /// Failure classification.
    pub kind: ReplyFailure,
    /// Application failure code; `-1` unless set by the recipient.
    pub code: i32,
    /// Human-readable failure message.
    pub message: String,
}

impl ReplyError {
    /// Creates a reply error of the given kind with code `-1`.
    pub fn new(kind: ReplyFailure, message: impl Into<String>) -> ReplyError {
        ReplyError {
            kind,
            code: -1,
            message: message.into(),
        }
    }

    /// Creates a recipient failure with an application code.
    pub fn recipient(code: i32, message: impl Into<String>) -> ReplyError {
        ReplyError {
            kind: ReplyFailure::RecipientFailure,
            code,
            message: message.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self.kind {
            ReplyFailure::Timeout => "reply_timeout",
            ReplyFailure::NoHandlers => "reply_no_handlers",
            ReplyFailure::RecipientFailure => "reply_recipient_failure",
        }
    }
}

/// # Errors raised inside a message codec.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CodecError {
    /// The body handed to the codec is not the type the codec encodes.
    #[error("codec {codec} cannot handle body of a foreign type")]
    BodyTypeMismatch {
        /// Name of the rejected codec.
        codec: &'static str,
    },

    /// The wire buffer does not contain a well-formed value.
    #[error("malformed wire data: {reason}")]
    Malformed {
        /// What the decoder choked on.
        reason: String,
    },
}

impl CodecError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            CodecError::BodyTypeMismatch { .. } => "codec_body_type_mismatch",
            CodecError::Malformed { .. } => "codec_malformed",
        }
    }
}

/// Extracts a readable message from a panic payload.
///
/// Scheduled tasks are isolated with `catch_unwind`; the payload ends up at
/// the context (or runtime) exception handler, which typically only wants the
/// message text.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

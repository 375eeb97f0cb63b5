// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classic CAN frames and the wire codecs the MQTT bridge speaks.
//!
//! The data model is deliberately narrow: 11-bit identifiers, payloads of
//! at most 8 bytes, and three frame kinds (data, remote, error). Both
//! constraints live in the types -- [`CobId`] validates the identifier
//! range and the payload is a fixed-capacity [`heapless::Vec`] -- so a
//! frame that exists is a frame that is legal on the wire.
//!
//! Bridged frames may additionally carry bookkeeping the bare bus does
//! not: the publishing bridge's random instance id, its publish counter,
//! and a wall-clock timestamp. Which of those survive encoding is a
//! property of the codec; see [`FrameCodec::supports_optional_field`].

pub mod binary;
pub mod json;

pub use binary::BinaryCodec;
pub use json::JsonCodec;

use std::fmt;

/// Payload of a classic CAN data frame: at most 8 bytes.
pub type Payload = heapless::Vec<u8, 8>;

/// An 11-bit CAN object identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CobId(u16);

impl CobId {
    pub const MAX: u16 = 0x7FF;

    pub fn new(raw: u16) -> Result<Self, FrameError> {
        if raw > Self::MAX {
            return Err(FrameError::IdOutOfRange(raw));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Violations of the classic-CAN frame invariants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("COB ID {0:#x} exceeds the 11-bit identifier range")]
    IdOutOfRange(u16),
    #[error("payload of {0} bytes exceeds the classic CAN maximum of 8")]
    PayloadTooLong(usize),
}

/// The three frame kinds the bridge transports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Data { cob_id: CobId, data: Payload },
    Remote { cob_id: CobId },
    Error,
}

impl FrameKind {
    pub fn cob_id(&self) -> Option<CobId> {
        match self {
            FrameKind::Data { cob_id, .. } | FrameKind::Remote { cob_id } => Some(*cob_id),
            FrameKind::Error => None,
        }
    }
}

/// A CAN frame as the bridge sees it: the bus-level kind plus the
/// optional bridge bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanFrame {
    pub kind: FrameKind,
    /// Random per-bridge-instance publisher id.
    pub pub_id: Option<u32>,
    /// The publisher's monotonic publish counter.
    pub pub_cnt: Option<u32>,
    /// Microseconds since the Unix epoch at publish time.
    pub timestamp_us: Option<u64>,
}

impl CanFrame {
    pub fn data(cob_id: u16, bytes: &[u8]) -> Result<Self, FrameError> {
        let mut data = Payload::new();
        data.extend_from_slice(bytes)
            .map_err(|_| FrameError::PayloadTooLong(bytes.len()))?;
        Ok(FrameKind::Data {
            cob_id: CobId::new(cob_id)?,
            data,
        }
        .into())
    }

    pub fn remote(cob_id: u16) -> Result<Self, FrameError> {
        Ok(FrameKind::Remote {
            cob_id: CobId::new(cob_id)?,
        }
        .into())
    }

    pub fn error() -> Self {
        FrameKind::Error.into()
    }

    pub fn cob_id(&self) -> Option<CobId> {
        self.kind.cob_id()
    }

    pub fn has_optional_fields(&self) -> bool {
        self.pub_id.is_some() || self.pub_cnt.is_some() || self.timestamp_us.is_some()
    }
}

impl From<FrameKind> for CanFrame {
    fn from(kind: FrameKind) -> Self {
        Self {
            kind,
            pub_id: None,
            pub_cnt: None,
            timestamp_us: None,
        }
    }
}

/// The optional bookkeeping fields, individually.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptionalField {
    PubId,
    PubCnt,
    TimeStamp,
}

bitflags::bitflags! {
    /// Configuration mask over the optional fields.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct OptionalFields: u8 {
        const PUB_ID = 1;
        const PUB_CNT = 2;
        const TIME_STAMP = 4;
    }
}

impl OptionalFields {
    pub fn has(self, field: OptionalField) -> bool {
        self.contains(match field {
            OptionalField::PubId => OptionalFields::PUB_ID,
            OptionalField::PubCnt => OptionalFields::PUB_CNT,
            OptionalField::TimeStamp => OptionalFields::TIME_STAMP,
        })
    }
}

/// Decode/encode failures. Encoding can only fail for frames the codec
/// cannot represent; decoding is strict and rejects anything it would not
/// itself have produced.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("record of {0} bytes is too short")]
    Truncated(usize),
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("invalid type bits {0:#04b}")]
    BadTypeBits(u8),
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("record length {actual} does not match the encoded frame ({expected})")]
    BadLength { expected: usize, actual: usize },
    #[error("frame type {ty} must not carry a payload length ({len})")]
    UnexpectedLength { ty: u8, len: usize },
    #[error("payload byte out of range: {0}")]
    BadPayloadByte(serde_json::Value),
    #[error("missing or malformed key {0:?}")]
    BadKey(&'static str),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
    #[error("codec does not support optional fields")]
    OptionalFieldsUnsupported,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A wire format for [`CanFrame`]s.
pub trait FrameCodec: Send + Sync + std::fmt::Debug {
    fn encode(&self, frame: &CanFrame) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, payload: &[u8]) -> Result<CanFrame, CodecError>;

    /// Whether the codec carries `field`; the bridge only stamps outbound
    /// frames with the fields its codec supports.
    fn supports_optional_field(&self, field: OptionalField) -> bool;
}

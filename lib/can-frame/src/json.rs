// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The JSON wire format.
//!
//! A frame is a UTF-8 JSON object: `type` is one of `"data"`, `"remote"`,
//! `"error"`; `cobId` is present for data and remote frames; `data` is an
//! array of byte values for data frames; `pubId`, `pubCnt` and `ts` are
//! the optional bookkeeping fields. The decoder is strict about the parts
//! that matter on the bus -- the three type literals, the identifier
//! range, byte-valued array entries -- and ignores keys it does not know.

use serde_json::{json, Map, Value};

use crate::{
    CanFrame, CodecError, FrameCodec, FrameKind, OptionalField, OptionalFields, Payload,
};

/// JSON codec, configured with the optional fields it should advertise.
#[derive(Clone, Debug)]
pub struct JsonCodec {
    enabled: OptionalFields,
}

impl JsonCodec {
    pub fn new(enabled: OptionalFields) -> Self {
        Self { enabled }
    }
}

impl FrameCodec for JsonCodec {
    fn encode(&self, frame: &CanFrame) -> Result<Vec<u8>, CodecError> {
        let mut obj = Map::new();
        match &frame.kind {
            FrameKind::Data { cob_id, data } => {
                obj.insert("type".into(), json!("data"));
                obj.insert("cobId".into(), json!(cob_id.raw()));
                obj.insert("data".into(), json!(data.as_slice()));
            }
            FrameKind::Remote { cob_id } => {
                obj.insert("type".into(), json!("remote"));
                obj.insert("cobId".into(), json!(cob_id.raw()));
            }
            FrameKind::Error => {
                obj.insert("type".into(), json!("error"));
            }
        }
        if let Some(id) = frame.pub_id {
            obj.insert("pubId".into(), json!(id));
        }
        if let Some(cnt) = frame.pub_cnt {
            obj.insert("pubCnt".into(), json!(cnt));
        }
        if let Some(ts) = frame.timestamp_us {
            obj.insert("ts".into(), json!(ts));
        }
        serde_json::to_vec(&Value::Object(obj))
            .map_err(|e| CodecError::MalformedJson(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<CanFrame, CodecError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| CodecError::MalformedJson(e.to_string()))?;
        let obj = value.as_object().ok_or(CodecError::NotAnObject)?;

        let ty = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CodecError::BadKey("type"))?;

        let kind = match ty {
            "data" => FrameKind::Data {
                cob_id: decode_cob_id(obj)?,
                data: decode_data(obj)?,
            },
            "remote" => FrameKind::Remote {
                cob_id: decode_cob_id(obj)?,
            },
            "error" => FrameKind::Error,
            other => return Err(CodecError::UnknownType(other.to_string())),
        };

        Ok(CanFrame {
            kind,
            pub_id: decode_u32(obj, "pubId")?,
            pub_cnt: decode_u32(obj, "pubCnt")?,
            timestamp_us: decode_u64(obj, "ts")?,
        })
    }

    fn supports_optional_field(&self, field: OptionalField) -> bool {
        self.enabled.has(field)
    }
}

fn decode_cob_id(obj: &Map<String, Value>) -> Result<crate::CobId, CodecError> {
    let raw = obj
        .get("cobId")
        .and_then(Value::as_u64)
        .ok_or(CodecError::BadKey("cobId"))?;
    let raw = u16::try_from(raw).map_err(|_| crate::FrameError::IdOutOfRange(u16::MAX))?;
    Ok(crate::CobId::new(raw)?)
}

fn decode_data(obj: &Map<String, Value>) -> Result<Payload, CodecError> {
    let array = obj
        .get("data")
        .and_then(Value::as_array)
        .ok_or(CodecError::BadKey("data"))?;
    if array.len() > 8 {
        return Err(crate::FrameError::PayloadTooLong(array.len()).into());
    }
    let mut data = Payload::new();
    for entry in array {
        let byte = entry
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| CodecError::BadPayloadByte(entry.clone()))?;
        // Capacity was checked above.
        let _ = data.push(byte);
    }
    Ok(data)
}

fn decode_u32(obj: &Map<String, Value>, key: &'static str) -> Result<Option<u32>, CodecError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or(CodecError::BadKey(key)),
    }
}

fn decode_u64(obj: &Map<String, Value>, key: &'static str) -> Result<Option<u64>, CodecError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or(CodecError::BadKey(key)),
    }
}

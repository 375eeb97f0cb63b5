// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The compact binary wire format.
//!
//! Records are at most 12 bytes and byte-exact:
//!
//! | byte | contents |
//! |------|----------|
//! | 0    | magic, `0x42` |
//! | 1    | frame type in the low 2 bits, payload length in the high 6 |
//! | 2-3  | COB ID, big-endian (absent for error frames) |
//! | 4..  | payload (data frames only) |
//!
//! Type encodings: 0 = data, 1 = remote, 2 = error. Record lengths are
//! exact: error frames are 2 bytes, remote frames 4, data frames
//! 4 + length. The format has no room for the optional bookkeeping
//! fields; encoding a frame that carries any of them is an error.

use crate::{CanFrame, CobId, CodecError, FrameCodec, FrameKind, OptionalField, Payload};

pub const MAGIC: u8 = 0x42;

const TYPE_DATA: u8 = 0;
const TYPE_REMOTE: u8 = 1;
const TYPE_ERROR: u8 = 2;

/// The fixed binary codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for BinaryCodec {
    fn encode(&self, frame: &CanFrame) -> Result<Vec<u8>, CodecError> {
        if frame.has_optional_fields() {
            return Err(CodecError::OptionalFieldsUnsupported);
        }
        let mut record = Vec::with_capacity(12);
        record.push(MAGIC);
        match &frame.kind {
            FrameKind::Data { cob_id, data } => {
                record.push(TYPE_DATA | (data.len() as u8) << 2);
                record.extend_from_slice(&cob_id.raw().to_be_bytes());
                record.extend_from_slice(data);
            }
            FrameKind::Remote { cob_id } => {
                record.push(TYPE_REMOTE);
                record.extend_from_slice(&cob_id.raw().to_be_bytes());
            }
            FrameKind::Error => record.push(TYPE_ERROR),
        }
        Ok(record)
    }

    fn decode(&self, payload: &[u8]) -> Result<CanFrame, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::Truncated(payload.len()));
        }
        if payload[0] != MAGIC {
            return Err(CodecError::BadMagic(payload[0]));
        }
        let ty = payload[1] & 0b11;
        let len = usize::from(payload[1] >> 2);

        let expected = match ty {
            TYPE_DATA => 4 + len,
            TYPE_REMOTE | TYPE_ERROR if len != 0 => {
                return Err(CodecError::UnexpectedLength { ty, len })
            }
            TYPE_REMOTE => 4,
            TYPE_ERROR => 2,
            bits => return Err(CodecError::BadTypeBits(bits)),
        };
        if payload.len() != expected {
            return Err(CodecError::BadLength {
                expected,
                actual: payload.len(),
            });
        }

        let kind = match ty {
            TYPE_ERROR => FrameKind::Error,
            TYPE_REMOTE => FrameKind::Remote {
                cob_id: decode_cob_id(payload)?,
            },
            TYPE_DATA => {
                if len > 8 {
                    return Err(crate::FrameError::PayloadTooLong(len).into());
                }
                let mut data = Payload::new();
                // Length was validated against the capacity above.
                let _ = data.extend_from_slice(&payload[4..4 + len]);
                FrameKind::Data {
                    cob_id: decode_cob_id(payload)?,
                    data,
                }
            }
            _ => unreachable!(),
        };
        Ok(kind.into())
    }

    fn supports_optional_field(&self, _field: OptionalField) -> bool {
        false
    }
}

fn decode_cob_id(payload: &[u8]) -> Result<CobId, CodecError> {
    let raw = u16::from_be_bytes([payload[2], payload[3]]);
    Ok(CobId::new(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn data_frame_is_byte_exact() {
        let frame = CanFrame::data(0x123, &[1, 2, 3]).unwrap();
        let wire = BinaryCodec.encode(&frame).unwrap();
        assert_eq!(wire, vec![0x42, 3 << 2, 0x01, 0x23, 1, 2, 3]);
        assert_eq!(BinaryCodec.decode(&wire).unwrap(), frame);
    }

    #[test]
    fn remote_frame_is_four_bytes() {
        let frame = CanFrame::remote(0x7FF).unwrap();
        let wire = BinaryCodec.encode(&frame).unwrap();
        assert_eq!(wire, vec![0x42, 0x01, 0x07, 0xFF]);
        assert_eq!(BinaryCodec.decode(&wire).unwrap(), frame);
    }

    #[test]
    fn error_frame_is_two_bytes() {
        let wire = BinaryCodec.encode(&CanFrame::error()).unwrap();
        assert_eq!(wire, vec![0x42, 0x02]);
        assert_eq!(BinaryCodec.decode(&wire).unwrap().kind, FrameKind::Error);
    }

    #[test]
    fn rejects_optional_fields() {
        let mut frame = CanFrame::data(1, &[]).unwrap();
        frame.pub_cnt = Some(1);
        assert_eq!(
            BinaryCodec.encode(&frame),
            Err(CodecError::OptionalFieldsUnsupported)
        );
    }

    #[test]
    fn rejects_bad_magic() {
        assert_eq!(
            BinaryCodec.decode(&[0x43, 0x02]),
            Err(CodecError::BadMagic(0x43))
        );
    }

    #[test]
    fn rejects_type_bits_3() {
        assert_eq!(
            BinaryCodec.decode(&[0x42, 0x03, 0, 0]),
            Err(CodecError::BadTypeBits(3))
        );
    }

    #[test]
    fn rejects_length_mismatch() {
        // Claims 3 payload bytes, carries 2.
        assert_eq!(
            BinaryCodec.decode(&[0x42, 3 << 2, 0x01, 0x23, 1, 2]),
            Err(CodecError::BadLength {
                expected: 7,
                actual: 6
            })
        );
        // Remote frames must not carry a length.
        assert_eq!(
            BinaryCodec.decode(&[0x42, 0x01 | (1 << 2), 0x01, 0x23]),
            Err(CodecError::UnexpectedLength { ty: 1, len: 1 })
        );
    }

    #[test]
    fn rejects_out_of_range_id() {
        assert_eq!(
            BinaryCodec.decode(&[0x42, 0x01, 0x08, 0x00]),
            Err(CodecError::Frame(crate::FrameError::IdOutOfRange(0x800)))
        );
    }

    #[test]
    fn rejects_overlong_payload_claim() {
        let mut wire = vec![0x42, 9 << 2, 0x00, 0x01];
        wire.extend_from_slice(&[0; 9]);
        assert_eq!(
            BinaryCodec.decode(&wire),
            Err(CodecError::Frame(crate::FrameError::PayloadTooLong(9)))
        );
    }

    prop_compose! {
        fn arb_bus_frame()(
            which in 0..3u8,
            cob_id in 0..=0x7FFu16,
            data in proptest::collection::vec(any::<u8>(), 0..=8),
        ) -> CanFrame {
            match which {
                0 => CanFrame::data(cob_id, &data).unwrap(),
                1 => CanFrame::remote(cob_id).unwrap(),
                _ => CanFrame::error(),
            }
        }
    }

    proptest! {
        #[test]
        fn any_bus_frame_round_trips(frame in arb_bus_frame()) {
            let wire = BinaryCodec.encode(&frame).unwrap();
            prop_assert!(wire.len() <= 12);
            prop_assert_eq!(BinaryCodec.decode(&wire).unwrap(), frame);
        }
    }
}

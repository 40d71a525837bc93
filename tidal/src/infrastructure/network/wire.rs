// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Network Wire Format
//!
//! Length-prefixed frames carrying tuple-buffer payloads and control
//! signals between nodes. Every frame names its partition
//! `(query, pipeline, origin)`; control frames carry a tag and an empty
//! payload. All integers are little-endian, matching the buffer cell
//! encoding, so a payload crosses the wire byte-identical to its source
//! buffer prefix.
//!
//! ```text
//! [u32 frame_len]                      -- bytes after this field
//! [u64 query][u64 pipeline][u64 origin]
//! [u64 sequence][u64 chunk][u8 last]
//! [u64 watermark][u8 control_tag][u64 epoch]
//! [u32 payload_len][payload bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use tidal_domain::{EngineError, OriginId, Partition, PipelineId, QueryId};

/// Control vocabulary of the wire; `Data` frames carry payload instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTag {
    Initialize,
    HardEos,
    SoftEos,
    FailEos,
    Epoch,
}

impl ControlTag {
    fn to_byte(self) -> u8 {
        match self {
            ControlTag::Initialize => 1,
            ControlTag::HardEos => 2,
            ControlTag::SoftEos => 3,
            ControlTag::FailEos => 4,
            ControlTag::Epoch => 5,
        }
    }

    fn from_byte(byte: u8) -> Result<Option<Self>, EngineError> {
        Ok(match byte {
            0 => None,
            1 => Some(ControlTag::Initialize),
            2 => Some(ControlTag::HardEos),
            3 => Some(ControlTag::SoftEos),
            4 => Some(ControlTag::FailEos),
            5 => Some(ControlTag::Epoch),
            other => {
                return Err(EngineError::SerializationError(format!(
                    "unknown control tag {other}"
                )));
            }
        })
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub partition: Partition,
    pub sequence_number: u64,
    pub chunk_number: u64,
    pub is_last_chunk: bool,
    pub watermark: u64,
    /// `None` marks a data frame.
    pub control: Option<ControlTag>,
    /// Barrier payload for `Epoch` frames, zero otherwise.
    pub epoch: u64,
    pub payload: Bytes,
}

/// Fixed header bytes after the length field.
const HEADER_LEN: usize = 8 * 3 + 8 + 8 + 1 + 8 + 1 + 8 + 4;

impl Frame {
    pub fn data(
        partition: Partition,
        sequence_number: u64,
        chunk_number: u64,
        is_last_chunk: bool,
        watermark: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            partition,
            sequence_number,
            chunk_number,
            is_last_chunk,
            watermark,
            control: None,
            epoch: 0,
            payload,
        }
    }

    pub fn control(partition: Partition, tag: ControlTag) -> Self {
        Self {
            partition,
            sequence_number: 0,
            chunk_number: 0,
            is_last_chunk: true,
            watermark: 0,
            control: Some(tag),
            epoch: 0,
            payload: Bytes::new(),
        }
    }

    pub fn epoch(partition: Partition, epoch: u64) -> Self {
        let mut frame = Self::control(partition, ControlTag::Epoch);
        frame.epoch = epoch;
        frame
    }

    pub fn is_control(&self) -> bool {
        self.control.is_some()
    }

    /// Appends the encoded frame to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        let frame_len = HEADER_LEN + self.payload.len();
        out.reserve(4 + frame_len);
        out.put_u32_le(frame_len as u32);
        out.put_u64_le(self.partition.query_id.raw());
        out.put_u64_le(self.partition.pipeline_id.raw());
        out.put_u64_le(self.partition.origin_id.raw());
        out.put_u64_le(self.sequence_number);
        out.put_u64_le(self.chunk_number);
        out.put_u8(self.is_last_chunk as u8);
        out.put_u64_le(self.watermark);
        out.put_u8(self.control.map(ControlTag::to_byte).unwrap_or(0));
        out.put_u64_le(self.epoch);
        out.put_u32_le(self.payload.len() as u32);
        out.put_slice(&self.payload);
    }

    /// Removes and decodes one frame from `buf`, or `Ok(None)` while the
    /// frame is still incomplete.
    ///
    /// # Errors
    /// `EngineError::SerializationError` for malformed headers; the
    /// connection carrying them is unusable afterwards.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, EngineError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len < HEADER_LEN {
            return Err(EngineError::SerializationError(format!(
                "frame length {frame_len} below header size"
            )));
        }
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }
        buf.advance(4);
        let query = buf.get_u64_le();
        let pipeline = buf.get_u64_le();
        let origin = buf.get_u64_le();
        let sequence_number = buf.get_u64_le();
        let chunk_number = buf.get_u64_le();
        let is_last_chunk = buf.get_u8() != 0;
        let watermark = buf.get_u64_le();
        let control = ControlTag::from_byte(buf.get_u8())?;
        let epoch = buf.get_u64_le();
        let payload_len = buf.get_u32_le() as usize;
        if payload_len != frame_len - HEADER_LEN {
            return Err(EngineError::SerializationError(format!(
                "payload length {payload_len} disagrees with frame length {frame_len}"
            )));
        }
        if control.is_some() && payload_len != 0 {
            return Err(EngineError::SerializationError(
                "control frame with payload".into(),
            ));
        }
        let payload = buf.split_to(payload_len).freeze();
        let partition = Partition::new(
            QueryId::new(query).map_err(|e| EngineError::SerializationError(e.to_string()))?,
            PipelineId::new(pipeline).map_err(|e| EngineError::SerializationError(e.to_string()))?,
            OriginId::new(origin).map_err(|e| EngineError::SerializationError(e.to_string()))?,
        );
        Ok(Some(Frame {
            partition,
            sequence_number,
            chunk_number,
            is_last_chunk,
            watermark,
            control,
            epoch,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::new(
            QueryId::new(1).unwrap(),
            PipelineId::new(2).unwrap(),
            OriginId::new(3).unwrap(),
        )
    }

    #[test]
    fn test_data_frame_round_trip() {
        let frame = Frame::data(partition(), 7, 1, true, 99, Bytes::from_static(b"abcdef"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_control_frame_round_trip() {
        for tag in [
            ControlTag::Initialize,
            ControlTag::HardEos,
            ControlTag::SoftEos,
            ControlTag::FailEos,
        ] {
            let frame = Frame::control(partition(), tag);
            let mut buf = BytesMut::new();
            frame.encode(&mut buf);
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.control, Some(tag));
            assert!(decoded.payload.is_empty());
        }
    }

    #[test]
    fn test_epoch_frame_carries_barrier() {
        let frame = Frame::epoch(partition(), 1234);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.control, Some(ControlTag::Epoch));
        assert_eq!(decoded.epoch, 1234);
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let frame = Frame::data(partition(), 1, 1, true, 0, Bytes::from_static(b"xyz"));
        let mut encoded = BytesMut::new();
        frame.encode(&mut encoded);

        let mut partial = BytesMut::from(&encoded[..10]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&encoded[10..]);
        assert!(Frame::decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        Frame::data(partition(), 1, 1, true, 0, Bytes::from_static(b"a")).encode(&mut buf);
        Frame::data(partition(), 2, 1, true, 0, Bytes::from_static(b"b")).encode(&mut buf);
        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_control_tag_rejected() {
        let frame = Frame::data(partition(), 1, 1, true, 0, Bytes::new());
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        // Corrupt the control byte (offset: 4 len + 24 partition + 16 + 1 + 8).
        let control_offset = 4 + 24 + 8 + 8 + 1 + 8;
        buf[control_offset] = 77;
        assert!(Frame::decode(&mut buf).is_err());
    }
}

//! 프레임 코덱
//!
//! 와이어 포맷 (little-endian, 고정 24바이트 헤더):
//! ```text
//! [magic:4][version:1][frame_type:1][channel:1][reserved:1][path_epoch:4][sequence:8][payload_len:4][payload:N]
//! ```
//! 봉인된 프레임의 payload는 ciphertext + 16바이트 Poly1305 태그.
//! 코덱 자체는 부작용 없는 순수 변환.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::event::{ChannelId, EventPayload, PeripheralEvent};
use crate::message::ControlMessage;
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 24;

/// 프레임 타입 태그
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    MouseMove = 0x01,
    MouseButton = 0x02,
    MouseScroll = 0x03,
    Key = 0x04,
    ClipboardChunk = 0x05,
    FileChunk = 0x06,
    AudioFrame = 0x07,

    Hello = 0x40,
    HelloAck = 0x41,
    Probe = 0x42,
    ProbeAck = 0x43,
    Ack = 0x44,
    RetransmitRequest = 0x45,
    Close = 0x46,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let t = match value {
            0x01 => FrameType::MouseMove,
            0x02 => FrameType::MouseButton,
            0x03 => FrameType::MouseScroll,
            0x04 => FrameType::Key,
            0x05 => FrameType::ClipboardChunk,
            0x06 => FrameType::FileChunk,
            0x07 => FrameType::AudioFrame,
            0x40 => FrameType::Hello,
            0x41 => FrameType::HelloAck,
            0x42 => FrameType::Probe,
            0x43 => FrameType::ProbeAck,
            0x44 => FrameType::Ack,
            0x45 => FrameType::RetransmitRequest,
            0x46 => FrameType::Close,
            _ => return None,
        };
        Some(t)
    }

    /// 이 타입이 속해야 하는 채널
    pub fn channel(self) -> ChannelId {
        match self {
            FrameType::MouseMove | FrameType::MouseButton | FrameType::MouseScroll | FrameType::Key => {
                ChannelId::Input
            }
            FrameType::ClipboardChunk | FrameType::FileChunk => ChannelId::Transfer,
            FrameType::AudioFrame => ChannelId::Audio,
            _ => ChannelId::Control,
        }
    }

    pub fn is_control(self) -> bool {
        self.channel() == ChannelId::Control
    }

    /// 평문으로 전송되는 핸드쉐이크 타입
    pub fn is_handshake(self) -> bool {
        matches!(self, FrameType::Hello | FrameType::HelloAck)
    }
}

/// 프레임 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub channel: ChannelId,
    pub path_epoch: u32,
    pub sequence: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    /// 헤더를 바이트로 직렬화
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_NUMBER.to_le_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.frame_type as u8;
        buf[6] = self.channel as u8;
        buf[7] = 0; // reserved
        buf[8..12].copy_from_slice(&self.path_epoch.to_le_bytes());
        buf[12..20].copy_from_slice(&self.sequence.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// 헤더 파싱 (payload 길이 검사는 Frame::from_bytes에서)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedFrame(format!(
                "헤더 부족: need {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC_NUMBER {
            return Err(Error::MalformedFrame(format!("매직 넘버 불일치: {:08X}", magic)));
        }
        if bytes[4] != PROTOCOL_VERSION {
            return Err(Error::MalformedFrame(format!("지원하지 않는 버전: {}", bytes[4])));
        }

        let frame_type = FrameType::from_u8(bytes[5])
            .ok_or_else(|| Error::MalformedFrame(format!("알 수 없는 타입: 0x{:02X}", bytes[5])))?;
        let channel = ChannelId::from_u8(bytes[6])
            .ok_or_else(|| Error::MalformedFrame(format!("알 수 없는 채널: {}", bytes[6])))?;
        if frame_type.channel() != channel {
            return Err(Error::MalformedFrame(format!(
                "채널 불일치: {:?} on {:?}",
                frame_type, channel
            )));
        }

        let mut epoch = [0u8; 4];
        epoch.copy_from_slice(&bytes[8..12]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[12..20]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[20..24]);

        Ok(Self {
            frame_type,
            channel,
            path_epoch: u32::from_le_bytes(epoch),
            sequence: u64::from_le_bytes(seq),
            payload_len: u32::from_le_bytes(len),
        })
    }
}

/// 이벤트 본문 (직렬화용)
#[derive(Serialize)]
struct EventBodyRef<'a> {
    timestamp_us: u64,
    payload: &'a EventPayload,
}

#[derive(Deserialize)]
struct EventBody {
    timestamp_us: u64,
    payload: EventPayload,
}

/// 와이어 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// 헤더 + payload로 프레임 구성 (payload_len 자동 설정)
    pub fn with_payload(mut header: FrameHeader, payload: Bytes) -> Self {
        header.payload_len = payload.len() as u32;
        Self { header, payload }
    }

    /// 이벤트를 평문 프레임으로 인코딩
    pub fn from_event(event: &PeripheralEvent, path_epoch: u32) -> Result<Self> {
        let body = bincode::serialize(&EventBodyRef {
            timestamp_us: event.timestamp_us(),
            payload: event.payload(),
        })?;

        let frame_type = FrameType::from_u8(event.payload().type_tag())
            .ok_or_else(|| Error::MalformedFrame("이벤트 타입 태그 오류".into()))?;

        let header = FrameHeader {
            frame_type,
            channel: event.channel(),
            path_epoch,
            sequence: event.sequence(),
            payload_len: 0,
        };
        Ok(Self::with_payload(header, Bytes::from(body)))
    }

    /// 제어 메시지를 평문 프레임으로 인코딩
    pub fn from_control(msg: &ControlMessage, path_epoch: u32, sequence: u64) -> Result<Self> {
        let header = FrameHeader {
            frame_type: msg.frame_type(),
            channel: ChannelId::Control,
            path_epoch,
            sequence,
            payload_len: 0,
        };
        Ok(Self::with_payload(header, Bytes::from(msg.encode_body()?)))
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// 바이트에서 역직렬화
    ///
    /// 선언된 payload 길이와 실제 길이가 다르면 `MalformedFrame`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(bytes)?;
        let available = bytes.len() - HEADER_SIZE;
        if header.payload_len as usize != available {
            return Err(Error::MalformedFrame(format!(
                "payload 길이 불일치: header says {}, available is {}",
                header.payload_len, available
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }

    /// 평문 프레임에서 이벤트 복원
    pub fn decode_event(&self) -> Result<PeripheralEvent> {
        if self.header.frame_type.is_control() {
            return Err(Error::MalformedFrame(format!(
                "이벤트 프레임 아님: {:?}",
                self.header.frame_type
            )));
        }

        let body: EventBody = bincode::deserialize(&self.payload)
            .map_err(|e| Error::MalformedFrame(format!("이벤트 본문: {}", e)))?;

        if body.payload.type_tag() != self.header.frame_type as u8 {
            return Err(Error::MalformedFrame(format!(
                "타입 태그 불일치: header {:?}, body {}",
                self.header.frame_type,
                body.payload.type_tag()
            )));
        }

        Ok(PeripheralEvent::new(
            self.header.sequence,
            body.timestamp_us,
            body.payload,
        ))
    }

    /// 평문 프레임에서 제어 메시지 복원
    pub fn decode_control(&self) -> Result<ControlMessage> {
        ControlMessage::decode_body(self.header.frame_type, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProbeMessage;

    fn key_event(seq: u64) -> PeripheralEvent {
        PeripheralEvent::new(
            seq,
            1_700_000_000,
            EventPayload::Key { code: 0x04, pressed: true, modifiers: 0 },
        )
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::from_event(&key_event(42), 3).unwrap();
        let bytes = frame.to_bytes();

        assert_eq!(&bytes[0..4], &MAGIC_NUMBER.to_le_bytes());
        assert_eq!(bytes[5], FrameType::Key as u8);
        assert_eq!(bytes[6], ChannelId::Input as u8);
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 3);
        assert_eq!(bytes.len(), HEADER_SIZE + frame.payload.len());
    }

    #[test]
    fn test_event_frame() {
        let event = key_event(9);
        let bytes = Frame::from_event(&event, 1).unwrap().to_bytes();
        let decoded = Frame::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.header.path_epoch, 1);
        assert_eq!(decoded.decode_event().unwrap(), event);
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let bytes = Frame::from_event(&key_event(1), 1).unwrap().to_bytes();

        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(Frame::from_bytes(truncated), Err(Error::MalformedFrame(_))));

        let mut padded = bytes.to_vec();
        padded.push(0);
        assert!(matches!(Frame::from_bytes(&padded), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_bad_magic_and_short_buffer() {
        let mut bytes = Frame::from_event(&key_event(1), 1).unwrap().to_bytes().to_vec();
        bytes[0] ^= 0xFF;
        assert!(matches!(Frame::from_bytes(&bytes), Err(Error::MalformedFrame(_))));
        assert!(matches!(Frame::from_bytes(&[0u8; 10]), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_type_on_wrong_channel() {
        let mut bytes = Frame::from_event(&key_event(1), 1).unwrap().to_bytes().to_vec();
        bytes[6] = ChannelId::Audio as u8;
        assert!(matches!(Frame::from_bytes(&bytes), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_control_frame() {
        let msg = ControlMessage::Probe(ProbeMessage { probe_id: 5, sent_at_us: 77 });
        let frame = Frame::from_control(&msg, 2, 11).unwrap();
        assert_eq!(frame.header.channel, ChannelId::Control);

        let decoded = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(decoded.decode_control().unwrap(), msg);
        assert!(decoded.decode_event().is_err());
    }
}

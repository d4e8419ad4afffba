//! 제어 평면 메시지 정의
//!
//! 데이터 채널과 별도로 Control 채널로만 전송됨
//! - Hello / HelloAck: 경로별 핸드쉐이크 (평문, HMAC 인증)
//! - Probe / ProbeAck: RTT 및 생존 측정
//! - Ack / RetransmitRequest: 수신 확인 및 재전송 요청
//! - Close: 명시적 종료

use serde::{Deserialize, Serialize};

use crate::event::ChannelId;
use crate::frame::FrameType;
use crate::{Error, Result};

/// 핸드쉐이크 시작 (initiator → responder)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// 프로토콜 버전
    pub protocol_version: u8,

    /// 세션 ID (initiator가 생성)
    pub session_id: u64,

    /// 경로 ID
    pub path_id: u8,

    /// 제안하는 경로 epoch
    pub path_epoch: u32,

    /// X25519 임시 공개키
    pub public_key: [u8; 32],

    pub nonce: [u8; 16],

    /// HMAC-SHA256(pairing secret, transcript)
    pub mac: [u8; 32],
}

/// 핸드쉐이크 응답 (responder → initiator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckMessage {
    pub session_id: u64,
    pub path_id: u8,
    pub path_epoch: u32,
    pub public_key: [u8; 32],
    pub nonce: [u8; 16],

    /// Hello 전체 + 응답 필드에 대한 HMAC
    pub mac: [u8; 32],
}

/// 프로브 (응답은 같은 내용을 ProbeAck로 에코)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMessage {
    pub probe_id: u64,
    pub sent_at_us: u64,
}

/// 누적 ACK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    /// (채널, 다음 기대 시퀀스)
    pub acks: Vec<(ChannelId, u64)>,
}

/// 재전송 요청 (Transfer 채널 전용)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetransmitRequest {
    pub channel: ChannelId,
    pub missing: Vec<u64>,
}

/// 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// 사용자 요청
    UserDisconnect,

    /// 모든 경로 소진
    SessionFailed,
}

/// 통합 제어 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Hello(HelloMessage),
    HelloAck(HelloAckMessage),
    Probe(ProbeMessage),
    ProbeAck(ProbeMessage),
    Ack(AckMessage),
    RetransmitRequest(RetransmitRequest),
    Close(CloseReason),
}

impl ControlMessage {
    /// 프레임 타입 반환
    pub fn frame_type(&self) -> FrameType {
        match self {
            ControlMessage::Hello(_) => FrameType::Hello,
            ControlMessage::HelloAck(_) => FrameType::HelloAck,
            ControlMessage::Probe(_) => FrameType::Probe,
            ControlMessage::ProbeAck(_) => FrameType::ProbeAck,
            ControlMessage::Ack(_) => FrameType::Ack,
            ControlMessage::RetransmitRequest(_) => FrameType::RetransmitRequest,
            ControlMessage::Close(_) => FrameType::Close,
        }
    }

    /// 핸드쉐이크 메시지 여부 (평문으로 전송됨)
    pub fn is_handshake(&self) -> bool {
        matches!(self, ControlMessage::Hello(_) | ControlMessage::HelloAck(_))
    }

    /// 페이로드 직렬화
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            ControlMessage::Hello(m) => bincode::serialize(m)?,
            ControlMessage::HelloAck(m) => bincode::serialize(m)?,
            ControlMessage::Probe(m) | ControlMessage::ProbeAck(m) => bincode::serialize(m)?,
            ControlMessage::Ack(m) => bincode::serialize(m)?,
            ControlMessage::RetransmitRequest(m) => bincode::serialize(m)?,
            ControlMessage::Close(r) => bincode::serialize(r)?,
        };
        Ok(body)
    }

    /// 프레임 타입과 페이로드로부터 역직렬화
    pub fn decode_body(frame_type: FrameType, body: &[u8]) -> Result<Self> {
        let malformed = |e: bincode::Error| Error::MalformedFrame(format!("{:?}: {}", frame_type, e));
        let msg = match frame_type {
            FrameType::Hello => ControlMessage::Hello(bincode::deserialize(body).map_err(malformed)?),
            FrameType::HelloAck => {
                ControlMessage::HelloAck(bincode::deserialize(body).map_err(malformed)?)
            }
            FrameType::Probe => ControlMessage::Probe(bincode::deserialize(body).map_err(malformed)?),
            FrameType::ProbeAck => {
                ControlMessage::ProbeAck(bincode::deserialize(body).map_err(malformed)?)
            }
            FrameType::Ack => ControlMessage::Ack(bincode::deserialize(body).map_err(malformed)?),
            FrameType::RetransmitRequest => {
                ControlMessage::RetransmitRequest(bincode::deserialize(body).map_err(malformed)?)
            }
            FrameType::Close => ControlMessage::Close(bincode::deserialize(body).map_err(malformed)?),
            other => {
                return Err(Error::MalformedFrame(format!(
                    "제어 메시지가 아닌 타입: {:?}",
                    other
                )))
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_body() {
        let msg = ControlMessage::Ack(AckMessage {
            acks: vec![(ChannelId::Input, 12), (ChannelId::Transfer, 3)],
        });
        let body = msg.encode_body().unwrap();
        let decoded = ControlMessage::decode_body(FrameType::Ack, &body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_event_type_is_not_control() {
        let result = ControlMessage::decode_body(FrameType::Key, &[0u8; 8]);
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }
}

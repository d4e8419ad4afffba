//! 주변기기 이벤트 정의
//!
//! - ChannelId: 논리 채널 (Input / Transfer / Audio / Control)
//! - EventPayload: 캡처된 이벤트 내용
//! - PeripheralEvent: 채널 + 시퀀스 + 캡처 시각이 붙은 불변 이벤트

use serde::{Deserialize, Serialize};

/// 논리 채널 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelId {
    /// 키보드/마우스
    Input = 0,

    /// 클립보드/파일
    Transfer = 1,

    /// 오디오
    Audio = 2,

    /// 제어 평면 (핸드쉐이크, 프로브, ACK)
    Control = 3,
}

impl ChannelId {
    /// 이벤트를 싣는 데이터 채널 목록
    pub const DATA: [ChannelId; 3] = [ChannelId::Input, ChannelId::Transfer, ChannelId::Audio];

    /// 채널별 배열 인덱스
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChannelId::Input),
            1 => Some(ChannelId::Transfer),
            2 => Some(ChannelId::Audio),
            3 => Some(ChannelId::Control),
            _ => None,
        }
    }
}

/// 마우스 버튼
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Back,
    Forward,
}

/// 클립보드/파일 전송 조각
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunk {
    /// 전송 ID (한 번의 클립보드 복사 또는 파일 하나)
    pub transfer_id: u64,

    /// 조각 인덱스
    pub index: u32,

    /// 전체 조각 수
    pub total_chunks: u32,

    /// 전체 데이터 크기
    pub total_len: u64,

    /// 데이터 내 오프셋
    pub offset: u64,

    /// CRC32 체크섬
    pub crc32: u32,

    /// 파일 이름 (첫 조각에만, 클립보드는 None)
    pub name: Option<String>,

    pub data: Vec<u8>,
}

impl TransferChunk {
    /// CRC 검증
    pub fn verify_crc(&self) -> bool {
        crc32fast::hash(&self.data) == self.crc32
    }
}

/// 이벤트 내용
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    MouseMove { x: i32, y: i32 },
    MouseButton { button: MouseButton, pressed: bool, x: i32, y: i32 },
    MouseScroll { dx: i32, dy: i32 },
    Key { code: u32, pressed: bool, modifiers: u16 },
    ClipboardChunk(TransferChunk),
    FileChunk(TransferChunk),
    AudioFrame {
        stream_id: u32,
        sample_rate: u32,
        channels: u8,
        /// 재생 타임스탬프 (마이크로초)
        pts_us: u64,
        /// 코덱에 무관한 불투명 페이로드
        data: Vec<u8>,
    },
}

impl EventPayload {
    /// 이 이벤트가 속한 채널
    pub fn channel(&self) -> ChannelId {
        match self {
            EventPayload::MouseMove { .. }
            | EventPayload::MouseButton { .. }
            | EventPayload::MouseScroll { .. }
            | EventPayload::Key { .. } => ChannelId::Input,
            EventPayload::ClipboardChunk(_) | EventPayload::FileChunk(_) => ChannelId::Transfer,
            EventPayload::AudioFrame { .. } => ChannelId::Audio,
        }
    }

    /// 와이어 타입 태그
    pub fn type_tag(&self) -> u8 {
        match self {
            EventPayload::MouseMove { .. } => 1,
            EventPayload::MouseButton { .. } => 2,
            EventPayload::MouseScroll { .. } => 3,
            EventPayload::Key { .. } => 4,
            EventPayload::ClipboardChunk(_) => 5,
            EventPayload::FileChunk(_) => 6,
            EventPayload::AudioFrame { .. } => 7,
        }
    }
}

/// 현재 시각 (마이크로초, UNIX epoch 기준)
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// 시퀀스가 붙은 주변기기 이벤트
///
/// 생성 후 변경되지 않는다. 시퀀스는 송신측 세션이 채널별로 부여한다.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralEvent {
    channel: ChannelId,
    sequence: u64,
    timestamp_us: u64,
    payload: EventPayload,
}

impl PeripheralEvent {
    pub fn new(sequence: u64, timestamp_us: u64, payload: EventPayload) -> Self {
        Self {
            channel: payload.channel(),
            sequence,
            timestamp_us,
            payload,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 캡처 시각 (마이크로초)
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mapping() {
        let key = EventPayload::Key { code: 4, pressed: true, modifiers: 0 };
        assert_eq!(key.channel(), ChannelId::Input);

        let audio = EventPayload::AudioFrame {
            stream_id: 1,
            sample_rate: 48_000,
            channels: 2,
            pts_us: 0,
            data: vec![0; 16],
        };
        assert_eq!(audio.channel(), ChannelId::Audio);

        let event = PeripheralEvent::new(7, 100, key);
        assert_eq!(event.channel(), ChannelId::Input);
        assert_eq!(event.sequence(), 7);
    }

    #[test]
    fn test_channel_from_u8() {
        for channel in ChannelId::DATA {
            assert_eq!(ChannelId::from_u8(channel as u8), Some(channel));
        }
        assert_eq!(ChannelId::from_u8(3), Some(ChannelId::Control));
        assert_eq!(ChannelId::from_u8(9), None);
    }
}

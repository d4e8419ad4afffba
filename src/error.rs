//! 에러 타입 정의

use thiserror::Error;

use crate::event::ChannelId;
use crate::failover::FailureReason;
use crate::multipath::PathId;

/// PSTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("설정 파일 파싱 에러: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("유효하지 않은 설정: {0}")]
    Config(String),

    #[error("잘못된 프레임: {0}")]
    MalformedFrame(String),

    #[error("무결성 검증 실패: channel={channel:?}, epoch={path_epoch}, seq={sequence}")]
    IntegrityViolation {
        channel: ChannelId,
        path_epoch: u32,
        sequence: u64,
    },

    #[error("재전송 공격/중복 프레임 거부: channel={channel:?}, seq={sequence}")]
    ReplayedFrame { channel: ChannelId, sequence: u64 },

    #[error("만료된 epoch: expected {expected}, got {got}")]
    StaleEpoch { expected: u32, got: u32 },

    #[error("핸드쉐이크 실패: {0}")]
    HandshakeFailed(String),

    #[error("시퀀스 누락: channel={channel:?}, expected={expected}, got={got}")]
    SequenceGap {
        channel: ChannelId,
        expected: u64,
        got: u64,
    },

    #[error("경로 끊김: {0}")]
    PathDead(PathId),

    #[error("경로 품질 저하: {0}")]
    PathDegraded(PathId),

    #[error("상대 주소 미확정")]
    NoPeerAddress,

    #[error("세션 실패: {0:?}")]
    SessionFailed(FailureReason),

    #[error("세션 종료됨")]
    SessionClosed,

    #[error("큐 닫힘: {0:?}")]
    QueueClosed(ChannelId),

    #[error("전송 크기 초과: {size} > {max}")]
    TransferTooLarge { size: u64, max: u64 },

    #[error("전송 데이터 손상: transfer_id={transfer_id}, index={index}")]
    TransferCorrupted { transfer_id: u64, index: u32 },

    #[error("채널 에러")]
    ChannelError,

    #[error("타임아웃: {0}")]
    Timeout(&'static str),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

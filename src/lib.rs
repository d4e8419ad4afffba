//! # PSTP (Peripheral Share Transport Protocol)
//!
//! 두 기기 사이에서 키보드/마우스, 클립보드/파일, 오디오를 공유하는 암호화 전송
//!
//! ## 핵심 특징
//! - **채널 다중화**: Input / Transfer / Audio 채널마다 별도의 순서/신뢰성 정책
//! - **보안 채널**: 페어링 비밀 기반 X25519 핸드쉐이크, 경로 epoch별 ChaCha20-Poly1305
//! - **재전송 방지**: 채널별 재전송 방지 윈도우 + 수신측 시퀀스 중복 제거
//! - **경로 전환**: 유선/무선 경로 상태 감시, 이중 송신으로 끊김 없는 failover
//! - **백프레셔**: 채널별 유한 큐 (Audio는 절대 막지 않음)

pub mod chunk;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod failover;
pub mod frame;
pub mod health;
pub mod message;
pub mod multipath;
pub mod policy;
pub mod queue;
pub mod receiver;
pub mod reorder;
pub mod sender;
pub mod session;
pub mod sink;
pub mod stats;
pub mod transport;

pub use chunk::{CompletedTransfer, TransferBuilder, TransferKind, TransferReassembler};
pub use config::{ChannelThresholds, Config};
pub use crypto::{PairingSecret, SecureChannel};
pub use error::{Error, Result};
pub use event::{ChannelId, EventPayload, MouseButton, PeripheralEvent, TransferChunk};
pub use failover::{FailureReason, SessionState};
pub use frame::{Frame, FrameHeader, FrameType};
pub use health::PathStatus;
pub use multipath::{PathCandidate, PathId, PathLink, PathRole, PathSnapshot};
pub use policy::{ChannelPolicy, ChannelPolicySet};
pub use queue::PushOutcome;
pub use session::TransportSession;
pub use sink::{ChannelSink, DeliveredEvents, EventSink, EventSource};
pub use stats::SessionStats;
pub use transport::{memory_link, LinkControl, LinkEnd, PathTransport, ProtocolKind, UdpTransport};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (프레임 식별용)
pub const MAGIC_NUMBER: u32 = 0x50535450; // "PSTP"

/// 기본 경로 포트 (유선 LAN)
pub const DEFAULT_PRIMARY_PORT: u16 = 8888;

/// 보조 경로 포트 (Wi-Fi / 발견)
pub const DEFAULT_SECONDARY_PORT: u16 = 8889;

//! 멀티패스 관리
//!
//! 세션이 소유하는 경로 목록. 다른 구성요소는 `PathId` 인덱스로만 경로를 가리킨다.
//! 경로마다 보안 채널, 상태 감시기, epoch 카운터를 가진다.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::crypto::SecureChannel;
use crate::frame::Frame;
use crate::health::{HealthSnapshot, HealthThresholds, PathHealthMonitor, PathStatus};
use crate::transport::{PathTransport, ProtocolKind, UdpTransport};
use crate::{Error, Result};

/// 경로 핸들 (세션 경로 목록의 인덱스)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub u8);

impl PathId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path#{}", self.0)
    }
}

/// 경로 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathRole {
    /// 유선 LAN
    Primary,

    /// Wi-Fi 등 보조 경로
    Secondary,
}

/// 발견 계층이 제공하는 후보 경로
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCandidate {
    pub address: SocketAddr,
    pub protocol: ProtocolKind,
    pub role: PathRole,
}

impl PathCandidate {
    /// 후보 주소로 연결하는 경로 생성 (UDP만 지원)
    pub async fn connect(&self, local: SocketAddr) -> Result<PathLink> {
        match self.protocol {
            ProtocolKind::Udp => PathLink::udp_connect(self.role, local, self.address).await,
            ProtocolKind::Memory => Err(Error::Config(
                "메모리 후보는 memory_link()로 직접 구성".into(),
            )),
        }
    }
}

/// 세션 생성 시 전달하는 경로 구성
#[derive(Clone)]
pub struct PathLink {
    pub role: PathRole,
    pub transport: Arc<dyn PathTransport>,
}

impl PathLink {
    pub fn new(role: PathRole, transport: Arc<dyn PathTransport>) -> Self {
        Self { role, transport }
    }

    /// 상대 주소를 아는 UDP 경로 (initiator)
    pub async fn udp_connect(role: PathRole, local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let transport = UdpTransport::connect(local, remote).await?;
        Ok(Self::new(role, Arc::new(transport)))
    }

    /// 수신 대기 UDP 경로 (responder, 상대 주소는 Hello에서 학습)
    pub async fn udp_bind(role: PathRole, local: SocketAddr) -> Result<Self> {
        let transport = UdpTransport::bind(local).await?;
        Ok(Self::new(role, Arc::new(transport)))
    }
}

/// 경로 상태 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct PathSnapshot {
    pub id: PathId,
    pub role: PathRole,
    pub protocol: ProtocolKind,
    pub address: Option<SocketAddr>,
    pub epoch: u32,
    pub established: bool,
    pub status: PathStatus,
    pub rtt: Option<Duration>,
    pub loss_rate: f64,
    /// 마지막 인증된 수신 이후 경과 시간
    pub idle: Duration,
}

/// 경로 하나
pub struct Path {
    id: PathId,
    role: PathRole,
    transport: Arc<dyn PathTransport>,

    /// 현재 (또는 마지막으로 시도한) epoch
    epoch: AtomicU32,

    /// 이 값보다 작은 epoch의 Hello는 거부 (폐기된 epoch 재사용 방지)
    min_accept_epoch: AtomicU32,

    secure: Mutex<Option<SecureChannel>>,
    health: Mutex<PathHealthMonitor>,

    /// 제어 프레임 시퀀스
    control_seq: AtomicU64,

    /// 마지막 ACK 이후 데이터 수신 여부
    ack_pending: AtomicBool,
}

impl Path {
    fn new(id: PathId, link: PathLink, thresholds: HealthThresholds, now: Instant) -> Self {
        Self {
            id,
            role: link.role,
            transport: link.transport,
            epoch: AtomicU32::new(0),
            min_accept_epoch: AtomicU32::new(1),
            secure: Mutex::new(None),
            health: Mutex::new(PathHealthMonitor::new(thresholds, now)),
            control_seq: AtomicU64::new(0),
            ack_pending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PathId {
        self.id
    }

    pub fn role(&self) -> PathRole {
        self.role
    }

    pub fn transport(&self) -> &Arc<dyn PathTransport> {
        &self.transport
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_established(&self) -> bool {
        self.secure.lock().is_some()
    }

    /// initiator: 새 핸드쉐이크용 epoch
    pub fn next_epoch(&self) -> u32 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// responder: 제안된 epoch 수용 여부
    pub fn accepts_epoch(&self, proposed: u32) -> bool {
        if proposed < self.min_accept_epoch.load(Ordering::SeqCst) {
            return false;
        }
        match self.secure.lock().as_ref() {
            Some(channel) => proposed > channel.path_epoch(),
            None => true,
        }
    }

    /// 핸드쉐이크 완료된 보안 채널 설치
    pub fn install(&self, channel: SecureChannel, now: Instant) {
        let epoch = channel.path_epoch();
        self.epoch.fetch_max(epoch, Ordering::SeqCst);
        self.min_accept_epoch.fetch_max(epoch, Ordering::SeqCst);
        *self.secure.lock() = Some(channel);
        self.health.lock().reset(now);
        self.ack_pending.store(false, Ordering::SeqCst);
    }

    /// 경로 폐기. epoch를 올려 이후 도착하는 이전 epoch 프레임은 거부된다.
    pub fn retire(&self) {
        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.min_accept_epoch.fetch_max(next, Ordering::SeqCst);
        *self.secure.lock() = None;
        self.ack_pending.store(false, Ordering::SeqCst);
    }

    /// 평문 프레임 봉인
    pub fn seal(&self, frame: &Frame) -> Result<Frame> {
        match self.secure.lock().as_ref() {
            Some(channel) => channel.seal(frame),
            None => Err(Error::PathDead(self.id)),
        }
    }

    /// 봉인된 프레임 복호화
    pub fn open(&self, frame: &Frame) -> Result<Frame> {
        match self.secure.lock().as_mut() {
            Some(channel) => channel.open(frame),
            None => Err(Error::StaleEpoch {
                expected: self.epoch(),
                got: frame.header.path_epoch,
            }),
        }
    }

    /// 봉인 후 전송
    pub async fn send_sealed(&self, frame: &Frame) -> Result<usize> {
        let bytes = self.seal(frame)?.to_bytes();
        self.transport.send(&bytes).await?;
        Ok(bytes.len())
    }

    /// 평문 전송 (핸드쉐이크 전용)
    pub async fn send_plain(&self, frame: &Frame) -> Result<usize> {
        let bytes = frame.to_bytes();
        self.transport.send(&bytes).await?;
        Ok(bytes.len())
    }

    pub fn next_control_seq(&self) -> u64 {
        self.control_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn mark_ack_pending(&self) {
        self.ack_pending.store(true, Ordering::SeqCst);
    }

    /// ACK 대기 플래그를 확인하고 지움
    pub fn take_ack_pending(&self) -> bool {
        self.ack_pending.swap(false, Ordering::SeqCst)
    }

    /// 상태 감시기에 접근
    pub fn with_health<R>(&self, f: impl FnOnce(&mut PathHealthMonitor) -> R) -> R {
        f(&mut self.health.lock())
    }

    /// 수립되었고 Dead가 아닌 경로의 상태
    pub fn status(&self) -> PathStatus {
        self.health.lock().status()
    }

    pub fn snapshot(&self, now: Instant) -> PathSnapshot {
        let HealthSnapshot {
            status,
            rtt,
            loss_rate,
            idle,
        } = self.health.lock().snapshot(now);
        PathSnapshot {
            id: self.id,
            role: self.role,
            protocol: self.transport.kind(),
            address: self.transport.peer().or_else(|| self.transport.local_addr()),
            epoch: self.epoch(),
            established: self.is_established(),
            status,
            rtt,
            loss_rate,
            idle,
        }
    }
}

/// 세션 소유 경로 목록
pub struct PathManager {
    paths: Vec<Arc<Path>>,
}

impl PathManager {
    pub fn new(links: Vec<PathLink>, thresholds: HealthThresholds, now: Instant) -> Result<Self> {
        if links.is_empty() {
            return Err(Error::Config("경로가 하나 이상 필요".into()));
        }
        if links.len() > u8::MAX as usize {
            return Err(Error::Config(format!("경로가 너무 많음: {}", links.len())));
        }

        let paths = links
            .into_iter()
            .enumerate()
            .map(|(idx, link)| Arc::new(Path::new(PathId(idx as u8), link, thresholds.clone(), now)))
            .collect();
        Ok(Self { paths })
    }

    pub fn get(&self, id: PathId) -> Option<&Arc<Path>> {
        self.paths.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Path>> {
        self.paths.iter()
    }

    /// 기본 경로 (Primary 역할 중 첫 번째, 없으면 첫 경로)
    pub fn primary(&self) -> PathId {
        self.paths
            .iter()
            .find(|p| p.role() == PathRole::Primary)
            .map(|p| p.id())
            .unwrap_or(PathId(0))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn snapshots(&self, now: Instant) -> Vec<PathSnapshot> {
        self.paths.iter().map(|p| p.snapshot(now)).collect()
    }
}

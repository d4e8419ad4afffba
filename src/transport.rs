//! 경로 전송 계층
//!
//! 경로 하나가 사용하는 데이터그램 전송. 세션은 `PathTransport`에만 의존한다.
//! - UdpTransport: 실제 UDP 소켓
//! - MemoryTransport: 테스트용 메모리 링크 (끊김, 손실, 캡처/재주입 제어)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result};

/// 최대 수신 버퍼 (UDP 최대 페이로드)
const RECV_BUFFER_SIZE: usize = 65_536;

/// 전송 프로토콜 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Udp,
    Memory,
}

/// 경로 전송 인터페이스
#[async_trait]
pub trait PathTransport: Send + Sync {
    /// 데이터그램 하나 전송. 상대 주소를 모르면 `NoPeerAddress`.
    async fn send(&self, datagram: &[u8]) -> Result<()>;

    /// 데이터그램 하나 수신 (송신 주소 포함)
    async fn recv(&self) -> Result<(Bytes, Option<SocketAddr>)>;

    /// 상대 주소 지정 (responder는 인증된 Hello에서 학습)
    fn set_peer(&self, addr: SocketAddr);

    fn peer(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn kind(&self) -> ProtocolKind;
}

/// UDP 전송
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    /// 로컬 주소에 바인드 (상대 주소는 나중에 학습)
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket,
            peer: Mutex::new(None),
        })
    }

    /// 바인드 후 상대 주소 지정
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let transport = Self::bind(local).await?;
        transport.set_peer(remote);
        Ok(transport)
    }
}

#[async_trait]
impl PathTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> Result<()> {
        let peer = (*self.peer.lock()).ok_or(Error::NoPeerAddress)?;
        self.socket.send_to(datagram, peer).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, Option<SocketAddr>)> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((Bytes::from(buf), Some(from)))
    }

    fn set_peer(&self, addr: SocketAddr) {
        let mut peer = self.peer.lock();
        if *peer != Some(addr) {
            debug!("상대 주소 갱신: {:?} -> {}", *peer, addr);
            *peer = Some(addr);
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Udp
    }
}

/// 메모리 링크의 한쪽 끝
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    A,
    B,
}

#[derive(Default)]
struct LinkState {
    down: AtomicBool,
    loss_rate: Mutex<f64>,
    capturing: AtomicBool,
    /// (송신한 끝, 데이터그램)
    captured: Mutex<Vec<(LinkEnd, Bytes)>>,
}

/// 메모리 링크 제어 핸들
#[derive(Clone)]
pub struct LinkControl {
    state: Arc<LinkState>,
    to_a: mpsc::UnboundedSender<Bytes>,
    to_b: mpsc::UnboundedSender<Bytes>,
}

impl LinkControl {
    /// 링크 끊기/복구 (끊긴 동안 전송된 데이터그램은 사라짐)
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.state.down.load(Ordering::SeqCst)
    }

    /// 무작위 손실률 (0.0 ~ 1.0)
    pub fn set_loss(&self, rate: f64) {
        *self.state.loss_rate.lock() = rate.clamp(0.0, 1.0);
    }

    /// 전달된 데이터그램 기록 시작/중지
    pub fn set_capture(&self, enabled: bool) {
        self.state.capturing.store(enabled, Ordering::SeqCst);
    }

    /// `from` 끝이 보낸 기록된 데이터그램
    pub fn captured(&self, from: LinkEnd) -> Vec<Bytes> {
        self.state
            .captured
            .lock()
            .iter()
            .filter(|(end, _)| *end == from)
            .map(|(_, datagram)| datagram.clone())
            .collect()
    }

    /// 데이터그램을 `to` 끝에 직접 주입 (재전송 공격 재현용)
    pub fn inject(&self, to: LinkEnd, datagram: Bytes) {
        let tx = match to {
            LinkEnd::A => &self.to_a,
            LinkEnd::B => &self.to_b,
        };
        let _ = tx.send(datagram);
    }
}

/// 메모리 전송 (테스트 및 로컬 시뮬레이션)
pub struct MemoryTransport {
    end: LinkEnd,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    state: Arc<LinkState>,
}

/// 양방향 메모리 링크 생성
pub fn memory_link() -> (MemoryTransport, MemoryTransport, LinkControl) {
    let (to_a, a_rx) = mpsc::unbounded_channel();
    let (to_b, b_rx) = mpsc::unbounded_channel();
    let state = Arc::new(LinkState::default());

    let a = MemoryTransport {
        end: LinkEnd::A,
        tx: to_b.clone(),
        rx: tokio::sync::Mutex::new(a_rx),
        state: state.clone(),
    };
    let b = MemoryTransport {
        end: LinkEnd::B,
        tx: to_a.clone(),
        rx: tokio::sync::Mutex::new(b_rx),
        state: state.clone(),
    };
    let control = LinkControl { state, to_a, to_b };
    (a, b, control)
}

#[async_trait]
impl PathTransport for MemoryTransport {
    async fn send(&self, datagram: &[u8]) -> Result<()> {
        if self.state.down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let loss_rate = *self.state.loss_rate.lock();
        if loss_rate > 0.0 && rand::thread_rng().gen::<f64>() < loss_rate {
            return Ok(());
        }

        let datagram = Bytes::copy_from_slice(datagram);
        if self.state.capturing.load(Ordering::SeqCst) {
            self.state.captured.lock().push((self.end, datagram.clone()));
        }
        // 상대가 사라졌으면 네트워크처럼 조용히 버림
        let _ = self.tx.send(datagram);
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, Option<SocketAddr>)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => Ok((datagram, None)),
            None => Err(Error::ChannelError),
        }
    }

    fn set_peer(&self, _addr: SocketAddr) {}

    fn peer(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Memory
    }
}

//! 채널별 송신 큐
//!
//! 캡처 생산자와 세션 드라이버 사이의 유한 큐.
//! - Input/Transfer: 가득 차면 잠시 생산자를 막고, 그래도 가득하면 가장 오래된 항목을 버림 (경고)
//! - Audio: 절대 막지 않고 새 항목을 버림

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::event::{ChannelId, EventPayload};
use crate::policy::{ChannelPolicy, OverflowPolicy};
use crate::{Error, Result};

/// 시퀀스 부여 전 이벤트 (시퀀스는 드라이버가 꺼낼 때 부여하므로 버려진 항목이 공백을 만들지 않음)
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub timestamp_us: u64,
    pub payload: EventPayload,
}

/// push 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,

    /// 공간을 만들기 위해 가장 오래된 항목을 버림
    DroppedOldest,

    /// 새 항목을 버림
    DroppedNewest,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// 유한 채널 큐
pub struct ChannelQueue<T> {
    channel: ChannelId,
    depth: usize,
    overflow: OverflowPolicy,
    inner: Mutex<QueueInner<T>>,
    not_full: Notify,
    /// 드라이버 깨우기
    wake: Arc<Notify>,
    dropped: AtomicU64,
}

impl<T> ChannelQueue<T> {
    pub fn new(policy: &ChannelPolicy, wake: Arc<Notify>) -> Self {
        Self::with_depth(policy.channel, policy.queue_depth, policy.overflow, wake)
    }

    pub fn with_depth(
        channel: ChannelId,
        depth: usize,
        overflow: OverflowPolicy,
        wake: Arc<Notify>,
    ) -> Self {
        let depth = depth.max(1);
        Self {
            channel,
            depth,
            overflow,
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(depth),
                closed: false,
            }),
            not_full: Notify::new(),
            wake,
            dropped: AtomicU64::new(0),
        }
    }

    /// 항목 추가. BlockThenDropOldest 정책이면 최대 `block` 동안 대기.
    pub async fn push(&self, item: T) -> Result<PushOutcome> {
        let block = match self.overflow {
            OverflowPolicy::BlockThenDropOldest { block } => block,
            OverflowPolicy::DropNewest => return self.try_push(item),
        };

        let deadline = Instant::now() + block;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                if inner.closed {
                    return Err(Error::QueueClosed(self.channel));
                }
                if inner.items.len() < self.depth {
                    break;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        self.try_push(item)
    }

    /// 대기 없이 항목 추가
    pub fn try_push(&self, item: T) -> Result<PushOutcome> {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::QueueClosed(self.channel));
            }

            if inner.items.len() < self.depth {
                inner.items.push_back(item);
                PushOutcome::Enqueued
            } else {
                match self.overflow {
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                    OverflowPolicy::BlockThenDropOldest { .. } => {
                        inner.items.pop_front();
                        inner.items.push_back(item);
                        PushOutcome::DroppedOldest
                    }
                }
            }
        };

        match outcome {
            PushOutcome::Enqueued => {}
            PushOutcome::DroppedOldest => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "{:?} 큐 가득 참: 가장 오래된 이벤트 버림 (누적 {})",
                    self.channel, total
                );
            }
            PushOutcome::DroppedNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        if outcome != PushOutcome::DroppedNewest {
            self.wake.notify_one();
        }
        Ok(outcome)
    }

    /// 공간이 생길 때까지 대기하고 추가. 항목을 버리지 않는다 (전송 조각용).
    pub async fn push_wait(&self, item: T) -> Result<()> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(Error::QueueClosed(self.channel));
                }
                if inner.items.len() < self.depth {
                    inner.items.push_back(item);
                    drop(inner);
                    self.wake.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// 맨 앞 항목 꺼내기 (드라이버)
    pub fn pop(&self) -> Option<T> {
        let item = self.inner.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// 큐 닫기. 대기 중인 생산자는 QueueClosed로 깨어남.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 버려진 항목 수
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

//! 内存 broker
//!
//! 按 topic 维护 FIFO 队列，模拟 peek-lock 语义：
//! 接收即锁定，确认后移除，放弃后重新入队并累加投递次数，
//! 投递次数达到上限时转入死信列表。用于本地联调和集成测试。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use order_shared::dlq::{AbandonOutcome, delivery_exhausted};
use order_shared::error::OrderError;
use order_shared::kafka::ConsumerMessage;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use super::{Subscription, SubscriptionClient};
use crate::error::PipelineError;

enum Delivery {
    Message(ConsumerMessage),
    /// 注入的传输层错误，被接收时以 `Err` 形式返回
    Fault(String),
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, VecDeque<Delivery>>>,
    notify: Notify,
    next_offset: AtomicI64,
    max_delivery_count: u32,
    in_flight: AtomicUsize,
    completed: Mutex<Vec<ConsumerMessage>>,
    dead_lettered: Mutex<Vec<(ConsumerMessage, String)>>,
    abandoned: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    subscribe_failures: AtomicU32,
}

impl BrokerState {
    fn enqueue(&self, topic: &str, delivery: Delivery) {
        self.queues
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(delivery);
        self.notify.notify_waiters();
    }

    /// 出队时在持有队列锁的情况下登记在途，空闲判断不会看到中间状态
    fn dequeue(&self, topic: &str) -> Option<Delivery> {
        let mut queues = self.queues.lock();
        let delivery = queues.get_mut(topic)?.pop_front()?;
        if matches!(delivery, Delivery::Message(_)) {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
        }
        Some(delivery)
    }
}

/// 内存 broker，Clone 后共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// `max_delivery_count` 为 0 时消息永不进入死信
    pub fn new(max_delivery_count: u32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                max_delivery_count,
                ..Default::default()
            }),
        }
    }

    /// 投递一条原始负载，返回分配的 offset
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = self.state.next_offset.fetch_add(1, Ordering::SeqCst);
        let msg = ConsumerMessage {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: None,
            payload: payload.into(),
            timestamp: Some(Utc::now().timestamp_millis()),
            headers: HashMap::new(),
            delivery_count: 0,
        };
        self.state.enqueue(topic, Delivery::Message(msg));
        offset
    }

    pub fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<i64, OrderError> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(topic, payload))
    }

    /// 在队列中插入一次传输层错误
    pub fn inject_error(&self, topic: &str, message: &str) {
        self.state
            .enqueue(topic, Delivery::Fault(message.to_string()));
    }

    /// 让接下来的 `count` 次订阅失败
    pub fn fail_subscribe_next(&self, count: u32) {
        self.state.subscribe_failures.store(count, Ordering::SeqCst);
    }

    pub fn completed(&self) -> Vec<ConsumerMessage> {
        self.state.completed.lock().clone()
    }

    /// 已转入死信的消息及原因
    pub fn dead_lettered(&self) -> Vec<(ConsumerMessage, String)> {
        self.state.dead_lettered.lock().clone()
    }

    /// 被放弃后重新入队的次数
    pub fn abandoned_count(&self) -> usize {
        self.state.abandoned.load(Ordering::SeqCst)
    }

    /// 队列中尚未被接收的投递数
    pub fn pending_count(&self, topic: &str) -> usize {
        self.state.queues.lock().get(topic).map_or(0, VecDeque::len)
    }

    /// 已接收但尚未确认或放弃的消息数
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn opened_subscriptions(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed_subscriptions(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// 等到 topic 队列为空且没有在途消息，超时返回 false
    pub async fn wait_idle(&self, topic: &str, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.pending_count(topic) > 0 || self.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl SubscriptionClient for InMemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn Subscription>, PipelineError> {
        let failing = self
            .state
            .subscribe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::Transport(format!(
                "无法订阅 {topic}/{subscription}"
            )));
        }

        self.state.opened.fetch_add(1, Ordering::SeqCst);
        debug!(topic, subscription, "内存订阅已打开");
        Ok(Arc::new(InMemorySubscription {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct InMemorySubscription {
    state: Arc<BrokerState>,
    topic: String,
    closed: AtomicBool,
}

impl InMemorySubscription {
    fn settle(&self) {
        // 饱和递减，重复确认不会下溢
        let _ = self
            .state
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn receive(&self) -> Option<Result<ConsumerMessage, PipelineError>> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            match self.state.dequeue(&self.topic) {
                Some(Delivery::Message(mut msg)) => {
                    msg.delivery_count += 1;
                    return Some(Ok(msg));
                }
                Some(Delivery::Fault(reason)) => {
                    return Some(Err(PipelineError::Transport(reason)));
                }
                None => notified.await,
            }
        }
    }

    async fn complete(&self, msg: &ConsumerMessage) -> Result<(), PipelineError> {
        self.state.completed.lock().push(msg.clone());
        self.settle();
        Ok(())
    }

    async fn abandon(
        &self,
        msg: &ConsumerMessage,
        reason: &str,
    ) -> Result<AbandonOutcome, PipelineError> {
        let outcome = if delivery_exhausted(msg.delivery_count, self.state.max_delivery_count) {
            self.state
                .dead_lettered
                .lock()
                .push((msg.clone(), reason.to_string()));
            AbandonOutcome::DeadLettered
        } else {
            self.state.abandoned.fetch_add(1, Ordering::SeqCst);
            self.state
                .enqueue(&self.topic, Delivery::Message(msg.clone()));
            AbandonOutcome::Requeued
        };
        self.settle();
        Ok(outcome)
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            self.state.notify.notify_waiters();
        }
        Ok(())
    }
}

//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer / Subscription 抽象。
//! 订阅端关闭自动存储 offset，改为逐条确认：只有确认过的连续前缀才会被提交，
//! 放弃的消息通过 seek 回退实现重投，满足至少一次投递语义。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rdkafka::Offset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::dlq::{AbandonOutcome, DlqProducer, delivery_exhausted};
use crate::error::OrderError;

/// seek / commit 等同步调用的超时
const CLIENT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理任务。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
    /// 本条消息在当前订阅中的投递次数，首次投递为 1
    pub delivery_count: u32,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
            delivery_count: 0,
        }
    }

    /// 日志与死信使用的消息标识：优先使用消息 key，否则由位置拼出
    pub fn message_id(&self) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => format!("{}-{}-{}", self.topic, self.partition, self.offset),
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, OrderError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// `FutureProducer` 内部是 Arc 包装的，Clone 代价很低。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 为 5 秒，超时后由上层重试或放弃消息，而非无限等待。
    pub fn new(config: &KafkaConfig) -> Result<Self, OrderError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| OrderError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), OrderError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, CLIENT_CALL_TIMEOUT)
            .await
            .map_err(|(e, _)| OrderError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), OrderError> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload).await
    }

    /// 退出前把缓冲区中的消息刷出
    pub fn flush(&self, timeout: Duration) -> Result<(), OrderError> {
        self.producer
            .flush(timeout)
            .map_err(|e| OrderError::Kafka(format!("刷新生产者缓冲失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// OffsetTracker
// ---------------------------------------------------------------------------

/// 单条 offset 在跟踪器中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetState {
    /// 已投递，处理中
    InFlight,
    /// 已确认，等待前面的 offset 完成后一并提交
    Acked,
    /// 已放弃，等待 seek 回退后重投
    Abandoned,
}

/// 按分区跟踪在途 offset
///
/// 并发处理时后到的消息可能先确认。Kafka 的提交语义是"提交到某个位置"，
/// 因此只能提交已确认的连续前缀，否则会连带确认前面尚未成功的消息。
///
/// 放弃一条消息时只回退到最低的已放弃 offset。回退后重新读到的
/// 处理中或已确认的 offset 由 [`OffsetTracker::track`] 过滤掉，
/// 只有失败过的消息才会被重投。
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, BTreeMap<i64, OffsetState>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条读到的消息，返回是否应当交给处理方
    ///
    /// 首次读到或此前被放弃的 offset 返回 `true`；
    /// 回退后重读到的处理中或已确认的 offset 返回 `false`。
    pub fn track(&mut self, partition: i32, offset: i64) -> bool {
        let pending = self.partitions.entry(partition).or_default();
        match pending.get_mut(&offset) {
            None => {
                pending.insert(offset, OffsetState::InFlight);
                true
            }
            Some(state) if *state == OffsetState::Abandoned => {
                *state = OffsetState::InFlight;
                true
            }
            Some(_) => false,
        }
    }

    /// 确认一条消息，返回可以存储的最高连续已处理 offset
    ///
    /// 未登记的 offset 直接忽略。
    pub fn ack(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let pending = self.partitions.get_mut(&partition)?;
        *pending.get_mut(&offset)? = OffsetState::Acked;

        let mut committable = None;
        while let Some(entry) = pending.first_entry() {
            if *entry.get() != OffsetState::Acked {
                break;
            }
            committable = Some(*entry.key());
            entry.remove();
        }
        committable
    }

    /// 放弃一条消息，返回应 seek 到的位置
    ///
    /// 该位置是分区内最低的已放弃 offset，
    /// 之前放弃但尚未重投到达的消息不会被跳过。
    pub fn rewind(&mut self, partition: i32, offset: i64) -> i64 {
        let pending = self.partitions.entry(partition).or_default();
        pending.insert(offset, OffsetState::Abandoned);

        pending
            .iter()
            .find(|(_, state)| **state == OffsetState::Abandoned)
            .map_or(offset, |(o, _)| *o)
    }

    /// 分区内尚未提交的 offset 数量
    pub fn pending(&self, partition: i32) -> usize {
        self.partitions.get(&partition).map_or(0, BTreeMap::len)
    }
}

// ---------------------------------------------------------------------------
// KafkaSubscription
// ---------------------------------------------------------------------------

/// 一个主题订阅（消费组）的生命周期资源
///
/// 由消息管道在启动时创建、停止时关闭；Drop 时底层消费者随之离开消费组。
pub struct KafkaSubscription {
    consumer: StreamConsumer,
    topic: String,
    group_id: String,
    tracker: Mutex<OffsetTracker>,
    delivery_counts: DashMap<(i32, i64), u32>,
    dead_letter: Option<DlqProducer>,
    max_delivery_count: u32,
    closed: AtomicBool,
}

impl KafkaSubscription {
    /// 创建消费者并订阅 topic
    ///
    /// `enable.auto.offset.store=false`：offset 只在显式确认时存储，
    /// 自动提交只会提交已存储的位置。
    pub fn open(
        config: &KafkaConfig,
        topic: &str,
        group_id: &str,
        dead_letter: Option<DlqProducer>,
        max_delivery_count: u32,
    ) -> Result<Self, OrderError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| OrderError::Kafka(format!("创建消费者失败: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| OrderError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            topic,
            group_id,
            max_delivery_count,
            "Kafka 订阅已建立"
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            tracker: Mutex::new(OffsetTracker::new()),
            delivery_counts: DashMap::new(),
            dead_letter,
            max_delivery_count,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 接收下一条消息并登记投递次数
    ///
    /// 回退后重读到的处理中或已确认的消息直接跳过。
    /// 底层 `recv` 可安全取消，调用方可以把它放进 `select!`。
    pub async fn recv(&self) -> Result<ConsumerMessage, OrderError> {
        loop {
            let borrowed = self
                .consumer
                .recv()
                .await
                .map_err(|e| OrderError::Kafka(format!("接收消息出错: {e}")))?;
            let (partition, offset) = (borrowed.partition(), borrowed.offset());

            if !self.tracker.lock().track(partition, offset) {
                debug!(partition, offset, "跳过处理中或已确认的消息");
                continue;
            }

            let mut msg = ConsumerMessage::from_borrowed(&borrowed);
            msg.delivery_count = {
                let mut count = self.delivery_counts.entry((partition, offset)).or_insert(0);
                *count += 1;
                *count
            };
            return Ok(msg);
        }
    }

    /// 确认消息已处理完毕
    pub fn ack(&self, msg: &ConsumerMessage) -> Result<(), OrderError> {
        self.delivery_counts.remove(&(msg.partition, msg.offset));

        let committable = self.tracker.lock().ack(msg.partition, msg.offset);
        if let Some(processed) = committable {
            // 存储的是下一条待消费的位置
            let offset = processed + 1;
            self.consumer
                .store_offset(&msg.topic, msg.partition, offset)
                .map_err(|e| OrderError::Kafka(format!("存储 offset 失败: {e}")))?;
            debug!(partition = msg.partition, offset, "offset 已存储，等待自动提交");
        }
        Ok(())
    }

    /// 放弃消息
    ///
    /// 投递次数耗尽且配置了死信队列时转入死信并确认；
    /// 否则回退分区位置让消息重新投递。死信发送失败同样回退。
    pub async fn abandon(
        &self,
        msg: &ConsumerMessage,
        reason: &str,
    ) -> Result<AbandonOutcome, OrderError> {
        if delivery_exhausted(msg.delivery_count, self.max_delivery_count) {
            match &self.dead_letter {
                Some(dlq) => {
                    if dlq.send(msg, reason, self.max_delivery_count).await.is_ok() {
                        self.ack(msg)?;
                        return Ok(AbandonOutcome::DeadLettered);
                    }
                }
                None => warn!(
                    message_id = %msg.message_id(),
                    delivery_count = msg.delivery_count,
                    "投递次数已耗尽但未配置死信队列，消息继续重投"
                ),
            }
        }

        let seek_to = self.tracker.lock().rewind(msg.partition, msg.offset);
        self.consumer
            .seek(
                &msg.topic,
                msg.partition,
                Offset::Offset(seek_to),
                CLIENT_CALL_TIMEOUT,
            )
            .map_err(|e| OrderError::Kafka(format!("回退分区位置失败: {e}")))?;

        debug!(
            partition = msg.partition,
            offset = msg.offset,
            seek_to,
            "消息已退回，等待重新投递"
        );
        Ok(AbandonOutcome::Requeued)
    }

    /// 同步提交已存储的 offset 并离开消费组，重复调用无副作用
    pub fn close(&self) -> Result<(), OrderError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // 没有任何已存储 offset 时 librdkafka 会返回 NoOffset，属于正常情况
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %e, topic = %self.topic, "关闭订阅时提交 offset 失败");
        }
        self.consumer.unsubscribe();

        info!(topic = %self.topic, group_id = %self.group_id, "Kafka 订阅已关闭");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(key: Option<&str>, payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: "checkoutmessagetopic".to_string(),
            partition: 1,
            offset: 100,
            key: key.map(String::from),
            payload: payload.to_vec(),
            timestamp: None,
            headers: HashMap::new(),
            delivery_count: 1,
        }
    }

    #[test]
    fn test_message_id_prefers_key() {
        assert_eq!(make_message(Some("cart-1"), b"{}").message_id(), "cart-1");
        assert_eq!(
            make_message(None, b"{}").message_id(),
            "checkoutmessagetopic-1-100"
        );
    }

    #[test]
    fn test_deserialize_payload() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Event {
            user_id: String,
        }

        let msg = make_message(None, br#"{"user_id":"u-001"}"#);
        let event: Event = msg.deserialize_payload().unwrap();
        assert_eq!(event.user_id, "u-001");

        let bad = make_message(None, b"not json");
        let result: Result<serde_json::Value, _> = bad.deserialize_payload();
        assert!(matches!(result, Err(OrderError::Serialization(_))));
    }

    #[test]
    fn test_tracker_commits_in_order() {
        let mut tracker = OffsetTracker::new();
        tracker.track(0, 10);
        tracker.track(0, 11);
        tracker.track(0, 12);

        assert_eq!(tracker.ack(0, 10), Some(10));
        assert_eq!(tracker.ack(0, 11), Some(11));
        assert_eq!(tracker.ack(0, 12), Some(12));
        assert_eq!(tracker.pending(0), 0);
    }

    #[test]
    fn test_tracker_holds_back_out_of_order_acks() {
        let mut tracker = OffsetTracker::new();
        for offset in 10..=13 {
            tracker.track(0, offset);
        }

        // 11、12 先完成，10 仍在处理中，不能提交
        assert_eq!(tracker.ack(0, 12), None);
        assert_eq!(tracker.ack(0, 11), None);
        assert_eq!(tracker.pending(0), 4);

        // 10 完成后一次性推进到 12
        assert_eq!(tracker.ack(0, 10), Some(12));
        assert_eq!(tracker.pending(0), 1);
    }

    #[test]
    fn test_tracker_partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.track(0, 5);
        tracker.track(1, 7);

        assert_eq!(tracker.ack(1, 7), Some(7));
        assert_eq!(tracker.pending(0), 1);
        assert_eq!(tracker.ack(0, 5), Some(5));
    }

    #[test]
    fn test_tracker_rewind_seeks_to_abandoned_offset() {
        let mut tracker = OffsetTracker::new();
        for offset in 10..=12 {
            assert!(tracker.track(0, offset));
        }

        // 10 仍在处理中，11 已成功，只有 12 失败
        assert_eq!(tracker.ack(0, 11), None);
        assert_eq!(tracker.rewind(0, 12), 12);

        // 重读到 12 时才重新交给处理方
        assert!(tracker.track(0, 12));
        assert_eq!(tracker.ack(0, 12), None);
        assert_eq!(tracker.ack(0, 10), Some(12));
        assert_eq!(tracker.pending(0), 0);
    }

    #[test]
    fn test_tracker_skips_in_flight_and_acked_after_rewind() {
        let mut tracker = OffsetTracker::new();
        for offset in 20..=23 {
            tracker.track(0, offset);
        }

        tracker.ack(0, 22);
        assert_eq!(tracker.rewind(0, 21), 21);

        // 从 21 开始重读：21 重投，22 已确认、23 处理中，都不再重复处理
        assert!(tracker.track(0, 21));
        assert!(!tracker.track(0, 22));
        assert!(!tracker.track(0, 23));
        assert!(tracker.track(0, 24));

        // 20 仍挡住提交
        assert_eq!(tracker.ack(0, 21), None);
        assert_eq!(tracker.ack(0, 20), Some(22));
        assert_eq!(tracker.pending(0), 2);
    }

    #[test]
    fn test_tracker_rewind_seeks_to_lowest_abandoned() {
        let mut tracker = OffsetTracker::new();
        for offset in 30..=33 {
            tracker.track(0, offset);
        }

        tracker.rewind(0, 30);
        // 更高的 offset 在 30 重投前也失败，仍应从 30 开始重投
        assert_eq!(tracker.rewind(0, 32), 30);

        // 30 重投后 32 仍待重投
        assert!(tracker.track(0, 30));
        assert!(!tracker.track(0, 31));
        assert!(tracker.track(0, 32));
    }

    #[test]
    fn test_tracker_ignores_unknown_offsets() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.ack(3, 1), None);
        tracker.track(3, 2);
        assert_eq!(tracker.ack(3, 1), None);
    }
}

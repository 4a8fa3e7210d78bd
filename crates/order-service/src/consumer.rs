//! 结账消息管道
//!
//! 生命周期：`Stopped -> Starting -> Running -> Stopping -> Stopped`。
//!
//! 每条消息的处理顺序固定为：解码 -> 转换 -> 持久化订单 -> 发布支付请求 -> 确认。
//! 任一步失败都不确认消息，交由 broker 重投；重投会重新走完整流程，
//! 因此"订单已落库但发布失败"的消息会产生重复订单，这里不做去重。
//!
//! 消息在有界并发下处理（`max_concurrent_calls`），不保证跨消息的顺序。

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use order_shared::config::MessagingConfig;
use order_shared::dlq::AbandonOutcome;
use order_shared::error::OrderError;
use order_shared::kafka::ConsumerMessage;
use order_shared::observability::metrics;
use order_shared::retry::{RetryPolicy, retry_with_policy};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::models::CheckoutHeader;
use crate::publisher::PaymentRequestPublisher;
use crate::repository::OrderRepositoryTrait;
use crate::transformer;
use crate::transport::{Subscription, SubscriptionClient};

/// 管道生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
        };
        f.write_str(name)
    }
}

/// 管道运行参数
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub checkout_topic: String,
    pub checkout_subscription: String,
    pub payment_topic: String,
    pub max_concurrent_calls: usize,
    pub retry_policy: RetryPolicy,
}

impl ConsumerSettings {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            checkout_topic: config.checkout_topic.clone(),
            checkout_subscription: config.checkout_subscription.clone(),
            payment_topic: config.payment_topic.clone(),
            max_concurrent_calls: config.max_concurrent_calls.max(1),
            retry_policy: RetryPolicy::from(&config.retry),
        }
    }
}

/// 单条消息处理所需的依赖，在处理任务之间共享
#[derive(Clone)]
pub struct PipelineContext {
    pub order_repo: Arc<dyn OrderRepositoryTrait>,
    pub publisher: Arc<dyn PaymentRequestPublisher>,
    pub payment_topic: String,
    pub retry_policy: RetryPolicy,
}

struct RunningPipeline {
    subscription: Arc<dyn Subscription>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// 结账消息消费者（管道控制器）
pub struct CheckoutConsumer {
    client: Arc<dyn SubscriptionClient>,
    context: PipelineContext,
    settings: ConsumerSettings,
    state: Mutex<ConsumerState>,
    running: tokio::sync::Mutex<Option<RunningPipeline>>,
}

impl CheckoutConsumer {
    pub fn new(
        client: Arc<dyn SubscriptionClient>,
        order_repo: Arc<dyn OrderRepositoryTrait>,
        publisher: Arc<dyn PaymentRequestPublisher>,
        settings: ConsumerSettings,
    ) -> Self {
        let context = PipelineContext {
            order_repo,
            publisher,
            payment_topic: settings.payment_topic.clone(),
            retry_policy: settings.retry_policy.clone(),
        };
        Self {
            client,
            context,
            settings,
            state: Mutex::new(ConsumerState::Stopped),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    fn transition(&self, from: ConsumerState, to: ConsumerState) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(PipelineError::InvalidState {
                current: *state,
                expected: from,
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: ConsumerState) {
        *self.state.lock() = to;
    }

    /// 打开订阅并开始接收消息
    ///
    /// 仅在 `Stopped` 状态下可调用；订阅失败时回到 `Stopped` 并返回错误。
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.transition(ConsumerState::Stopped, ConsumerState::Starting)?;

        let topic = &self.settings.checkout_topic;
        let subscription_name = &self.settings.checkout_subscription;
        info!(
            topic = %topic,
            subscription = %subscription_name,
            max_concurrent_calls = self.settings.max_concurrent_calls,
            "正在启动结账消息管道"
        );

        let subscription = match self.client.subscribe(topic, subscription_name).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.set_state(ConsumerState::Stopped);
                error!(error = %e, topic = %topic, "打开订阅失败");
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            Arc::clone(&subscription),
            self.context.clone(),
            self.settings.max_concurrent_calls,
            shutdown_rx,
        ));

        *self.running.lock().await = Some(RunningPipeline {
            subscription,
            shutdown,
            task,
        });
        self.set_state(ConsumerState::Running);

        info!(topic = %topic, "结账消息管道已启动");
        Ok(())
    }

    /// 停止接收、等待在途消息处理完毕后关闭订阅
    ///
    /// 仅在 `Running` 状态下可调用。无论中途是否出错，订阅都会被关闭，
    /// 状态最终回到 `Stopped`，返回遇到的第一个错误。
    /// 返回的 future 在排空途中被丢弃时，订阅改由后台任务关闭。
    pub async fn stop(&self) -> Result<(), PipelineError> {
        self.transition(ConsumerState::Running, ConsumerState::Stopping)?;
        info!("正在停止结账消息管道");

        let mut guard = StopGuard {
            consumer: self,
            subscription: None,
        };

        let pipeline = self.running.lock().await.take();
        let Some(pipeline) = pipeline else {
            return Ok(());
        };
        guard.subscription = Some(Arc::clone(&pipeline.subscription));
        let mut result = Ok(());

        // 接收端已退出时发送失败，不影响后续关闭
        let _ = pipeline.shutdown.send(true);

        if let Err(e) = pipeline.task.await {
            error!(error = %e, "消息管道任务异常退出");
            result = Err(PipelineError::Shared(OrderError::Internal(format!(
                "消息管道任务异常退出: {e}"
            ))));
        }

        if let Some(subscription) = guard.subscription.take()
            && let Err(e) = subscription.close().await
        {
            warn!(error = %e, "关闭订阅失败");
            if result.is_ok() {
                result = Err(e);
            }
        }

        drop(guard);
        info!("结账消息管道已停止");
        result
    }
}

/// 停止流程的收尾：离开作用域时回到 `Stopped`，尚未关闭的订阅交给后台任务关闭
struct StopGuard<'a> {
    consumer: &'a CheckoutConsumer,
    subscription: Option<Arc<dyn Subscription>>,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            warn!("停止流程被中断，在后台关闭订阅");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = subscription.close().await {
                            warn!(error = %e, "后台关闭订阅失败");
                        }
                    });
                }
                Err(_) => error!("没有可用的运行时，订阅未能关闭"),
            }
        }
        self.consumer.set_state(ConsumerState::Stopped);
    }
}

/// 接收循环
///
/// 先取得并发许可再接收，保证在途消息数不超过 `max_concurrent_calls`。
/// 收到关闭信号后不再接收新消息，等待已派发的处理任务全部结束再返回。
async fn run_loop(
    subscription: Arc<dyn Subscription>,
    context: PipelineContext,
    max_concurrent_calls: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent_calls.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "消息处理任务异常退出");
            }
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            delivery = subscription.receive() => delivery,
        };

        match delivery {
            None => {
                info!("订阅已关闭，接收循环退出");
                break;
            }
            Some(Err(e)) => {
                // 传输层错误不改变管道状态，继续接收
                error!(error = %e, "接收结账消息时发生传输层错误");
                metrics::record_transport_error();
            }
            Some(Ok(msg)) => {
                debug!(
                    message_id = %msg.message_id(),
                    delivery_count = msg.delivery_count,
                    "收到结账消息"
                );
                let subscription = Arc::clone(&subscription);
                let context = context.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    process_delivery(subscription.as_ref(), &context, msg).await;
                });
            }
        }
    }

    let in_flight = tasks.len();
    if in_flight > 0 {
        info!(in_flight, "等待在途消息处理完成");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "消息处理任务异常退出");
        }
    }
}

/// 处理一条投递并结算：成功则确认，失败则放弃
async fn process_delivery(
    subscription: &dyn Subscription,
    context: &PipelineContext,
    msg: ConsumerMessage,
) {
    let started = Instant::now();
    let message_id = msg.message_id();

    match handle_message(context, &msg).await {
        Ok(order_id) => {
            let elapsed = started.elapsed().as_secs_f64();
            match subscription.complete(&msg).await {
                Ok(()) => {
                    info!(message_id = %message_id, order_id, "结账消息处理完成");
                    metrics::record_checkout_message("completed", elapsed);
                }
                Err(e) => {
                    error!(
                        message_id = %message_id,
                        order_id,
                        error = %e,
                        "确认消息失败，消息将被重新投递"
                    );
                    metrics::record_checkout_message("ack_failed", elapsed);
                }
            }
        }
        Err(e) => {
            warn!(
                message_id = %message_id,
                delivery_count = msg.delivery_count,
                outcome = e.outcome(),
                error = %e,
                "结账消息处理失败，不确认"
            );
            metrics::record_checkout_message(e.outcome(), started.elapsed().as_secs_f64());

            match subscription.abandon(&msg, &e.to_string()).await {
                Ok(AbandonOutcome::Requeued) => {
                    debug!(message_id = %message_id, "消息已退回，等待重投");
                }
                Ok(AbandonOutcome::DeadLettered) => {
                    metrics::record_dead_letter(&msg.topic);
                    warn!(
                        message_id = %message_id,
                        delivery_count = msg.delivery_count,
                        "消息投递次数耗尽，已转入死信"
                    );
                }
                Err(abandon_err) => {
                    error!(
                        message_id = %message_id,
                        error = %abandon_err,
                        "放弃消息失败，由 broker 超时后重投"
                    );
                }
            }
        }
    }
}

/// 处理一条结账消息，成功时返回新订单 ID
///
/// 只有返回 `Ok` 时调用方才可以确认消息。
pub async fn handle_message(
    context: &PipelineContext,
    msg: &ConsumerMessage,
) -> Result<i64, PipelineError> {
    let checkout: CheckoutHeader = msg
        .deserialize_payload()
        .map_err(|e| PipelineError::MalformedPayload(e.to_string()))?;

    let order = transformer::to_order_header(&checkout)?;

    let persisted = retry_with_policy(
        &context.retry_policy,
        "add_order",
        OrderError::is_retryable,
        || context.order_repo.add_order(&order),
    )
    .await
    .map_err(PipelineError::Persistence)?;
    metrics::record_order_created();

    let payment = transformer::to_payment_request(&persisted)?;

    retry_with_policy(
        &context.retry_policy,
        "publish_payment_request",
        OrderError::is_retryable,
        || context.publisher.publish(&payment, &context.payment_topic),
    )
    .await
    .map_err(PipelineError::Publish)?;
    metrics::record_payment_request_published(&context.payment_topic);

    debug!(
        order_id = payment.order_id,
        payment_message_id = %payment.id,
        total_items = persisted.cart_total_items,
        "订单已创建并发布支付请求"
    );
    Ok(payment.order_id)
}

// src/messaging/strategy.rs
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerClient, ReceiverChannel};
use super::error::{BusError, Result};
use super::types::{DestinationKind, OutgoingMessage, ReceiveSource, ReceivedMessage};

/// Caller-supplied message handler. Returning `Err` (or panicking) hands the
/// message back to the broker for redelivery instead of completing it.
///
/// Handlers run synchronously on the listener's task. On a multi-thread
/// runtime the call goes through `block_in_place`; on a current-thread
/// runtime a slow handler holds up every other task.
pub type Handler = Arc<dyn Fn(&ReceivedMessage) -> anyhow::Result<()> + Send + Sync>;

/// How a publisher reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStrategy {
    Queue,
    Topic,
}

impl SenderStrategy {
    pub fn kind(&self) -> DestinationKind {
        match self {
            SenderStrategy::Queue => DestinationKind::Queue,
            SenderStrategy::Topic => DestinationKind::Topic,
        }
    }

    /// Open a send-channel on `name`, push `content` through it and release
    /// the channel before returning, whatever the outcome.
    pub async fn send(&self, client: &dyn BrokerClient, name: &str, content: &str) -> Result<()> {
        let kind = self.kind();
        let mut channel = client.open_sender(kind, name).await?;

        let message = OutgoingMessage::new(content);
        let outcome = channel.send(&message).await;

        if let Err(e) = channel.close().await {
            warn!(destination = %name, kind = %kind, error = %e, "Failed to release sender channel");
        }

        match outcome {
            Ok(()) => {
                info!(destination = %name, kind = %kind, message_id = %message.id, "Sent message to {}: {}", kind, content);
                Ok(())
            }
            Err(e) => {
                error!(destination = %name, kind = %kind, error = %e, "Send failed");
                Err(e)
            }
        }
    }
}

/// How a subscriber reads from its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverStrategy {
    Queue,
    Topic,
}

impl ReceiverStrategy {
    /// Work out which entity to read from. Topics need a non-empty
    /// subscription name; queues ignore it.
    pub fn resolve_source(&self, name: &str, subscription: Option<&str>) -> Result<ReceiveSource> {
        match self {
            ReceiverStrategy::Queue => {
                if let Some(subscription) = subscription {
                    debug!(queue = %name, subscription = %subscription, "Ignoring subscription name for queue receiver");
                }
                Ok(ReceiveSource::Queue(name.to_string()))
            }
            ReceiverStrategy::Topic => match subscription.map(str::trim) {
                Some(subscription) if !subscription.is_empty() => Ok(ReceiveSource::Subscription {
                    topic: name.to_string(),
                    subscription: subscription.to_string(),
                }),
                _ => Err(BusError::configuration(format!(
                    "topic receiver for '{}' requires a subscription name",
                    name
                ))),
            },
        }
    }

    /// Validate the binding and spawn the consume loop on the current tokio
    /// runtime. Returns as soon as the loop is scheduled.
    pub fn start_listening(
        &self,
        client: Arc<dyn BrokerClient>,
        name: &str,
        subscription: Option<&str>,
        handler: Handler,
    ) -> Result<ListenerHandle> {
        let source = self.resolve_source(name, subscription)?;
        let runtime = Handle::try_current().map_err(|e| {
            BusError::configuration(format!("start_listening needs a tokio runtime: {}", e))
        })?;

        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_listener(
            client,
            source.clone(),
            handler,
            cancel.clone(),
        ));

        info!(entity = %source, "Started listening to {}", source);
        Ok(ListenerHandle {
            source,
            cancel,
            task,
        })
    }
}

/// Handle to a running consume loop.
///
/// Dropping the handle leaves the loop running until the process exits.
pub struct ListenerHandle {
    source: ReceiveSource,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ListenerHandle {
    pub fn source(&self) -> &ReceiveSource {
        &self.source
    }

    /// Ask the loop to stop. It finishes the message in hand first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end and return how it ended.
    pub async fn join(self) -> Result<()> {
        let entity = self.source.entity_path();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(BusError::receive(entity, format!("listener task aborted: {}", e))),
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

async fn run_listener(
    client: Arc<dyn BrokerClient>,
    source: ReceiveSource,
    handler: Handler,
    cancel: CancellationToken,
) -> Result<()> {
    let mut channel = match client.open_receiver(&source).await {
        Ok(channel) => channel,
        Err(e) => {
            error!(entity = %source, error = %e, "Failed to open receiver channel");
            return Err(e);
        }
    };

    let outcome = consume(channel.as_mut(), &source, &handler, &cancel).await;

    if let Err(e) = channel.close().await {
        warn!(entity = %source, error = %e, "Failed to release receiver channel");
    }
    match &outcome {
        Ok(()) => info!(entity = %source, "Listener stopped"),
        Err(e) => error!(entity = %source, error = %e, "Listener terminated"),
    }
    outcome
}

async fn consume(
    channel: &mut dyn ReceiverChannel,
    source: &ReceiveSource,
    handler: &Handler,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = channel.receive() => next,
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(BusError::receive(
                    source.entity_path(),
                    "receive stream closed by broker",
                ))
            }
            Err(e) => return Err(e),
        };

        match settle(channel, &message, handler).await {
            Ok(()) => {
                debug!(entity = %source, message_id = %message.message_id, "Completed message");
            }
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                warn!(entity = %source, error = %e, "Message handed back for redelivery");
                // The broker may hand the same message straight back.
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Run the handler, then complete the message or give it back to the broker.
/// Handler failures come back as non-terminal errors; channel failures as
/// terminal ones.
async fn settle(
    channel: &mut dyn ReceiverChannel,
    message: &ReceivedMessage,
    handler: &Handler,
) -> Result<()> {
    match invoke(handler, message) {
        Ok(()) => channel.complete(message).await,
        Err(failure) => {
            channel.abandon(message).await?;
            Err(failure)
        }
    }
}

fn invoke(handler: &Handler, message: &ReceivedMessage) -> Result<()> {
    let run = || catch_unwind(AssertUnwindSafe(|| handler(message)));
    // Keep a slow handler from pinning a runtime worker.
    let outcome = match Handle::try_current().map(|runtime| runtime.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(run),
        _ => run(),
    };

    let failure = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .map_or_else(|| "handler panicked".to_string(), |s| format!("handler panicked: {}", s)),
    };
    Err(BusError::Handler {
        message_id: message.message_id.clone(),
        reason: failure,
    })
}

/// Handler that just logs each message.
pub fn log_message(message: &ReceivedMessage) -> anyhow::Result<()> {
    info!(message_id = %message.message_id, redelivered = message.redelivered, "Received message: {}", message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::broker::SenderChannel;
    use crate::messaging::in_memory::InMemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Client whose queue disappears right after a sender opens on it.
    struct VanishingQueue {
        broker: InMemoryBroker,
    }

    #[async_trait]
    impl BrokerClient for VanishingQueue {
        async fn open_sender(
            &self,
            kind: DestinationKind,
            name: &str,
        ) -> Result<Box<dyn SenderChannel>> {
            let channel = self.broker.client().open_sender(kind, name).await?;
            self.broker.delete(&ReceiveSource::Queue(name.to_string()));
            Ok(channel)
        }

        async fn open_receiver(&self, source: &ReceiveSource) -> Result<Box<dyn ReceiverChannel>> {
            self.broker.client().open_receiver(source).await
        }
    }

    /// Receiver that delivers one message and cannot settle it.
    struct BrokenSettle {
        delivered: bool,
    }

    #[async_trait]
    impl ReceiverChannel for BrokenSettle {
        async fn receive(&mut self) -> Result<Option<ReceivedMessage>> {
            if std::mem::replace(&mut self.delivered, true) {
                std::future::pending::<()>().await;
            }
            Ok(Some(ReceivedMessage {
                message_id: "m-1".to_string(),
                body: "x".to_string(),
                delivery_tag: 1,
                redelivered: false,
                enqueued_at: None,
            }))
        }

        async fn complete(&mut self, _message: &ReceivedMessage) -> Result<()> {
            Err(BusError::receive("q1", "channel closed"))
        }

        async fn abandon(&mut self, _message: &ReceivedMessage) -> Result<()> {
            Err(BusError::receive("q1", "channel closed"))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn queue_send_is_accepted_once_with_same_body() {
        let broker = InMemoryBroker::new();
        let client = broker.client();

        SenderStrategy::Queue.send(&client, "q1", "hello, queue").await.unwrap();

        let accepted = broker.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].kind, DestinationKind::Queue);
        assert_eq!(accepted[0].destination, "q1");
        assert_eq!(accepted[0].body, "hello, queue");
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn topic_send_is_accepted_once_with_same_body() {
        let broker = InMemoryBroker::new();
        let client = broker.client();

        SenderStrategy::Topic.send(&client, "t1", "  padded\ncontent ").await.unwrap();

        let accepted = broker.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].kind, DestinationKind::Topic);
        assert_eq!(accepted[0].body, "  padded\ncontent ");
    }

    #[tokio::test]
    async fn send_failure_propagates_and_releases_nothing_open() {
        let broker = InMemoryBroker::strict();
        let client = broker.client();

        let err = SenderStrategy::Queue.send(&client, "missing", "x").await.unwrap_err();
        assert!(matches!(err, BusError::Send { .. }));
        assert!(broker.accepted().is_empty());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn push_failure_after_open_still_releases_the_channel() {
        let broker = InMemoryBroker::strict();
        broker.declare_queue("q1");
        let client = VanishingQueue {
            broker: broker.clone(),
        };

        let err = SenderStrategy::Queue.send(&client, "q1", "x").await.unwrap_err();
        assert!(matches!(err, BusError::Send { .. }));
        assert!(broker.accepted().is_empty());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn failure_to_settle_ends_the_loop() {
        let source = ReceiveSource::Queue("q1".to_string());
        let cancel = CancellationToken::new();

        let ok: Handler = Arc::new(log_message);
        let mut channel = BrokenSettle { delivered: false };
        let outcome = consume(&mut channel, &source, &ok, &cancel).await;
        assert!(matches!(outcome, Err(BusError::Receive { .. })));

        let failing: Handler =
            Arc::new(|_: &ReceivedMessage| -> anyhow::Result<()> { anyhow::bail!("nope") });
        let mut channel = BrokenSettle { delivered: false };
        let outcome = consume(&mut channel, &source, &failing, &cancel).await;
        assert!(matches!(outcome, Err(BusError::Receive { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_handler_leaves_the_runtime_responsive() {
        let broker = InMemoryBroker::new();
        let entered = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let (entered_flag, done_flag) = (Arc::clone(&entered), Arc::clone(&done));
        let handler: Handler = Arc::new(move |_: &ReceivedMessage| -> anyhow::Result<()> {
            entered_flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            done_flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        SenderStrategy::Queue.send(&broker.client(), "q1", "slow").await.unwrap();
        let listener = ReceiverStrategy::Queue
            .start_listening(Arc::new(broker.client()), "q1", None, handler)
            .unwrap();

        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let watched = Arc::clone(&done);
        let finished_early = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            !watched.load(Ordering::SeqCst)
        })
        .await
        .unwrap();
        assert!(finished_early);

        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn topic_receiver_without_subscription_is_rejected_up_front() {
        let broker = InMemoryBroker::new();
        let handler: Handler = Arc::new(log_message);

        for subscription in [None, Some(""), Some("   ")] {
            let err = ReceiverStrategy::Topic
                .start_listening(Arc::new(broker.client()), "t1", subscription, handler.clone())
                .err()
                .unwrap();
            assert!(matches!(err, BusError::Configuration(_)));
        }
        assert_eq!(broker.receivers_opened(), 0);
    }

    #[test]
    fn queue_receiver_ignores_subscription() {
        let source = ReceiverStrategy::Queue.resolve_source("q1", Some("s1")).unwrap();
        assert_eq!(source, ReceiveSource::Queue("q1".to_string()));
    }

    #[test]
    fn start_listening_outside_runtime_is_a_configuration_error() {
        let broker = InMemoryBroker::new();
        let err = ReceiverStrategy::Queue
            .start_listening(Arc::new(broker.client()), "q1", None, Arc::new(log_message))
            .err()
            .unwrap();
        assert!(matches!(err, BusError::Configuration(_)));
    }

    #[test]
    fn handler_errors_and_panics_become_handler_errors() {
        let message = ReceivedMessage {
            message_id: "m-1".to_string(),
            body: "x".to_string(),
            delivery_tag: 1,
            redelivered: false,
            enqueued_at: None,
        };

        let failing: Handler =
            Arc::new(|_: &ReceivedMessage| -> anyhow::Result<()> { anyhow::bail!("bad payload") });
        match invoke(&failing, &message) {
            Err(BusError::Handler { message_id, reason }) => {
                assert_eq!(message_id, "m-1");
                assert_eq!(reason, "bad payload");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let panicking: Handler =
            Arc::new(|_: &ReceivedMessage| -> anyhow::Result<()> { panic!("exploded") });
        match invoke(&panicking, &message) {
            Err(BusError::Handler { reason, .. }) => assert_eq!(reason, "handler panicked: exploded"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert!(invoke(&(Arc::new(log_message) as Handler), &message).is_ok());
    }
}

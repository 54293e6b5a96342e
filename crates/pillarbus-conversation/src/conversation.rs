//! Per-conversation driver.
//!
//! Each started conversation runs as one tokio task that owns its
//! [`ConversationState`]. Inbound messages, cancellation and timer
//! firings are all funnelled through one `select!`, so the state machine
//! only ever sees one input at a time.

use crate::context::ConversationContext;
use crate::error::{ConversationError, Result};
use crate::mediator::ConversationMediator;
use crate::state::{ConversationOutcome, ConversationState, Effect, Input, Phase};
use crate::types::ConversationId;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// A conversation that has been configured but not started.
///
/// Start it with [`ConversationMediator::start`] (or through
/// [`crate::client::Client`]).
#[derive(Debug)]
pub struct Conversation {
    context: Arc<ConversationContext>,
}

impl Conversation {
    /// Wrap a context.
    pub fn new(context: ConversationContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Conversation ID.
    pub fn id(&self) -> ConversationId {
        self.context.conversation_id()
    }

    /// The context the conversation runs with.
    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Compute the initial transition and spawn the driver task.
    ///
    /// The caller must already have registered `inbox_tx` under
    /// [`Conversation::id`]; the driver deregisters itself when done.
    pub(crate) fn spawn(
        self,
        initial: (ConversationState, Vec<Effect>),
        inbox_tx: mpsc::UnboundedSender<Input>,
        inbox_rx: mpsc::UnboundedReceiver<Input>,
        mediator: ConversationMediator,
    ) -> ConversationHandle {
        let id = self.id();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let driver = Driver {
            context: self.context,
            timer: None,
            mediator,
            outcome_tx,
        };
        tokio::spawn(driver.run(initial, inbox_rx));
        ConversationHandle {
            id,
            inbox: inbox_tx,
            outcome: outcome_rx,
        }
    }
}

/// Caller-side handle on a running conversation.
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    id: ConversationId,
    inbox: mpsc::UnboundedSender<Input>,
    outcome: watch::Receiver<Option<ConversationOutcome>>,
}

impl ConversationHandle {
    /// Conversation ID.
    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Ask the conversation to stop. It finishes with a cancelled failure
    /// unless it already finished, in which case this does nothing.
    pub fn cancel(&self) {
        if self.inbox.send(Input::Cancel).is_err() {
            debug!(conversation = %self.id, "cancel after finish ignored");
        }
    }

    /// True once the conversation reached `Finished`.
    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// The outcome, if the conversation already finished.
    pub fn outcome(&self) -> Option<ConversationOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the conversation to finish.
    pub async fn wait(&self) -> Result<ConversationOutcome> {
        let mut rx = self.outcome.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return Ok(outcome);
            }
            if rx.changed().await.is_err() {
                // Driver gone without publishing: the runtime shut down under it.
                return rx
                    .borrow()
                    .clone()
                    .ok_or(ConversationError::UnknownConversation { id: self.id });
            }
        }
    }
}

struct Driver {
    context: Arc<ConversationContext>,
    timer: Option<(Phase, Instant)>,
    mediator: ConversationMediator,
    outcome_tx: watch::Sender<Option<ConversationOutcome>>,
}

impl Driver {
    async fn run(
        mut self,
        initial: (ConversationState, Vec<Effect>),
        mut inbox: mpsc::UnboundedReceiver<Input>,
    ) {
        let ctx = self.context.clone();
        let watchdog = sleep_until(Instant::now() + ctx.timeouts().conversation);
        tokio::pin!(watchdog);

        info!(
            conversation = %ctx.conversation_id(),
            operation = %ctx.operation_kind(),
            collection = %ctx.collection_id(),
            "conversation started"
        );

        let (state, effects) = initial;
        let mut state = self.execute(state, effects).await;

        while !state.is_finished() {
            let (phase, at) = match self.timer {
                Some((phase, at)) => (Some(phase), at),
                None => (None, Instant::now() + ctx.timeouts().conversation),
            };
            // watchdog first so a busy inbox cannot starve the ceiling
            let input = tokio::select! {
                biased;
                _ = &mut watchdog => Input::ConversationTimeout,
                received = inbox.recv() => match received {
                    Some(input) => input,
                    None => {
                        warn!(conversation = %ctx.conversation_id(), "inbox closed, cancelling");
                        Input::Cancel
                    }
                },
                _ = sleep_until(at), if phase.is_some() => {
                    self.timer = None;
                    match phase {
                        Some(phase) => Input::PhaseTimeout(phase),
                        None => continue,
                    }
                }
            };
            let (next, effects) = state.on_input(&ctx, input);
            state = self.execute(next, effects).await;
        }
        debug!(conversation = %ctx.conversation_id(), "driver stopped");
    }

    /// Run effects in order. Send failures are fed back into the machine
    /// immediately and their effects appended to the queue.
    async fn execute(&mut self, mut state: ConversationState, effects: Vec<Effect>) -> ConversationState {
        let ctx = self.context.clone();
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Send {
                    message,
                    destination,
                    contributor,
                } => {
                    if let Err(error) = ctx.sender().send(message, &destination).await {
                        warn!(
                            conversation = %ctx.conversation_id(),
                            destination = %destination,
                            error = %error,
                            "send failed"
                        );
                        let (next, more) = state.on_input(&ctx, Input::SendFailed { contributor, error });
                        state = next;
                        queue.extend(more);
                    }
                }
                Effect::Emit(event) => ctx.emit(event),
                Effect::StartTimer { phase, after } => {
                    if !state.is_finished() {
                        self.timer = Some((phase, Instant::now() + after));
                    }
                }
                Effect::Finish(outcome) => {
                    self.timer = None;
                    self.mediator.deregister(&ctx.conversation_id());
                    info!(
                        conversation = %ctx.conversation_id(),
                        success = outcome.is_success(),
                        "conversation finished"
                    );
                    self.outcome_tx.send_replace(Some(outcome));
                }
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, MessageSender};
    use crate::config::{CollectionSettings, Settings};
    use crate::error::TransportError;
    use crate::event::{ChannelEventHandler, EventType, FailureReason, OperationEvent};
    use crate::message::{Message, MessageBody, ResponseCode, ResponseInfo};
    use crate::operation::{Operation, OperationKind};
    use crate::types::{CollectionId, ContributorId, Destination};
    use std::time::Duration;

    struct Fixture {
        bus: Arc<LocalBus>,
        mediator: ConversationMediator,
        events: mpsc::UnboundedReceiver<OperationEvent>,
        handle: ConversationHandle,
        topic: mpsc::UnboundedReceiver<Message>,
    }

    fn settings() -> Settings {
        Settings {
            identification_timeout_ms: 1_000,
            operation_timeout_ms: 5_000,
            conversation_timeout_ms: 60_000,
            collections: vec![CollectionSettings {
                id: CollectionId::new("books"),
                destination: Destination::new("topic.books"),
                contributors: vec![ContributorId::new("a"), ContributorId::new("b")],
            }],
            ..Settings::default()
        }
    }

    fn start(settings: &Settings) -> Fixture {
        let bus = Arc::new(LocalBus::new());
        let topic = bus.subscribe(Destination::new("topic.books"));
        let (handler, events) = ChannelEventHandler::new();
        let context = ConversationContext::builder(settings, CollectionId::new("books"), Operation::GetStatus)
            .sender(bus.clone())
            .event_handler(Arc::new(handler))
            .build()
            .unwrap();
        let mediator = ConversationMediator::new();
        let handle = mediator.start(Conversation::new(context)).unwrap();
        Fixture {
            bus,
            mediator,
            events,
            handle,
            topic,
        }
    }

    /// Accepts every send after `delay`.
    struct SlowSender {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MessageSender for SlowSender {
        async fn send(
            &self,
            _message: Message,
            _destination: &Destination,
        ) -> std::result::Result<(), TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<OperationEvent>) -> Vec<EventType> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event.event_type);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_timeout_without_responses() {
        let mut f = start(&settings());
        let outcome = f.handle.wait().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::NoComponentFound));
        assert_eq!(
            drain(&mut f.events),
            vec![
                EventType::IdentifyRequestSent,
                EventType::NoComponentFound,
                EventType::Failed
            ]
        );
        assert!(!f.mediator.is_registered(&f.handle.id()));
        let request = f.topic.recv().await.unwrap();
        assert!(matches!(request.body, MessageBody::IdentifyRequest { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_finishes_once() {
        let mut f = start(&settings());
        f.handle.cancel();
        let outcome = f.handle.wait().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
        f.handle.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let terminal = drain(&mut f.events)
            .into_iter()
            .filter(|e| e.is_terminal())
            .count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_failure_fails_conversation() {
        let bus = Arc::new(LocalBus::new());
        let (handler, mut events) = ChannelEventHandler::new();
        let settings = settings();
        let context = ConversationContext::builder(&settings, CollectionId::new("books"), Operation::GetStatus)
            .sender(bus.clone())
            .event_handler(Arc::new(handler))
            .build()
            .unwrap();
        let mediator = ConversationMediator::new();
        let handle = mediator.start(Conversation::new(context)).unwrap();
        let outcome = handle.wait().await.unwrap();
        assert!(matches!(outcome.failure, Some(FailureReason::Transport { .. })));
        assert_eq!(
            drain(&mut events),
            vec![EventType::IdentifyRequestSent, EventType::Failed]
        );
        assert_eq!(mediator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_drive_to_completion() {
        let mut f = start(&settings());
        let request = f.topic.recv().await.unwrap();
        let mut queues = Vec::new();
        for name in ["a", "b"] {
            let queue = Destination::new(format!("queue.{name}"));
            queues.push(f.bus.subscribe(queue.clone()));
            let reply = Message::reply_to(
                &request,
                ContributorId::new(name),
                queue,
                MessageBody::IdentifyResponse {
                    operation: OperationKind::GetStatus,
                    response: Some(ResponseInfo::new(ResponseCode::IdentificationPositive, "here")),
                },
            );
            f.mediator.dispatch(reply);
        }
        for (name, queue) in ["a", "b"].iter().zip(queues.iter_mut()) {
            let op = queue.recv().await.unwrap();
            assert!(matches!(op.body, MessageBody::OperationRequest { .. }));
            f.mediator.dispatch(Message::reply_to(
                &op,
                ContributorId::new(*name),
                Destination::new(format!("queue.{name}")),
                MessageBody::OperationResponse {
                    operation: OperationKind::GetStatus,
                    response: Some(ResponseInfo::new(ResponseCode::OperationCompleted, "ok")),
                    result: None,
                },
            ));
        }
        let outcome = f.handle.wait().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.completed().len(), 2);
        assert_eq!(drain(&mut f.events).last(), Some(&EventType::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_during_performing() {
        let settings = Settings {
            operation_timeout_ms: 120_000,
            conversation_timeout_ms: 30_000,
            ..settings()
        };
        let mut f = start(&settings);
        let request = f.topic.recv().await.unwrap();
        let _queue = f.bus.subscribe(Destination::new("queue.a"));
        f.mediator.dispatch(Message::reply_to(
            &request,
            ContributorId::new("a"),
            Destination::new("queue.a"),
            MessageBody::IdentifyResponse {
                operation: OperationKind::GetStatus,
                response: Some(ResponseInfo::new(ResponseCode::IdentificationPositive, "here")),
            },
        ));
        let outcome = f.handle.wait().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::ConversationTimeout));
        let events = drain(&mut f.events);
        assert!(events.contains(&EventType::RequestSent));
        assert_eq!(events.last(), Some(&EventType::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_preempts_queued_responses() {
        let settings = Settings {
            conversation_timeout_ms: 100,
            ..settings()
        };
        let (handler, mut events) = ChannelEventHandler::new();
        let context = ConversationContext::builder(&settings, CollectionId::new("books"), Operation::GetStatus)
            .sender(Arc::new(SlowSender {
                delay: Duration::from_millis(150),
            }))
            .event_handler(Arc::new(handler))
            .build()
            .unwrap();
        let mediator = ConversationMediator::new();
        let handle = mediator.start(Conversation::new(context)).unwrap();

        // the driver is still inside the broadcast send while both answers queue up
        tokio::time::sleep(Duration::from_millis(10)).await;
        for name in ["a", "b"] {
            mediator.dispatch(Message {
                conversation_id: handle.id(),
                collection_id: CollectionId::new("books"),
                from: ContributorId::new(name),
                reply_to: Destination::new(format!("queue.{name}")),
                body: MessageBody::IdentifyResponse {
                    operation: OperationKind::GetStatus,
                    response: Some(ResponseInfo::new(ResponseCode::IdentificationPositive, "here")),
                },
            });
        }

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::ConversationTimeout));
        assert_eq!(
            drain(&mut events),
            vec![EventType::IdentifyRequestSent, EventType::Failed]
        );
        assert_eq!(mediator.active_count(), 0);
    }
}

//! Test Harness - simulated pillars on an in-process bus

use pillarbus_conversation::{
    ChecksumEntry, Client, CollectionId, CollectionSettings, ContributorId, ConversationHandle,
    ConversationId, ConversationMediator, ConversationOutcome, Destination, EventHandler,
    EventType, FileIdEntry, FileIdSelector, LocalBus, Message, MessageBody, MessageSender,
    Operation, OperationEvent, OperationPolicy, OperationResult, ResponseCode, ResponseInfo,
    Settings, StatusInfo,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// How a simulated pillar answers an identify request.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyReply {
    /// Positive, with its own queue as reply destination.
    Positive,
    /// Positive, but advertising a queue nobody listens on.
    PositiveUnreachable,
    /// Declines with the given code.
    Negative(ResponseCode),
    /// Response without a status block.
    Malformed,
    /// Never answers.
    Silent,
}

/// How a simulated pillar answers an operation request.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationReply {
    /// Completes with a result payload.
    Complete,
    /// Sends an accepted-progress response first, then completes.
    ProgressThenComplete,
    /// Fails with the given code.
    Fail(ResponseCode),
    /// Response without a status block.
    Malformed,
    /// Never answers.
    Silent,
}

/// Behaviour of one simulated pillar.
#[derive(Debug, Clone)]
pub struct PillarScript {
    pub identify: IdentifyReply,
    pub operation: OperationReply,
    /// Delay before each answer.
    pub delay: Duration,
}

impl PillarScript {
    pub fn cooperative() -> Self {
        Self {
            identify: IdentifyReply::Positive,
            operation: OperationReply::Complete,
            delay: Duration::ZERO,
        }
    }

    pub fn declining() -> Self {
        Self {
            identify: IdentifyReply::Negative(ResponseCode::IdentificationNegative),
            ..Self::cooperative()
        }
    }

    pub fn silent() -> Self {
        Self {
            identify: IdentifyReply::Silent,
            ..Self::cooperative()
        }
    }

    pub fn failing(code: ResponseCode) -> Self {
        Self {
            operation: OperationReply::Fail(code),
            ..Self::cooperative()
        }
    }

    pub fn with_identify(mut self, reply: IdentifyReply) -> Self {
        self.identify = reply;
        self
    }

    pub fn with_operation(mut self, reply: OperationReply) -> Self {
        self.operation = reply;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct PillarStats {
    identify_requests: AtomicU64,
    operation_requests: AtomicU64,
}

/// A pillar that listens on the collection topic and on its own queue
/// and answers from its script. The task stops when dropped.
#[derive(Debug)]
pub struct SimulatedPillar {
    id: ContributorId,
    stats: Arc<PillarStats>,
    task: JoinHandle<()>,
}

impl SimulatedPillar {
    /// Queue a pillar receives point-to-point requests on.
    pub fn queue(id: &ContributorId) -> Destination {
        Destination::new(format!("queue.{id}"))
    }

    pub fn spawn(bus: Arc<LocalBus>, id: ContributorId, topic: Destination, script: PillarScript) -> Self {
        let stats = Arc::new(PillarStats::default());
        let mut broadcasts = bus.subscribe(topic);
        let mut direct = bus.subscribe(Self::queue(&id));
        let worker = PillarWorker {
            bus,
            id: id.clone(),
            script,
            stats: stats.clone(),
        };
        let task = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    Some(m) = broadcasts.recv() => m,
                    Some(m) = direct.recv() => m,
                    else => break,
                };
                worker.handle(request).await;
            }
        });
        Self { id, stats, task }
    }

    pub fn id(&self) -> &ContributorId {
        &self.id
    }

    pub fn identify_requests(&self) -> u64 {
        self.stats.identify_requests.load(Ordering::Relaxed)
    }

    pub fn operation_requests(&self) -> u64 {
        self.stats.operation_requests.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedPillar {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct PillarWorker {
    bus: Arc<LocalBus>,
    id: ContributorId,
    script: PillarScript,
    stats: Arc<PillarStats>,
}

impl PillarWorker {
    async fn handle(&self, request: Message) {
        let replies = match &request.body {
            MessageBody::IdentifyRequest { operation, .. } => {
                self.stats.identify_requests.fetch_add(1, Ordering::Relaxed);
                self.identify_replies(operation)
            }
            MessageBody::OperationRequest { operation, .. } => {
                self.stats.operation_requests.fetch_add(1, Ordering::Relaxed);
                self.operation_replies(operation)
            }
            _ => return,
        };
        if replies.is_empty() {
            debug!(pillar = %self.id, kind = request.kind(), "staying silent");
            return;
        }
        if !self.script.delay.is_zero() {
            tokio::time::sleep(self.script.delay).await;
        }
        let reply_queue = match self.script.identify {
            IdentifyReply::PositiveUnreachable => Destination::new(format!("queue.void.{}", self.id)),
            _ => SimulatedPillar::queue(&self.id),
        };
        for body in replies {
            let reply = Message::reply_to(&request, self.id.clone(), reply_queue.clone(), body);
            if let Err(e) = self.bus.send(reply, &request.reply_to).await {
                warn!(pillar = %self.id, error = %e, "reply not delivered");
            }
        }
    }

    fn identify_replies(&self, operation: &Operation) -> Vec<MessageBody> {
        let response = match &self.script.identify {
            IdentifyReply::Positive | IdentifyReply::PositiveUnreachable => Some(ResponseInfo::new(
                ResponseCode::IdentificationPositive,
                format!("{} can perform {}", self.id, operation.kind()),
            )),
            IdentifyReply::Negative(code) => Some(ResponseInfo::new(*code, format!("{} declines", self.id))),
            IdentifyReply::Malformed => None,
            IdentifyReply::Silent => return Vec::new(),
        };
        vec![MessageBody::IdentifyResponse {
            operation: operation.kind(),
            response,
        }]
    }

    fn operation_replies(&self, operation: &Operation) -> Vec<MessageBody> {
        let kind = operation.kind();
        let done = || MessageBody::OperationResponse {
            operation: kind,
            response: Some(ResponseInfo::new(ResponseCode::OperationCompleted, "done")),
            result: Some(result_for(&self.id, operation)),
        };
        match &self.script.operation {
            OperationReply::Complete => vec![done()],
            OperationReply::ProgressThenComplete => vec![
                MessageBody::OperationResponse {
                    operation: kind,
                    response: Some(ResponseInfo::new(ResponseCode::OperationAcceptedProgress, "accepted")),
                    result: None,
                },
                done(),
            ],
            OperationReply::Fail(code) => vec![MessageBody::OperationResponse {
                operation: kind,
                response: Some(ResponseInfo::new(*code, format!("{} failed", self.id))),
                result: None,
            }],
            OperationReply::Malformed => vec![MessageBody::OperationResponse {
                operation: kind,
                response: None,
                result: None,
            }],
            OperationReply::Silent => Vec::new(),
        }
    }
}

/// Plausible result payload for an operation answered by `pillar`.
pub fn result_for(pillar: &ContributorId, operation: &Operation) -> OperationResult {
    let ids = |selector: &FileIdSelector| match selector {
        FileIdSelector::All => vec!["file-1".to_string(), "file-2".to_string()],
        FileIdSelector::Ids(ids) => ids.clone(),
    };
    match operation {
        Operation::GetFileIds { file_ids } => OperationResult::FileIds(
            ids(file_ids)
                .into_iter()
                .map(|file_id| FileIdEntry {
                    file_id,
                    size: Some(1024),
                    last_modified_ms: None,
                })
                .collect(),
        ),
        Operation::GetChecksums { file_ids, .. } => OperationResult::Checksums(
            ids(file_ids)
                .into_iter()
                .map(|file_id| ChecksumEntry {
                    checksum: format!("{pillar}:{file_id}"),
                    file_id,
                    calculated_at_ms: 0,
                })
                .collect(),
        ),
        Operation::GetFile { upload_url, .. } => OperationResult::FileUploaded {
            url: upload_url.clone(),
        },
        Operation::PutFile { checksum, .. } => OperationResult::FileStored {
            checksum: checksum.clone(),
        },
        Operation::ReplaceFile { new_checksum, .. } => OperationResult::FileStored {
            checksum: new_checksum.clone(),
        },
        Operation::DeleteFile { checksum, .. } => OperationResult::FileDeleted {
            checksum: checksum.clone(),
        },
        Operation::GetStatus => OperationResult::Status(StatusInfo {
            status_code: "OK".to_string(),
            text: format!("{pillar} is running"),
            timestamp_ms: 0,
        }),
        Operation::GetAuditTrails { .. } => OperationResult::AuditTrails(Vec::new()),
    }
}

/// Event handler that keeps every event for later assertions.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<OperationEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OperationEvent> {
        self.lock().clone()
    }

    /// Events of one conversation, in emission order.
    pub fn for_conversation(&self, id: ConversationId) -> Vec<OperationEvent> {
        self.lock()
            .iter()
            .filter(|e| e.conversation_id == id)
            .cloned()
            .collect()
    }

    pub fn types(&self, id: ConversationId) -> Vec<EventType> {
        self.for_conversation(id).iter().map(|e| e.event_type).collect()
    }

    pub fn count(&self, id: ConversationId, event_type: EventType) -> usize {
        self.types(id).into_iter().filter(|t| *t == event_type).count()
    }

    /// Contributors named by events of `event_type`.
    pub fn contributors(&self, id: ConversationId, event_type: EventType) -> Vec<ContributorId> {
        self.for_conversation(id)
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .filter_map(|e| e.contributor)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OperationEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventHandler for EventRecorder {
    fn handle_event(&self, event: OperationEvent) {
        self.lock().push(event);
    }
}

/// Builder for [`TestNetwork`].
#[derive(Debug)]
pub struct TestNetworkBuilder {
    pillars: Vec<(ContributorId, PillarScript)>,
    settings: Settings,
}

impl TestNetworkBuilder {
    pub fn pillar(mut self, id: &str, script: PillarScript) -> Self {
        self.pillars.push((ContributorId::new(id), script));
        self
    }

    pub fn identification_timeout(mut self, timeout: Duration) -> Self {
        self.settings.identification_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn conversation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.conversation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn policy(mut self, policy: OperationPolicy) -> Self {
        self.settings.policies.push(policy);
        self
    }

    /// Spawn the pillars and the dispatch loop. Needs a tokio runtime.
    pub fn build(mut self) -> anyhow::Result<TestNetwork> {
        let collection = TestNetwork::collection();
        let topic = Destination::new(format!("topic.{collection}"));
        self.settings.collections = vec![CollectionSettings {
            id: collection,
            destination: topic.clone(),
            contributors: self.pillars.iter().map(|(id, _)| id.clone()).collect(),
        }];

        let bus = Arc::new(LocalBus::new());
        let pillars = self
            .pillars
            .into_iter()
            .map(|(id, script)| SimulatedPillar::spawn(bus.clone(), id, topic.clone(), script))
            .collect();

        let mediator = ConversationMediator::new();
        let inbound = bus.subscribe(self.settings.reply_destination.clone());
        let pump = {
            let mediator = mediator.clone();
            tokio::spawn(async move { mediator.run(inbound).await })
        };

        let recorder = Arc::new(EventRecorder::new());
        let client = Client::new(self.settings, mediator.clone(), bus.clone(), recorder.clone())?;
        Ok(TestNetwork {
            bus,
            mediator,
            recorder,
            client,
            pillars,
            pump,
        })
    }
}

/// A client, a mediator, a bus and a set of simulated pillars serving
/// one collection.
#[derive(Debug)]
pub struct TestNetwork {
    pub bus: Arc<LocalBus>,
    pub mediator: ConversationMediator,
    pub recorder: Arc<EventRecorder>,
    pub client: Client,
    pillars: Vec<SimulatedPillar>,
    pump: JoinHandle<()>,
}

impl TestNetwork {
    /// Short timeouts suitable for paused-clock tests.
    pub fn builder() -> TestNetworkBuilder {
        TestNetworkBuilder {
            pillars: Vec::new(),
            settings: Settings {
                identification_timeout_ms: 1_000,
                operation_timeout_ms: 5_000,
                conversation_timeout_ms: 60_000,
                ..Settings::default()
            },
        }
    }

    /// The one collection every test network serves.
    pub fn collection() -> CollectionId {
        CollectionId::new("integrity")
    }

    pub fn pillar(&self, id: &str) -> Option<&SimulatedPillar> {
        self.pillars.iter().find(|p| p.id().as_str() == id)
    }

    pub fn start(&self, operation: Operation) -> anyhow::Result<ConversationHandle> {
        let context = self.client.context(Self::collection(), operation).build()?;
        Ok(self.client.start_operation(context)?)
    }

    /// Start an operation and wait for its outcome.
    pub async fn run(&self, operation: Operation) -> anyhow::Result<(ConversationHandle, ConversationOutcome)> {
        let handle = self.start(operation)?;
        let outcome = handle.wait().await?;
        Ok((handle, outcome))
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.mediator.shutdown();
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pillar_answers_identify() {
        let bus = Arc::new(LocalBus::new());
        let topic = Destination::new("topic.integrity");
        let pillar = SimulatedPillar::spawn(bus.clone(), ContributorId::new("p1"), topic.clone(), PillarScript::cooperative());
        let mut client_queue = bus.subscribe(Destination::new("queue.client"));

        let request = Message {
            conversation_id: ConversationId::generate(),
            collection_id: TestNetwork::collection(),
            from: ContributorId::new("client"),
            reply_to: Destination::new("queue.client"),
            body: MessageBody::IdentifyRequest {
                operation: Operation::GetStatus,
                audit: pillarbus_conversation::AuditTrailInfo {
                    client_id: "client".to_string(),
                    info: None,
                },
            },
        };
        bus.send(request.clone(), &topic).await.unwrap();
        let reply = client_queue.recv().await.unwrap();
        assert_eq!(reply.conversation_id, request.conversation_id);
        assert_eq!(reply.reply_to, Destination::new("queue.p1"));
        assert_eq!(pillar.identify_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_pillar_counts_requests() {
        let bus = Arc::new(LocalBus::new());
        let topic = Destination::new("topic.integrity");
        let pillar = SimulatedPillar::spawn(bus.clone(), ContributorId::new("p1"), topic.clone(), PillarScript::silent());
        let mut client_queue = bus.subscribe(Destination::new("queue.client"));
        let request = Message {
            conversation_id: ConversationId::generate(),
            collection_id: TestNetwork::collection(),
            from: ContributorId::new("client"),
            reply_to: Destination::new("queue.client"),
            body: MessageBody::IdentifyRequest {
                operation: Operation::GetStatus,
                audit: pillarbus_conversation::AuditTrailInfo {
                    client_id: "client".to_string(),
                    info: None,
                },
            },
        };
        bus.send(request, &topic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pillar.identify_requests(), 1);
        assert!(client_queue.try_recv().is_err());
    }

    #[test]
    fn test_recorder_filters_by_conversation() {
        let recorder = EventRecorder::new();
        let (a, b) = (ConversationId::generate(), ConversationId::generate());
        let kind = pillarbus_conversation::OperationKind::GetStatus;
        recorder.handle_event(OperationEvent::new(EventType::IdentifyRequestSent, a, kind, ""));
        recorder.handle_event(OperationEvent::new(EventType::IdentifyRequestSent, b, kind, ""));
        recorder.handle_event(
            OperationEvent::new(EventType::ComponentIdentified, a, kind, "").with_contributor(ContributorId::new("p1")),
        );
        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.types(a), vec![EventType::IdentifyRequestSent, EventType::ComponentIdentified]);
        assert_eq!(recorder.contributors(a, EventType::ComponentIdentified), vec![ContributorId::new("p1")]);
        assert_eq!(recorder.count(b, EventType::ComponentIdentified), 0);
    }

    #[test]
    fn test_result_for_uses_requested_ids() {
        let result = result_for(
            &ContributorId::new("p1"),
            &Operation::GetFileIds {
                file_ids: FileIdSelector::Ids(vec!["x".to_string()]),
            },
        );
        match result {
            OperationResult::FileIds(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].file_id, "x");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

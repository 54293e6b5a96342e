//! Property-Based Tests for the conversation state machine
//!
//! Scripted contributors answer in arbitrary order, timeouts fire, and
//! duplicates arrive after the end. The pure state machine is driven
//! directly, so every interleaving is reproducible from the seed.

use pillarbus_conversation::{
    CollectionId, CollectionSettings, CompletionRule, ContributorId, ContributorStatus,
    ConversationContext, ConversationOutcome, ConversationState, Destination, Effect, EventType,
    FailureReason, Input, LocalBus, LoggingEventHandler, Message, MessageBody, Operation,
    OperationEvent, OperationKind, Phase, ResponseCode, ResponseInfo, SelectionPolicy, Settings,
};
use proptest::prelude::*;
use std::sync::Arc;

/// Identify answer of one scripted contributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyOutcome {
    Positive,
    Negative,
    Silent,
}

/// Operation answer of one scripted contributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Complete,
    Fail,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub identify: IdentifyOutcome,
    pub operation: OperationOutcome,
}

/// One generated conversation.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub participants: Vec<Participant>,
    pub policy: SelectionPolicy,
    pub rule: CompletionRule,
    /// Arrival order of identify responses (indices into `participants`).
    pub identify_order: Vec<usize>,
    /// Arrival order of operation responses.
    pub operation_order: Vec<usize>,
    /// Repeat every identify answer while identifying, then replay every
    /// response, a cancel and the watchdog after the end.
    pub replay_duplicates: bool,
}

/// What one replay produced.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<OperationEvent>,
    pub effects: Vec<Effect>,
    pub state: ConversationState,
}

impl Replay {
    pub fn outcome(&self) -> Option<&ConversationOutcome> {
        self.state.outcome()
    }

    pub fn finish_count(&self) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, Effect::Finish(_)))
            .count()
    }
}

pub fn arb_participant() -> impl Strategy<Value = Participant> {
    let identify = prop_oneof![
        3 => Just(IdentifyOutcome::Positive),
        1 => Just(IdentifyOutcome::Negative),
        1 => Just(IdentifyOutcome::Silent),
    ];
    let operation = prop_oneof![
        3 => Just(OperationOutcome::Complete),
        1 => Just(OperationOutcome::Fail),
        1 => Just(OperationOutcome::Silent),
    ];
    (identify, operation).prop_map(|(identify, operation)| Participant {
        identify,
        operation,
    })
}

pub fn arb_rule() -> impl Strategy<Value = CompletionRule> {
    prop_oneof![Just(CompletionRule::RequireAll), Just(CompletionRule::RequireAny)]
}

pub fn arb_scenario() -> impl Strategy<Value = Scenario> {
    (prop::collection::vec(arb_participant(), 1..=5), arb_rule())
        .prop_flat_map(|(participants, rule)| {
            let n = participants.len();
            let order: Vec<usize> = (0..n).collect();
            let policy = prop_oneof![
                Just(SelectionPolicy::AllComponents),
                (1..=n + 1).prop_map(SelectionPolicy::FirstPositive),
            ];
            (
                Just(participants),
                policy,
                Just(rule),
                Just(order.clone()).prop_shuffle(),
                Just(order).prop_shuffle(),
                any::<bool>(),
            )
        })
        .prop_map(
            |(participants, policy, rule, identify_order, operation_order, replay_duplicates)| Scenario {
                participants,
                policy,
                rule,
                identify_order,
                operation_order,
                replay_duplicates,
            },
        )
}

pub fn contributor(index: usize) -> ContributorId {
    ContributorId::new(format!("p{index}"))
}

fn message(ctx: &ConversationContext, index: usize, body: MessageBody) -> Input {
    Input::Message(Message {
        conversation_id: ctx.conversation_id(),
        collection_id: ctx.collection_id().clone(),
        from: contributor(index),
        reply_to: Destination::new(format!("queue.p{index}")),
        body,
    })
}

fn identify_input(ctx: &ConversationContext, index: usize, outcome: IdentifyOutcome) -> Option<Input> {
    let code = match outcome {
        IdentifyOutcome::Positive => ResponseCode::IdentificationPositive,
        IdentifyOutcome::Negative => ResponseCode::IdentificationNegative,
        IdentifyOutcome::Silent => return None,
    };
    Some(message(
        ctx,
        index,
        MessageBody::IdentifyResponse {
            operation: OperationKind::GetStatus,
            response: Some(ResponseInfo::new(code, "identify")),
        },
    ))
}

fn operation_input(ctx: &ConversationContext, index: usize, outcome: OperationOutcome) -> Option<Input> {
    let code = match outcome {
        OperationOutcome::Complete => ResponseCode::OperationCompleted,
        OperationOutcome::Fail => ResponseCode::Failure,
        OperationOutcome::Silent => return None,
    };
    Some(message(
        ctx,
        index,
        MessageBody::OperationResponse {
            operation: OperationKind::GetStatus,
            response: Some(ResponseInfo::new(code, "operation")),
            result: None,
        },
    ))
}

/// Drive one scenario through the state machine.
pub fn replay(scenario: &Scenario) -> pillarbus_conversation::Result<Replay> {
    let settings = Settings {
        collections: vec![CollectionSettings {
            id: CollectionId::new("prop"),
            destination: Destination::new("topic.prop"),
            contributors: (0..scenario.participants.len()).map(contributor).collect(),
        }],
        ..Settings::default()
    };
    let ctx = ConversationContext::builder(&settings, CollectionId::new("prop"), Operation::GetStatus)
        .selection(scenario.policy.clone())
        .completion(scenario.rule)
        .sender(Arc::new(LocalBus::new()))
        .event_handler(Arc::new(LoggingEventHandler))
        .build()?;

    let identify: Vec<Input> = scenario
        .identify_order
        .iter()
        .filter_map(|&i| identify_input(&ctx, i, scenario.participants[i].identify))
        .collect();
    let operation: Vec<Input> = scenario
        .operation_order
        .iter()
        .filter_map(|&i| operation_input(&ctx, i, scenario.participants[i].operation))
        .collect();

    let mut inputs = identify.clone();
    if scenario.replay_duplicates {
        inputs.extend(identify.iter().cloned());
    }
    inputs.push(Input::PhaseTimeout(Phase::Identifying));
    inputs.extend(operation.clone());
    inputs.push(Input::PhaseTimeout(Phase::Performing));
    if scenario.replay_duplicates {
        inputs.extend(identify);
        inputs.extend(operation);
        inputs.push(Input::Cancel);
        inputs.push(Input::ConversationTimeout);
    }

    let (mut state, mut effects) = ConversationState::start(&ctx)?;
    for input in inputs {
        let (next, more) = state.on_input(&ctx, input);
        state = next;
        effects.extend(more);
    }
    let events = effects
        .iter()
        .filter_map(|e| match e {
            Effect::Emit(event) => Some(event.clone()),
            _ => None,
        })
        .collect();
    Ok(Replay {
        events,
        effects,
        state,
    })
}

/// Contributors the policy should have selected: the first positives in
/// arrival order, capped by the first-positive count.
pub fn expected_selection(scenario: &Scenario) -> Vec<usize> {
    let cap = match scenario.policy {
        SelectionPolicy::FirstPositive(n) => n,
        _ => usize::MAX,
    };
    scenario
        .identify_order
        .iter()
        .copied()
        .filter(|&i| scenario.participants[i].identify == IdentifyOutcome::Positive)
        .take(cap)
        .collect()
}

pub fn check_terminal(replay: &Replay) {
    let terminal: Vec<_> = replay
        .events
        .iter()
        .filter(|e| e.event_type.is_terminal())
        .collect();
    assert_eq!(terminal.len(), 1, "events: {:?}", replay.events);
    assert!(replay.events.last().unwrap().event_type.is_terminal());
    assert_eq!(replay.finish_count(), 1);
    assert!(matches!(replay.effects.last(), Some(Effect::Finish(_))));
    assert!(replay.state.is_finished());
}

pub fn check_selection_and_outcome(scenario: &Scenario, replay: &Replay) {
    let outcome = replay.outcome().unwrap();
    let expected = expected_selection(scenario);

    if expected.is_empty() {
        assert_eq!(outcome.failure, Some(FailureReason::NoComponentFound));
        assert!(outcome.contributors.is_empty());
        let no_component = replay
            .events
            .iter()
            .filter(|e| e.event_type == EventType::NoComponentFound)
            .count();
        assert_eq!(no_component, 1);
        return;
    }

    let selected: Vec<ContributorId> = outcome.contributors.keys().cloned().collect();
    let mut wanted: Vec<ContributorId> = expected.iter().map(|&i| contributor(i)).collect();
    wanted.sort();
    assert_eq!(selected, wanted);

    let mut completed = 0;
    let mut silent = false;
    for &i in &expected {
        let status = outcome.contributors[&contributor(i)];
        match scenario.participants[i].operation {
            OperationOutcome::Complete => {
                assert_eq!(status, ContributorStatus::Complete);
                completed += 1;
            }
            OperationOutcome::Fail => assert_eq!(status, ContributorStatus::Failed),
            OperationOutcome::Silent => {
                assert_eq!(status, ContributorStatus::Failed);
                silent = true;
            }
        }
    }

    let success = scenario.rule.is_success(completed, expected.len());
    assert_eq!(outcome.is_success(), success, "outcome: {outcome:?}");
    if !success {
        let reason = if completed == 0 && silent {
            FailureReason::Timeout {
                phase: Phase::Performing,
            }
        } else {
            FailureReason::InsufficientSuccesses {
                completed,
                selected: expected.len(),
            }
        };
        assert_eq!(outcome.failure, Some(reason));
    }
}

pub fn check_identified_once(replay: &Replay) {
    let mut identified: Vec<_> = replay
        .events
        .iter()
        .filter(|e| e.event_type == EventType::ComponentIdentified)
        .filter_map(|e| e.contributor.clone())
        .collect();
    let total = identified.len();
    identified.sort();
    identified.dedup();
    assert_eq!(identified.len(), total);
}

pub fn check_failed_once(replay: &Replay) {
    let mut failed: Vec<_> = replay
        .events
        .iter()
        .filter(|e| e.event_type == EventType::ComponentFailed)
        .filter_map(|e| e.contributor.clone())
        .collect();
    let total = failed.len();
    failed.sort();
    failed.dedup();
    assert_eq!(failed.len(), total, "events: {:?}", replay.events);
}


proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_exactly_one_terminal_event(scenario in arb_scenario()) {
        let replay = replay(&scenario).unwrap();
        check_terminal(&replay);
    }

    #[test]
    fn prop_selection_and_outcome_follow_policy(scenario in arb_scenario()) {
        let replay = replay(&scenario).unwrap();
        check_selection_and_outcome(&scenario, &replay);
    }

    #[test]
    fn prop_contributor_identified_at_most_once(scenario in arb_scenario()) {
        let replay = replay(&scenario).unwrap();
        check_identified_once(&replay);
    }

    #[test]
    fn prop_contributor_failed_at_most_once(scenario in arb_scenario()) {
        let replay = replay(&scenario).unwrap();
        check_failed_once(&replay);
    }
}

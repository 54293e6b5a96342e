//! Conversation state machine.
//!
//! The machine is pure: [`ConversationState::on_input`] consumes the
//! current state and one [`Input`] and returns the next state plus the
//! [`Effect`]s the driver must carry out (sends, events, timers). All I/O
//! lives in [`crate::conversation`], so any interleaving of responses,
//! timeouts and cancellation can be replayed here deterministically.
//!
//! ```text
//! Identifying ──selection done──▶ Performing ──all terminal──▶ Finished(success|failure)
//!      │                               │
//!      └──timeout, nothing selected──▶ Finished(failure)
//! ```

use crate::context::ConversationContext;
use crate::error::{ConversationError, Result, TransportError};
use crate::event::{EventType, FailureReason, OperationEvent};
use crate::message::{response_code, Message, MessageBody, OperationResult};
use crate::operation::OperationKind;
use crate::selector::{ComponentSelector, Offer};
use crate::tracker::ResponseTracker;
use crate::types::{Contributor, ContributorId, ConversationId, Destination};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The two non-terminal phases, each with its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting for identify responses.
    Identifying,
    /// Waiting for operation responses from the selected contributors.
    Performing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Identifying => write!(f, "identifying"),
            Phase::Performing => write!(f, "performing"),
        }
    }
}

/// Per-contributor status during the performing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributorStatus {
    /// No final answer yet.
    Pending,
    /// Finished the operation.
    Complete,
    /// Failed, declined, timed out or unreachable.
    Failed,
}

impl ContributorStatus {
    /// True for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        self != ContributorStatus::Pending
    }
}

/// Everything that can drive a transition.
#[derive(Debug, Clone)]
pub enum Input {
    /// An inbound message routed to this conversation.
    Message(Message),
    /// An outbound send failed. `contributor` is `None` for the broadcast.
    SendFailed {
        /// Addressee of the failed point-to-point send.
        contributor: Option<ContributorId>,
        /// What went wrong.
        error: TransportError,
    },
    /// The timer of a phase fired.
    PhaseTimeout(Phase),
    /// The whole-conversation watchdog fired.
    ConversationTimeout,
    /// The caller asked for cancellation.
    Cancel,
}

/// Side effects requested by a transition, in the order they must run.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a message.
    Send {
        /// The message.
        message: Message,
        /// Where to send it.
        destination: Destination,
        /// Addressee for point-to-point sends, `None` for the broadcast.
        contributor: Option<ContributorId>,
    },
    /// Hand an event to the caller.
    Emit(OperationEvent),
    /// Arm the timer of a phase.
    StartTimer {
        /// Phase the timer belongs to.
        phase: Phase,
        /// Delay until it fires.
        after: Duration,
    },
    /// The conversation is over: deregister and publish the outcome.
    Finish(ConversationOutcome),
}

/// Final result of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationOutcome {
    /// Conversation ID.
    pub conversation_id: ConversationId,
    /// Operation performed.
    pub operation: OperationKind,
    /// Why it failed; `None` on success.
    pub failure: Option<FailureReason>,
    /// Final status of every contributor that was asked to perform.
    pub contributors: BTreeMap<ContributorId, ContributorStatus>,
    /// Result payloads of the contributors that completed.
    pub results: BTreeMap<ContributorId, OperationResult>,
}

impl ConversationOutcome {
    fn failed(ctx: &ConversationContext, reason: FailureReason) -> Self {
        Self {
            conversation_id: ctx.conversation_id(),
            operation: ctx.operation_kind(),
            failure: Some(reason),
            contributors: BTreeMap::new(),
            results: BTreeMap::new(),
        }
    }

    /// True if the conversation succeeded.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Contributors that completed the operation.
    pub fn completed(&self) -> Vec<&ContributorId> {
        self.contributors
            .iter()
            .filter(|(_, s)| **s == ContributorStatus::Complete)
            .map(|(id, _)| id)
            .collect()
    }
}

/// Identify phase state.
#[derive(Debug, Clone)]
pub struct Identifying {
    selector: ComponentSelector,
}

impl Identifying {
    /// The selector collecting identify responses.
    pub fn selector(&self) -> &ComponentSelector {
        &self.selector
    }
}

/// Performing phase state.
#[derive(Debug, Clone)]
pub struct Performing {
    selected: Vec<Contributor>,
    tracker: ResponseTracker,
    statuses: BTreeMap<ContributorId, ContributorStatus>,
    results: BTreeMap<ContributorId, OperationResult>,
}

impl Performing {
    /// The frozen selection the request was sent to.
    pub fn selected(&self) -> &[Contributor] {
        &self.selected
    }

    /// Status of one selected contributor.
    pub fn status(&self, id: &ContributorId) -> Option<ContributorStatus> {
        self.statuses.get(id).copied()
    }

    fn mark(&mut self, id: &ContributorId, status: ContributorStatus) {
        self.statuses.insert(id.clone(), status);
        self.tracker.record_response(id);
    }
}

/// State of one conversation. Exactly one is active at a time and no
/// state is ever re-entered.
#[derive(Debug, Clone)]
pub enum ConversationState {
    /// Collecting identify responses.
    Identifying(Identifying),
    /// Waiting for the selected contributors to perform.
    Performing(Performing),
    /// Terminal.
    Finished(ConversationOutcome),
}

type Transition = (ConversationState, Vec<Effect>);

impl ConversationState {
    /// Enter the initial state: broadcast the identify request.
    pub fn start(ctx: &ConversationContext) -> Result<Transition> {
        let selector = ctx.new_selector()?;
        let message = request(ctx, MessageBody::IdentifyRequest {
            operation: ctx.operation().clone(),
            audit: ctx.audit().clone(),
        });
        let effects = vec![
            Effect::Send {
                message,
                destination: ctx.broadcast_to().clone(),
                contributor: None,
            },
            Effect::Emit(event(
                ctx,
                EventType::IdentifyRequestSent,
                format!(
                    "Identify request for {} sent to {} contributors on {}",
                    ctx.operation_kind(),
                    ctx.contributors().len(),
                    ctx.broadcast_to()
                ),
            )),
            Effect::StartTimer {
                phase: Phase::Identifying,
                after: ctx.timeouts().identification,
            },
        ];
        Ok((ConversationState::Identifying(Identifying { selector }), effects))
    }

    /// Apply one input.
    pub fn on_input(self, ctx: &ConversationContext, input: Input) -> Transition {
        match input {
            Input::Cancel => match self {
                ConversationState::Finished(_) => ignore(self, ctx, "cancel"),
                _ => finish_failed(ctx, FailureReason::Cancelled, "Conversation cancelled"),
            },
            Input::ConversationTimeout => match self {
                ConversationState::Finished(_) => ignore(self, ctx, "conversation timeout"),
                _ => finish_failed(
                    ctx,
                    FailureReason::ConversationTimeout,
                    format!(
                        "Conversation exceeded its {}ms ceiling",
                        ctx.timeouts().conversation.as_millis()
                    ),
                ),
            },
            input => match self {
                ConversationState::Identifying(state) => state.on_input(ctx, input),
                ConversationState::Performing(state) => state.on_input(ctx, input),
                ConversationState::Finished(_) => ignore(self, ctx, "input after finish"),
            },
        }
    }

    /// The active phase, `None` once finished.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            ConversationState::Identifying(_) => Some(Phase::Identifying),
            ConversationState::Performing(_) => Some(Phase::Performing),
            ConversationState::Finished(_) => None,
        }
    }

    /// True in the terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, ConversationState::Finished(_))
    }

    /// The outcome, once finished.
    pub fn outcome(&self) -> Option<&ConversationOutcome> {
        match self {
            ConversationState::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }
}

impl Identifying {
    fn on_input(mut self, ctx: &ConversationContext, input: Input) -> Transition {
        match input {
            Input::Message(message) => {
                if !matches!(message.body, MessageBody::IdentifyResponse { .. }) {
                    debug!(
                        conversation = %ctx.conversation_id(),
                        from = %message.from,
                        kind = message.kind(),
                        "dropping message not expected while identifying"
                    );
                    return (ConversationState::Identifying(self), Vec::new());
                }
                let mut effects = Vec::new();
                match self.selector.offer(&message) {
                    Ok(Offer::Selected(contributor)) => {
                        effects.push(Effect::Emit(
                            event(
                                ctx,
                                EventType::ComponentIdentified,
                                format!("{} identified for {}", contributor.id, ctx.operation_kind()),
                            )
                            .with_contributor(contributor.id),
                        ));
                    }
                    Ok(Offer::Duplicate) => {
                        debug!(conversation = %ctx.conversation_id(), from = %message.from, "duplicate identify response");
                    }
                    Ok(Offer::Ignored { reason }) => {
                        debug!(conversation = %ctx.conversation_id(), from = %message.from, reason, "identify response ignored");
                    }
                    Err(ConversationError::NegativeResponse {
                        contributor,
                        code,
                        text,
                    }) => {
                        info!(conversation = %ctx.conversation_id(), contributor = %contributor, ?code, "contributor declined");
                        effects.push(Effect::Emit(
                            event(
                                ctx,
                                EventType::ComponentFailed,
                                format!("{contributor} declined ({code:?}): {text}"),
                            )
                            .with_contributor(contributor),
                        ));
                    }
                    Err(e) => {
                        warn!(conversation = %ctx.conversation_id(), error = %e, "unusable identify response");
                    }
                }
                if self.selector.is_selection_done() {
                    let (state, more) = self.complete(ctx, false);
                    effects.extend(more);
                    return (state, effects);
                }
                (ConversationState::Identifying(self), effects)
            }
            Input::PhaseTimeout(Phase::Identifying) => {
                info!(
                    conversation = %ctx.conversation_id(),
                    selected = self.selector.selected().len(),
                    outstanding = self.selector.outstanding().len(),
                    "identification timed out"
                );
                self.complete(ctx, true)
            }
            Input::SendFailed {
                contributor: None,
                error,
            } => finish_failed(
                ctx,
                FailureReason::Transport {
                    msg: error.to_string(),
                },
                format!("Identify request could not be sent: {error}"),
            ),
            other => {
                debug!(conversation = %ctx.conversation_id(), input = ?other, "ignored while identifying");
                (ConversationState::Identifying(self), Vec::new())
            }
        }
    }

    fn complete(self, ctx: &ConversationContext, timed_out: bool) -> Transition {
        let selected = self.selector.into_selection();
        if selected.is_empty() {
            let info = if timed_out {
                format!(
                    "No contributor identified within {}ms",
                    ctx.timeouts().identification.as_millis()
                )
            } else {
                "Every contributor declined".to_string()
            };
            let mut effects = vec![Effect::Emit(event(ctx, EventType::NoComponentFound, info.clone()))];
            let (state, more) = finish_failed(ctx, FailureReason::NoComponentFound, info);
            effects.extend(more);
            return (state, effects);
        }

        let names = join_ids(selected.iter().map(|c| &c.id));
        let info = if timed_out {
            format!("Identification timed out, continuing with {names}")
        } else {
            format!("Identified {names}")
        };
        let mut effects = vec![Effect::Emit(event(ctx, EventType::IdentificationComplete, info))];
        let (state, more) = Performing::enter(ctx, selected);
        effects.extend(more);
        (state, effects)
    }
}

impl Performing {
    fn enter(ctx: &ConversationContext, selected: Vec<Contributor>) -> Transition {
        let tracker = match ResponseTracker::new(selected.iter().map(|c| c.id.clone())) {
            Ok(tracker) => tracker,
            Err(_) => {
                return finish_failed(ctx, FailureReason::NoComponentFound, "Nothing to perform on");
            }
        };
        let statuses = selected
            .iter()
            .map(|c| (c.id.clone(), ContributorStatus::Pending))
            .collect();

        let mut effects: Vec<Effect> = selected
            .iter()
            .map(|c| Effect::Send {
                message: request(ctx, MessageBody::OperationRequest {
                    operation: ctx.operation().clone(),
                    audit: ctx.audit().clone(),
                }),
                destination: c.reply_to.clone(),
                contributor: Some(c.id.clone()),
            })
            .collect();
        effects.push(Effect::Emit(event(
            ctx,
            EventType::RequestSent,
            format!(
                "{} request sent to {}",
                ctx.operation_kind(),
                join_ids(selected.iter().map(|c| &c.id))
            ),
        )));
        effects.push(Effect::StartTimer {
            phase: Phase::Performing,
            after: ctx.timeouts().operation,
        });

        let state = Performing {
            selected,
            tracker,
            statuses,
            results: BTreeMap::new(),
        };
        (ConversationState::Performing(state), effects)
    }

    fn on_input(mut self, ctx: &ConversationContext, input: Input) -> Transition {
        let mut effects = Vec::new();
        match input {
            Input::Message(message) => self.on_message(ctx, message, &mut effects),
            Input::SendFailed {
                contributor: Some(id),
                error,
            } => {
                if self.status(&id) == Some(ContributorStatus::Pending) {
                    self.mark(&id, ContributorStatus::Failed);
                    effects.push(Effect::Emit(
                        event(
                            ctx,
                            EventType::ComponentFailed,
                            format!("Request to {id} could not be sent: {error}"),
                        )
                        .with_contributor(id),
                    ));
                }
            }
            Input::PhaseTimeout(Phase::Performing) => {
                let pending: Vec<ContributorId> = self.tracker.outstanding().into_iter().collect();
                for id in pending {
                    self.mark(&id, ContributorStatus::Failed);
                    effects.push(Effect::Emit(
                        event(
                            ctx,
                            EventType::ComponentFailed,
                            format!(
                                "{id} did not finish within {}ms",
                                ctx.timeouts().operation.as_millis()
                            ),
                        )
                        .with_contributor(id),
                    ));
                }
                let (state, more) = self.conclude(ctx, true);
                effects.extend(more);
                return (state, effects);
            }
            other => {
                debug!(conversation = %ctx.conversation_id(), input = ?other, "ignored while performing");
            }
        }

        if self.tracker.is_finished() {
            let (state, more) = self.conclude(ctx, false);
            effects.extend(more);
            return (state, effects);
        }
        (ConversationState::Performing(self), effects)
    }

    fn on_message(&mut self, ctx: &ConversationContext, message: Message, effects: &mut Vec<Effect>) {
        let from = message.from;
        let (response, result) = match message.body {
            MessageBody::OperationResponse {
                response, result, ..
            } => (response, result),
            _ => {
                debug!(conversation = %ctx.conversation_id(), from = %from, "late identify traffic dropped");
                return;
            }
        };
        match self.status(&from) {
            Some(ContributorStatus::Pending) => {}
            Some(_) => {
                debug!(conversation = %ctx.conversation_id(), from = %from, "response after final status dropped");
                return;
            }
            None => {
                debug!(conversation = %ctx.conversation_id(), from = %from, "response from unselected contributor dropped");
                return;
            }
        }
        let code = match response_code(&from, response.as_ref()) {
            Ok(code) => code,
            Err(e) => {
                warn!(conversation = %ctx.conversation_id(), error = %e, "malformed operation response");
                return;
            }
        };
        let text = response.as_ref().map(|r| r.text().to_string()).unwrap_or_default();

        if code.is_progress() {
            effects.push(Effect::Emit(
                event(ctx, EventType::Progress, format!("{from}: {text}")).with_contributor(from),
            ));
        } else if code.is_completion() {
            self.mark(&from, ContributorStatus::Complete);
            if let Some(result) = &result {
                self.results.insert(from.clone(), result.clone());
            }
            effects.push(Effect::Emit(
                event(ctx, EventType::ComponentComplete, format!("{from} completed: {text}"))
                    .with_contributor(from)
                    .with_result(result),
            ));
        } else {
            self.mark(&from, ContributorStatus::Failed);
            effects.push(Effect::Emit(
                event(ctx, EventType::ComponentFailed, format!("{from} failed ({code:?}): {text}"))
                    .with_contributor(from),
            ));
        }
    }

    fn conclude(self, ctx: &ConversationContext, timed_out: bool) -> Transition {
        let selected = self.statuses.len();
        let completed = self
            .statuses
            .values()
            .filter(|s| **s == ContributorStatus::Complete)
            .count();
        let success = ctx.completion().is_success(completed, selected);
        let failure = if success {
            None
        } else if timed_out && completed == 0 {
            Some(FailureReason::Timeout {
                phase: Phase::Performing,
            })
        } else {
            Some(FailureReason::InsufficientSuccesses {
                completed,
                selected,
            })
        };
        let outcome = ConversationOutcome {
            conversation_id: ctx.conversation_id(),
            operation: ctx.operation_kind(),
            failure,
            contributors: self.statuses,
            results: self.results,
        };
        let info = format!(
            "{} {}: {completed} of {selected} contributors completed",
            ctx.operation_kind(),
            if success { "complete" } else { "failed" }
        );
        finish(ctx, outcome, info)
    }
}

fn request(ctx: &ConversationContext, body: MessageBody) -> Message {
    Message {
        conversation_id: ctx.conversation_id(),
        collection_id: ctx.collection_id().clone(),
        from: ctx.client_id().clone(),
        reply_to: ctx.reply_to().clone(),
        body,
    }
}

fn event(ctx: &ConversationContext, event_type: EventType, info: impl Into<String>) -> OperationEvent {
    OperationEvent::new(event_type, ctx.conversation_id(), ctx.operation_kind(), info)
}

fn finish_failed(
    ctx: &ConversationContext,
    reason: FailureReason,
    info: impl Into<String>,
) -> Transition {
    finish(ctx, ConversationOutcome::failed(ctx, reason), info)
}

fn finish(ctx: &ConversationContext, outcome: ConversationOutcome, info: impl Into<String>) -> Transition {
    let terminal = match &outcome.failure {
        None => event(ctx, EventType::Complete, info),
        Some(reason) => event(ctx, EventType::Failed, info).with_failure(reason.clone()),
    };
    let effects = vec![Effect::Emit(terminal), Effect::Finish(outcome.clone())];
    (ConversationState::Finished(outcome), effects)
}

fn ignore(state: ConversationState, ctx: &ConversationContext, what: &str) -> Transition {
    debug!(conversation = %ctx.conversation_id(), what, "conversation already finished, dropping");
    (state, Vec::new())
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a ContributorId>) -> String {
    ids.map(ContributorId::as_str).collect::<Vec<_>>().join(", ")
}

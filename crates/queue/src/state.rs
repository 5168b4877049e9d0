//! Per-record consumer state machine.
//!
//! ```text
//! Fetched -> Parsing -> ParseFailed -> DeadLetter
//!                    -> Parsed -> Dispatching
//! Dispatching -> HandlerSucceeded -> Commit
//!             -> HandlerFailed -> RetryOrDeadLetter
//! RetryOrDeadLetter -> Backoff -> Dispatching   (attempts remain)
//!                   -> DeadLetter               (exhausted)
//! DeadLetter -> Commit -> Done
//! ```
//!
//! [`RecordState::step`] is pure: the consumer performs the side effect a
//! state calls for (decode, dispatch, sleep, publish, commit) and feeds the
//! result back in as a [`StepInput`].

use std::fmt;

/// Terminal result of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every handler succeeded.
    Committed,
    /// Quarantined on the dead-letter topic.
    DeadLettered,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Committed => write!(f, "committed"),
            Outcome::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Fetched,
    Parsing,
    ParseFailed { reason: String },
    Parsed,
    /// `attempt` is 1-based.
    Dispatching { attempt: u32 },
    HandlerSucceeded,
    HandlerFailed { attempt: u32, reason: String },
    RetryOrDeadLetter { attempt: u32, reason: String },
    Backoff { next_attempt: u32 },
    DeadLetter { reason: String },
    Commit { outcome: Outcome },
    Done { outcome: Outcome },
}

/// Result of the side effect performed in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepInput {
    /// The state needs no result (or its side effect finished).
    Proceed,
    /// Decode or dispatch succeeded.
    Succeeded,
    /// Decode or dispatch failed.
    Failed(String),
}

impl RecordState {
    /// Advance one transition. `max_retry` is the total number of dispatch
    /// attempts allowed.
    pub fn step(self, input: StepInput, max_retry: u32) -> RecordState {
        use RecordState::*;

        match self {
            Fetched => Parsing,
            Parsing => match input {
                StepInput::Succeeded => Parsed,
                StepInput::Failed(reason) => ParseFailed { reason },
                StepInput::Proceed => ParseFailed {
                    reason: "no decode result".into(),
                },
            },
            ParseFailed { reason } => DeadLetter { reason },
            Parsed => Dispatching { attempt: 1 },
            Dispatching { attempt } => match input {
                StepInput::Succeeded => HandlerSucceeded,
                StepInput::Failed(reason) => HandlerFailed { attempt, reason },
                StepInput::Proceed => HandlerFailed {
                    attempt,
                    reason: "no dispatch result".into(),
                },
            },
            HandlerSucceeded => Commit {
                outcome: Outcome::Committed,
            },
            HandlerFailed { attempt, reason } => RetryOrDeadLetter { attempt, reason },
            RetryOrDeadLetter { attempt, reason } => {
                if attempt < max_retry {
                    Backoff {
                        next_attempt: attempt + 1,
                    }
                } else {
                    DeadLetter { reason }
                }
            }
            Backoff { next_attempt } => Dispatching {
                attempt: next_attempt,
            },
            DeadLetter { .. } => Commit {
                outcome: Outcome::DeadLettered,
            },
            Commit { outcome } | Done { outcome } => Done { outcome },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Done { .. })
    }

    /// Short state name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RecordState::Fetched => "fetched",
            RecordState::Parsing => "parsing",
            RecordState::ParseFailed { .. } => "parse_failed",
            RecordState::Parsed => "parsed",
            RecordState::Dispatching { .. } => "dispatching",
            RecordState::HandlerSucceeded => "handler_succeeded",
            RecordState::HandlerFailed { .. } => "handler_failed",
            RecordState::RetryOrDeadLetter { .. } => "retry_or_dead_letter",
            RecordState::Backoff { .. } => "backoff",
            RecordState::DeadLetter { .. } => "dead_letter",
            RecordState::Commit { .. } => "commit",
            RecordState::Done { .. } => "done",
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State shared by executions, task runs and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Initial state of every execution and task run
    Created,
    /// Execution waiting for a concurrency slot
    Queued,
    /// Currently executing
    Running,
    /// Waiting for a manual or timed resume
    Paused,
    /// Failed attempt waiting for its retry backoff
    Retrying,
    /// Re-entry point after a retry or an operator restart
    Restarted,
    /// Kill requested, `finally` tasks may still be running
    Killing,
    Success,
    Warning,
    Failed,
    Killed,
    /// Execution refused at admission
    Cancelled,
}

impl State {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Warning | Self::Failed | Self::Killed | Self::Cancelled
        )
    }

    /// Check if this state aborts a sequence of siblings
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Killed | Self::Cancelled)
    }

    /// Check if this state is still being processed
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Killing)
    }

    /// Aggregation rank used when folding child states into a block state.
    ///
    /// `FAILED` outranks `KILLED` so that a block keeps the root cause of a
    /// failure rather than the collateral kills it triggered.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Warning => 1,
            Self::Cancelled | Self::Killed => 2,
            Self::Failed => 3,
            _ => 0,
        }
    }

    /// The worse of two terminal states.
    pub fn worst(self, other: State) -> State {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Folds an iterator of terminal child states, an empty block is a success.
    pub fn fold<I: IntoIterator<Item = State>>(states: I) -> State {
        states.into_iter().fold(State::Success, State::worst)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Retrying => "RETRYING",
            Self::Restarted => "RESTARTED",
            Self::Killing => "KILLING",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "RETRYING" => Ok(Self::Retrying),
            "RESTARTED" => Ok(Self::Restarted),
            "KILLING" => Ok(Self::Killing),
            "SUCCESS" => Ok(Self::Success),
            "WARNING" => Ok(Self::Warning),
            "FAILED" => Ok(Self::Failed),
            "KILLED" => Ok(Self::Killed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid state: {s}")),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::Created
    }
}

/// One entry of a state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: State,
    pub date: DateTime<Utc>,
}

/// Current state plus the ordered list of every state ever entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistory {
    current: State,
    histories: Vec<StateTransition>,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::starting_at(State::Created)
    }

    pub fn starting_at(state: State) -> Self {
        Self {
            current: state,
            histories: vec![StateTransition {
                state,
                date: Utc::now(),
            }],
        }
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn histories(&self) -> &[StateTransition] {
        &self.histories
    }

    /// Record a new current state. Callers validate the transition beforehand.
    pub(crate) fn push(&mut self, state: State) {
        self.current = state;
        self.histories.push(StateTransition {
            state,
            date: Utc::now(),
        });
    }

    pub fn is_terminated(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.histories.first().map(|h| h.date)
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        if self.is_terminated() {
            self.histories.last().map(|h| h.date)
        } else {
            None
        }
    }

    /// Whether the history ever went through `state`.
    pub fn has_been(&self, state: State) -> bool {
        self.histories.iter().any(|h| h.state == state)
    }

    /// Whether the history went through `state` after the last `since`.
    pub fn has_been_since(&self, state: State, since: State) -> bool {
        self.histories
            .iter()
            .rev()
            .take_while(|h| h.state != since)
            .any(|h| h.state == state)
    }
}

impl Default for StateHistory {
    fn default() -> Self {
        Self::new()
    }
}

use crate::errors::GraderError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Validating,
    AwaitingStage,
    ExecutingAction,
    AwaitingCapture,
    Evaluating,
    Summarizing,
    Done,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::AwaitingStage => "awaiting_stage",
            Self::ExecutingAction => "executing_action",
            Self::AwaitingCapture => "awaiting_capture",
            Self::Evaluating => "evaluating",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    pub fn is_per_case(self) -> bool {
        matches!(
            self,
            Self::AwaitingStage | Self::ExecutingAction | Self::AwaitingCapture | Self::Evaluating
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunSnapshot {
    pub state: RunState,
    pub case: Option<String>,
    pub stage: Option<u32>,
    pub failure_reason: Option<String>,
}

impl RunSnapshot {
    pub fn transition(&mut self, next: RunState) -> Result<(), GraderError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }

    pub fn enter_case(&mut self, name: &str) -> Result<(), GraderError> {
        self.transition(RunState::AwaitingStage)?;
        self.case = Some(name.to_string());
        self.stage = None;
        Ok(())
    }

    pub fn enter_stage(&mut self, stage: u32) -> Result<(), GraderError> {
        if self.state != RunState::AwaitingStage {
            self.transition(RunState::AwaitingStage)?;
        }
        self.stage = Some(stage);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), GraderError> {
        self.transition(RunState::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), GraderError> {
    use RunState as S;

    let allowed = match from {
        _ if from.is_terminal() => false,
        _ if to == S::Cancelled => true,
        S::Idle => matches!(to, S::Validating),
        S::Validating => matches!(to, S::AwaitingStage | S::Summarizing | S::Failed),
        S::AwaitingStage => matches!(
            to,
            S::ExecutingAction | S::AwaitingStage | S::Summarizing | S::Failed
        ),
        S::ExecutingAction => matches!(
            to,
            S::AwaitingCapture | S::AwaitingStage | S::Summarizing | S::Failed
        ),
        S::AwaitingCapture => matches!(
            to,
            S::Evaluating | S::AwaitingStage | S::Summarizing | S::Failed
        ),
        S::Evaluating => matches!(to, S::AwaitingStage | S::Summarizing | S::Failed),
        S::Summarizing => matches!(to, S::Done | S::Failed),
        S::Done | S::Cancelled | S::Failed => false,
    };

    if !allowed {
        return Err(GraderError::InvalidState(format!(
            "illegal transition: {:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}

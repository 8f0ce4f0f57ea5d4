use crate::errors::TaskdistError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuizConfig {
    pub enabled: bool,
    pub questions: u32,
    pub passing: u32,
    pub short_circuit: bool,
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            questions: 0,
            passing: 0,
            short_circuit: true,
        }
    }
}

impl QuizConfig {
    pub fn validate(&self) -> Result<(), TaskdistError> {
        if self.passing > self.questions {
            return Err(TaskdistError::InvalidInput(format!(
                "quiz passing score {} exceeds question count {}",
                self.passing, self.questions
            )));
        }
        if self.enabled && self.questions == 0 {
            return Err(TaskdistError::InvalidInput(
                "an enabled quiz needs at least one question".to_string(),
            ));
        }
        Ok(())
    }

    /// Status a contributor starts from, or returns to after a reset.
    pub fn initial_status(&self) -> QuizStatus {
        if self.enabled {
            QuizStatus::InProgress
        } else {
            QuizStatus::NotStarted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    NotStarted,
    InProgress,
    Passed,
    Failed,
}

impl QuizStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

/// Which pool a contributor may draw from given their quiz standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPool {
    Normal,
    Gold,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizProgress {
    pub status: QuizStatus,
    pub right: u32,
    pub wrong: u32,
}

impl QuizProgress {
    pub fn fresh(config: &QuizConfig) -> Self {
        Self {
            status: config.initial_status(),
            right: 0,
            wrong: 0,
        }
    }

    pub fn pool(&self, config: &QuizConfig) -> TaskPool {
        if !config.enabled {
            return TaskPool::Normal;
        }
        match self.status {
            QuizStatus::NotStarted | QuizStatus::InProgress => TaskPool::Gold,
            QuizStatus::Passed => TaskPool::Normal,
            QuizStatus::Failed => TaskPool::Closed,
        }
    }

    /// Moves a contributor who has never been quizzed onto the quiz.
    pub fn start(&mut self, config: &QuizConfig) -> Result<(), TaskdistError> {
        self.transition(config.initial_status())
    }

    pub fn record_answer(&mut self, correct: bool, config: &QuizConfig) -> Result<(), TaskdistError> {
        if self.status != QuizStatus::InProgress {
            return Err(TaskdistError::InvalidInput(format!(
                "quiz answers are only recorded in progress, status is {}",
                self.status.as_str()
            )));
        }
        if correct {
            self.right = self.right.saturating_add(1);
        } else {
            self.wrong = self.wrong.saturating_add(1);
        }
        if let Some(next) = evaluate(self.right, self.wrong, config) {
            self.transition(next)?;
        }
        Ok(())
    }

    pub fn reset(&mut self, config: &QuizConfig) {
        *self = Self::fresh(config);
    }

    fn transition(&mut self, next: QuizStatus) -> Result<(), TaskdistError> {
        validate_transition(self.status, next)?;
        self.status = next;
        Ok(())
    }
}

fn evaluate(right: u32, wrong: u32, config: &QuizConfig) -> Option<QuizStatus> {
    let allowed_wrong = config.questions.saturating_sub(config.passing);
    if config.short_circuit {
        if right >= config.passing {
            return Some(QuizStatus::Passed);
        }
        if wrong > allowed_wrong {
            return Some(QuizStatus::Failed);
        }
        return None;
    }
    if right.saturating_add(wrong) < config.questions {
        return None;
    }
    if right >= config.passing {
        Some(QuizStatus::Passed)
    } else {
        Some(QuizStatus::Failed)
    }
}

pub fn validate_transition(from: QuizStatus, to: QuizStatus) -> Result<(), TaskdistError> {
    use QuizStatus as S;

    let allowed = match from {
        S::NotStarted => matches!(to, S::NotStarted | S::InProgress),
        S::InProgress => matches!(to, S::InProgress | S::Passed | S::Failed),
        S::Passed | S::Failed => false,
    };
    if !allowed {
        return Err(TaskdistError::InvalidInput(format!(
            "illegal quiz transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}

//! Timed question/answer modal.
//!
//! A batch of questions is opened with a shared countdown. While the batch
//! is open, answers can be edited and the batch can be submitted exactly
//! once. Submitted answers are kept per batch id for the session lifetime so
//! that a redisplayed batch can show what was sent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of input a question expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    #[default]
    Text,
    SingleChoice,
    MultipleChoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: QuestionKind,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

impl Question {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: QuestionKind::Text,
            options: Vec::new(),
            required: false,
        }
    }

    pub fn choice(text: impl Into<String>, kind: QuestionKind, options: &[&str]) -> Self {
        Self {
            text: text.into(),
            kind,
            options: options.iter().map(|o| o.to_string()).collect(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn check(&self, value: &AnswerValue) -> Result<(), ModalError> {
        let invalid = |reason: &str| ModalError::InvalidAnswer {
            question: self.text.clone(),
            reason: reason.to_string(),
        };
        let known = |choice: &String| self.options.is_empty() || self.options.contains(choice);

        match (self.kind, value) {
            (QuestionKind::Text, AnswerValue::Single(_)) => Ok(()),
            (QuestionKind::Text, AnswerValue::Multiple(_)) => {
                Err(invalid("expected a single value"))
            }
            (QuestionKind::SingleChoice, AnswerValue::Single(choice)) if known(choice) => Ok(()),
            (QuestionKind::SingleChoice, AnswerValue::Single(_)) => Err(invalid("unknown option")),
            (QuestionKind::SingleChoice, AnswerValue::Multiple(_)) => {
                Err(invalid("expected a single choice"))
            }
            (QuestionKind::MultipleChoice, AnswerValue::Multiple(choices)) => {
                if choices.iter().all(known) {
                    Ok(())
                } else {
                    Err(invalid("unknown option"))
                }
            }
            (QuestionKind::MultipleChoice, AnswerValue::Single(choice)) if known(choice) => Ok(()),
            (QuestionKind::MultipleChoice, AnswerValue::Single(_)) => {
                Err(invalid("unknown option"))
            }
        }
    }
}

/// One answer: a JSON string or a JSON array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Single(String),
    Multiple(Vec<String>),
}

impl AnswerValue {
    pub fn is_empty(&self) -> bool {
        match self {
            AnswerValue::Single(value) => value.trim().is_empty(),
            AnswerValue::Multiple(values) => values.is_empty(),
        }
    }
}

/// Answers keyed by question text.
pub type Answers = HashMap<String, AnswerValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionBatch {
    pub id: String,
    pub questions: Vec<Question>,
    pub timeout_seconds: u32,
    pub remaining_seconds: u32,
}

impl QuestionBatch {
    fn question(&self, text: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.text == text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModalState {
    Idle,
    Open,
    Closed,
}

/// Notifications emitted by the machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModalEvent {
    Opened { batch_id: String, remaining_seconds: u32 },
    Tick { batch_id: String, remaining_seconds: u32 },
    /// Countdown reached zero; the batch is still open.
    Expired { batch_id: String },
    AnswerChanged { batch_id: String, question: String },
    Submitted { batch_id: String },
    Closed { batch_id: String },
    Reset,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModalError {
    #[error("No question batch is open")]
    NotOpen,

    #[error("Unknown question: {0}")]
    UnknownQuestion(String),

    #[error("Invalid answer for '{question}': {reason}")]
    InvalidAnswer { question: String, reason: String },

    #[error("Required questions unanswered: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
}

/// idle -> open -> closed, with `reset` forcing idle from anywhere.
#[derive(Debug, Clone)]
pub struct TimedResponseMachine {
    state: ModalState,
    batch: Option<QuestionBatch>,
    answers: Answers,
    submitted: HashMap<String, Answers>,
    expired: bool,
}

impl Default for TimedResponseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TimedResponseMachine {
    pub fn new() -> Self {
        Self {
            state: ModalState::Idle,
            batch: None,
            answers: Answers::new(),
            submitted: HashMap::new(),
            expired: false,
        }
    }

    /// Open a batch. Remaining time and answers are reset no matter what
    /// state the machine was in.
    pub fn open_modal(
        &mut self,
        batch_id: impl Into<String>,
        questions: Vec<Question>,
        timeout_seconds: u32,
    ) -> ModalEvent {
        let batch_id = batch_id.into();
        self.batch = Some(QuestionBatch {
            id: batch_id.clone(),
            questions,
            timeout_seconds,
            remaining_seconds: timeout_seconds,
        });
        self.answers.clear();
        self.expired = false;
        self.state = ModalState::Open;

        tracing::debug!(batch_id = %batch_id, timeout_seconds, "Question batch opened");

        ModalEvent::Opened {
            batch_id,
            remaining_seconds: timeout_seconds,
        }
    }

    /// Close the open batch without submitting.
    pub fn close_modal(&mut self) -> Option<ModalEvent> {
        if self.state != ModalState::Open {
            return None;
        }
        self.state = ModalState::Closed;
        self.batch.as_ref().map(|batch| ModalEvent::Closed {
            batch_id: batch.id.clone(),
        })
    }

    /// One-second countdown step. Floors at zero and never closes the batch;
    /// the first tick that reaches zero reports [`ModalEvent::Expired`].
    pub fn tick(&mut self) -> Option<ModalEvent> {
        if self.state != ModalState::Open {
            return None;
        }
        let batch = self.batch.as_mut()?;
        if batch.remaining_seconds == 0 {
            if self.expired {
                return None;
            }
            self.expired = true;
            return Some(ModalEvent::Expired {
                batch_id: batch.id.clone(),
            });
        }

        batch.remaining_seconds -= 1;
        if batch.remaining_seconds == 0 {
            self.expired = true;
            Some(ModalEvent::Expired {
                batch_id: batch.id.clone(),
            })
        } else {
            Some(ModalEvent::Tick {
                batch_id: batch.id.clone(),
                remaining_seconds: batch.remaining_seconds,
            })
        }
    }

    /// Record an answer for a question of the open batch.
    pub fn set_answer(
        &mut self,
        question: &str,
        value: AnswerValue,
    ) -> Result<ModalEvent, ModalError> {
        let batch = self.open_batch()?;
        let q = batch
            .question(question)
            .ok_or_else(|| ModalError::UnknownQuestion(question.to_string()))?;
        q.check(&value)?;

        let batch_id = batch.id.clone();
        self.answers.insert(question.to_string(), value);
        Ok(ModalEvent::AnswerChanged {
            batch_id,
            question: question.to_string(),
        })
    }

    /// Submit the open batch's answers. Succeeds at most once per batch.
    pub fn submit(&mut self) -> Result<ModalEvent, ModalError> {
        let batch = self.open_batch()?;

        let missing: Vec<String> = batch
            .questions
            .iter()
            .filter(|q| q.required)
            .filter(|q| self.answers.get(&q.text).map_or(true, AnswerValue::is_empty))
            .map(|q| q.text.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ModalError::MissingRequired(missing));
        }

        let batch_id = batch.id.clone();
        let answers = self.answers.clone();
        Ok(self.submit_answers(batch_id, answers))
    }

    /// Store answers for a batch, overwriting any earlier submission for the
    /// same id. Closes the batch if it is the one currently open.
    pub fn submit_answers(&mut self, batch_id: impl Into<String>, answers: Answers) -> ModalEvent {
        let batch_id = batch_id.into();
        self.submitted.insert(batch_id.clone(), answers);

        let is_open_batch = self.state == ModalState::Open
            && self.batch.as_ref().is_some_and(|b| b.id == batch_id);
        if is_open_batch {
            self.state = ModalState::Closed;
        }

        tracing::debug!(batch_id = %batch_id, "Answers submitted");
        ModalEvent::Submitted { batch_id }
    }

    pub fn get_submitted_answer(&self, batch_id: &str) -> Option<&Answers> {
        self.submitted.get(batch_id)
    }

    /// Force idle. Submitted answers survive.
    pub fn reset(&mut self) -> ModalEvent {
        self.state = ModalState::Idle;
        self.batch = None;
        self.answers.clear();
        self.expired = false;
        ModalEvent::Reset
    }

    pub fn state(&self) -> ModalState {
        self.state
    }

    pub fn batch(&self) -> Option<&QuestionBatch> {
        self.batch.as_ref()
    }

    pub fn remaining_seconds(&self) -> Option<u32> {
        self.batch.as_ref().map(|b| b.remaining_seconds)
    }

    pub fn answers(&self) -> &Answers {
        &self.answers
    }

    fn open_batch(&self) -> Result<&QuestionBatch, ModalError> {
        match (&self.state, &self.batch) {
            (ModalState::Open, Some(batch)) => Ok(batch),
            _ => Err(ModalError::NotOpen),
        }
    }
}

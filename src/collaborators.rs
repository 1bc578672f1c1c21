//! Upstream collaborators: the AI generation and grading services and the
//! learning-history source they read from.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{StudentId, TokenUsage};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("Upstream call failed: {0}")]
    Failed(String),

    #[error("Upstream call timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_))
    }
}

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

/// What the generator needs to know about a student.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StudentContext {
    pub student_id: StudentId,
    pub completed_items: Vec<String>,
    #[serde(default)]
    pub profile: serde_json::Value,
}

impl StudentContext {
    pub fn new(student_id: StudentId) -> Self {
        Self {
            student_id,
            completed_items: Vec::new(),
            profile: serde_json::Value::Null,
        }
    }

    pub fn with_completed(mut self, items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.completed_items.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn with_profile(mut self, profile: serde_json::Value) -> Self {
        self.profile = profile;
        self
    }

    pub fn history_len(&self) -> usize {
        self.completed_items.len()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPath {
    pub recommendations: serde_json::Value,
    pub reasoning: String,
    pub usage: TokenUsage,
    pub confidence: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradingRequest {
    pub question_id: String,
    pub question: String,
    pub answer: String,
    pub rubric: Option<String>,
}

impl GradingRequest {
    pub fn new(
        question_id: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            question_id: question_id.into(),
            question: question.into(),
            answer: answer.into(),
            rubric: None,
        }
    }

    pub fn with_rubric(mut self, rubric: impl Into<String>) -> Self {
        self.rubric = Some(rubric.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradedAnswer {
    pub score: f32,
    pub feedback: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait PathGenerator: Send + Sync {
    async fn generate(&self, context: &StudentContext) -> UpstreamResult<GeneratedPath>;
}

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(
        &self,
        student_id: &StudentId,
        request: &GradingRequest,
    ) -> UpstreamResult<GradedAnswer>;
}

#[async_trait]
pub trait ContextSource: Send + Sync {
    /// `None` when the student has no learning history at all.
    async fn load(&self, student_id: &StudentId) -> UpstreamResult<Option<StudentContext>>;
}

/// Context source backed by a map, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryContextSource {
    contexts: DashMap<StudentId, StudentContext>,
}

impl InMemoryContextSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, context: StudentContext) {
        self.contexts.insert(context.student_id.clone(), context);
    }

    pub fn remove(&self, student_id: &StudentId) -> Option<StudentContext> {
        self.contexts.remove(student_id).map(|(_, v)| v)
    }
}

#[async_trait]
impl ContextSource for InMemoryContextSource {
    async fn load(&self, student_id: &StudentId) -> UpstreamResult<Option<StudentContext>> {
        Ok(self.contexts.get(student_id).map(|c| c.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_context_source() {
        let source = InMemoryContextSource::new();
        let student = StudentId::new("s1");
        assert!(source.load(&student).await.unwrap().is_none());

        source.insert(StudentContext::new(student.clone()).with_completed(["unit-1", "unit-2"]));
        let context = source.load(&student).await.unwrap().unwrap();
        assert_eq!(context.history_len(), 2);
    }

    #[test]
    fn test_upstream_error_retryable() {
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(UpstreamError::Failed("503".into()).is_retryable());
        assert!(!UpstreamError::InsufficientData("no history".into()).is_retryable());
    }
}

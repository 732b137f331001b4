//! Concept Oracle — the natural-language judgment collaborator
//!
//! Every call that needs language understanding (noun-phrase extraction,
//! match judgment, cluster validation, parent proposal, description
//! synthesis) goes through this trait. Two implementations ship: a mock with
//! preconfigured responses for tests, and whatever model-backed client the
//! deployment wires in. All calls are synchronous from the caller's point of
//! view, fallible, and retried at most once.

use crate::candidate::Candidate;
use crate::embedding::ScoredConcept;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Errors from Oracle operations. All of these are transient-infrastructure
/// failures from the pipeline's point of view: fatal to the run, resumable.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle call timed out after {0:?}")]
    Timeout(Duration),

    #[error("oracle invocation failed: {0}")]
    InvocationFailed(String),

    #[error("oracle response parse error: {0}")]
    ParseError(String),
}

/// The Oracle's verdict on one noun phrase against its candidate list.
#[derive(Debug, Clone)]
pub struct MatchJudgment {
    /// The chosen existing concept, or None when nothing fits.
    pub matched_id: Option<String>,
    /// Stated rationale, recorded for audit either way.
    pub reason: String,
    /// Normalized noun-phrase summary of the keyword.
    pub noun_phrase_summary: String,
}

/// The Oracle's verdict on whether a cluster's members denote one concept.
#[derive(Debug, Clone)]
pub struct ClusterValidation {
    pub can_merge: bool,
    /// The member (by noun-phrase summary) chosen as representative.
    pub representative_key: String,
    /// A description covering every member.
    pub unified_description: String,
    pub reason: String,
}

/// One ranked parent proposal.
#[derive(Debug, Clone)]
pub struct RankedParent {
    pub parent_id: String,
    pub score: f32,
}

/// The natural-language judgment collaborator.
#[async_trait]
pub trait ConceptOracle: Send + Sync {
    /// Decompose an observed keyword into up to 3 candidate noun phrases.
    async fn extract_noun_phrases(
        &self,
        keyword: &str,
        context: &str,
        top_level_categories: &[String],
    ) -> Result<Vec<String>, OracleError>;

    /// Pick a matching existing concept for a keyword, if any.
    async fn judge_match(
        &self,
        keyword: &str,
        context: &str,
        candidates: &[ScoredConcept],
    ) -> Result<MatchJudgment, OracleError>;

    /// Decide whether every cluster member denotes the same concept.
    async fn validate_cluster(
        &self,
        members: &[Candidate],
    ) -> Result<ClusterValidation, OracleError>;

    /// Propose up to 3 ranked parents for a new concept, best first.
    async fn propose_parents(
        &self,
        concept_id: &str,
        description: &str,
    ) -> Result<Vec<RankedParent>, OracleError>;

    /// Synthesize a search-friendly description for a concept.
    async fn describe(&self, concept: &str, context: &str) -> Result<String, OracleError>;
}

/// Run an Oracle call with a timeout, retrying exactly once on failure.
///
/// Decision-quality outcomes (e.g. "no match") are Ok values and never
/// retried; only transport-level errors trigger the single retry.
pub async fn call_with_retry<T, F, Fut>(timeout: Duration, op: F) -> Result<T, OracleError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    for attempt in 0..2 {
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if attempt == 1 => return Err(e),
            Err(_) if attempt == 1 => return Err(OracleError::Timeout(timeout)),
            _ => continue,
        }
    }
    unreachable!("retry loop returns on the second attempt")
}

/// HTTP client for an Oracle judgment service.
///
/// Each call posts `{"task": ..., "input": {...}}` as JSON and expects a
/// JSON object back. The blocking HTTP round trip runs on the blocking
/// thread pool so Oracle calls never stall the async runtime.
pub struct HttpOracle {
    endpoint_url: String,
    agent: ureq::Agent,
}

impl HttpOracle {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self::with_timeout(endpoint_url, Duration::from_secs(60))
    }

    pub fn with_timeout(endpoint_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    async fn call(
        &self,
        task: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, OracleError> {
        let agent = self.agent.clone();
        let url = self.endpoint_url.clone();
        let body = serde_json::json!({ "task": task, "input": payload });
        tokio::task::spawn_blocking(move || {
            let response = agent.post(&url).send_json(body).map_err(|e| match e {
                ureq::Error::Status(status, response) => OracleError::InvocationFailed(format!(
                    "HTTP {}: {}",
                    status,
                    response.into_string().unwrap_or_default()
                )),
                other => OracleError::Unavailable(other.to_string()),
            })?;
            response
                .into_json::<serde_json::Value>()
                .map_err(|e| OracleError::ParseError(e.to_string()))
        })
        .await
        .map_err(|e| OracleError::InvocationFailed(e.to_string()))?
    }
}

fn str_field(value: &serde_json::Value, key: &str) -> Result<String, OracleError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| OracleError::ParseError(format!("missing field '{}'", key)))
}

#[async_trait]
impl ConceptOracle for HttpOracle {
    async fn extract_noun_phrases(
        &self,
        keyword: &str,
        context: &str,
        top_level_categories: &[String],
    ) -> Result<Vec<String>, OracleError> {
        let reply = self
            .call(
                "extract_noun_phrases",
                serde_json::json!({
                    "keyword": keyword,
                    "context": context,
                    "top_level_categories": top_level_categories,
                }),
            )
            .await?;
        let phrases = reply
            .get("noun_phrases")
            .and_then(|v| v.as_array())
            .ok_or_else(|| OracleError::ParseError("missing field 'noun_phrases'".to_string()))?;
        Ok(phrases
            .iter()
            .filter_map(|p| p.as_str())
            .map(|p| p.to_string())
            .collect())
    }

    async fn judge_match(
        &self,
        keyword: &str,
        context: &str,
        candidates: &[ScoredConcept],
    ) -> Result<MatchJudgment, OracleError> {
        let candidate_rows: Vec<serde_json::Value> = candidates
            .iter()
            .map(|c| {
                serde_json::json!({
                    "concept_id": c.concept_id,
                    "description": c.description,
                    "distance": c.distance,
                })
            })
            .collect();
        let reply = self
            .call(
                "judge_match",
                serde_json::json!({
                    "keyword": keyword,
                    "context": context,
                    "candidates": candidate_rows,
                }),
            )
            .await?;
        Ok(MatchJudgment {
            matched_id: reply
                .get("matched_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            reason: str_field(&reply, "reason")?,
            noun_phrase_summary: str_field(&reply, "noun_phrase_summary")
                .unwrap_or_else(|_| keyword.to_string()),
        })
    }

    async fn validate_cluster(
        &self,
        members: &[Candidate],
    ) -> Result<ClusterValidation, OracleError> {
        let member_rows: Vec<serde_json::Value> = members
            .iter()
            .map(|m| {
                serde_json::json!({
                    "concept_text": m.concept_text,
                    "description": m.description,
                    "original_keyword": m.original_keyword,
                })
            })
            .collect();
        let reply = self
            .call("validate_cluster", serde_json::json!({ "members": member_rows }))
            .await?;
        Ok(ClusterValidation {
            can_merge: reply
                .get("can_merge")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            representative_key: str_field(&reply, "representative_key").unwrap_or_default(),
            unified_description: str_field(&reply, "unified_description").unwrap_or_default(),
            reason: str_field(&reply, "reason").unwrap_or_default(),
        })
    }

    async fn propose_parents(
        &self,
        concept_id: &str,
        description: &str,
    ) -> Result<Vec<RankedParent>, OracleError> {
        let reply = self
            .call(
                "propose_parents",
                serde_json::json!({ "concept_id": concept_id, "description": description }),
            )
            .await?;
        let parents = reply
            .get("parents")
            .and_then(|v| v.as_array())
            .ok_or_else(|| OracleError::ParseError("missing field 'parents'".to_string()))?;
        Ok(parents
            .iter()
            .filter_map(|p| {
                Some(RankedParent {
                    parent_id: p.get("parent_id")?.as_str()?.to_string(),
                    score: p.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32,
                })
            })
            .collect())
    }

    async fn describe(&self, concept: &str, context: &str) -> Result<String, OracleError> {
        let reply = self
            .call(
                "describe",
                serde_json::json!({ "concept": concept, "context": context }),
            )
            .await?;
        str_field(&reply, "description")
    }
}

/// Mock oracle for testing — returns preconfigured responses.
///
/// Unconfigured phrases yield a no-match judgment, unconfigured keywords
/// yield themselves as the single noun phrase, and cluster validation
/// accepts with the first member as representative unless told otherwise.
pub struct MockOracle {
    noun_phrases: HashMap<String, Vec<String>>,
    matches: HashMap<String, MatchJudgment>,
    parents: HashMap<String, Vec<RankedParent>>,
    default_parent: Option<String>,
    reject_clusters: Option<String>,
    representative_key: Option<String>,
    failing: AtomicBool,
    calls_remaining: AtomicUsize,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            noun_phrases: HashMap::new(),
            matches: HashMap::new(),
            parents: HashMap::new(),
            default_parent: None,
            reject_clusters: None,
            representative_key: None,
            failing: AtomicBool::new(false),
            calls_remaining: AtomicUsize::new(usize::MAX),
        }
    }

    /// Preconfigure the noun phrases extracted from a keyword.
    pub fn with_noun_phrases(mut self, keyword: &str, phrases: &[&str]) -> Self {
        self.noun_phrases.insert(
            keyword.to_string(),
            phrases.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    /// Preconfigure a successful match for a phrase.
    pub fn with_match(mut self, phrase: &str, matched_id: &str, reason: &str) -> Self {
        self.matches.insert(
            phrase.to_string(),
            MatchJudgment {
                matched_id: Some(matched_id.to_string()),
                reason: reason.to_string(),
                noun_phrase_summary: phrase.to_string(),
            },
        );
        self
    }

    /// Preconfigure an explicit no-match verdict for a phrase.
    pub fn with_no_match(mut self, phrase: &str, reason: &str) -> Self {
        self.matches.insert(
            phrase.to_string(),
            MatchJudgment {
                matched_id: None,
                reason: reason.to_string(),
                noun_phrase_summary: phrase.to_string(),
            },
        );
        self
    }

    /// Preconfigure ranked parents for a concept id.
    pub fn with_parents(mut self, concept_id: &str, parents: &[(&str, f32)]) -> Self {
        self.parents.insert(
            concept_id.to_string(),
            parents
                .iter()
                .map(|(id, score)| RankedParent {
                    parent_id: id.to_string(),
                    score: *score,
                })
                .collect(),
        );
        self
    }

    /// Fallback parent proposed for any unconfigured concept.
    pub fn with_default_parent(mut self, parent_id: &str) -> Self {
        self.default_parent = Some(parent_id.to_string());
        self
    }

    /// Make cluster validation reject everything with the given reason.
    pub fn rejecting_clusters(mut self, reason: &str) -> Self {
        self.reject_clusters = Some(reason.to_string());
        self
    }

    /// Force the representative chosen on cluster acceptance.
    pub fn with_representative(mut self, key: &str) -> Self {
        self.representative_key = Some(key.to_string());
        self
    }

    /// Toggle hard failure of every call (for fatal-error paths).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Allow exactly `calls` further calls, then fail every one after.
    pub fn set_fail_after(&self, calls: usize) {
        self.calls_remaining.store(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), OracleError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("mock oracle set to fail".to_string()));
        }
        let remaining = self.calls_remaining.load(Ordering::SeqCst);
        if remaining == usize::MAX {
            return Ok(());
        }
        if remaining == 0 {
            return Err(OracleError::Unavailable(
                "mock oracle call budget exhausted".to_string(),
            ));
        }
        self.calls_remaining.store(remaining - 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConceptOracle for MockOracle {
    async fn extract_noun_phrases(
        &self,
        keyword: &str,
        _context: &str,
        _top_level_categories: &[String],
    ) -> Result<Vec<String>, OracleError> {
        self.check_available()?;
        Ok(self
            .noun_phrases
            .get(keyword)
            .cloned()
            .unwrap_or_else(|| vec![keyword.to_string()]))
    }

    async fn judge_match(
        &self,
        keyword: &str,
        _context: &str,
        _candidates: &[ScoredConcept],
    ) -> Result<MatchJudgment, OracleError> {
        self.check_available()?;
        Ok(self.matches.get(keyword).cloned().unwrap_or(MatchJudgment {
            matched_id: None,
            reason: "no configured match".to_string(),
            noun_phrase_summary: keyword.to_string(),
        }))
    }

    async fn validate_cluster(
        &self,
        members: &[Candidate],
    ) -> Result<ClusterValidation, OracleError> {
        self.check_available()?;
        if let Some(reason) = &self.reject_clusters {
            return Ok(ClusterValidation {
                can_merge: false,
                representative_key: String::new(),
                unified_description: String::new(),
                reason: reason.clone(),
            });
        }
        let representative_key = self
            .representative_key
            .clone()
            .or_else(|| members.first().map(|m| m.noun_phrase_summary.clone()))
            .unwrap_or_default();
        let unified_description = members
            .iter()
            .map(|m| m.description.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(ClusterValidation {
            can_merge: true,
            representative_key,
            unified_description,
            reason: "members denote the same concept".to_string(),
        })
    }

    async fn propose_parents(
        &self,
        concept_id: &str,
        _description: &str,
    ) -> Result<Vec<RankedParent>, OracleError> {
        self.check_available()?;
        if let Some(parents) = self.parents.get(concept_id) {
            return Ok(parents.clone());
        }
        Ok(self
            .default_parent
            .iter()
            .map(|p| RankedParent {
                parent_id: p.clone(),
                score: 1.0,
            })
            .collect())
    }

    async fn describe(&self, concept: &str, context: &str) -> Result<String, OracleError> {
        self.check_available()?;
        if context.is_empty() {
            Ok(format!("{} is a concept in this ontology.", concept))
        } else {
            let excerpt: String = context.chars().take(120).collect();
            Ok(format!("{}: {}", concept, excerpt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn retry_once_then_succeed() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retry(Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(OracleError::Unavailable("first try".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_stops_after_second_failure() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = call_with_retry(Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OracleError::Unavailable("always".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_is_reported_as_oracle_error() {
        let result: Result<(), _> = call_with_retry(Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(OracleError::Timeout(_))));
    }

    #[tokio::test]
    async fn mock_defaults_are_conservative() {
        let oracle = MockOracle::new();
        let phrases = oracle
            .extract_noun_phrases("RAG", "some context", &[])
            .await
            .unwrap();
        assert_eq!(phrases, vec!["RAG"]);

        let judgment = oracle.judge_match("RAG", "ctx", &[]).await.unwrap();
        assert!(judgment.matched_id.is_none());

        let parents = oracle.propose_parents("RAG", "desc").await.unwrap();
        assert!(parents.is_empty());
    }

    #[tokio::test]
    async fn failing_mock_surfaces_unavailable() {
        let oracle = MockOracle::new();
        oracle.set_failing(true);
        let result = oracle.extract_noun_phrases("x", "", &[]).await;
        assert!(matches!(result, Err(OracleError::Unavailable(_))));
    }

    #[tokio::test]
    async fn call_budget_fails_after_the_allowed_calls() {
        let oracle = MockOracle::new();
        oracle.set_fail_after(1);
        assert!(oracle.extract_noun_phrases("x", "", &[]).await.is_ok());
        let result = oracle.judge_match("x", "", &[]).await;
        assert!(matches!(result, Err(OracleError::Unavailable(_))));
    }
}

//! Preference Learning Engine (§4.8): Bayesian-weighted tracking of user
//! selections/rejections per (keyword, model, adapter) combination.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    model::{FeedbackAction, PreferenceRecord, PreferenceStat},
    util::error::OrchestratorError,
};

const SMOOTHING: f64 = 10.0;
const MIN_KEYWORD_LEN: usize = 3;
const EXPORT_VERSION: u32 = 1;

static STOPWORDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "with", "that", "this", "from", "into", "onto", "over", "under",
        "of", "a", "an", "in", "on", "at", "to", "is", "are", "was", "were", "be", "been", "it",
        "its", "as", "by", "or", "but", "not", "very", "more", "most", "some", "any",
    ]
    .into_iter()
    .collect()
});

/// Tokenizes by whitespace and punctuation, lowercases, stop-words, and
/// filters by minimum length. Order is not significant; the keyword set is
/// deduplicated.
#[must_use]
pub fn extract_keywords(prompt: &str) -> BTreeSet<String> {
    prompt
        .split(|c: char| !c.is_alphanumeric())
        .map(|token| token.to_lowercase())
        .filter(|token| token.len() >= MIN_KEYWORD_LEN)
        .filter(|token| !STOPWORDS.contains(token.as_str()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum StatKey {
    KeywordModel { keyword: String, model: String },
    KeywordAdapter { keyword: String, adapter: String },
    ModelAdapter { model: String, adapter: String },
    Model { model: String },
}

#[derive(Debug, Default)]
struct EngineState {
    records: Vec<PreferenceRecord>,
    stats: HashMap<StatKey, PreferenceStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatEntry {
    key: StatKey,
    stat: PreferenceStat,
}

/// A stable, versioned export envelope round-tripping the engine's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceExport {
    version: u32,
    records: Vec<PreferenceRecord>,
    stats: Vec<StatEntry>,
}

#[derive(Debug, Clone)]
pub struct ModelRecommendation {
    pub model: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct AdapterRecommendation {
    pub adapter: String,
    pub score: f64,
}

/// A digestible aggregate over the engine's append-only record log, for the
/// dashboard and stats endpoints that should not see `StatKey` internals.
#[derive(Debug, Clone, Serialize)]
pub struct PreferenceStatsSummary {
    pub total_events: usize,
    pub total_selected: usize,
    pub total_rejected: usize,
    pub distinct_models: usize,
    pub distinct_keywords: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PreferenceEngine {
    state: Arc<RwLock<EngineState>>,
}

impl PreferenceEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one feedback event and updates every derived statistic it
    /// touches. The single writer here is the only mutator of preference
    /// statistics; readers work against `tokio::sync::RwLock` read guards.
    pub async fn record(
        &self,
        prompt: &str,
        model: &str,
        adapters: &[String],
        action: FeedbackAction,
        stage: u32,
        session_id: Uuid,
        feedback_text: Option<String>,
    ) {
        let keywords = extract_keywords(prompt);
        let selected = matches!(action, FeedbackAction::Selected);

        let mut guard = self.state.write().await;
        for keyword in &keywords {
            guard.records.push(PreferenceRecord {
                keyword: keyword.clone(),
                model: model.to_string(),
                adapter: adapters.first().cloned(),
                stage,
                action,
                feedback_text: feedback_text.clone(),
                session_id,
                timestamp: Utc::now(),
            });
            guard
                .stats
                .entry(StatKey::KeywordModel {
                    keyword: keyword.clone(),
                    model: model.to_string(),
                })
                .or_default()
                .record(selected);

            for adapter in adapters {
                guard
                    .stats
                    .entry(StatKey::KeywordAdapter {
                        keyword: keyword.clone(),
                        adapter: adapter.clone(),
                    })
                    .or_default()
                    .record(selected);
            }
        }

        for adapter in adapters {
            guard
                .stats
                .entry(StatKey::ModelAdapter {
                    model: model.to_string(),
                    adapter: adapter.clone(),
                })
                .or_default()
                .record(selected);
        }

        guard
            .stats
            .entry(StatKey::Model {
                model: model.to_string(),
            })
            .or_default()
            .record(selected);
    }

    /// Blended score `(1 - w)*prior + w*rate` averaged over the prompt's
    /// keyword set; returns the 0.5 prior when the set is empty.
    async fn score_model(&self, keywords: &BTreeSet<String>, model: &str) -> f64 {
        if keywords.is_empty() {
            return 0.5;
        }
        let guard = self.state.read().await;
        let mut total = 0.0;
        for keyword in keywords {
            let stat = guard
                .stats
                .get(&StatKey::KeywordModel {
                    keyword: keyword.clone(),
                    model: model.to_string(),
                })
                .copied()
                .unwrap_or_default();
            total += blended_score(stat);
        }
        total / keywords.len() as f64
    }

    async fn confidence(&self, keywords: &BTreeSet<String>, candidates: &[String]) -> f64 {
        let guard = self.state.read().await;
        let mut total_evidence = 0u64;
        for keyword in keywords {
            for model in candidates {
                if let Some(stat) = guard.stats.get(&StatKey::KeywordModel {
                    keyword: keyword.clone(),
                    model: model.clone(),
                }) {
                    total_evidence += stat.total;
                }
            }
        }
        (total_evidence as f64 / 100.0).min(1.0)
    }

    async fn model_ever_seen(&self, model: &str) -> bool {
        let guard = self.state.read().await;
        guard
            .stats
            .get(&StatKey::Model {
                model: model.to_string(),
            })
            .is_some_and(|stat| stat.total > 0)
    }

    /// Scores every candidate and returns the argmax with its confidence.
    /// Ties broken by candidate id (lexicographic).
    pub async fn recommend_model(
        &self,
        prompt: &str,
        candidates: &[String],
    ) -> Result<ModelRecommendation, OrchestratorError> {
        if candidates.is_empty() {
            return Err(OrchestratorError::NotFound("no candidate models".into()));
        }
        let keywords = extract_keywords(prompt);

        if keywords.is_empty() {
            let mut any_unseen = false;
            for model in candidates {
                if !self.model_ever_seen(model).await {
                    any_unseen = true;
                    break;
                }
            }
            if any_unseen {
                return Ok(ModelRecommendation {
                    model: candidates[0].clone(),
                    confidence: 0.0,
                });
            }
        }

        let mut best: Option<(String, f64)> = None;
        for model in candidates {
            let score = self.score_model(&keywords, model).await;
            best = match best {
                None => Some((model.clone(), score)),
                Some((best_model, best_score)) => {
                    if score > best_score || (score == best_score && *model < best_model) {
                        Some((model.clone(), score))
                    } else {
                        Some((best_model, best_score))
                    }
                }
            };
        }
        let (model, _score) = best.expect("candidates is non-empty");
        let confidence = self.confidence(&keywords, candidates).await;
        Ok(ModelRecommendation { model, confidence })
    }

    /// Combines per-keyword `(keyword, adapter)` score and `(model, adapter)`
    /// score with equal weight; returns the top `k` by score.
    pub async fn recommend_adapters(
        &self,
        prompt: &str,
        model: &str,
        candidate_adapters: &[String],
        k: usize,
    ) -> Vec<AdapterRecommendation> {
        let keywords = extract_keywords(prompt);
        let guard = self.state.read().await;

        let mut scored: Vec<AdapterRecommendation> = candidate_adapters
            .iter()
            .map(|adapter| {
                let keyword_component = if keywords.is_empty() {
                    0.5
                } else {
                    let total: f64 = keywords
                        .iter()
                        .map(|keyword| {
                            let stat = guard
                                .stats
                                .get(&StatKey::KeywordAdapter {
                                    keyword: keyword.clone(),
                                    adapter: adapter.clone(),
                                })
                                .copied()
                                .unwrap_or_default();
                            blended_score(stat)
                        })
                        .sum();
                    total / keywords.len() as f64
                };
                let model_adapter_component = {
                    let stat = guard
                        .stats
                        .get(&StatKey::ModelAdapter {
                            model: model.to_string(),
                            adapter: adapter.clone(),
                        })
                        .copied()
                        .unwrap_or_default();
                    blended_score(stat)
                };
                AdapterRecommendation {
                    adapter: adapter.clone(),
                    score: (keyword_component + model_adapter_component) / 2.0,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.adapter.cmp(&b.adapter))
        });
        scored.truncate(k);
        scored
    }

    /// Exports a stable, versioned snapshot of records and derived stats.
    pub async fn export(&self) -> PreferenceExport {
        let guard = self.state.read().await;
        PreferenceExport {
            version: EXPORT_VERSION,
            records: guard.records.clone(),
            stats: guard
                .stats
                .iter()
                .map(|(key, stat)| StatEntry {
                    key: key.clone(),
                    stat: *stat,
                })
                .collect(),
        }
    }

    /// Replaces the engine's state atomically from a previously exported
    /// snapshot. Rejects partially-decoded input with `CorruptExport`.
    pub async fn import(&self, raw: &str) -> Result<(), OrchestratorError> {
        let export: PreferenceExport =
            serde_json::from_str(raw).map_err(|e| OrchestratorError::CorruptExport(e.to_string()))?;
        if export.version != EXPORT_VERSION {
            return Err(OrchestratorError::CorruptExport(format!(
                "unsupported export version {}",
                export.version
            )));
        }

        let mut guard = self.state.write().await;
        guard.records = export.records;
        guard.stats = export.stats.into_iter().map(|e| (e.key, e.stat)).collect();
        Ok(())
    }

    /// Summarizes the record log into counts digestible by an API response,
    /// without exposing the internal `StatKey`/`StatEntry` shapes.
    pub async fn stats_summary(&self) -> PreferenceStatsSummary {
        let guard = self.state.read().await;
        let total_selected = guard
            .records
            .iter()
            .filter(|r| matches!(r.action, FeedbackAction::Selected))
            .count();
        let distinct_models: BTreeSet<&str> = guard.records.iter().map(|r| r.model.as_str()).collect();
        let distinct_keywords: BTreeSet<&str> = guard.records.iter().map(|r| r.keyword.as_str()).collect();
        PreferenceStatsSummary {
            total_events: guard.records.len(),
            total_selected,
            total_rejected: guard.records.len() - total_selected,
            distinct_models: distinct_models.len(),
            distinct_keywords: distinct_keywords.len(),
        }
    }

    /// Test helper: clears all recorded state.
    pub async fn reset(&self) {
        let mut guard = self.state.write().await;
        guard.records.clear();
        guard.stats.clear();
    }
}

fn blended_score(stat: PreferenceStat) -> f64 {
    if stat.total == 0 {
        return 0.5;
    }
    let rate = stat.selected as f64 / stat.total as f64;
    let w = stat.total as f64 / (stat.total as f64 + SMOOTHING);
    (1.0 - w) * 0.5 + w * rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_keywords_filters_stopwords_and_short_tokens() {
        let keywords = extract_keywords("A cat and a dog, in the rain!");
        assert!(keywords.contains("cat"));
        assert!(keywords.contains("dog"));
        assert!(keywords.contains("rain"));
        assert!(!keywords.contains("and"));
        assert!(!keywords.contains("in"));
        assert!(!keywords.contains("the"));
    }

    #[tokio::test]
    async fn recommendation_after_warmup_favors_well_evidenced_model() {
        let engine = PreferenceEngine::new();
        for _ in 0..20 {
            engine
                .record(
                    "k thing",
                    "A",
                    &[],
                    FeedbackAction::Selected,
                    0,
                    Uuid::new_v4(),
                    None,
                )
                .await;
        }
        for _ in 0..2 {
            engine
                .record(
                    "k thing",
                    "B",
                    &[],
                    FeedbackAction::Selected,
                    0,
                    Uuid::new_v4(),
                    None,
                )
                .await;
        }

        let rec = engine
            .recommend_model("k thing", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(rec.model, "A");
        assert!(rec.confidence >= 0.22, "confidence was {}", rec.confidence);
    }

    #[tokio::test]
    async fn confidence_saturates_to_one_with_enough_evidence() {
        let engine = PreferenceEngine::new();
        for _ in 0..100 {
            engine
                .record(
                    "k thing",
                    "A",
                    &[],
                    FeedbackAction::Selected,
                    0,
                    Uuid::new_v4(),
                    None,
                )
                .await;
        }
        let rec = engine
            .recommend_model("k thing", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert!((rec.confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejection_context_does_not_globally_penalize() {
        let engine = PreferenceEngine::new();
        // anime: A 0/10
        for _ in 0..10 {
            engine
                .record(
                    "anime girl",
                    "A",
                    &[],
                    FeedbackAction::Rejected,
                    0,
                    Uuid::new_v4(),
                    None,
                )
                .await;
        }
        // photoreal: A 9/10
        for i in 0..10 {
            let action = if i < 9 {
                FeedbackAction::Selected
            } else {
                FeedbackAction::Rejected
            };
            engine
                .record("photoreal portrait", "A", &[], action, 0, Uuid::new_v4(), None)
                .await;
        }

        let anime_rec = engine
            .recommend_model("anime girl", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(anime_rec.model, "B");

        let photoreal_rec = engine
            .recommend_model("photoreal portrait", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(photoreal_rec.model, "A");
    }

    #[tokio::test]
    async fn export_import_round_trips_identical_recommendations() {
        let engine = PreferenceEngine::new();
        for _ in 0..15 {
            engine
                .record("k thing", "A", &[], FeedbackAction::Selected, 0, Uuid::new_v4(), None)
                .await;
        }

        let exported = engine.export().await;
        let raw = serde_json::to_string(&exported).unwrap();

        let restored = PreferenceEngine::new();
        restored.import(&raw).await.expect("import should succeed");

        let before = engine
            .recommend_model("k thing", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        let after = restored
            .recommend_model("k thing", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(before.model, after.model);
        assert!((before.confidence - after.confidence).abs() < 1e-9);
    }

    #[tokio::test]
    async fn import_rejects_corrupt_payload() {
        let engine = PreferenceEngine::new();
        let error = engine.import("{not valid json").await.unwrap_err();
        assert!(matches!(error, OrchestratorError::CorruptExport(_)));
    }

    #[tokio::test]
    async fn unknown_model_with_empty_keywords_returns_first_candidate_zero_confidence() {
        let engine = PreferenceEngine::new();
        let rec = engine
            .recommend_model("", &["Z".to_string(), "Y".to_string()])
            .await
            .unwrap();
        assert_eq!(rec.model, "Z");
        assert!((rec.confidence - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stats_are_monotone_non_decreasing() {
        let engine = PreferenceEngine::new();
        engine
            .record("cat photo", "A", &[], FeedbackAction::Selected, 0, Uuid::new_v4(), None)
            .await;
        let export_before = engine.export().await;
        engine
            .record("cat photo", "A", &[], FeedbackAction::Rejected, 0, Uuid::new_v4(), None)
            .await;
        let export_after = engine.export().await;

        let total_before: u64 = export_before.stats.iter().map(|e| e.stat.total).sum();
        let total_after: u64 = export_after.stats.iter().map(|e| e.stat.total).sum();
        assert!(total_after >= total_before);

        for entry in &export_after.stats {
            assert!(entry.stat.selected <= entry.stat.total);
        }
    }

    #[tokio::test]
    async fn reset_clears_all_state() {
        let engine = PreferenceEngine::new();
        engine
            .record("cat photo", "A", &[], FeedbackAction::Selected, 0, Uuid::new_v4(), None)
            .await;
        engine.reset().await;
        let export = engine.export().await;
        assert!(export.records.is_empty());
        assert!(export.stats.is_empty());
    }
}

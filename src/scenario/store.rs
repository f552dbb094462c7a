//! Durable scenario library with pattern tracking and cross-environment
//! adaptation.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::adapt::{brittle_selector_suggestions, rewrite_navigation_targets, AdaptationSuggestion, SuggestionKind};
use super::types::{
    Execution, ExecutionRecord, ExecutionStatus, InteractionPattern, NewScenario, Scenario, Step,
};
use crate::cache::keys::{extract_url_pattern, steps_structure_hash, EnhancedCacheKey};
use crate::cache::store::{unix_now, SqliteStore};
use crate::cache::CacheBackend;
use crate::dom::signature::truncated_sha256;
use crate::error::{MemoryError, Result};
use crate::normalizer::similarity::{context_similarity, OperationType, CONFLICT_SENTINEL};
use crate::normalizer::SmartNormalizer;

/// Similarity search input.
#[derive(Debug, Clone, Default)]
pub struct SimilarQuery {
    pub name: String,
    pub description: Option<String>,
    /// Free text describing the steps the caller is looking for, compared
    /// against candidates' step descriptions
    pub steps_description: Option<String>,
    pub tags: Vec<String>,
    pub url: Option<String>,
    pub profile: Option<String>,
    pub limit: usize,
}

/// One similarity search result.
#[derive(Debug, Clone)]
pub struct SimilarScenario {
    pub scenario: Scenario,
    pub similarity: f64,
}

/// Result of adapting a scenario for a new environment.
#[derive(Debug, Clone)]
pub struct AdaptedScenario {
    pub scenario: Scenario,
    pub suggestions: Vec<AdaptationSuggestion>,
}

/// Scenario store sharing the cache database. Composes a cache backend for
/// selector suggestions during adaptation rather than owning one.
pub struct ScenarioStore {
    store: Arc<SqliteStore>,
    normalizer: Arc<SmartNormalizer>,
    cache: Arc<dyn CacheBackend>,
}

impl ScenarioStore {
    pub fn new(
        store: Arc<SqliteStore>,
        normalizer: Arc<SmartNormalizer>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        Self {
            store,
            normalizer,
            cache,
        }
    }

    /// Structural fingerprint of a scenario's step shape, independent of
    /// concrete values.
    pub fn pattern_hash(&self, steps: &[Step]) -> String {
        let shape: Vec<String> = steps
            .iter()
            .map(|step| {
                let normalized = self
                    .normalizer
                    .normalize(step.target.as_deref().unwrap_or(""))
                    .normalized;
                format!("{}:{}", step.action.as_str(), normalized)
            })
            .collect();
        truncated_sha256(&shape.join("|"), 32)
    }

    /// Save (or refresh) a scenario. Per-action interaction patterns and
    /// the enhanced key row are derived in the same transaction. Success
    /// statistics survive re-saves.
    pub async fn save(&self, draft: NewScenario) -> Result<Scenario> {
        let pattern_hash = self.pattern_hash(&draft.steps);
        let url_pattern = extract_url_pattern(&draft.url);
        let steps_hash = steps_structure_hash(&draft.steps);
        let steps_json = serde_json::to_string(&draft.steps)
            .map_err(|e| MemoryError::Validation {
                message: format!("steps not serializable: {e}"),
            })?;
        let tags_json =
            serde_json::to_string(&draft.tags).unwrap_or_else(|_| "[]".to_string());
        let name_normalized = self.normalizer.normalize(&draft.name).normalized;
        let now = unix_now();

        let name = draft.name.clone();
        let patterns = derive_patterns(&draft.steps);
        self.store
            .transaction(move |conn| {
                conn.execute(
                    "INSERT INTO test_scenarios
                         (name, description, steps, pattern_hash, url_pattern, tags,
                          profile, success_rate, total_runs, created_at, confidence)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1.0, 0, ?8, 0.5)
                     ON CONFLICT(name) DO UPDATE SET
                         description = excluded.description,
                         steps = excluded.steps,
                         pattern_hash = excluded.pattern_hash,
                         url_pattern = excluded.url_pattern,
                         tags = excluded.tags,
                         profile = excluded.profile",
                    params![
                        draft.name,
                        draft.description,
                        steps_json,
                        pattern_hash,
                        url_pattern,
                        tags_json,
                        draft.profile,
                        now,
                    ],
                )?;
                let scenario_id: i64 = conn.query_row(
                    "SELECT id FROM test_scenarios WHERE name = ?1",
                    params![draft.name],
                    |row| row.get(0),
                )?;

                for pattern in &patterns {
                    conn.execute(
                        "INSERT INTO test_patterns
                             (pattern_hash, interaction_type, element_patterns,
                              success_indicators, adaptation_rules, confidence,
                              success_count, total_count, learned_from, created_at, last_used)
                         VALUES (?1, ?2, ?3, ?4, ?5, 0.5, 0, 1, ?6, ?7, ?7)
                         ON CONFLICT(pattern_hash) DO UPDATE SET
                             total_count = total_count + 1,
                             last_used = ?7",
                        params![
                            pattern.pattern_hash,
                            pattern.interaction_type,
                            serde_json::to_string(&pattern.element_patterns)
                                .unwrap_or_else(|_| "[]".to_string()),
                            serde_json::to_string(&pattern.success_indicators)
                                .unwrap_or_else(|_| "[]".to_string()),
                            serde_json::to_string(&pattern.adaptation_rules)
                                .unwrap_or_else(|_| "[]".to_string()),
                            pattern.learned_from,
                            now,
                        ],
                    )?;
                }

                conn.execute(
                    "DELETE FROM cache_keys_v2 WHERE scenario_id = ?1",
                    params![scenario_id],
                )?;
                conn.execute(
                    "INSERT INTO cache_keys_v2
                         (test_name_normalized, url_pattern, dom_signature,
                          steps_structure_hash, profile, version, scenario_id, created_at)
                     VALUES (?1, ?2, '', ?3, ?4, 1, ?5, ?6)",
                    params![
                        name_normalized,
                        url_pattern,
                        steps_hash,
                        draft.profile,
                        scenario_id,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;

        info!(name = %name, "scenario saved");
        self.get(&name)
            .await?
            .ok_or(MemoryError::ScenarioNotFound(name))
    }

    pub async fn get(&self, name: &str) -> Result<Option<Scenario>> {
        let name = name.to_string();
        self.store
            .query(move |conn| {
                conn.query_row(
                    &format!("{} WHERE name = ?1", SELECT_SCENARIO),
                    params![name],
                    scenario_from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Scenario>> {
        self.store
            .query(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY created_at DESC", SELECT_SCENARIO))?;
                let rows = stmt.query_map([], scenario_from_row)?;
                rows.collect()
            })
            .await
    }

    /// Weighted four-channel similarity search with action-conflict
    /// discarding. A target URL whose domain differs from a candidate's
    /// switches that comparison to the cross-environment threshold.
    pub async fn find_similar(&self, query: SimilarQuery) -> Result<Vec<SimilarScenario>> {
        let candidates = self.list().await?;
        let query_pattern = query.url.as_deref().map(extract_url_pattern);
        let query_name = self.normalizer.normalize(&query.name);
        let query_description = query
            .description
            .as_deref()
            .map(|d| self.normalizer.normalize(d));
        let query_steps = query
            .steps_description
            .as_deref()
            .map(|s| self.normalizer.normalize(s));
        let query_tags = self.normalizer.normalize(&query.tags.join(" "));
        let limit = if query.limit == 0 { 10 } else { query.limit };

        let mut results = Vec::new();
        for candidate in candidates {
            if let Some(profile) = &query.profile {
                if candidate
                    .profile
                    .as_ref()
                    .is_some_and(|p| p != profile)
                {
                    continue;
                }
            }
            if let Some(pattern) = &query_pattern {
                let overlap = candidate.url_pattern.contains(pattern.as_str())
                    || pattern.contains(candidate.url_pattern.as_str());
                if !overlap && !is_cross_domain(pattern, &candidate.url_pattern) {
                    // same-domain candidates must share path structure
                    continue;
                }
            }

            let cross_env = query_pattern
                .as_deref()
                .map(|p| is_cross_domain(p, &candidate.url_pattern))
                .unwrap_or(false);
            let operation = if cross_env {
                OperationType::CrossEnv
            } else {
                OperationType::TestSearch
            };

            let cand_name = self.normalizer.normalize(&candidate.name);
            let name_score = context_similarity(&query_name, &cand_name, operation, cross_env);
            if name_score == CONFLICT_SENTINEL {
                debug!(candidate = %candidate.name, "discarded: conflicting name verbs");
                continue;
            }

            let description_score = match (&query_description, &candidate.description) {
                (Some(qd), Some(cd)) => {
                    let cd = self.normalizer.normalize(cd);
                    context_similarity(qd, &cd, operation, cross_env)
                }
                _ => 0.0,
            };
            if description_score == CONFLICT_SENTINEL {
                continue;
            }

            let steps_score = match &query_steps {
                Some(qs) => {
                    let cand_steps_text = candidate
                        .steps
                        .iter()
                        .map(|s| s.description.as_str())
                        .collect::<Vec<_>>()
                        .join(" ");
                    if cand_steps_text.is_empty() {
                        0.0
                    } else {
                        let cand_steps = self.normalizer.normalize(&cand_steps_text);
                        context_similarity(qs, &cand_steps, operation, cross_env)
                    }
                }
                None => 0.0,
            };
            if steps_score == CONFLICT_SENTINEL {
                continue;
            }

            let tags_score = if query.tags.is_empty() || candidate.tags.is_empty() {
                0.0
            } else {
                let cand_tags = self.normalizer.normalize(&candidate.tags.join(" "));
                context_similarity(&query_tags, &cand_tags, operation, cross_env)
            };
            if tags_score == CONFLICT_SENTINEL {
                continue;
            }

            let similarity = name_score * 0.4
                + description_score * 0.3
                + steps_score * 0.2
                + tags_score * 0.1;
            if similarity < operation.threshold() * 0.4 {
                // below any useful ranking weight
                continue;
            }

            results.push(SimilarScenario {
                scenario: candidate,
                similarity,
            });
        }

        results.sort_by(|a, b| {
            let score_a = a.similarity * 0.7 + a.scenario.confidence * 0.3;
            let score_b = b.similarity * 0.7 + b.scenario.confidence * 0.3;
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }

    /// Transform a scenario for a new URL. Navigation targets move to the
    /// new origin, brittle selectors are flagged, and the composed cache is
    /// consulted for known selectors on the target. Optionally persists the
    /// adapted scenario under a new name.
    pub async fn adapt(
        &self,
        name: &str,
        new_url: &str,
        persist_as: Option<&str>,
    ) -> Result<AdaptedScenario> {
        let mut scenario = self
            .get(name)
            .await?
            .ok_or_else(|| MemoryError::ScenarioNotFound(name.to_string()))?;

        let mut suggestions = rewrite_navigation_targets(&mut scenario.steps, new_url);
        suggestions.extend(brittle_selector_suggestions(&scenario.steps));

        for (index, step) in scenario.steps.iter().enumerate() {
            if step.action.is_navigation() || step.description.is_empty() {
                continue;
            }
            if let Some(hit) = self.cache.get(&step.description, new_url).await? {
                suggestions.push(AdaptationSuggestion {
                    step_index: index,
                    kind: SuggestionKind::CachedAlternative,
                    message: format!(
                        "cached selector '{}' (confidence {:.2}) matches this step on the target",
                        hit.selector, hit.confidence
                    ),
                    replacement: Some(hit.selector),
                });
            }
        }

        scenario.url_pattern = extract_url_pattern(new_url);
        scenario.last_adapted = Some(unix_now());

        if let Some(new_name) = persist_as {
            let draft = NewScenario {
                name: new_name.to_string(),
                description: scenario.description.clone(),
                steps: scenario.steps.clone(),
                tags: scenario.tags.clone(),
                profile: scenario.profile.clone(),
                url: new_url.to_string(),
            };
            let mut persisted = self.save(draft).await?;
            let adapted_at = scenario.last_adapted;
            let name_owned = new_name.to_string();
            self.store
                .query(move |conn| {
                    conn.execute(
                        "UPDATE test_scenarios SET last_adapted = ?1 WHERE name = ?2",
                        params![adapted_at, name_owned],
                    )
                })
                .await?;
            persisted.last_adapted = adapted_at;
            return Ok(AdaptedScenario {
                scenario: persisted,
                suggestions,
            });
        }

        Ok(AdaptedScenario {
            scenario,
            suggestions,
        })
    }

    /// Insert an execution row for a named scenario.
    pub async fn record_execution(
        &self,
        name: &str,
        status: ExecutionStatus,
        record: ExecutionRecord,
    ) -> Result<i64> {
        let scenario_id = self
            .scenario_id(name)
            .await?
            .ok_or_else(|| MemoryError::ScenarioNotFound(name.to_string()))?;
        let now = unix_now();
        let adaptations = if record.selector_adaptations.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&record.selector_adaptations)
                    .unwrap_or_else(|_| "[]".to_string()),
            )
        };
        self.store
            .query(move |conn| {
                conn.execute(
                    "INSERT INTO test_executions
                         (scenario_id, status, execution_time_ms, selector_adaptations,
                          error_details, snapshot_id, confidence_score, profile, url, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        scenario_id,
                        status.as_str(),
                        record.execution_time_ms as i64,
                        adaptations,
                        record.error_details,
                        record.snapshot_id,
                        record.confidence_score,
                        record.profile,
                        record.url.unwrap_or_default(),
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Recompute the running success rate so it stays integer-consistent
    /// with the recorded run count.
    pub async fn update_success_rate(&self, name: &str, success: bool) -> Result<f64> {
        let name_owned = name.to_string();
        let now = unix_now();
        let updated = self
            .store
            .transaction(move |conn| {
                let row: Option<(f64, i64, f64)> = conn
                    .query_row(
                        "SELECT success_rate, total_runs, confidence
                         FROM test_scenarios WHERE name = ?1",
                        params![name_owned],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                let Some((old_rate, old_runs, confidence)) = row else {
                    return Ok(None);
                };

                let successes = (old_rate * old_runs as f64).round() as i64
                    + if success { 1 } else { 0 };
                let new_runs = old_runs + 1;
                let new_rate = (successes as f64 / new_runs as f64).clamp(0.0, 1.0);
                let new_confidence = if success {
                    (confidence * 1.05).min(1.0)
                } else {
                    (confidence * 0.85).max(0.0)
                };

                conn.execute(
                    "UPDATE test_scenarios
                     SET success_rate = ?1, total_runs = ?2, last_run = ?3, confidence = ?4
                     WHERE name = ?5",
                    params![new_rate, new_runs, now, new_confidence, name_owned],
                )?;
                Ok(Some(new_rate))
            })
            .await?;
        updated.ok_or_else(|| MemoryError::ScenarioNotFound(name.to_string()))
    }

    pub async fn executions(&self, name: &str) -> Result<Vec<Execution>> {
        let scenario_id = self
            .scenario_id(name)
            .await?
            .ok_or_else(|| MemoryError::ScenarioNotFound(name.to_string()))?;
        self.store
            .query(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, scenario_id, status, execution_time_ms, selector_adaptations,
                            error_details, snapshot_id, confidence_score, profile, url, timestamp
                     FROM test_executions WHERE scenario_id = ?1 ORDER BY timestamp DESC",
                )?;
                let rows = stmt.query_map(params![scenario_id], |row| {
                    let status_text: String = row.get(2)?;
                    Ok(Execution {
                        id: row.get(0)?,
                        scenario_id: row.get(1)?,
                        status: ExecutionStatus::parse(&status_text)
                            .unwrap_or(ExecutionStatus::Failure),
                        execution_time_ms: row.get::<_, i64>(3)? as u64,
                        selector_adaptations: row.get(4)?,
                        error_details: row.get(5)?,
                        snapshot_id: row.get(6)?,
                        confidence_score: row.get(7)?,
                        profile: row.get(8)?,
                        url: row.get(9)?,
                        timestamp: row.get(10)?,
                    })
                })?;
                rows.collect()
            })
            .await
    }

    /// Delete one scenario by name; executions cascade.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        let removed = self
            .store
            .query(move |conn| {
                conn.execute("DELETE FROM test_scenarios WHERE name = ?1", params![name])
            })
            .await?;
        Ok(removed > 0)
    }

    /// Delete every scenario whose tag list contains the given substring.
    pub async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let needle = format!("%{}%", tag);
        self.store
            .query(move |conn| {
                conn.execute(
                    "DELETE FROM test_scenarios WHERE tags LIKE ?1",
                    params![needle],
                )
            })
            .await
    }

    /// Delete the whole library. Requires explicit confirmation.
    pub async fn delete_all(&self, confirm: bool) -> Result<usize> {
        if !confirm {
            return Err(MemoryError::ConfirmationRequired(
                "deleting all scenarios".to_string(),
            ));
        }
        self.store
            .query(|conn| conn.execute("DELETE FROM test_scenarios", []))
            .await
    }

    pub async fn pattern(&self, pattern_hash: &str) -> Result<Option<InteractionPattern>> {
        let hash = pattern_hash.to_string();
        self.store
            .query(move |conn| {
                conn.query_row(
                    "SELECT pattern_hash, interaction_type, element_patterns,
                            success_indicators, adaptation_rules, confidence,
                            success_count, total_count, learned_from, created_at, last_used
                     FROM test_patterns WHERE pattern_hash = ?1",
                    params![hash],
                    pattern_from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn enhanced_key(&self, name: &str) -> Result<Option<EnhancedCacheKey>> {
        let name = name.to_string();
        self.store
            .query(move |conn| {
                conn.query_row(
                    "SELECT k.test_name_normalized, k.url_pattern, k.dom_signature,
                            k.steps_structure_hash, k.profile, k.version
                     FROM cache_keys_v2 k
                     JOIN test_scenarios s ON s.id = k.scenario_id
                     WHERE s.name = ?1",
                    params![name],
                    |row| {
                        Ok(EnhancedCacheKey {
                            test_name_normalized: row.get(0)?,
                            url_pattern: row.get(1)?,
                            dom_signature: row.get(2)?,
                            steps_structure_hash: row.get(3)?,
                            profile: row.get(4)?,
                            version: row.get::<_, i64>(5)? as u32,
                        })
                    },
                )
                .optional()
            })
            .await
    }

    /// Render one scenario as a portable YAML document.
    pub async fn export_yaml(&self, name: &str) -> Result<String> {
        let scenario = self
            .get(name)
            .await?
            .ok_or_else(|| MemoryError::ScenarioNotFound(name.to_string()))?;
        let file = ScenarioFile {
            name: scenario.name,
            description: scenario.description,
            steps: scenario.steps,
            tags: scenario.tags,
            profile: scenario.profile,
            url: scenario.url_pattern,
        };
        serde_yaml::to_string(&file).map_err(|e| MemoryError::Validation {
            message: format!("scenario not exportable: {e}"),
        })
    }

    /// Import a YAML document produced by `export_yaml` (or written by
    /// hand). Derived fields are recomputed.
    pub async fn import_yaml(&self, yaml: &str) -> Result<Scenario> {
        let file: ScenarioFile = serde_yaml::from_str(yaml).map_err(|e| MemoryError::Validation {
            message: format!("scenario YAML malformed: {e}"),
        })?;
        self.save(NewScenario {
            name: file.name,
            description: file.description,
            steps: file.steps,
            tags: file.tags,
            profile: file.profile,
            url: file.url,
        })
        .await
    }

    async fn scenario_id(&self, name: &str) -> Result<Option<i64>> {
        let name = name.to_string();
        self.store
            .query(move |conn| {
                conn.query_row(
                    "SELECT id FROM test_scenarios WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }
}

/// Portable on-disk scenario document.
#[derive(Debug, Serialize, Deserialize)]
struct ScenarioFile {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    steps: Vec<Step>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<String>,
    url: String,
}

const SELECT_SCENARIO: &str = "SELECT name, description, steps, pattern_hash, url_pattern, tags,
        profile, success_rate, total_runs, last_run, last_adapted, created_at, confidence
 FROM test_scenarios";

fn scenario_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Scenario> {
    let steps_json: String = row.get(2)?;
    let tags_json: String = row.get(5)?;
    Ok(Scenario {
        name: row.get(0)?,
        description: row.get(1)?,
        steps: serde_json::from_str(&steps_json).unwrap_or_default(),
        pattern_hash: row.get(3)?,
        url_pattern: row.get(4)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        profile: row.get(6)?,
        success_rate: row.get(7)?,
        total_runs: row.get(8)?,
        last_run: row.get(9)?,
        last_adapted: row.get(10)?,
        created_at: row.get(11)?,
        confidence: row.get(12)?,
    })
}

fn pattern_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InteractionPattern> {
    let element_patterns: String = row.get(2)?;
    let success_indicators: String = row.get(3)?;
    let adaptation_rules: String = row.get(4)?;
    Ok(InteractionPattern {
        pattern_hash: row.get(0)?,
        interaction_type: row.get(1)?,
        element_patterns: serde_json::from_str(&element_patterns).unwrap_or_default(),
        success_indicators: serde_json::from_str(&success_indicators).unwrap_or_default(),
        adaptation_rules: serde_json::from_str(&adaptation_rules).unwrap_or_default(),
        confidence: row.get(5)?,
        success_count: row.get(6)?,
        total_count: row.get(7)?,
        learned_from: row.get(8)?,
        created_at: row.get(9)?,
        last_used: row.get(10)?,
    })
}

/// Derive one interaction pattern per action present in the steps.
fn derive_patterns(steps: &[Step]) -> Vec<InteractionPattern> {
    let mut by_action: std::collections::BTreeMap<&'static str, Vec<String>> =
        std::collections::BTreeMap::new();
    let mut actions = std::collections::BTreeMap::new();
    for step in steps {
        let entry = by_action.entry(step.action.as_str()).or_default();
        if let Some(selector) = &step.selector {
            entry.push(selector.clone());
        } else if let Some(target) = &step.target {
            entry.push(target.clone());
        }
        if !step.description.is_empty() {
            entry.push(step.description.clone());
        }
        actions.insert(step.action.as_str(), step.action);
    }

    by_action
        .into_iter()
        .map(|(action_name, element_patterns)| {
            let action = actions[action_name];
            let hash_input = format!("{}|{}", action_name, element_patterns.join("|"));
            InteractionPattern {
                pattern_hash: truncated_sha256(&hash_input, 32),
                interaction_type: action_name.to_string(),
                element_patterns,
                success_indicators: action.success_indicators(),
                adaptation_rules: action.adaptation_rules(),
                confidence: 0.5,
                success_count: 0,
                total_count: 1,
                learned_from: Some("scenario-save".to_string()),
                created_at: 0,
                last_used: 0,
            }
        })
        .collect()
}

/// Two URL patterns belong to different environments when their host
/// portions differ.
fn is_cross_domain(a: &str, b: &str) -> bool {
    let host = |p: &str| p.split('/').next().unwrap_or("").to_string();
    host(a) != host(b)
}

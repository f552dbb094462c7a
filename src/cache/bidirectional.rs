//! Bidirectional selector cache.
//!
//! Maps (intent text, URL) to selectors through a four-tier lookup and
//! learns passively from every resolution. Mappings only exist while their
//! selector record exists; invalidation cascades and orphan records are
//! removed by the periodic cleanup task.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::snapshot::{decode_payload, encode_payload, SnapshotOptions, SnapshotScope};
use super::store::{unix_now, SqliteStore};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::normalizer::similarity::{fuzzy_admissible, semantic_jaccard_tokens};
use crate::normalizer::{md5_hex, normalize_intent, SmartNormalizer};
use crate::telemetry::{CacheTelemetry, TelemetrySnapshot};

/// Minimum reverse-lookup score for admission.
const REVERSE_SCORE_FLOOR: f64 = 0.15;
/// Reverse hits carry a 10% confidence penalty.
const REVERSE_CONFIDENCE_PENALTY: f64 = 0.9;
/// Existing mappings participate in related-input learning once their
/// success count reaches this.
const LEARNING_SUCCESS_FLOOR: i64 = 3;
/// Minimum shared-token ratio for an inferred mapping.
const LEARNING_RATIO_FLOOR: f64 = 0.7;

/// Which lookup tier produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupSource {
    Exact,
    Normalized,
    Reverse,
    Fuzzy,
}

/// A resolved selector with its confidence and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHit {
    pub selector: String,
    pub confidence: f64,
    pub source: LookupSource,
}

/// Row counts plus lookup counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub selector_records: u64,
    pub input_mappings: u64,
    pub snapshot_entries: u64,
    pub counters: TelemetrySnapshot,
}

/// Summary of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_mappings: usize,
    pub expired_snapshots: usize,
    pub pruned_variations: usize,
    pub orphaned_selectors: usize,
}

struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Persistent bidirectional cache over a shared SQLite store.
pub struct BidirectionalCache {
    store: Arc<SqliteStore>,
    normalizer: Arc<SmartNormalizer>,
    config: CacheConfig,
    telemetry: Arc<CacheTelemetry>,
    cleanup: StdMutex<Option<CleanupHandle>>,
}

impl BidirectionalCache {
    pub fn new(
        store: Arc<SqliteStore>,
        normalizer: Arc<SmartNormalizer>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            normalizer,
            config,
            telemetry: Arc::new(CacheTelemetry::default()),
            cleanup: StdMutex::new(None),
        }
    }

    pub fn telemetry(&self) -> Arc<CacheTelemetry> {
        self.telemetry.clone()
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }

    /// Four-tier lookup: exact, normalized, reverse, fuzzy. First hit wins;
    /// reverse and fuzzy hits are learned back as inferred mappings so the
    /// next read resolves on a direct tier.
    pub async fn get(&self, input: &str, url: &str) -> Result<Option<CacheHit>> {
        let intent = self.normalizer.normalize(input);

        if let Some((selector, confidence)) = self
            .lookup_direct("raw_input", input.to_string(), url.to_string())
            .await?
        {
            CacheTelemetry::bump(&self.telemetry.exact_hits);
            debug!(url, "cache hit: exact");
            return Ok(Some(CacheHit {
                selector,
                confidence,
                source: LookupSource::Exact,
            }));
        }

        if let Some((selector, confidence)) = self
            .lookup_direct(
                "normalized_input",
                intent.normalized.clone(),
                url.to_string(),
            )
            .await?
        {
            CacheTelemetry::bump(&self.telemetry.normalized_hits);
            debug!(url, "cache hit: normalized");
            return Ok(Some(CacheHit {
                selector,
                confidence,
                source: LookupSource::Normalized,
            }));
        }

        if let Some((selector, confidence)) = self
            .lookup_reverse(intent.tokens.clone(), url.to_string())
            .await?
        {
            CacheTelemetry::bump(&self.telemetry.reverse_hits);
            debug!(url, "cache hit: reverse");
            self.learn_resolution(input, url, &selector, confidence)
                .await?;
            return Ok(Some(CacheHit {
                selector,
                confidence,
                source: LookupSource::Reverse,
            }));
        }

        if let Some((selector, confidence)) = self
            .lookup_fuzzy(intent.normalized.clone(), url.to_string())
            .await?
        {
            CacheTelemetry::bump(&self.telemetry.fuzzy_hits);
            debug!(url, "cache hit: fuzzy");
            self.learn_resolution(input, url, &selector, confidence)
                .await?;
            return Ok(Some(CacheHit {
                selector,
                confidence,
                source: LookupSource::Fuzzy,
            }));
        }

        CacheTelemetry::bump(&self.telemetry.misses);
        Ok(None)
    }

    /// Learn a (input, url) -> selector association. One transaction:
    /// concurrent readers observe either the prior state or the committed
    /// new state. Related-input learning runs afterwards in the background.
    pub async fn set(&self, input: &str, url: &str, selector: &str) -> Result<()> {
        let intent = self.normalizer.normalize(input);
        let selector_hash = md5_hex(selector);
        let tokens_json =
            serde_json::to_string(&intent.tokens).unwrap_or_else(|_| "[]".to_string());

        let now = unix_now();
        let hash = selector_hash.clone();
        let selector_owned = selector.to_string();
        let url_owned = url.to_string();
        let input_owned = input.to_string();
        let normalized = intent.normalized.clone();

        self.store
            .transaction(move |conn| {
                conn.execute(
                    "INSERT INTO selector_cache_v2
                         (selector_hash, selector, url, confidence, created_at, last_used, use_count)
                     VALUES (?1, ?2, ?3, 0.5, ?4, ?4, 1)
                     ON CONFLICT(selector_hash) DO UPDATE SET
                         last_used = ?4,
                         use_count = use_count + 1,
                         confidence = MIN(confidence * 1.02, 1.0)",
                    params![hash, selector_owned, url_owned, now],
                )?;
                conn.execute(
                    "INSERT INTO input_mappings
                         (selector_hash, raw_input, normalized_input, tokens, url,
                          success_count, last_used, confidence, learned_from)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, 0.5, 'direct')
                     ON CONFLICT(selector_hash, normalized_input, url) DO UPDATE SET
                         success_count = success_count + 1,
                         confidence = MIN(confidence * 1.05, 1.0),
                         last_used = ?6,
                         raw_input = CASE
                             WHEN length(excluded.raw_input) > length(raw_input)
                             THEN excluded.raw_input
                             ELSE raw_input
                         END",
                    params![hash, input_owned, normalized, tokens_json, url_owned, now],
                )?;
                Ok(())
            })
            .await?;

        // Cross-pollinate phrasings sharing this selector off the hot path.
        let store = self.store.clone();
        let telemetry = self.telemetry.clone();
        let hash = selector_hash;
        let input = input.to_string();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = learn_related_inputs(store, telemetry, hash, input, url).await {
                debug!(error = %e, "related-input learning skipped");
            }
        });

        Ok(())
    }

    /// Remove every mapping for (selector, url); the selector record goes
    /// too once nothing references it anywhere.
    pub async fn invalidate(&self, selector: &str, url: &str) -> Result<usize> {
        let hash = md5_hex(selector);
        let url = url.to_string();
        let removed = self
            .store
            .transaction(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM input_mappings WHERE selector_hash = ?1 AND url = ?2",
                    params![hash, url],
                )?;
                let remaining: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM input_mappings WHERE selector_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )?;
                if remaining == 0 {
                    conn.execute(
                        "DELETE FROM selector_cache_v2 WHERE selector_hash = ?1",
                        params![hash],
                    )?;
                }
                Ok(removed)
            })
            .await?;
        CacheTelemetry::bump(&self.telemetry.invalidations);
        info!(selector, removed, "selector invalidated");
        Ok(removed)
    }

    /// Related-input learning, exposed for deterministic tests; `set`
    /// schedules the same work in the background.
    pub async fn learn_related_now(&self, selector: &str, input: &str, url: &str) -> Result<usize> {
        learn_related_inputs(
            self.store.clone(),
            self.telemetry.clone(),
            md5_hex(selector),
            input.to_string(),
            url.to_string(),
        )
        .await
    }

    // --- snapshot sub-cache ---

    pub async fn set_snapshot(
        &self,
        key: &str,
        payload: &[u8],
        options: SnapshotOptions,
    ) -> Result<()> {
        let blob = encode_payload(payload)?;
        let now = unix_now();
        let ttl = options
            .ttl
            .unwrap_or(self.config.snapshot_ttl.as_secs()) as i64;
        let key = key.to_string();
        self.store
            .query(move |conn| {
                conn.execute(
                    "INSERT INTO snapshot_cache
                         (cache_key, url, dom_hash, payload, viewport, profile,
                          created_at, last_used, ttl, hit_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, 0)
                     ON CONFLICT(cache_key) DO UPDATE SET
                         url = excluded.url,
                         dom_hash = excluded.dom_hash,
                         payload = excluded.payload,
                         viewport = excluded.viewport,
                         profile = excluded.profile,
                         created_at = ?7,
                         last_used = ?7,
                         ttl = ?8",
                    params![
                        key,
                        options.url,
                        options.dom_hash.unwrap_or_default(),
                        blob,
                        options.viewport,
                        options.profile,
                        now,
                        ttl,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Profile isolation is enforced at read time: a request with profile P
    /// matches rows with profile P or NULL; a request without a profile
    /// matches only NULL rows. Expired rows read as absent.
    pub async fn get_snapshot(&self, key: &str, profile: Option<&str>) -> Result<Option<Vec<u8>>> {
        let now = unix_now();
        let key_owned = key.to_string();
        let profile_owned = profile.map(str::to_string);
        let row = self
            .store
            .query(move |conn| {
                let result: Option<(i64, Vec<u8>)> = match &profile_owned {
                    Some(p) => conn
                        .query_row(
                            "SELECT id, payload FROM snapshot_cache
                             WHERE cache_key = ?1
                               AND (profile = ?2 OR profile IS NULL)
                               AND created_at + ttl >= ?3",
                            params![key_owned, p, now],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?,
                    None => conn
                        .query_row(
                            "SELECT id, payload FROM snapshot_cache
                             WHERE cache_key = ?1
                               AND profile IS NULL
                               AND created_at + ttl >= ?2",
                            params![key_owned, now],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?,
                };
                if let Some((id, _)) = &result {
                    conn.execute(
                        "UPDATE snapshot_cache
                         SET last_used = ?1, hit_count = hit_count + 1
                         WHERE id = ?2",
                        params![now, id],
                    )?;
                }
                Ok(result)
            })
            .await?;

        let Some((id, blob)) = row else {
            CacheTelemetry::bump(&self.telemetry.snapshot_misses);
            return Ok(None);
        };

        match decode_payload(&blob) {
            Ok(payload) => {
                CacheTelemetry::bump(&self.telemetry.snapshot_hits);
                Ok(Some(payload))
            }
            Err(e) => {
                // A corrupt blob is useless; drop the row and report a miss.
                warn!(key, error = %e, "snapshot payload corrupt, deleting");
                self.store
                    .query(move |conn| {
                        conn.execute("DELETE FROM snapshot_cache WHERE id = ?1", params![id])
                    })
                    .await?;
                CacheTelemetry::bump(&self.telemetry.snapshot_misses);
                Ok(None)
            }
        }
    }

    pub async fn invalidate_snapshots(&self, scope: SnapshotScope) -> Result<usize> {
        self.store
            .query(move |conn| match (&scope.url, &scope.profile) {
                (Some(url), Some(profile)) => conn.execute(
                    "DELETE FROM snapshot_cache WHERE url = ?1 AND profile = ?2",
                    params![url, profile],
                ),
                (Some(url), None) => {
                    conn.execute("DELETE FROM snapshot_cache WHERE url = ?1", params![url])
                }
                (None, Some(profile)) => conn.execute(
                    "DELETE FROM snapshot_cache WHERE profile = ?1",
                    params![profile],
                ),
                (None, None) => conn.execute("DELETE FROM snapshot_cache", []),
            })
            .await
    }

    // --- maintenance ---

    /// One cleanup pass: TTL expiry, variation pruning, orphan removal.
    pub async fn cleanup_pass(&self) -> Result<CleanupReport> {
        let now = unix_now();
        let selector_ttl = self.config.selector_ttl.as_secs() as i64;
        let max_variations = self.config.max_variations_per_selector as i64;

        let report = self
            .store
            .transaction(move |conn| {
                let expired_mappings = conn.execute(
                    "DELETE FROM input_mappings WHERE last_used + ?1 < ?2",
                    params![selector_ttl, now],
                )?;
                let expired_snapshots = conn.execute(
                    "DELETE FROM snapshot_cache WHERE created_at + ttl < ?1",
                    params![now],
                )?;
                let pruned_variations = conn.execute(
                    "DELETE FROM input_mappings WHERE id IN (
                         SELECT id FROM (
                             SELECT id, ROW_NUMBER() OVER (
                                 PARTITION BY selector_hash, url
                                 ORDER BY confidence DESC, success_count DESC, last_used DESC
                             ) AS rn
                             FROM input_mappings
                         ) ranked WHERE ranked.rn > ?1
                     )",
                    params![max_variations],
                )?;
                let orphaned_selectors = conn.execute(
                    "DELETE FROM selector_cache_v2 WHERE selector_hash NOT IN (
                         SELECT DISTINCT selector_hash FROM input_mappings
                     )",
                    [],
                )?;
                Ok(CleanupReport {
                    expired_mappings,
                    expired_snapshots,
                    pruned_variations,
                    orphaned_selectors,
                })
            })
            .await?;

        if report.expired_mappings + report.expired_snapshots + report.pruned_variations > 0 {
            info!(
                expired_mappings = report.expired_mappings,
                expired_snapshots = report.expired_snapshots,
                pruned = report.pruned_variations,
                orphans = report.orphaned_selectors,
                "cache cleanup pass finished"
            );
        }
        Ok(report)
    }

    /// Start the periodic cleanup task. Cancellation on shutdown is
    /// cooperative; `close` awaits the task.
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut guard = match self.cleanup.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = self.clone();
        let interval = self.config.cleanup_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.cleanup_pass().await {
                            warn!(error = %e, "cleanup pass failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *guard = Some(CleanupHandle {
            shutdown: shutdown_tx,
            task,
        });
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let (selector_records, input_mappings, snapshot_entries) = self
            .store
            .query(|conn| {
                let selectors: i64 =
                    conn.query_row("SELECT COUNT(*) FROM selector_cache_v2", [], |r| r.get(0))?;
                let mappings: i64 =
                    conn.query_row("SELECT COUNT(*) FROM input_mappings", [], |r| r.get(0))?;
                let snapshots: i64 =
                    conn.query_row("SELECT COUNT(*) FROM snapshot_cache", [], |r| r.get(0))?;
                Ok((selectors, mappings, snapshots))
            })
            .await?;
        Ok(CacheStats {
            selector_records: selector_records as u64,
            input_mappings: input_mappings as u64,
            snapshot_entries: snapshot_entries as u64,
            counters: self.telemetry.snapshot(),
        })
    }

    /// Drop every cached row. Scenario tables are untouched.
    pub async fn clear(&self) -> Result<()> {
        self.store
            .query(|conn| {
                conn.execute("DELETE FROM input_mappings", [])?;
                conn.execute("DELETE FROM selector_cache_v2", [])?;
                conn.execute("DELETE FROM snapshot_cache", [])?;
                Ok(())
            })
            .await
    }

    /// Stop background work. Idempotent.
    pub async fn close(&self) {
        let handle = {
            let mut guard = match self.cleanup.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
    }

    // --- lookup tiers ---

    async fn lookup_direct(
        &self,
        column: &'static str,
        needle: String,
        url: String,
    ) -> Result<Option<(String, f64)>> {
        let now = unix_now();
        self.store
            .query(move |conn| {
                let sql = format!(
                    "SELECT m.id, m.selector_hash, s.selector, m.confidence
                     FROM input_mappings m
                     JOIN selector_cache_v2 s ON s.selector_hash = m.selector_hash
                     WHERE m.{column} = ?1 AND m.url = ?2
                     ORDER BY m.confidence DESC, m.success_count DESC
                     LIMIT 1"
                );
                let row = conn
                    .query_row(&sql, params![needle, url], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, f64>(3)?,
                        ))
                    })
                    .optional()?;
                match row {
                    Some((id, hash, selector, confidence)) => {
                        touch(conn, id, &hash, now)?;
                        Ok(Some((selector, confidence)))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Reverse tier: token-overlap search across stored mappings for this
    /// URL, boosted by success history. The winner must clear the score
    /// floor; its confidence is returned with the reverse penalty applied.
    async fn lookup_reverse(
        &self,
        query_tokens: Vec<String>,
        url: String,
    ) -> Result<Option<(String, f64)>> {
        if query_tokens.is_empty() {
            return Ok(None);
        }
        let now = unix_now();
        let limit = self.config.reverse_candidates as i64;
        self.store
            .query(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.id, m.selector_hash, s.selector, m.tokens,
                            m.success_count, m.confidence
                     FROM input_mappings m
                     JOIN selector_cache_v2 s ON s.selector_hash = m.selector_hash
                     WHERE m.url = ?1 AND m.tokens NOT IN ('', '[]')
                     ORDER BY m.confidence DESC, m.success_count DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![url, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, f64>(5)?,
                    ))
                })?;

                let mut best: Option<(i64, String, String, f64, f64)> = None;
                let mut seen_hashes = std::collections::HashSet::new();
                for row in rows {
                    let (id, hash, selector, tokens_json, success_count, confidence) = row?;
                    if !seen_hashes.insert(hash.clone()) {
                        continue;
                    }
                    // A malformed tokens column disqualifies the row, not
                    // the lookup.
                    let tokens: Vec<String> = match serde_json::from_str(&tokens_json) {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    if tokens.is_empty() {
                        continue;
                    }
                    let similarity = semantic_jaccard_tokens(&query_tokens, &tokens);
                    let boost = 1.0 + ((1.0 + success_count as f64).ln() * 0.1);
                    let score = similarity * boost * confidence;
                    let current_best = best.as_ref().map(|b| b.4).unwrap_or(REVERSE_SCORE_FLOOR);
                    if score > current_best {
                        best = Some((id, hash, selector, confidence, score));
                    }
                }

                match best {
                    Some((id, hash, selector, confidence, _)) => {
                        touch(conn, id, &hash, now)?;
                        Ok(Some((selector, confidence * REVERSE_CONFIDENCE_PENALTY)))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Fuzzy tier: Damerau-Levenshtein over recently used candidates.
    async fn lookup_fuzzy(
        &self,
        query_normalized: String,
        url: String,
    ) -> Result<Option<(String, f64)>> {
        let now = unix_now();
        let recency_floor = now - self.config.fuzzy_recency.as_secs() as i64;
        let limit = self.config.fuzzy_candidates as i64;
        self.store
            .query(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.id, m.selector_hash, s.selector, m.normalized_input, m.confidence
                     FROM input_mappings m
                     JOIN selector_cache_v2 s ON s.selector_hash = m.selector_hash
                     WHERE m.url = ?1 AND m.last_used > ?2
                     ORDER BY m.confidence DESC, m.success_count DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![url, recency_floor, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                })?;

                for row in rows {
                    let (id, hash, selector, candidate_normalized, confidence) = row?;
                    if let Some(distance) =
                        fuzzy_admissible(&query_normalized, &candidate_normalized)
                    {
                        touch(conn, id, &hash, now)?;
                        let adjusted = confidence * (1.0 - distance as f64 / 10.0);
                        return Ok(Some((selector, adjusted)));
                    }
                }
                Ok(None)
            })
            .await
    }

    /// Materialize an indirect hit as a direct mapping for the queried
    /// phrasing.
    async fn learn_resolution(
        &self,
        input: &str,
        url: &str,
        selector: &str,
        confidence: f64,
    ) -> Result<()> {
        let intent = self.normalizer.normalize(input);
        let hash = md5_hex(selector);
        let tokens_json =
            serde_json::to_string(&intent.tokens).unwrap_or_else(|_| "[]".to_string());
        let now = unix_now();
        let input = input.to_string();
        let url = url.to_string();
        let normalized = intent.normalized.clone();
        let inserted = self
            .store
            .query(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO input_mappings
                         (selector_hash, raw_input, normalized_input, tokens, url,
                          success_count, last_used, confidence, learned_from)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, 'inferred')",
                    params![hash, input, normalized, tokens_json, url, now, confidence],
                )
            })
            .await?;
        if inserted > 0 {
            CacheTelemetry::bump(&self.telemetry.learned_mappings);
        }
        Ok(())
    }
}

fn touch(conn: &Connection, mapping_id: i64, selector_hash: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE selector_cache_v2
         SET last_used = ?1, use_count = use_count + 1
         WHERE selector_hash = ?2",
        params![now, selector_hash],
    )?;
    conn.execute(
        "UPDATE input_mappings SET last_used = ?1 WHERE id = ?2",
        params![now, mapping_id],
    )?;
    Ok(())
}

/// Cross-pollinate phrasings: mappings with strong success history that
/// share this selector contribute their common tokens as a new pattern
/// mapping, when the overlap is high enough to be trustworthy.
async fn learn_related_inputs(
    store: Arc<SqliteStore>,
    telemetry: Arc<CacheTelemetry>,
    selector_hash: String,
    new_input: String,
    url: String,
) -> Result<usize> {
    let learned = store
        .transaction(move |conn| {
            let new_tokens = normalize_intent(&new_input).tokens;
            if new_tokens.is_empty() {
                return Ok(0);
            }

            let mut stmt = conn.prepare(
                "SELECT raw_input FROM input_mappings
                 WHERE selector_hash = ?1 AND raw_input != ?2 AND success_count >= ?3",
            )?;
            let existing: Vec<String> = stmt
                .query_map(
                    params![selector_hash, new_input, LEARNING_SUCCESS_FLOOR],
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<_>>()?;

            let now = unix_now();
            let mut learned = 0usize;
            for raw in existing {
                let existing_tokens = normalize_intent(&raw).tokens;
                let common: Vec<String> = new_tokens
                    .iter()
                    .filter(|t| existing_tokens.contains(t))
                    .cloned()
                    .collect();
                if common.len() < 2 {
                    continue;
                }
                let ratio =
                    common.len() as f64 / new_tokens.len().max(existing_tokens.len()) as f64;
                if ratio <= LEARNING_RATIO_FLOOR {
                    continue;
                }

                let phrase = common.join(" ");
                let normalized = normalize_intent(&phrase);
                let tokens_json = serde_json::to_string(&normalized.tokens)
                    .unwrap_or_else(|_| "[]".to_string());
                // Uniqueness collisions are expected here and ignored.
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO input_mappings
                         (selector_hash, raw_input, normalized_input, tokens, url,
                          success_count, last_used, confidence, learned_from)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, 'pattern')",
                    params![
                        selector_hash,
                        phrase,
                        normalized.normalized,
                        tokens_json,
                        url,
                        now,
                        ratio,
                    ],
                )?;
                learned += inserted;
            }
            Ok(learned)
        })
        .await?;

    for _ in 0..learned {
        CacheTelemetry::bump(&telemetry.learned_mappings);
    }
    Ok(learned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn test_cache() -> BidirectionalCache {
        BidirectionalCache::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(SmartNormalizer::new()),
            CacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_set_get_round_trip_is_exact() {
        let cache = test_cache();
        cache
            .set("Click Add Todo button", "http://x/", "button[data-testid='add-todo']")
            .await
            .unwrap();

        let hit = cache
            .get("Click Add Todo button", "http://x/")
            .await
            .unwrap()
            .expect("seeded mapping should resolve");
        assert_eq!(hit.selector, "button[data-testid='add-todo']");
        assert_eq!(hit.source, LookupSource::Exact);
        assert!(hit.confidence >= 0.5);
    }

    #[tokio::test]
    async fn test_paraphrase_hits_normalized_tier() {
        let cache = test_cache();
        cache
            .set("Click Add Todo button", "http://x/", "button[data-testid='add-todo']")
            .await
            .unwrap();

        let hit = cache
            .get("press Add Todo button", "http://x/")
            .await
            .unwrap()
            .expect("paraphrase should resolve");
        assert_eq!(hit.selector, "button[data-testid='add-todo']");
        assert_eq!(hit.source, LookupSource::Normalized);
    }

    #[tokio::test]
    async fn test_reverse_tier_with_semantic_overlap() {
        let cache = test_cache();
        let selector = "button#new-task";
        cache.set("add todo", "http://x/", selector).await.unwrap();
        cache.set("add task", "http://x/", selector).await.unwrap();
        cache
            .set("create todo", "http://x/", selector)
            .await
            .unwrap();

        let hit = cache
            .get("create a new task", "http://x/")
            .await
            .unwrap()
            .expect("semantic overlap should resolve");
        assert_eq!(hit.selector, selector);
        assert_eq!(hit.source, LookupSource::Reverse);

        // reverse carries the 10% penalty over the winning mapping
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.counters.reverse_hits, 1);
    }

    #[tokio::test]
    async fn test_reverse_hit_is_learned_for_next_read() {
        let cache = test_cache();
        let selector = "button#new-task";
        cache.set("add todo", "http://x/", selector).await.unwrap();
        cache.set("add task", "http://x/", selector).await.unwrap();

        let first = cache
            .get("create a new task", "http://x/")
            .await
            .unwrap()
            .expect("first read resolves via reverse");
        assert_eq!(first.source, LookupSource::Reverse);

        let second = cache
            .get("create a new task", "http://x/")
            .await
            .unwrap()
            .expect("second read resolves directly");
        assert!(matches!(
            second.source,
            LookupSource::Exact | LookupSource::Normalized
        ));
        assert!(second.confidence >= first.confidence);
    }

    #[tokio::test]
    async fn test_fuzzy_tier_tolerates_typos() {
        let cache = test_cache();
        cache
            .set("click the subscription button", "http://x/", "#subscribe")
            .await
            .unwrap();

        // the typo'd token shares no tokens with the stored mapping, so the
        // reverse tier passes and Damerau-Levenshtein resolves it
        let hit = cache
            .get("click the subscirption button", "http://x/")
            .await
            .unwrap()
            .expect("single transposition should resolve");
        assert_eq!(hit.selector, "#subscribe");
        assert_eq!(hit.source, LookupSource::Fuzzy);
    }

    #[tokio::test]
    async fn test_invalidate_removes_all_tiers() {
        let cache = test_cache();
        let selector = "button#add";
        cache
            .set("Click Add Todo button", "http://x/", selector)
            .await
            .unwrap();
        cache.invalidate(selector, "http://x/").await.unwrap();

        assert!(cache
            .get("Click Add Todo button", "http://x/")
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .get("press add todo", "http://x/")
            .await
            .unwrap()
            .is_none());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.selector_records, 0);
        assert_eq!(stats.input_mappings, 0);
    }

    #[tokio::test]
    async fn test_invalidate_keeps_selector_for_other_urls() {
        let cache = test_cache();
        let selector = "button#add";
        cache.set("add todo", "http://x/", selector).await.unwrap();
        cache.set("add todo", "http://y/", selector).await.unwrap();
        cache.invalidate(selector, "http://x/").await.unwrap();

        assert!(cache.get("add todo", "http://x/").await.unwrap().is_none());
        assert!(cache.get("add todo", "http://y/").await.unwrap().is_some());
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.selector_records, 1);
    }

    #[tokio::test]
    async fn test_confidence_grows_on_repeat_sets() {
        let cache = test_cache();
        cache.set("add todo", "http://x/", "#a").await.unwrap();
        let first = cache.get("add todo", "http://x/").await.unwrap().unwrap();
        cache.set("add todo", "http://x/", "#a").await.unwrap();
        let second = cache.get("add todo", "http://x/").await.unwrap().unwrap();
        assert!(second.confidence > first.confidence);
        assert!(second.confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_longer_raw_input_displaces_terser_one() {
        let cache = test_cache();
        cache.set("add todo", "http://x/", "#a").await.unwrap();
        cache
            .set("add todo right now please", "http://x/", "#a")
            .await
            .unwrap();

        // different normalized forms, so check via direct SQL
        let raw: String = cache
            .store()
            .query(|conn| {
                conn.query_row(
                    "SELECT raw_input FROM input_mappings WHERE normalized_input = 'add todo'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(raw, "add todo");

        // colliding normalized form with a longer phrasing displaces raw
        cache
            .set("press the add todo button", "http://x/", "#a")
            .await
            .unwrap();
        let raw: String = cache
            .store()
            .query(|conn| {
                conn.query_row(
                    "SELECT raw_input FROM input_mappings WHERE normalized_input = 'add todo'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(raw, "press the add todo button");
    }

    #[tokio::test]
    async fn test_related_input_learning_materializes_pattern() {
        let cache = test_cache();
        let selector = "#add";
        // build success history
        for _ in 0..3 {
            cache
                .set("add new todo entry", "http://x/", selector)
                .await
                .unwrap();
        }
        let learned = cache
            .learn_related_now(selector, "add new todo item", "http://x/")
            .await
            .unwrap();
        assert!(learned >= 1);

        let pattern_count: i64 = cache
            .store()
            .query(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM input_mappings WHERE learned_from = 'pattern'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert!(pattern_count >= 1);
    }

    #[tokio::test]
    async fn test_snapshot_profile_isolation() {
        let cache = test_cache();
        cache
            .set_snapshot(
                "page-1",
                b"payload-dev",
                SnapshotOptions {
                    profile: Some("dev".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // request without profile must not see the dev row
        assert!(cache.get_snapshot("page-1", None).await.unwrap().is_none());
        // matching profile sees it
        assert_eq!(
            cache.get_snapshot("page-1", Some("dev")).await.unwrap(),
            Some(b"payload-dev".to_vec())
        );

        // NULL-profile rows are visible to any profile
        cache
            .set_snapshot("page-2", b"shared", SnapshotOptions::default())
            .await
            .unwrap();
        assert_eq!(
            cache.get_snapshot("page-2", Some("dev")).await.unwrap(),
            Some(b"shared".to_vec())
        );
    }

    #[tokio::test]
    async fn test_snapshot_ttl_expiry_reads_as_absent() {
        let cache = test_cache();
        cache
            .set_snapshot(
                "stale",
                b"old",
                SnapshotOptions {
                    ttl: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // created_at + 0 < now once a second has passed; force it by
        // backdating the row
        cache
            .store()
            .query(|conn| {
                conn.execute(
                    "UPDATE snapshot_cache SET created_at = created_at - 10",
                    [],
                )
            })
            .await
            .unwrap();
        assert!(cache.get_snapshot("stale", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_deleted_on_read() {
        let cache = test_cache();
        cache
            .set_snapshot("page", b"fine", SnapshotOptions::default())
            .await
            .unwrap();
        cache
            .store()
            .query(|conn| {
                conn.execute(
                    "UPDATE snapshot_cache SET payload = X'DEAD' WHERE cache_key = 'page'",
                    [],
                )
            })
            .await
            .unwrap();

        assert!(cache.get_snapshot("page", None).await.unwrap().is_none());
        let remaining: i64 = cache
            .store()
            .query(|conn| {
                conn.query_row("SELECT COUNT(*) FROM snapshot_cache", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_cleanup_prunes_excess_variations() {
        let mut config = CacheConfig::default();
        config.max_variations_per_selector = 2;
        let cache = BidirectionalCache::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(SmartNormalizer::new()),
            config,
        );

        let selector = "#add";
        for phrase in ["add todo", "create todo", "insert todo", "new todo entry"] {
            cache.set(phrase, "http://x/", selector).await.unwrap();
        }

        let report = cache.cleanup_pass().await.unwrap();
        assert!(report.pruned_variations >= 1);

        let stats = cache.stats().await.unwrap();
        assert!(stats.input_mappings <= 2);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_orphans() {
        let mut config = CacheConfig::default();
        config.selector_ttl = std::time::Duration::from_secs(100);
        let cache = BidirectionalCache::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(SmartNormalizer::new()),
            config,
        );
        cache.set("add todo", "http://x/", "#a").await.unwrap();
        cache
            .store()
            .query(|conn| {
                conn.execute("UPDATE input_mappings SET last_used = last_used - 1000", [])
            })
            .await
            .unwrap();

        let report = cache.cleanup_pass().await.unwrap();
        assert_eq!(report.expired_mappings, 1);
        assert_eq!(report.orphaned_selectors, 1);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.selector_records, 0);
    }

    #[tokio::test]
    async fn test_malformed_tokens_row_is_skipped_not_fatal() {
        let cache = test_cache();
        cache.set("add todo", "http://x/", "#a").await.unwrap();
        cache.set("create task", "http://x/", "#b").await.unwrap();
        // corrupt one candidate's tokens column
        cache
            .store()
            .query(|conn| {
                conn.execute(
                    "UPDATE input_mappings SET tokens = '{broken' WHERE selector_hash IN (
                         SELECT selector_hash FROM selector_cache_v2 WHERE selector = '#a'
                     )",
                    [],
                )
            })
            .await
            .unwrap();

        // reverse lookup still succeeds through the intact row
        let hit = cache
            .get("make a new task", "http://x/")
            .await
            .unwrap()
            .expect("intact candidate should still resolve");
        assert_eq!(hit.selector, "#b");
    }

    #[tokio::test]
    async fn test_miss_is_counted() {
        let cache = test_cache();
        assert!(cache.get("never seen", "http://x/").await.unwrap().is_none());
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.counters.misses, 1);
    }
}

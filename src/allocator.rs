#![forbid(unsafe_code)]

//! Sequence allocator: collision-free formatted identifiers per
//! (category, formatted pattern).
//!
//! Identifiers are reserved from the persisted
//! [`BarcodeSequence`](crate::model::BarcodeSequence) row in batches and
//! handed out from an in-memory pool. Each reservation reads and advances the
//! row in one atomic backend step, reconciling it against the highest
//! identifier already present in committed records, so ids created outside
//! the allocator are never reused.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use time::{Date, OffsetDateTime};
use tracing::{debug, trace, warn};

use crate::cache::{Cache, PoolKey};
use crate::config::AllocatorConfig;
use crate::error::{Result, TrackError};
use crate::model::{ContainerType, SequenceCategory};
use crate::store::{Backend, Record, RecordKey};

/// Prefix of allocated location codes.
pub const LOCATION_CODE_PREFIX: &str = "L";

/// Values substituted into pattern placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternContext {
    /// Code of the study the identifier is issued for (`{StudyId}`).
    pub study_code: Option<String>,
    /// Calendar date used by `{YY}`, `{YYYY}`, `{MM}` and `{DD}`.
    pub date: Date,
}

impl PatternContext {
    /// Context for today's UTC date without a study.
    pub fn today() -> Self {
        Self::on(OffsetDateTime::now_utc().date())
    }

    /// Context for a fixed date without a study.
    pub fn on(date: Date) -> Self {
        Self {
            study_code: None,
            date,
        }
    }

    /// Adds a study code.
    pub fn with_study(mut self, study_code: impl Into<String>) -> Self {
        self.study_code = Some(study_code.into());
        self
    }
}

/// Expands placeholders in `pattern` and appends a run of `default_digits`
/// `#` when the result has no numeric run.
///
/// Deterministic for a fixed pattern, context and digit count.
pub fn format_pattern(pattern: &str, ctx: &PatternContext, default_digits: usize) -> String {
    let year = ctx.date.year();
    let mut out = pattern
        .replace("{StudyId}", ctx.study_code.as_deref().unwrap_or(""))
        .replace("{YYYY}", &format!("{year:04}"))
        .replace("{YY}", &format!("{:02}", year.rem_euclid(100)))
        .replace("{MM}", &format!("{:02}", u8::from(ctx.date.month())))
        .replace("{DD}", &format!("{:02}", ctx.date.day()));
    if !out.contains('#') {
        out.push_str(&"#".repeat(default_digits.max(1)));
    }
    out
}

/// A formatted pattern split around its last `#` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternParts {
    /// Literal text before the numeric run.
    pub head: String,
    /// Minimum number of digits.
    pub width: usize,
    /// Literal text after the numeric run.
    pub tail: String,
}

impl PatternParts {
    /// Splits a formatted pattern. `None` when it has no `#`.
    pub fn parse(formatted: &str) -> Option<Self> {
        let end = formatted.rfind('#')? + 1;
        let start = formatted[..end]
            .trim_end_matches('#')
            .len();
        Some(Self {
            head: formatted[..start].to_string(),
            width: end - start,
            tail: formatted[end..].to_string(),
        })
    }

    /// Renders the identifier carrying `value`.
    pub fn render(&self, value: u64) -> String {
        format!("{}{:0width$}{}", self.head, value, self.tail, width = self.width)
    }

    /// Numeric body of `identifier`, when it matches this pattern.
    pub fn value_of(&self, identifier: &str) -> Option<u64> {
        let body = identifier
            .strip_prefix(self.head.as_str())?
            .strip_suffix(self.tail.as_str())?;
        if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        body.parse().ok()
    }
}

struct Pool {
    queue: VecDeque<String>,
    /// Highest value this process has reserved for the key.
    high_water: u64,
}

/// Issues formatted identifiers.
///
/// Pools are process-wide and not linked to any transaction: call
/// [`SequenceAllocator::reset`] after a rollback or whenever persisted state
/// may have diverged.
pub struct SequenceAllocator {
    backend: Arc<dyn Backend>,
    config: AllocatorConfig,
    observed: Arc<Cache<PoolKey, u64>>,
    pools: Mutex<FxHashMap<PoolKey, Arc<Mutex<Pool>>>>,
}

impl SequenceAllocator {
    /// Creates an allocator over `backend`. `observed` memoises the highest
    /// identifier found in committed records per key.
    pub fn new(
        backend: Arc<dyn Backend>,
        config: AllocatorConfig,
        observed: Arc<Cache<PoolKey, u64>>,
    ) -> Self {
        Self {
            backend,
            config,
            observed,
            pools: Mutex::new(FxHashMap::default()),
        }
    }

    /// Allocator settings.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Formats `pattern` with the configured default digit count.
    pub fn format_pattern(&self, pattern: &str, ctx: &PatternContext) -> String {
        format_pattern(pattern, ctx, self.config.default_digits)
    }

    /// Returns the next identifier for (`category`, `pattern`).
    pub fn next_id(
        &self,
        category: SequenceCategory,
        pattern: &str,
        ctx: &PatternContext,
    ) -> Result<String> {
        let mut ids = self.next_ids(category, pattern, ctx, 1)?;
        ids.pop().ok_or_else(|| TrackError::Allocation {
            pattern: pattern.to_string(),
            reason: "empty reservation".into(),
        })
    }

    /// Returns `count` consecutive identifiers for (`category`, `pattern`).
    pub fn next_ids(
        &self,
        category: SequenceCategory,
        pattern: &str,
        ctx: &PatternContext,
        count: usize,
    ) -> Result<Vec<String>> {
        let formatted = self.format_pattern(pattern, ctx);
        let parts = PatternParts::parse(&formatted).ok_or_else(|| TrackError::Allocation {
            pattern: formatted.clone(),
            reason: "no numeric placeholder".into(),
        })?;
        let key = PoolKey::new(category, formatted);
        let pool = self.pool(&key);
        let mut pool = pool.lock();
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match pool.queue.pop_front() {
                Some(id) => out.push(id),
                None => self.refill(&key, &parts, &mut pool)?,
            }
        }
        trace!(category = %category, pattern = %key.pattern, count, "allocator.issue");
        Ok(out)
    }

    /// Next sample id for a biotype prefix.
    pub fn next_sample_id(&self, prefix: &str, ctx: &PatternContext) -> Result<String> {
        self.next_id(SequenceCategory::Sample, prefix, ctx)
    }

    /// Next container id for `container_type`.
    pub fn next_container_id(&self, container_type: ContainerType) -> Result<String> {
        self.next_id(
            SequenceCategory::Container,
            container_type.prefix(),
            &PatternContext::today(),
        )
    }

    /// Next location scan code.
    pub fn next_location_code(&self) -> Result<String> {
        self.next_id(
            SequenceCategory::Location,
            LOCATION_CODE_PREFIX,
            &PatternContext::today(),
        )
    }

    /// Number of identifiers waiting in the pool of `key`.
    pub fn pooled(&self, key: &PoolKey) -> usize {
        let pool = self.pools.lock().get(key).cloned();
        pool.map_or(0, |pool| pool.lock().queue.len())
    }

    /// Drops every queued identifier and memoised observed maximum.
    ///
    /// High-water marks survive, so identifiers handed out by this process
    /// are never issued again even when hole correction moves the stored
    /// counter backwards.
    pub fn reset(&self) {
        let pools: Vec<Arc<Mutex<Pool>>> = self.pools.lock().values().cloned().collect();
        let mut dropped = 0usize;
        for pool in &pools {
            let mut pool = pool.lock();
            dropped += pool.queue.len();
            pool.queue.clear();
        }
        self.observed.clear();
        debug!(pools = pools.len(), dropped, "allocator.reset");
    }

    /// Drops the queued identifiers and memoised observed maximum of one key.
    pub fn reset_key(&self, key: &PoolKey) {
        let pool = self.pools.lock().get(key).cloned();
        if let Some(pool) = pool {
            pool.lock().queue.clear();
        }
        self.observed.invalidate_key(key);
        debug!(category = %key.category, pattern = %key.pattern, "allocator.reset_key");
    }

    fn pool(&self, key: &PoolKey) -> Arc<Mutex<Pool>> {
        let mut pools = self.pools.lock();
        Arc::clone(pools.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(Pool {
                queue: VecDeque::new(),
                high_water: 0,
            }))
        }))
    }

    fn batch_size(&self, category: SequenceCategory) -> u64 {
        let n = match category {
            SequenceCategory::Sample => self.config.sample_batch,
            SequenceCategory::Container => self.config.container_batch,
            SequenceCategory::Location => self.config.location_batch,
        };
        u64::from(n.max(1))
    }

    fn scan_observed(&self, key: &PoolKey, parts: &PatternParts) -> Result<u64> {
        let ids = self.backend.existing_identifiers(key.category, &parts.head)?;
        Ok(ids
            .iter()
            .filter_map(|id| parts.value_of(id))
            .max()
            .unwrap_or(0))
    }

    fn observed_max(&self, key: &PoolKey, parts: &PatternParts) -> Result<u64> {
        self.observed
            .get_or_try_insert_with(key, || self.scan_observed(key, parts))
    }

    /// Reconciles the stored counter, reserves one batch and fills the pool.
    /// Runs with the pool lock held.
    ///
    /// The stored row is read and advanced in one backend step, so trackers
    /// sharing a store never reserve overlapping ranges.
    fn refill(&self, key: &PoolKey, parts: &PatternParts, pool: &mut Pool) -> Result<()> {
        let peeked = match self.backend.fetch(&RecordKey::Sequence(key.clone()))? {
            Some(Record::Sequence(seq)) => parts.value_of(&seq.last_barcode).unwrap_or(0),
            _ => 0,
        };
        let mut observed = self.observed_max(key, parts)?;
        if peeked > observed.saturating_add(self.config.hole_threshold) {
            self.observed.invalidate_key(key);
            observed = self.observed_max(key, parts)?;
        }
        let batch = self.batch_size(key.category);
        let high_water = pool.high_water;
        let (mut start, mut last) = (0u64, 0u64);
        self.backend.advance_sequence(key, &mut |current| {
            let stored = current.and_then(|value| parts.value_of(value)).unwrap_or(0);
            start = self.anchor(key, stored, observed).max(high_water);
            last = start.checked_add(batch).ok_or_else(|| TrackError::Allocation {
                pattern: key.pattern.clone(),
                reason: "counter overflow".into(),
            })?;
            Ok(parts.render(last))
        })?;
        pool.queue.extend((start + 1..=last).map(|value| parts.render(value)));
        pool.high_water = last;
        debug!(
            category = %key.category,
            pattern = %key.pattern,
            from = start + 1,
            to = last,
            "allocator.reserve"
        );
        Ok(())
    }

    /// Value the next batch starts after: the stored counter, unless it lags
    /// the observed maximum or runs more than `hole_threshold` ahead of it.
    fn anchor(&self, key: &PoolKey, stored: u64, observed: u64) -> u64 {
        if stored < observed {
            observed
        } else if stored - observed > self.config.hole_threshold {
            warn!(
                category = %key.category,
                pattern = %key.pattern,
                stored,
                observed,
                "allocator.hole_corrected"
            );
            observed
        } else {
            stored
        }
    }
}

//! Safety state and exit-condition evaluation (component B): iteration
//! counters, stagnation/error streaks, token accounting.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Tunables resolved by component J; defaults match the spec's table.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub max_iterations: u32,
    pub stagnation_limit: u32,
    pub timeout: Duration,
    pub max_review_iterations: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            stagnation_limit: 3,
            timeout: Duration::from_secs(900),
            max_review_iterations: 3,
        }
    }
}

const ERROR_STREAK_BLOCKED_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    MaxIterations,
    Stagnation,
    Blocked,
    MaxReviewRetries,
    Complete,
    UserInterrupt,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::MaxIterations => "max_iterations",
            ExitReason::Stagnation => "stagnation",
            ExitReason::Blocked => "blocked",
            ExitReason::MaxReviewRetries => "max_review_retries",
            ExitReason::Complete => "complete",
            ExitReason::UserInterrupt => "user_interrupt",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Iteration counters, streaks, and token accounting. Owned exclusively
/// by the orchestration task; snapshots handed to the TUI boundary are
/// value copies.
#[derive(Debug, Clone)]
pub struct SafetyState {
    pub iteration: u32,
    pub no_change_streak: u32,
    pub last_error: Option<String>,
    pub error_streak: u32,
    pub files_changed_history: Vec<Vec<String>>,
    pub total_files_changed: HashSet<String>,
    pub start_time: Instant,
    pub token_totals: HashMap<String, TokenUsage>,
    pub live_tokens: TokenUsage,
    pub review_iterations: u32,
    pub in_review: bool,
}

impl SafetyState {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            no_change_streak: 0,
            last_error: None,
            error_streak: 0,
            files_changed_history: Vec::new(),
            total_files_changed: HashSet::new(),
            start_time: Instant::now(),
            token_totals: HashMap::new(),
            live_tokens: TokenUsage::default(),
            review_iterations: 0,
            in_review: false,
        }
    }

    /// Evaluate exit conditions in spec order, returning the first
    /// matching reason: `max_iterations`, `stagnation`, `blocked`,
    /// `max_review_retries` (only while in review).
    pub fn check(&self, cfg: &SafetyConfig) -> Option<ExitReason> {
        if self.iteration > cfg.max_iterations {
            return Some(ExitReason::MaxIterations);
        }
        if self.no_change_streak >= cfg.stagnation_limit {
            return Some(ExitReason::Stagnation);
        }
        if self.error_streak >= ERROR_STREAK_BLOCKED_THRESHOLD {
            return Some(ExitReason::Blocked);
        }
        if self.in_review && self.review_iterations >= cfg.max_review_iterations {
            return Some(ExitReason::MaxReviewRetries);
        }
        None
    }

    /// Record an iteration's reported `files_changed`. Empty increments
    /// the no-change streak; non-empty resets it and unions into the
    /// total-files-changed set.
    pub fn record_iteration(&mut self, files_changed: &[String]) {
        self.iteration += 1;
        self.files_changed_history.push(files_changed.to_vec());
        if files_changed.is_empty() {
            self.no_change_streak += 1;
        } else {
            self.no_change_streak = 0;
            for f in files_changed {
                self.total_files_changed.insert(f.clone());
            }
        }
    }

    /// Record an iteration error. A repeat of the previous iteration's
    /// exact error string increments the streak; anything else
    /// (including `None`, a successful iteration) resets it.
    pub fn record_error(&mut self, error: Option<&str>) {
        match error {
            Some(err) => {
                if self.last_error.as_deref() == Some(err) {
                    self.error_streak += 1;
                } else {
                    self.error_streak = 1;
                }
                self.last_error = Some(err.to_string());
            }
            None => {
                self.error_streak = 0;
                self.last_error = None;
            }
        }
    }

    /// Output tokens accumulate into the live per-iteration counter;
    /// input tokens are replaced since the agent reports a cumulative
    /// figure, not a delta.
    pub fn record_turn_tokens(&mut self, input_tokens: u64, output_tokens_delta: u64) {
        self.live_tokens.input_tokens = input_tokens;
        self.live_tokens.output_tokens += output_tokens_delta;
    }

    /// At iteration end, fold the live counter into the named model's
    /// running total and reset the live counter.
    pub fn absorb_live_tokens(&mut self, model: &str) {
        let entry = self.token_totals.entry(model.to_string()).or_default();
        entry.input_tokens += self.live_tokens.input_tokens;
        entry.output_tokens += self.live_tokens.output_tokens;
        self.live_tokens = TokenUsage::default();
    }

    pub fn enter_review(&mut self) {
        self.in_review = true;
        self.review_iterations = 0;
    }

    pub fn record_review_iteration(&mut self) {
        self.review_iterations += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for SafetyState {
    fn default() -> Self {
        Self::new()
    }
}

//! Verification of recorded call histories.
//!
//! A [`CallVerifier`] compares the calls resolved from a `verify` block with
//! the histories of the mocks they target. Each ordering discipline is its own
//! verifier.

use crate::invocation::{Call, Invocation};
use crate::stub::Mock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

/// How expected calls must line up with the recorded history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ordering {
    /// Each call matched independently
    #[default]
    Unordered,
    /// Each call matched, with no foreign call between matched invocations
    All,
    /// Calls matched as a contiguous run, in order
    Sequence,
    /// Calls matched in order, other calls may be interleaved
    Ordered,
}

/// Outcome of a verification.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Whether the expectation holds
    pub matches: bool,
    /// Explanation, set on failure
    pub message: Option<String>,
    /// Invocations accepted by the expected calls, as (call index, invocation)
    matched: Vec<(usize, Invocation)>,
}

impl VerificationResult {
    /// Successful result.
    pub fn ok() -> Self {
        Self::matched(Vec::new())
    }

    /// Successful result accepting `matched`.
    fn matched(matched: Vec<(usize, Invocation)>) -> Self {
        Self {
            matches: true,
            message: None,
            matched,
        }
    }

    /// Failed result with an explanation.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            matches: false,
            message: Some(message.into()),
            matched: Vec::new(),
        }
    }

    /// Feed the accepted invocations to the capturing matchers of `calls`.
    /// Verifiers never capture themselves; failed results carry nothing.
    pub fn capture(&self, calls: &[Call]) {
        for (idx, inv) in &self.matched {
            if let Some(call) = calls.get(*idx) {
                call.matcher.capture_args(inv);
            }
        }
    }

    /// Negate the result, for inverse verification.
    pub fn invert(self, calls: &[Call]) -> Self {
        if self.matches {
            Self::fail(format!(
                "calls were not expected to match:\n{}",
                render_expected(calls)
            ))
        } else {
            Self::ok()
        }
    }
}

/// Cardinality bounds of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationBounds {
    /// Minimum number of matches
    #[serde(default = "default_at_least")]
    pub at_least: usize,
    /// Maximum number of matches
    #[serde(default = "default_at_most")]
    pub at_most: usize,
    /// Exact number of matches, overriding the other two
    #[serde(default)]
    pub exactly: Option<usize>,
    /// Negate the whole verification
    #[serde(default)]
    pub inverse: bool,
}

fn default_at_least() -> usize {
    1
}

fn default_at_most() -> usize {
    usize::MAX
}

impl Default for VerificationBounds {
    fn default() -> Self {
        Self {
            at_least: default_at_least(),
            at_most: default_at_most(),
            exactly: None,
            inverse: false,
        }
    }
}

impl VerificationBounds {
    pub fn exactly(n: usize) -> Self {
        Self {
            exactly: Some(n),
            ..Self::default()
        }
    }

    pub fn at_least(n: usize) -> Self {
        Self {
            at_least: n,
            ..Self::default()
        }
    }

    pub fn at_most(n: usize) -> Self {
        Self {
            at_least: 0,
            at_most: n,
            ..Self::default()
        }
    }

    /// Same bounds, negated.
    pub fn inverse(self) -> Self {
        Self {
            inverse: true,
            ..self
        }
    }

    /// Resolved `(min, max)` pair.
    pub fn range(&self) -> (usize, usize) {
        match self.exactly {
            Some(n) => (n, n),
            None => (self.at_least, self.at_most),
        }
    }
}

/// Checks resolved calls against recorded histories.
pub trait CallVerifier: Send + Sync {
    /// Verify that `calls` happened between `min` and `max` times.
    fn verify(&self, calls: &[Call], min: usize, max: usize) -> VerificationResult;
}

/// Verifier for an ordering discipline.
pub fn verifier(ordering: Ordering) -> Box<dyn CallVerifier> {
    match ordering {
        Ordering::Unordered => Box::new(UnorderedCallVerifier),
        Ordering::All => Box::new(AllCallsCallVerifier),
        Ordering::Sequence => Box::new(SequenceCallVerifier),
        Ordering::Ordered => Box::new(OrderedCallVerifier),
    }
}

/// Each call must match between `min` and `max` invocations of its mock.
pub struct UnorderedCallVerifier;

/// Like [`UnorderedCallVerifier`], and the matched invocations must be
/// contiguous in the merged history of the involved mocks.
pub struct AllCallsCallVerifier;

/// The calls must appear as a contiguous, in-order run of the merged
/// history; the number of runs is bounded by `min..=max`.
pub struct SequenceCallVerifier;

/// The calls must appear in order, possibly interleaved with other calls;
/// the number of repetitions is bounded by `min..=max`.
pub struct OrderedCallVerifier;

impl CallVerifier for UnorderedCallVerifier {
    fn verify(&self, calls: &[Call], min: usize, max: usize) -> VerificationResult {
        let mut matched = Vec::new();
        for (k, call) in calls.iter().enumerate() {
            let history = mock_history(call);
            let hits: Vec<Invocation> = history
                .iter()
                .filter(|inv| call.matcher.matches(inv))
                .cloned()
                .collect();

            if hits.len() < min || hits.len() > max {
                return VerificationResult::fail(format!(
                    "{}: {} matching call(s) found, but needs {}\nCalls:\n{}",
                    call.matcher,
                    hits.len(),
                    describe_bounds(min, max),
                    render_history(&history)
                ));
            }
            matched.extend(hits.into_iter().map(|inv| (k, inv)));
        }
        VerificationResult::matched(matched)
    }
}

impl CallVerifier for AllCallsCallVerifier {
    fn verify(&self, calls: &[Call], min: usize, max: usize) -> VerificationResult {
        let result = UnorderedCallVerifier.verify(calls, min, max);
        if !result.matches {
            return result;
        }

        let history = merged_history(calls);
        let positions: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, inv)| calls.iter().any(|c| c.matcher.matches(inv)))
            .map(|(i, _)| i)
            .collect();

        if let (Some(&first), Some(&last)) = (positions.first(), positions.last()) {
            if let Some(foreign) = history[first..=last]
                .iter()
                .find(|inv| !calls.iter().any(|c| c.matcher.matches(inv)))
            {
                return VerificationResult::fail(format!(
                    "{} was called between expected calls\nExpected:\n{}\nCalls:\n{}",
                    foreign,
                    render_expected(calls),
                    render_history(&history)
                ));
            }
        }
        result
    }
}

impl CallVerifier for SequenceCallVerifier {
    fn verify(&self, calls: &[Call], min: usize, max: usize) -> VerificationResult {
        let history = merged_history(calls);
        let mut runs = Vec::new();
        let mut i = 0;
        while !calls.is_empty() && i + calls.len() <= history.len() {
            let window = &history[i..i + calls.len()];
            if calls.iter().zip(window).all(|(c, inv)| c.matcher.matches(inv)) {
                runs.push(window);
                i += calls.len();
            } else {
                i += 1;
            }
        }

        if runs.len() < min || runs.len() > max {
            return VerificationResult::fail(format!(
                "calls are not in verification sequence: {} run(s) found, but needs {}\nExpected:\n{}\nCalls:\n{}",
                runs.len(),
                describe_bounds(min, max),
                render_expected(calls),
                render_history(&history)
            ));
        }

        let matched = runs
            .into_iter()
            .flat_map(|window| window.iter().cloned().enumerate())
            .collect();
        VerificationResult::matched(matched)
    }
}

impl CallVerifier for OrderedCallVerifier {
    fn verify(&self, calls: &[Call], min: usize, max: usize) -> VerificationResult {
        let history = merged_history(calls);
        let mut next = 0;
        let mut repetitions = 0;
        let mut pending = Vec::new();
        let mut matched = Vec::new();

        for inv in &history {
            if calls.is_empty() {
                break;
            }
            if calls[next].matcher.matches(inv) {
                pending.push(inv);
                next += 1;
                if next == calls.len() {
                    repetitions += 1;
                    next = 0;
                    matched.append(&mut pending);
                }
            }
        }

        if repetitions < min || repetitions > max {
            let missing = match calls.get(next) {
                Some(call) if next > 0 || repetitions < min => format!(", first unmatched: {}", call.matcher),
                _ => String::new(),
            };
            return VerificationResult::fail(format!(
                "calls are not in verification order: {} repetition(s) found, but needs {}{}\nExpected:\n{}\nCalls:\n{}",
                repetitions,
                describe_bounds(min, max),
                missing,
                render_expected(calls),
                render_history(&history)
            ));
        }

        let matched = matched
            .into_iter()
            .enumerate()
            .map(|(k, inv)| (k % calls.len(), inv.clone()))
            .collect();
        VerificationResult::matched(matched)
    }
}

/// Fails when any of the mocks has recorded calls.
pub fn check_was_not_called(mocks: &[Mock]) -> VerificationResult {
    for mock in mocks {
        let history = mock.stub().all_recorded_calls();
        if !history.is_empty() {
            return VerificationResult::fail(format!(
                "{} should not be called\nCalls:\n{}",
                mock.to_str(),
                render_history(&history)
            ));
        }
    }
    VerificationResult::ok()
}

fn mock_history(call: &Call) -> Vec<Invocation> {
    call.matcher
        .subject
        .upgrade()
        .map(|m| m.stub().all_recorded_calls())
        .unwrap_or_default()
}

/// Histories of every mock involved in `calls`, merged by timestamp.
fn merged_history(calls: &[Call]) -> Vec<Invocation> {
    let mut seen = HashSet::new();
    let mut history: Vec<Invocation> = calls
        .iter()
        .filter(|c| seen.insert(c.matcher.subject.id()))
        .flat_map(mock_history)
        .collect();
    history.sort_by_key(|inv| inv.timestamp);
    history
}

fn describe_bounds(min: usize, max: usize) -> String {
    match (min, max) {
        (min, max) if min == max => format!("exactly {}", min),
        (0, usize::MAX) => "any number".to_string(),
        (min, usize::MAX) => format!("at least {}", min),
        (0, max) => format!("at most {}", max),
        (min, max) => format!("between {} and {}", min, max),
    }
}

fn render_history(history: &[Invocation]) -> String {
    if history.is_empty() {
        return "  (no calls)".to_string();
    }
    let mut out = String::new();
    for (i, inv) in history.iter().enumerate() {
        let _ = writeln!(out, "  {}) {}", i + 1, inv);
    }
    out.trim_end().to_string()
}

fn render_expected(calls: &[Call]) -> String {
    let mut out = String::new();
    for (i, call) in calls.iter().enumerate() {
        let _ = writeln!(out, "  {}) {}", i + 1, call.matcher);
    }
    out.trim_end().to_string()
}

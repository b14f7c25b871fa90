//! Argument matchers.
//!
//! A [`Matcher`] decides whether one argument of a live call satisfies a
//! declared expectation. Matchers are a closed set of variants dispatched by
//! [`Matcher::matches`]; user logic plugs in through [`Matcher::Custom`].

use crate::error::{Error, Result};
use crate::value::{Value, ValueType};
use parking_lot::Mutex;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Predicate over one argument.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A user supplied predicate with a description for diagnostics.
#[derive(Clone)]
pub struct CustomMatcher {
    description: String,
    predicate: Predicate,
}

impl CustomMatcher {
    fn key(&self) -> String {
        format!("matching#{:p}", Arc::as_ptr(&self.predicate) as *const ())
    }
}

impl fmt::Debug for CustomMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomMatcher")
            .field("description", &self.description)
            .finish()
    }
}

/// Append-only store of values accepted by a capturing matcher.
///
/// Clones share the same storage, so a slot handed to a matcher can be
/// inspected by the test afterwards.
#[derive(Clone, Default)]
pub struct CaptureSlot {
    values: Arc<Mutex<Vec<Value>>>,
}

impl CaptureSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured values, in capture order.
    pub fn captured(&self) -> Vec<Value> {
        self.values.lock().clone()
    }

    /// The most recently captured value.
    pub fn last(&self) -> Option<Value> {
        self.values.lock().last().cloned()
    }

    /// Whether at least one value was captured.
    pub fn is_captured(&self) -> bool {
        !self.values.lock().is_empty()
    }

    /// Number of captured values.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget captured values.
    pub fn clear(&self) {
        self.values.lock().clear();
    }

    fn push(&self, value: Value) {
        self.values.lock().push(value);
    }

    fn key(&self) -> String {
        format!("capture#{:p}", Arc::as_ptr(&self.values))
    }
}

impl fmt::Debug for CaptureSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSlot")
            .field("values", &*self.values.lock())
            .finish()
    }
}

/// Argument matcher.
#[derive(Clone, Debug)]
pub enum Matcher {
    /// Structural equality
    Eq(Value),
    /// Accepts anything, including `Null`
    Any,
    /// Runtime type check
    OfType(ValueType),
    /// User predicate
    Custom(CustomMatcher),
    /// Accepts anything and records the value
    Capture(CaptureSlot),
    /// Negation
    Not(Box<Matcher>),
    /// All must accept, evaluated left to right
    And(Vec<Matcher>),
    /// One must accept, evaluated left to right
    Or(Vec<Matcher>),
    /// String matching a regular expression
    Regex(Regex),
    /// String matching a glob pattern
    Glob {
        /// Source pattern
        pattern: String,
        /// Compiled matcher
        matcher: globset::GlobMatcher,
    },
}

impl Matcher {
    /// Equality matcher.
    pub fn eq(value: impl Into<Value>) -> Self {
        Matcher::Eq(value.into())
    }

    /// Custom predicate matcher.
    pub fn matching<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Matcher::Custom(CustomMatcher {
            description: description.into(),
            predicate: Arc::new(predicate),
        })
    }

    /// Regex matcher.
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Matcher::Regex)
            .map_err(|e| Error::InvalidPattern(format!("{}: {}", pattern, e)))
    }

    /// Glob matcher.
    pub fn glob(pattern: &str) -> Result<Self> {
        let glob = globset::Glob::new(pattern)
            .map_err(|e| Error::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Ok(Matcher::Glob {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// Whether this matcher accepts the value.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Matcher::Eq(expected) => expected == value,
            Matcher::Any | Matcher::Capture(_) => true,
            Matcher::OfType(ty) => value.is_instance_of(ty),
            Matcher::Custom(custom) => (custom.predicate)(value),
            Matcher::Not(inner) => !inner.matches(value),
            Matcher::And(all) => all.iter().all(|m| m.matches(value)),
            Matcher::Or(any) => any.iter().any(|m| m.matches(value)),
            Matcher::Regex(regex) => value.as_str().is_some_and(|s| regex.is_match(s)),
            Matcher::Glob { matcher, .. } => value.as_str().is_some_and(|s| matcher.is_match(s)),
        }
    }

    /// Record the value in capturing matchers. Conjunctions capture through
    /// every member, disjunctions through the first member that accepts the
    /// value. A negation's inner matcher rejected the value and captures
    /// nothing.
    pub fn capture(&self, value: &Value) {
        match self {
            Matcher::Capture(slot) => slot.push(value.clone()),
            Matcher::And(all) => all.iter().for_each(|m| m.capture(value)),
            Matcher::Or(any) => {
                if let Some(accepted) = any.iter().find(|m| m.matches(value)) {
                    accepted.capture(value);
                }
            }
            _ => {}
        }
    }

    /// Whether this matcher captures values.
    pub fn is_capturing(&self) -> bool {
        match self {
            Matcher::Capture(_) => true,
            Matcher::And(all) | Matcher::Or(all) => all.iter().any(Matcher::is_capturing),
            _ => false,
        }
    }

    /// Structural key. Custom predicates and capture slots are keyed by
    /// identity since they cannot be compared.
    pub(crate) fn key(&self) -> String {
        match self {
            Matcher::Custom(custom) => custom.key(),
            Matcher::Capture(slot) => slot.key(),
            Matcher::Not(inner) => format!("not({})", inner.key()),
            Matcher::And(all) => format!("and({})", join_keys(all)),
            Matcher::Or(any) => format!("or({})", join_keys(any)),
            other => other.to_string(),
        }
    }
}

fn join_keys(matchers: &[Matcher]) -> String {
    matchers.iter().map(Matcher::key).collect::<Vec<_>>().join(", ")
}

fn join_display(f: &mut fmt::Formatter<'_>, matchers: &[Matcher]) -> fmt::Result {
    for (i, matcher) in matchers.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", matcher)?;
    }
    Ok(())
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Eq(value) => write!(f, "eq({})", value),
            Matcher::Any => f.write_str("any()"),
            Matcher::OfType(ty) => write!(f, "ofType({})", ty),
            Matcher::Custom(custom) => write!(f, "matching({})", custom.description),
            Matcher::Capture(_) => f.write_str("capture()"),
            Matcher::Not(inner) => write!(f, "not({})", inner),
            Matcher::And(all) => {
                f.write_str("and(")?;
                join_display(f, all)?;
                f.write_str(")")
            }
            Matcher::Or(any) => {
                f.write_str("or(")?;
                join_display(f, any)?;
                f.write_str(")")
            }
            Matcher::Regex(regex) => write!(f, "regex({})", regex.as_str()),
            Matcher::Glob { pattern, .. } => write!(f, "glob({})", pattern),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_eq_and_any() {
        assert!(Matcher::eq(5).matches(&Value::Int(5)));
        assert!(!Matcher::eq(5).matches(&Value::Int(6)));
        assert!(Matcher::Any.matches(&Value::Null));
    }

    #[test]
    fn test_type_matcher_tolerates_null() {
        let m = Matcher::OfType(ValueType::Str);
        assert!(m.matches(&Value::from("x")));
        assert!(!m.matches(&Value::Null));
        assert!(!m.matches(&Value::Int(1)));
    }

    #[test]
    fn test_custom_matcher_sees_null() {
        let m = Matcher::matching("positive", |v| v.as_int().is_some_and(|i| i > 0));
        assert!(m.matches(&Value::Int(3)));
        assert!(!m.matches(&Value::Null));
        assert_eq!(m.to_string(), "matching(positive)");
    }

    #[test]
    fn test_and_short_circuits() {
        let evaluated = Arc::new(AtomicUsize::new(0));
        let counter = evaluated.clone();
        let m = Matcher::And(vec![
            Matcher::OfType(ValueType::Int),
            Matcher::matching("counted", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }),
        ]);

        assert!(!m.matches(&Value::from("not an int")));
        assert_eq!(evaluated.load(Ordering::SeqCst), 0);
        assert!(m.matches(&Value::Int(1)));
        assert_eq!(evaluated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_or_short_circuits() {
        let evaluated = Arc::new(AtomicUsize::new(0));
        let counter = evaluated.clone();
        let m = Matcher::Or(vec![
            Matcher::eq(1),
            Matcher::matching("counted", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            }),
        ]);

        assert!(m.matches(&Value::Int(1)));
        assert_eq!(evaluated.load(Ordering::SeqCst), 0);
        assert!(!m.matches(&Value::Int(2)));
        assert_eq!(evaluated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not() {
        let m = Matcher::Not(Box::new(Matcher::eq("a")));
        assert!(m.matches(&Value::from("b")));
        assert!(!m.matches(&Value::from("a")));
    }

    #[test]
    fn test_capture_accepts_and_records_only_on_capture() {
        let slot = CaptureSlot::new();
        let m = Matcher::Capture(slot.clone());

        assert!(m.matches(&Value::Int(5)));
        assert!(slot.is_empty());

        m.capture(&Value::Int(5));
        m.capture(&Value::Int(7));
        assert_eq!(slot.captured(), vec![Value::Int(5), Value::Int(7)]);
        assert_eq!(slot.last(), Some(Value::Int(7)));
    }

    #[test]
    fn test_capture_through_and() {
        let slot = CaptureSlot::new();
        let m = Matcher::And(vec![Matcher::OfType(ValueType::Int), Matcher::Capture(slot.clone())]);
        assert!(m.is_capturing());
        m.capture(&Value::Int(9));
        assert_eq!(slot.captured(), vec![Value::Int(9)]);
    }

    #[test]
    fn test_capture_through_accepting_or_branch() {
        let (strings, rest) = (CaptureSlot::new(), CaptureSlot::new());
        let m = Matcher::Or(vec![
            Matcher::And(vec![Matcher::OfType(ValueType::Str), Matcher::Capture(strings.clone())]),
            Matcher::Capture(rest.clone()),
        ]);
        assert!(m.is_capturing());

        m.capture(&Value::from("a"));
        m.capture(&Value::Int(2));
        assert_eq!(strings.captured(), vec![Value::from("a")]);
        assert_eq!(rest.captured(), vec![Value::Int(2)]);

        let negated = Matcher::Not(Box::new(Matcher::Capture(rest.clone())));
        assert!(!negated.is_capturing());
    }

    #[test]
    fn test_regex_and_glob() {
        let re = Matcher::regex("^user-[0-9]+$").unwrap();
        assert!(re.matches(&Value::from("user-42")));
        assert!(!re.matches(&Value::from("admin")));
        assert!(!re.matches(&Value::Int(42)));

        let glob = Matcher::glob("*.yaml").unwrap();
        assert!(glob.matches(&Value::from("config.yaml")));
        assert!(!glob.matches(&Value::from("config.json")));

        assert!(matches!(Matcher::regex("("), Err(Error::InvalidPattern(_))));
    }

    #[test]
    fn test_keys() {
        assert_eq!(Matcher::eq(1).key(), Matcher::eq(1).key());
        assert_ne!(Matcher::eq(1).key(), Matcher::eq(2).key());

        let a = CaptureSlot::new();
        let b = CaptureSlot::new();
        assert_eq!(Matcher::Capture(a.clone()).key(), Matcher::Capture(a).key());
        assert_ne!(
            Matcher::Capture(CaptureSlot::new()).key(),
            Matcher::Capture(b).key()
        );
    }
}

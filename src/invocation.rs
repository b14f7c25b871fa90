//! Invocation model.
//!
//! Immutable records describing one intercepted call ([`Invocation`]), the
//! method it targeted ([`MethodDescription`]), the declarative matcher used to
//! recognize a family of calls ([`InvocationMatcher`]) and a resolved
//! expectation ([`Call`]).

use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::stub::WeakMock;
use crate::value::{Value, ValueType};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Handle invoking the real implementation of a method with the given args.
pub type RealMethod = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Thunk calling the real implementation for one concrete invocation.
pub type OriginalCall = Arc<dyn Fn() -> Result<Value> + Send + Sync>;

/// Description of a mockable method.
#[derive(Clone)]
pub struct MethodDescription {
    /// Method name
    pub name: String,
    /// Declared return type
    pub return_type: ValueType,
    /// Type declaring the method
    pub declaring_type: String,
    /// Ordered parameter types
    pub param_types: Vec<ValueType>,
    /// Real implementation, used by spies
    pub real: Option<RealMethod>,
}

impl MethodDescription {
    /// Describe a method taking no parameters and returning `Unit`.
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            return_type: ValueType::Unit,
            declaring_type: declaring_type.into(),
            param_types: Vec::new(),
            real: None,
        }
    }

    /// Set the parameter types.
    pub fn params(mut self, params: impl IntoIterator<Item = ValueType>) -> Self {
        self.param_types = params.into_iter().collect();
        self
    }

    /// Set the return type.
    pub fn returns(mut self, return_type: ValueType) -> Self {
        self.return_type = return_type;
        self
    }

    /// Bind the real implementation.
    pub fn with_real<F>(mut self, real: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.real = Some(Arc::new(real));
        self
    }

    /// `to_string()`, answered intrinsically by every mock.
    pub fn to_string_method(declaring_type: impl Into<String>) -> Self {
        Self::new(declaring_type, "to_string").returns(ValueType::Str)
    }

    /// `hash_code()`, answered with the mock's identity hash.
    pub fn hash_code_method(declaring_type: impl Into<String>) -> Self {
        Self::new(declaring_type, "hash_code").returns(ValueType::Int)
    }

    /// `equals(other)`, answered with identity equality.
    pub fn equals_method(declaring_type: impl Into<String>) -> Self {
        Self::new(declaring_type, "equals")
            .params([ValueType::Any])
            .returns(ValueType::Bool)
    }

    pub fn is_to_string(&self) -> bool {
        self.name == "to_string" && self.param_types.is_empty()
    }

    pub fn is_hash_code(&self) -> bool {
        self.name == "hash_code" && self.param_types.is_empty()
    }

    pub fn is_equals(&self) -> bool {
        self.name == "equals" && self.param_types == [ValueType::Any]
    }
}

impl PartialEq for MethodDescription {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.declaring_type == other.declaring_type
            && self.param_types == other.param_types
            && self.return_type == other.return_type
    }
}

impl Eq for MethodDescription {}

impl fmt::Debug for MethodDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescription")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .field("declaring_type", &self.declaring_type)
            .field("param_types", &self.param_types)
            .field("real", &self.real.is_some())
            .finish()
    }
}

impl fmt::Display for MethodDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.declaring_type, self.name)?;
        for (i, ty) in self.param_types.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, "): {}", self.return_type)
    }
}

/// Strictly increasing nanosecond timestamp shared by all mocks, so that
/// histories of different mocks can be merged in call order.
pub(crate) fn next_timestamp() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = u64::try_from(EPOCH.get_or_init(Instant::now).elapsed().as_nanos()).unwrap_or(u64::MAX);
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// One concrete, already-happened call.
#[derive(Clone)]
pub struct Invocation {
    /// The mock that received the call
    pub subject: WeakMock,
    /// Display name of the calling object
    pub self_name: String,
    /// Called method
    pub method: Arc<MethodDescription>,
    /// Argument values
    pub args: Vec<Value>,
    /// Monotonic timestamp (nanoseconds)
    pub timestamp: u64,
    /// Calls the real implementation
    pub original_call: OriginalCall,
}

impl Invocation {
    /// Copy of this invocation addressed to another mock. Used when a chained
    /// call recorded on a temporary mock is re-targeted to a child mock.
    pub(crate) fn retarget(&self, subject: WeakMock) -> Self {
        Self {
            self_name: subject.display_name().to_string(),
            subject,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("self_name", &self.self_name)
            .field("method", &self.method.name)
            .field("args", &self.args)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.self_name, self.method.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

/// Structural key of an [`InvocationMatcher`], used to memoize child mocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatcherKey {
    subject: u64,
    method: String,
    declaring_type: String,
    param_types: Vec<ValueType>,
    args: Vec<String>,
}

/// Recognizes a family of invocations: same mock, same method, and every
/// positional matcher accepting its argument.
#[derive(Clone, Debug)]
pub struct InvocationMatcher {
    /// Mock the invocations must target
    pub subject: WeakMock,
    /// Method the invocations must target
    pub method: Arc<MethodDescription>,
    /// One matcher per parameter
    pub args: Vec<Matcher>,
}

impl InvocationMatcher {
    /// Create a matcher, checking that one matcher is given per parameter.
    pub fn new(subject: WeakMock, method: Arc<MethodDescription>, args: Vec<Matcher>) -> Result<Self> {
        if args.len() != method.param_types.len() {
            return Err(Error::ArityMismatch {
                method: method.name.clone(),
                expected: method.param_types.len(),
                actual: args.len(),
            });
        }
        Ok(Self {
            subject,
            method,
            args,
        })
    }

    /// Whether this matcher accepts the invocation. Matchers are evaluated
    /// left to right and stop at the first rejection.
    pub fn matches(&self, invocation: &Invocation) -> bool {
        self.subject.id() == invocation.subject.id()
            && *self.method == *invocation.method
            && self.args.len() == invocation.args.len()
            && self
                .args
                .iter()
                .zip(&invocation.args)
                .all(|(matcher, arg)| matcher.matches(arg))
    }

    /// Feed the invocation's arguments to capturing matchers. Only call this
    /// once [`matches`](Self::matches) accepted the whole invocation.
    pub fn capture_args(&self, invocation: &Invocation) {
        for (matcher, arg) in self.args.iter().zip(&invocation.args) {
            matcher.capture(arg);
        }
    }

    /// Structural key identifying equal matchers.
    pub fn key(&self) -> MatcherKey {
        MatcherKey {
            subject: self.subject.id(),
            method: self.method.name.clone(),
            declaring_type: self.method.declaring_type.clone(),
            param_types: self.method.param_types.clone(),
            args: self.args.iter().map(Matcher::key).collect(),
        }
    }
}

impl fmt::Display for InvocationMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.subject.display_name(), self.method.name)?;
        for (i, matcher) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", matcher)?;
        }
        f.write_str(")")
    }
}

/// A resolved expectation.
#[derive(Clone, Debug)]
pub struct Call {
    /// Declared (or hinted) return type
    pub ret_type: ValueType,
    /// The triggering invocation
    pub invocation: Invocation,
    /// Matcher recognizing the call
    pub matcher: InvocationMatcher,
    /// Whether this call is a verification expectation rather than a stub
    pub verification: bool,
}

impl Call {
    pub fn new(
        ret_type: ValueType,
        invocation: Invocation,
        matcher: InvocationMatcher,
        verification: bool,
    ) -> Self {
        Self {
            ret_type,
            invocation,
            matcher,
            verification,
        }
    }
}

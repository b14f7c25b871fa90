//! Declarative scenarios.
//!
//! A scenario describes mock types, the mocks to create, the stubs to install,
//! the calls to make and the verifications to run, all in YAML:
//!
//! ```yaml
//! types:
//!   Repo:
//!     find: { params: [int], returns: str }
//!
//! mocks:
//!   - name: repo
//!     type: Repo
//!
//! stubs:
//!   - mock: repo
//!     method: find
//!     args: [{ type: any }]
//!     answer: { type: returns, value: "found" }
//!
//! calls:
//!   - mock: repo
//!     method: find
//!     args: [7]
//!     expect: "found"
//!
//! verify:
//!   - exactly: 1
//!     calls:
//!       - mock: repo
//!         method: find
//!         args: [7]
//! ```
//!
//! Literal strings starting with `@` refer to mocks by name. Stubs go through
//! `every`, so matchers are resolved by the regular capture protocol.

use crate::answer::Answer;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::gateway::{MatcherScope, MockFactory, MockSession};
use crate::invocation::MethodDescription;
use crate::matcher::{CaptureSlot, Matcher};
use crate::stub::Mock;
use crate::value::{Value, ValueType};
use crate::verifier::{Ordering, VerificationBounds};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A complete scenario.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Optional name, used in reports
    #[serde(default)]
    pub name: Option<String>,

    /// Mockable types: type name to method name to signature
    #[serde(default)]
    pub types: BTreeMap<String, BTreeMap<String, MethodSpec>>,

    /// Mocks to create
    #[serde(default)]
    pub mocks: Vec<MockSpec>,

    /// Stubs installed before any call
    #[serde(default)]
    pub stubs: Vec<StubSpec>,

    /// Calls made in order
    #[serde(default)]
    pub calls: Vec<CallSpec>,

    /// Verifications run after the calls
    #[serde(default)]
    pub verify: Vec<VerifySpec>,
}

/// Method signature.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodSpec {
    /// Parameter type names
    #[serde(default)]
    pub params: Vec<String>,

    /// Return type name
    #[serde(default = "default_return_type")]
    pub returns: String,

    /// Value returned by the real implementation (used by spies)
    #[serde(default)]
    pub real: Option<serde_json::Value>,
}

fn default_return_type() -> String {
    "unit".to_string()
}

/// A mock to create.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockSpec {
    /// Name used to refer to the mock
    pub name: String,

    /// Mocked type, declared under `types`
    #[serde(rename = "type")]
    pub type_name: String,

    /// Answer defaults instead of failing (falls back to the engine setting)
    #[serde(default)]
    pub relaxed: Option<bool>,

    /// Create a spy delegating to the real implementation
    #[serde(default)]
    pub spy: bool,
}

/// Argument of a stubbed or verified call: a matcher or a literal.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    Matcher(MatcherSpec),
    Literal(serde_json::Value),
}

/// Matcher definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum MatcherSpec {
    /// Equal to a value
    Eq { value: serde_json::Value },
    /// Any value
    Any,
    /// Value of a type
    OfType { of: String },
    /// String matching a regex
    Regex { pattern: String },
    /// String matching a glob
    Glob { pattern: String },
    /// Any value, captured into a named slot
    Capture { slot: String },
    /// Negation
    Not { matcher: Box<MatcherSpec> },
    /// All matchers
    And { matchers: Vec<MatcherSpec> },
    /// Any matcher
    Or { matchers: Vec<MatcherSpec> },
}

/// Answer definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AnswerSpec {
    /// Return a value
    Returns { value: serde_json::Value },
    /// Fail with a message
    Throws { message: String },
    /// Return values in turn, repeating the last
    Many { values: Vec<serde_json::Value> },
    /// Return one of the call's arguments
    ReturnsArg { index: usize },
    /// Render a Handlebars template
    Template { template: String },
    /// Run the real implementation
    CallOriginal,
    /// Return nothing
    JustRuns,
}

/// Follow-up call on the mock returned by the previous one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
}

/// A stub to install.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubSpec {
    pub mock: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,

    /// Chained calls; the answer applies to the last one
    #[serde(default)]
    pub then: Vec<StepSpec>,

    pub answer: AnswerSpec,
}

/// A live call.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallSpec {
    pub mock: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    /// Expected result
    #[serde(default)]
    pub expect: Option<serde_json::Value>,

    /// Expected error, matched as a substring of the message
    #[serde(default)]
    pub expect_error: Option<String>,

    /// Name under which a returned mock is made available
    #[serde(default)]
    pub bind: Option<String>,
}

/// An expected call inside a verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectedCallSpec {
    pub mock: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
}

/// A verification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifySpec {
    #[serde(default)]
    pub ordering: Ordering,

    #[serde(default)]
    pub at_least: Option<usize>,

    #[serde(default)]
    pub at_most: Option<usize>,

    #[serde(default)]
    pub exactly: Option<usize>,

    /// Expect the verification to fail
    #[serde(default)]
    pub inverse: bool,

    #[serde(default)]
    pub calls: Vec<ExpectedCallSpec>,

    /// Mocks that must not have been called
    #[serde(default)]
    pub was_not_called: Vec<String>,
}

impl VerifySpec {
    fn bounds(&self) -> VerificationBounds {
        let defaults = VerificationBounds::default();
        VerificationBounds {
            at_least: self.at_least.unwrap_or(if self.at_most.is_some() { 0 } else { defaults.at_least }),
            at_most: self.at_most.unwrap_or(defaults.at_most),
            exactly: self.exactly,
            inverse: self.inverse,
        }
    }
}

impl Scenario {
    /// Load a scenario from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a scenario.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Check that every reference resolves.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashMap::new();
        for mock in &self.mocks {
            if !self.types.contains_key(&mock.type_name) {
                anyhow::bail!("Mock '{}': unknown type '{}'", mock.name, mock.type_name);
            }
            if names.insert(mock.name.as_str(), mock.type_name.as_str()).is_some() {
                anyhow::bail!("Duplicate mock name: {}", mock.name);
            }
        }

        for (type_name, methods) in &self.types {
            for (method, spec) in methods {
                for ty in spec.params.iter().chain([&spec.returns]) {
                    if let ValueType::Mock(name) = parse_type(ty) {
                        if !self.types.contains_key(&name) {
                            anyhow::bail!("{}.{}: unknown type '{}'", type_name, method, name);
                        }
                    }
                }
            }
        }

        for (i, stub) in self.stubs.iter().enumerate() {
            let type_name = names
                .get(stub.mock.as_str())
                .ok_or_else(|| anyhow::anyhow!("Stub {}: unknown mock '{}'", i, stub.mock))?;
            let mut method = self
                .method(type_name, &stub.method)
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
            for step in &stub.then {
                let ValueType::Mock(next) = parse_type(&method.returns) else {
                    anyhow::bail!("Stub {}: {} does not return a mock", i, stub.method);
                };
                method = self
                    .method(&next, &step.method)
                    .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
            }
        }

        for (i, verify) in self.verify.iter().enumerate() {
            if verify.calls.is_empty() && verify.was_not_called.is_empty() {
                anyhow::bail!("Verification {}: nothing to verify", i);
            }
        }
        Ok(())
    }

    fn method(&self, type_name: &str, method: &str) -> anyhow::Result<&MethodSpec> {
        self.types
            .get(type_name)
            .and_then(|methods| methods.get(method))
            .ok_or_else(|| anyhow::anyhow!("unknown method {}.{}", type_name, method))
    }
}

/// Parse a type name. Names other than the primitives are mock types.
pub fn parse_type(name: &str) -> ValueType {
    match name {
        "unit" => ValueType::Unit,
        "bool" => ValueType::Bool,
        "int" => ValueType::Int,
        "float" => ValueType::Float,
        "str" | "string" => ValueType::Str,
        "list" => ValueType::List,
        "any" => ValueType::Any,
        other => ValueType::mock(other),
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    /// What was checked
    pub description: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub checks: Vec<CheckOutcome>,
    /// Values captured per named slot
    pub captures: BTreeMap<String, Vec<String>>,
}

impl ScenarioReport {
    /// Whether every check passed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

enum PlannedArg {
    Matcher(Matcher, ValueType),
    Literal(Value),
}

struct PlannedStep {
    method: Arc<MethodDescription>,
    args: Vec<PlannedArg>,
}

/// Runs scenarios against a fresh mock session.
pub struct ScenarioRunner {
    session: MockSession,
    methods: HashMap<(String, String), Arc<MethodDescription>>,
    mocks: HashMap<String, Mock>,
    slots: BTreeMap<String, CaptureSlot>,
}

impl ScenarioRunner {
    /// Create a runner with the given engine configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            session: MockSession::new(config),
            methods: HashMap::new(),
            mocks: HashMap::new(),
            slots: BTreeMap::new(),
        }
    }

    /// The session mocks are created in.
    pub fn session(&self) -> &MockSession {
        &self.session
    }

    /// Run a scenario. Setup problems are errors; failed expectations are
    /// reported in the returned report.
    pub fn run(&mut self, scenario: &Scenario) -> anyhow::Result<ScenarioReport> {
        let name = scenario.name.clone().unwrap_or_else(|| "scenario".to_string());
        info!(scenario = %name, "Running scenario");

        self.declare_types(scenario);
        self.create_mocks(scenario);

        for (i, stub) in scenario.stubs.iter().enumerate() {
            self.install_stub(stub).with_context(|| format!("Stub {}", i))?;
        }

        let mut checks = Vec::new();
        for (i, call) in scenario.calls.iter().enumerate() {
            let outcome = self.make_call(call).with_context(|| format!("Call {}", i))?;
            if let Some(outcome) = outcome {
                checks.push(outcome);
            }
        }

        for (i, verify) in scenario.verify.iter().enumerate() {
            let outcome = self.run_verification(verify).with_context(|| format!("Verification {}", i))?;
            checks.extend(outcome);
        }

        let captures = self
            .slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.captured().iter().map(Value::to_string).collect()))
            .collect();

        let report = ScenarioReport {
            name,
            checks,
            captures,
        };
        if report.passed() {
            info!(scenario = %report.name, checks = report.checks.len(), "Scenario passed");
        } else {
            warn!(
                scenario = %report.name,
                failures = report.failures().count(),
                "Scenario failed"
            );
        }
        Ok(report)
    }

    fn declare_types(&mut self, scenario: &Scenario) {
        for (type_name, methods) in &scenario.types {
            for (method_name, spec) in methods {
                let mut method = MethodDescription::new(type_name.clone(), method_name.clone())
                    .params(spec.params.iter().map(|p| parse_type(p)))
                    .returns(parse_type(&spec.returns));
                if let Some(real) = &spec.real {
                    let real = json_to_literal(real);
                    method = method.with_real(move |_| Ok(real.clone()));
                }
                self.methods
                    .insert((type_name.clone(), method_name.clone()), Arc::new(method));
            }
        }
    }

    fn create_mocks(&mut self, scenario: &Scenario) {
        let relaxed_default = self.session.config().relaxed_by_default;
        for spec in &scenario.mocks {
            let mock = if spec.spy {
                self.session.spyk_named(&spec.type_name, &spec.name)
            } else {
                let relaxed = spec.relaxed.unwrap_or(relaxed_default);
                MockFactory::mockk(&self.session, &spec.type_name, Some(&spec.name), relaxed)
            };
            self.mocks.insert(spec.name.clone(), mock);
        }
    }

    fn mock(&self, name: &str) -> anyhow::Result<Mock> {
        self.mocks
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown mock '{}'", name))
    }

    fn method(&self, type_name: &str, method: &str) -> anyhow::Result<Arc<MethodDescription>> {
        self.methods
            .get(&(type_name.to_string(), method.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown method {}.{}", type_name, method))
    }

    fn slot(&mut self, name: &str) -> CaptureSlot {
        self.slots.entry(name.to_string()).or_default().clone()
    }

    fn literal(&self, value: &serde_json::Value) -> anyhow::Result<Value> {
        Ok(match value {
            serde_json::Value::String(s) if s.starts_with('@') => Value::Mock(self.mock(&s[1..])?),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(|v| self.literal(v)).collect::<anyhow::Result<_>>()?)
            }
            serde_json::Value::Object(_) => anyhow::bail!("maps are not supported as values: {}", value),
            other => json_to_literal(other),
        })
    }

    fn build_matcher(&mut self, spec: &MatcherSpec) -> anyhow::Result<Matcher> {
        Ok(match spec {
            MatcherSpec::Eq { value } => Matcher::Eq(self.literal(value)?),
            MatcherSpec::Any => Matcher::Any,
            MatcherSpec::OfType { of } => Matcher::OfType(parse_type(of)),
            MatcherSpec::Regex { pattern } => Matcher::regex(pattern)?,
            MatcherSpec::Glob { pattern } => Matcher::glob(pattern)?,
            MatcherSpec::Capture { slot } => Matcher::Capture(self.slot(slot)),
            MatcherSpec::Not { matcher } => Matcher::Not(Box::new(self.build_matcher(matcher)?)),
            MatcherSpec::And { matchers } => Matcher::And(
                matchers
                    .iter()
                    .map(|m| self.build_matcher(m))
                    .collect::<anyhow::Result<_>>()?,
            ),
            MatcherSpec::Or { matchers } => Matcher::Or(
                matchers
                    .iter()
                    .map(|m| self.build_matcher(m))
                    .collect::<anyhow::Result<_>>()?,
            ),
        })
    }

    fn plan_step(&mut self, type_name: &str, method: &str, args: &[ArgSpec]) -> anyhow::Result<PlannedStep> {
        let method = self.method(type_name, method)?;
        if args.len() != method.param_types.len() {
            anyhow::bail!(
                "{} expects {} argument(s), got {}",
                method,
                method.param_types.len(),
                args.len()
            );
        }
        let args = args
            .iter()
            .zip(&method.param_types)
            .map(|(arg, ty)| -> anyhow::Result<PlannedArg> {
                Ok(match arg {
                    ArgSpec::Matcher(spec) => PlannedArg::Matcher(self.build_matcher(spec)?, ty.clone()),
                    ArgSpec::Literal(value) => PlannedArg::Literal(self.literal(value)?),
                })
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(PlannedStep { method, args })
    }

    fn install_stub(&mut self, stub: &StubSpec) -> anyhow::Result<()> {
        let mock = self.mock(&stub.mock)?;
        let mut steps = vec![self.plan_step(mock.type_name(), &stub.method, &stub.args)?];
        for step in &stub.then {
            let previous = &steps[steps.len() - 1].method;
            let ValueType::Mock(next) = previous.return_type.clone() else {
                anyhow::bail!("{} does not return a mock", previous);
            };
            steps.push(self.plan_step(&next, &step.method, &step.args)?);
        }

        let answer = self.build_answer(&stub.answer)?;
        self.session
            .every(|s| {
                let mut subject = mock.clone();
                for (k, step) in steps.iter().enumerate() {
                    let returned = subject.invoke(&step.method, placeholders(s, &step.args)?)?;
                    if k + 1 < steps.len() {
                        subject = returned
                            .as_mock()
                            .cloned()
                            .ok_or_else(|| Error::thrown(format!("{} did not return a mock", step.method)))?;
                    }
                }
                Ok(())
            })?
            .answers_with(answer)?;

        debug!(mock = %stub.mock, method = %stub.method, chain = stub.then.len(), "Stub installed");
        Ok(())
    }

    fn build_answer(&self, spec: &AnswerSpec) -> anyhow::Result<Answer> {
        Ok(match spec {
            AnswerSpec::Returns { value } => Answer::Returns(self.literal(value)?),
            AnswerSpec::Throws { message } => Answer::throws(message.clone()),
            AnswerSpec::Many { values } => Answer::returns_many(
                values
                    .iter()
                    .map(|v| self.literal(v))
                    .collect::<anyhow::Result<Vec<_>>>()?,
            ),
            AnswerSpec::ReturnsArg { index } => {
                let index = *index;
                Answer::computes(move |call| {
                    call.invocation
                        .args
                        .get(index)
                        .cloned()
                        .ok_or_else(|| Error::thrown(format!("no argument {} in {}", index, call.invocation)))
                })
            }
            AnswerSpec::Template { template } => Answer::template(template.clone()),
            AnswerSpec::CallOriginal => Answer::CallOriginal,
            AnswerSpec::JustRuns => Answer::Returns(Value::Null),
        })
    }

    fn make_call(&mut self, spec: &CallSpec) -> anyhow::Result<Option<CheckOutcome>> {
        let mock = self.mock(&spec.mock)?;
        let method = self.method(mock.type_name(), &spec.method)?;
        let args = spec
            .args
            .iter()
            .map(|a| self.literal(a))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let description = format!("{}.{}({})", spec.mock, spec.method, join(&args));
        let result = mock.invoke(&method, args);
        debug!(call = %description, result = ?result, "Call made");

        if let (Some(name), Ok(Value::Mock(returned))) = (&spec.bind, &result) {
            self.mocks.insert(name.clone(), returned.clone());
        }

        let outcome = match (&spec.expect, &spec.expect_error, result) {
            (_, Some(expected), Err(e)) => check(description, e.to_string().contains(expected.as_str()), || {
                format!("expected error containing '{}', got '{}'", expected, e)
            }),
            (_, Some(expected), Ok(value)) => check(description, false, || {
                format!("expected error containing '{}', got {}", expected, value)
            }),
            (Some(expected), None, Ok(value)) => {
                let expected = self.literal(expected)?;
                check(description, value == expected, || {
                    format!("expected {}, got {}", expected, value)
                })
            }
            (_, None, Err(e)) => check(description, false, || format!("unexpected error: {}", e)),
            (None, None, Ok(_)) => return Ok(None),
        };
        Ok(Some(outcome))
    }

    fn run_verification(&mut self, spec: &VerifySpec) -> anyhow::Result<Vec<CheckOutcome>> {
        let mut outcomes = Vec::new();

        if !spec.calls.is_empty() {
            let mut planned = Vec::with_capacity(spec.calls.len());
            for call in &spec.calls {
                let mock = self.mock(&call.mock)?;
                let step = self.plan_step(mock.type_name(), &call.method, &call.args)?;
                planned.push((mock, step));
            }

            let description = format!(
                "verify {:?} [{}]",
                spec.ordering,
                spec.calls
                    .iter()
                    .map(|c| format!("{}.{}", c.mock, c.method))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let result = self.session.verify_result(spec.ordering, spec.bounds(), |s| {
                for (mock, step) in &planned {
                    mock.invoke(&step.method, placeholders(s, &step.args)?)?;
                }
                Ok(())
            });
            outcomes.push(match result {
                Ok(result) => CheckOutcome {
                    description,
                    passed: result.matches,
                    message: result.message,
                },
                Err(e) => check(description, false, || e.to_string()),
            });
        }

        if !spec.was_not_called.is_empty() {
            let mocks = spec
                .was_not_called
                .iter()
                .map(|name| self.mock(name))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let description = format!("was not called [{}]", spec.was_not_called.join(", "));
            let result = self.session.check_was_not_called(&mocks);
            outcomes.push(match result {
                Ok(()) => check(description, true, String::new),
                Err(e) => check(description, false, || e.to_string()),
            });
        }
        Ok(outcomes)
    }
}

fn placeholders(scope: &MatcherScope<'_>, args: &[PlannedArg]) -> crate::Result<Vec<Value>> {
    args.iter()
        .map(|arg| match arg {
            PlannedArg::Matcher(matcher, ty) => scope.matcher(matcher.clone(), ty.clone()),
            PlannedArg::Literal(value) => Ok(value.clone()),
        })
        .collect()
}

fn check(description: String, passed: bool, message: impl FnOnce() -> String) -> CheckOutcome {
    CheckOutcome {
        description,
        passed,
        message: (!passed).then(message),
    }
}

fn join(args: &[Value]) -> String {
    args.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
}

fn json_to_literal(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(json_to_literal).collect()),
        serde_json::Value::Object(_) => Value::Str(value.to_string()),
    }
}

//! Per-mock store of answers, recorded calls and child mocks.

use crate::answer::Answer;
use crate::error::{Error, Result};
use crate::gateway::SessionInner;
use crate::invocation::{
    next_timestamp, Call, Invocation, InvocationMatcher, MatcherKey, MethodDescription, OriginalCall,
};
use crate::matcher::Matcher;
use crate::value::{Value, ValueType};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// What happens to calls no answer matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    /// Fail with [`Error::UnansweredCall`] (or answer defaults when relaxed)
    Mock,
    /// Delegate to the real implementation
    Spy,
}

struct InvocationAnswer {
    matcher: InvocationMatcher,
    answer: Answer,
}

/// Settings a stub is created with.
#[derive(Debug, Clone)]
pub(crate) struct StubSettings {
    pub kind: StubKind,
    pub relaxed: bool,
    pub log_matches: bool,
    pub log_unanswered: bool,
}

/// Store of answers, call history and child mocks for one mock.
///
/// All three stores are guarded separately and can be used from any thread.
pub struct Stub {
    id: u64,
    type_name: String,
    name: String,
    settings: StubSettings,
    answers: Mutex<Vec<Arc<InvocationAnswer>>>,
    recorded_calls: Mutex<Vec<Invocation>>,
    childs: Mutex<HashMap<MatcherKey, Mock>>,
    session: Weak<SessionInner>,
}

fn child_of_regex() -> &'static Regex {
    static CHILD_OF: OnceLock<Regex> = OnceLock::new();
    CHILD_OF.get_or_init(|| Regex::new(r"^child(\^(\d+))? of (.+)$").expect("valid child name regex"))
}

/// Name of a child mock: `child of X`, then `child^2 of X`, `child^3 of X`...
pub fn child_name(parent: &str) -> String {
    match child_of_regex().captures(parent) {
        Some(caps) => {
            let depth = caps
                .get(2)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(1);
            let base = caps.get(3).map_or("", |m| m.as_str());
            format!("child^{} of {}", depth + 1, base)
        }
        None => format!("child of {}", parent),
    }
}

impl Stub {
    pub(crate) fn new(
        id: u64,
        type_name: String,
        name: String,
        settings: StubSettings,
        session: Weak<SessionInner>,
    ) -> Self {
        Self {
            id,
            type_name,
            name,
            settings,
            answers: Mutex::new(Vec::new()),
            recorded_calls: Mutex::new(Vec::new()),
            childs: Mutex::new(HashMap::new()),
            session,
        }
    }

    /// Mock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mocked type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> StubKind {
        self.settings.kind
    }

    pub fn is_relaxed(&self) -> bool {
        self.settings.relaxed
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session.upgrade().ok_or(Error::SessionClosed)
    }

    /// Append an answer. Later answers win over earlier overlapping ones.
    pub fn add_answer(&self, matcher: InvocationMatcher, answer: Answer) {
        self.answers
            .lock()
            .push(Arc::new(InvocationAnswer { matcher, answer }));
    }

    /// Number of registered answers.
    pub fn answer_count(&self) -> usize {
        self.answers.lock().len()
    }

    /// Resolve the result of a live call.
    ///
    /// The most recently added matching answer is used. Capturing matchers
    /// record the arguments before the answer runs.
    pub fn answer(&self, invocation: &Invocation) -> Result<Value> {
        // Matchers and answers may call back into this mock: never hold the
        // lock while evaluating them.
        let answers = self.answers.lock().clone();
        let found = answers.iter().rev().find(|a| a.matcher.matches(invocation));

        let Some(entry) = found else {
            return self.default_answer(invocation);
        };

        if self.settings.log_matches {
            debug!(mock = %self.name, matcher = %entry.matcher, "Answer matched");
        }

        entry.matcher.capture_args(invocation);
        let call = Call::new(
            invocation.method.return_type.clone(),
            invocation.clone(),
            entry.matcher.clone(),
            false,
        );
        entry.answer.answer(&call)
    }

    fn std_object_functions(&self, invocation: &Invocation) -> Option<Value> {
        let method = &invocation.method;
        if method.is_to_string() {
            Some(Value::Str(self.to_str()))
        } else if method.is_hash_code() {
            Some(Value::Int(self.id as i64))
        } else if method.is_equals() {
            let same = invocation
                .args
                .first()
                .and_then(Value::as_mock)
                .is_some_and(|other| other.id() == self.id);
            Some(Value::Bool(same))
        } else {
            None
        }
    }

    fn default_answer(&self, invocation: &Invocation) -> Result<Value> {
        if self.settings.kind == StubKind::Spy {
            return (invocation.original_call)();
        }
        if let Some(value) = self.std_object_functions(invocation) {
            return Ok(value);
        }
        if self.settings.relaxed {
            return self.relaxed_answer(invocation);
        }
        if self.settings.log_unanswered {
            debug!(mock = %self.name, call = %invocation, "No answer found");
        }
        Err(Error::UnansweredCall(invocation.to_string()))
    }

    fn relaxed_answer(&self, invocation: &Invocation) -> Result<Value> {
        let ret_type = invocation.method.return_type.clone();
        if ret_type.is_mock() {
            let matcher = InvocationMatcher::new(
                invocation.subject.clone(),
                invocation.method.clone(),
                invocation.args.iter().cloned().map(Matcher::Eq).collect(),
            )?;
            return self.child_mockk(&Call::new(ret_type, invocation.clone(), matcher, false));
        }
        let session = self.session()?;
        Ok(session.instantiator().any_value(&ret_type, &|| Value::Null))
    }

    /// Append a call to the history.
    pub fn record_call(&self, invocation: Invocation) {
        self.recorded_calls.lock().push(invocation);
    }

    /// Snapshot of the history.
    pub fn all_recorded_calls(&self) -> Vec<Invocation> {
        self.recorded_calls.lock().clone()
    }

    /// Child mock returned by the call, created on first use and shared by
    /// every call with an equal matcher.
    pub fn child_mockk(&self, call: &Call) -> Result<Value> {
        let key = call.matcher.key();
        let mut childs = self.childs.lock();
        if let Some(child) = childs.get(&key) {
            return Ok(Value::Mock(child.clone()));
        }

        let type_name = match &call.ret_type {
            ValueType::Mock(name) => name.clone(),
            other => other.to_string(),
        };
        let session = self.session()?;
        let child = session.create_mock(
            type_name,
            Some(child_name(&self.name)),
            StubKind::Mock,
            self.settings.relaxed,
        );
        debug!(parent = %self.name, child = %child.name(), "Child mock created");
        childs.insert(key, child.clone());
        Ok(Value::Mock(child))
    }

    /// Number of cached child mocks.
    pub fn child_count(&self) -> usize {
        self.childs.lock().len()
    }

    /// Reset any combination of answers, history and child mocks.
    pub fn clear(&self, answers: bool, calls: bool, child_mocks: bool) {
        if answers {
            self.answers.lock().clear();
        }
        if calls {
            self.recorded_calls.lock().clear();
        }
        if child_mocks {
            self.childs.lock().clear();
        }
    }

    /// Entry point of every intercepted call.
    ///
    /// Builds the invocation and hands it to the calling thread's recorder,
    /// which either answers it or captures it for a declaration block.
    pub fn handle_invocation(
        &self,
        subject: &Mock,
        method: Arc<MethodDescription>,
        original_call: Option<OriginalCall>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let original: OriginalCall = if method.is_to_string() {
            let display = self.to_str();
            Arc::new(move || Ok(Value::Str(display.clone())))
        } else if let Some(original) = original_call {
            original
        } else if let Some(real) = method.real.clone() {
            let args = args.clone();
            Arc::new(move || real(&args))
        } else {
            let described = format!("{}.{}", self.to_str(), method.name);
            Arc::new(move || Err(Error::NoOriginalCall(described.clone())))
        };

        let invocation = Invocation {
            subject: subject.downgrade(),
            self_name: self.to_str(),
            method,
            args,
            timestamp: next_timestamp(),
            original_call: original,
        };

        self.session()?.call(invocation)
    }

    /// Display form, `mockk<Type>(name)#id` or `spyk<Type>(name)#id`.
    pub fn to_str(&self) -> String {
        let prefix = match self.settings.kind {
            StubKind::Mock => "mockk",
            StubKind::Spy => "spyk",
        };
        format!("{}<{}>({})#{:x}", prefix, self.type_name, self.name, self.id)
    }
}

/// Handle to a mock. Clones refer to the same mock.
#[derive(Clone)]
pub struct Mock {
    stub: Arc<Stub>,
}

impl Mock {
    pub(crate) fn new(stub: Stub) -> Self {
        Self {
            stub: Arc::new(stub),
        }
    }

    /// Identity of this mock.
    pub fn id(&self) -> u64 {
        self.stub.id
    }

    pub fn name(&self) -> &str {
        self.stub.name()
    }

    pub fn type_name(&self) -> &str {
        self.stub.type_name()
    }

    /// The mock's stub.
    pub fn stub(&self) -> &Stub {
        &self.stub
    }

    pub fn to_str(&self) -> String {
        self.stub.to_str()
    }

    /// Non-owning handle, stored in invocations and matchers.
    pub fn downgrade(&self) -> WeakMock {
        WeakMock {
            id: self.id(),
            display: Arc::from(self.to_str()),
            inner: Arc::downgrade(&self.stub),
        }
    }

    /// Intercept a call to `method`.
    pub fn invoke(&self, method: &Arc<MethodDescription>, args: Vec<Value>) -> Result<Value> {
        self.stub.handle_invocation(self, method.clone(), None, args)
    }

    /// Intercept a call, binding the thunk that runs the real implementation.
    pub fn invoke_with_original(
        &self,
        method: &Arc<MethodDescription>,
        args: Vec<Value>,
        original: OriginalCall,
    ) -> Result<Value> {
        self.stub.handle_invocation(self, method.clone(), Some(original), args)
    }
}

impl fmt::Debug for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl fmt::Display for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

/// Non-owning mock handle. Keeps the id and display name after the mock is
/// gone so diagnostics stay readable.
#[derive(Clone)]
pub struct WeakMock {
    id: u64,
    display: Arc<str>,
    inner: Weak<Stub>,
}

impl WeakMock {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display
    }

    /// The mock, if it is still alive.
    pub fn upgrade(&self) -> Option<Mock> {
        self.inner.upgrade().map(|stub| Mock { stub })
    }
}

impl fmt::Debug for WeakMock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockSession;
    use crate::matcher::CaptureSlot;
    use std::thread;

    fn find_method() -> Arc<MethodDescription> {
        Arc::new(
            MethodDescription::new("Repo", "find")
                .params([ValueType::Int])
                .returns(ValueType::Str),
        )
    }

    fn matcher(mock: &Mock, method: &Arc<MethodDescription>, arg: Matcher) -> InvocationMatcher {
        InvocationMatcher::new(mock.downgrade(), method.clone(), vec![arg]).unwrap()
    }

    #[test]
    fn test_child_name() {
        assert_eq!(child_name("repo"), "child of repo");
        assert_eq!(child_name("child of repo"), "child^2 of repo");
        assert_eq!(child_name("child^2 of repo"), "child^3 of repo");
        assert_eq!(child_name("child^9 of child of x"), "child^10 of child of x");
    }

    #[test]
    fn test_last_registered_answer_wins() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find_method();

        repo.stub().add_answer(matcher(&repo, &find, Matcher::Any), Answer::returns("any"));
        repo.stub().add_answer(matcher(&repo, &find, Matcher::eq(1)), Answer::returns("one"));
        repo.stub().add_answer(matcher(&repo, &find, Matcher::eq(2)), Answer::returns("two"));

        assert_eq!(repo.invoke(&find, vec![1.into()]).unwrap(), Value::from("one"));
        assert_eq!(repo.invoke(&find, vec![2.into()]).unwrap(), Value::from("two"));
        assert_eq!(repo.invoke(&find, vec![3.into()]).unwrap(), Value::from("any"));

        repo.stub().add_answer(matcher(&repo, &find, Matcher::Any), Answer::returns("override"));
        assert_eq!(repo.invoke(&find, vec![1.into()]).unwrap(), Value::from("override"));
    }

    #[test]
    fn test_capture_then_echo() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find_method();
        let slot = CaptureSlot::new();

        let echo = slot.clone();
        repo.stub().add_answer(
            matcher(&repo, &find, Matcher::Capture(slot.clone())),
            Answer::computes(move |_| Ok(echo.last().unwrap_or(Value::Null))),
        );

        assert_eq!(repo.invoke(&find, vec![5.into()]).unwrap(), Value::Int(5));
        assert_eq!(repo.invoke(&find, vec![7.into()]).unwrap(), Value::Int(7));
        assert_eq!(slot.captured(), vec![Value::Int(5), Value::Int(7)]);
    }

    #[test]
    fn test_no_capture_on_partial_match() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let save = Arc::new(
            MethodDescription::new("Repo", "save")
                .params([ValueType::Int, ValueType::Str])
                .returns(ValueType::Bool),
        );
        let slot = CaptureSlot::new();
        repo.stub().add_answer(
            InvocationMatcher::new(
                repo.downgrade(),
                save.clone(),
                vec![Matcher::Capture(slot.clone()), Matcher::eq("ok")],
            )
            .unwrap(),
            Answer::returns(true),
        );

        assert!(repo.invoke(&save, vec![1.into(), "nope".into()]).is_err());
        assert!(slot.is_empty());
        assert_eq!(repo.invoke(&save, vec![2.into(), "ok".into()]).unwrap(), Value::Bool(true));
        assert_eq!(slot.captured(), vec![Value::Int(2)]);
    }

    #[test]
    fn test_unanswered_call_names_invocation() {
        let session = MockSession::default();
        let repo = session.mockk_named("Repo", "repo");
        let err = repo.invoke(&find_method(), vec![9.into()]).unwrap_err();
        match err {
            Error::UnansweredCall(msg) => assert!(msg.contains("(repo)") && msg.contains("find(9)")),
            other => panic!("unexpected error: {other:?}"),
        }
        // Unanswered calls are still recorded
        assert_eq!(repo.stub().all_recorded_calls().len(), 1);
    }

    #[test]
    fn test_standard_object_functions() {
        let session = MockSession::default();
        let repo = session.mockk_named("Repo", "repo");
        let other = session.mockk("Repo");

        let to_string = Arc::new(MethodDescription::to_string_method("Repo"));
        let hash_code = Arc::new(MethodDescription::hash_code_method("Repo"));
        let equals = Arc::new(MethodDescription::equals_method("Repo"));

        assert_eq!(repo.invoke(&to_string, vec![]).unwrap(), Value::Str(repo.to_str()));
        assert_eq!(repo.invoke(&hash_code, vec![]).unwrap(), Value::Int(repo.id() as i64));
        assert_eq!(
            repo.invoke(&equals, vec![Value::Mock(repo.clone())]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            repo.invoke(&equals, vec![Value::Mock(other)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(repo.invoke(&equals, vec![Value::Null]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_relaxed_mock_answers_defaults() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        assert_eq!(repo.invoke(&find_method(), vec![1.into()]).unwrap(), Value::from(""));

        let conn = Arc::new(
            MethodDescription::new("Repo", "connection").returns(ValueType::mock("Connection")),
        );
        let first = repo.invoke(&conn, vec![]).unwrap();
        let second = repo.invoke(&conn, vec![]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_mock().unwrap().name(), format!("child of {}", repo.name()));
    }

    #[test]
    fn test_spy_delegates_to_real_implementation() {
        let session = MockSession::default();
        let calc = session.spyk("Calculator");
        let double = Arc::new(
            MethodDescription::new("Calculator", "double")
                .params([ValueType::Int])
                .returns(ValueType::Int)
                .with_real(|args| Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))),
        );

        assert_eq!(calc.invoke(&double, vec![21.into()]).unwrap(), Value::Int(42));

        calc.stub().add_answer(matcher(&calc, &double, Matcher::eq(1)), Answer::returns(100));
        assert_eq!(calc.invoke(&double, vec![1.into()]).unwrap(), Value::Int(100));
        assert_eq!(calc.invoke(&double, vec![2.into()]).unwrap(), Value::Int(4));
        assert!(calc.to_str().starts_with("spyk<Calculator>"));
    }

    #[test]
    fn test_spy_without_real_implementation_fails() {
        let session = MockSession::default();
        let spy = session.spyk("Thing");
        let err = spy.invoke(&find_method(), vec![1.into()]).unwrap_err();
        assert!(matches!(err, Error::NoOriginalCall(_)));
    }

    #[test]
    fn test_recorded_calls_are_snapshots() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        let find = find_method();

        repo.invoke(&find, vec![1.into()]).unwrap();
        let snapshot = repo.stub().all_recorded_calls();
        repo.invoke(&find, vec![2.into()]).unwrap();
        repo.stub().clear(false, true, false);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].args, vec![Value::Int(1)]);
        assert!(repo.stub().all_recorded_calls().is_empty());
    }

    #[test]
    fn test_child_mocks_memoized_by_matcher() {
        let session = MockSession::default();
        let repo = session.mockk_named("Repo", "repo");
        let conn = Arc::new(
            MethodDescription::new("Repo", "connection")
                .params([ValueType::Str])
                .returns(ValueType::mock("Connection")),
        );
        let dummy = repo
            .invoke(&Arc::new(MethodDescription::to_string_method("Repo")), vec![])
            .unwrap();
        assert!(dummy.as_str().is_some());
        let invocation = repo.stub().all_recorded_calls().remove(0);

        let call = |arg: &str| {
            Call::new(
                ValueType::mock("Connection"),
                invocation.clone(),
                matcher(&repo, &conn, Matcher::eq(arg)),
                false,
            )
        };

        let a1 = repo.stub().child_mockk(&call("a")).unwrap();
        let a2 = repo.stub().child_mockk(&call("a")).unwrap();
        let b = repo.stub().child_mockk(&call("b")).unwrap();

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.as_mock().unwrap().name(), "child of repo");
        assert_eq!(a1.as_mock().unwrap().type_name(), "Connection");
        assert_eq!(repo.stub().child_count(), 2);

        repo.stub().clear(false, false, true);
        assert_eq!(repo.stub().child_count(), 0);
        assert_ne!(repo.stub().child_mockk(&call("a")).unwrap(), a1);
    }

    #[test]
    fn test_clear_answers_keeps_history() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find_method();
        repo.stub().add_answer(matcher(&repo, &find, Matcher::Any), Answer::returns("x"));
        repo.invoke(&find, vec![1.into()]).unwrap();

        repo.stub().clear(true, false, false);

        assert_eq!(repo.stub().answer_count(), 0);
        assert_eq!(repo.stub().all_recorded_calls().len(), 1);
        assert!(matches!(
            repo.invoke(&find, vec![1.into()]),
            Err(Error::UnansweredCall(_))
        ));
    }

    #[test]
    fn test_concurrent_calls_are_all_recorded() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        let find = find_method();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let repo = repo.clone();
                let find = find.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        repo.invoke(&find, vec![Value::Int(t * 1000 + i)]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let calls = repo.stub().all_recorded_calls();
        assert_eq!(calls.len(), 800);
    }
}

//! Mock session: the entry point of the engine.
//!
//! A [`MockSession`] creates mocks, owns one [`CallRecorder`] per calling
//! thread and runs declaration blocks through the capture protocol:
//!
//! ```ignore
//! let session = MockSession::default();
//! let repo = session.mockk("Repo");
//!
//! session
//!     .every(|s| {
//!         repo.invoke(&find, vec![s.any(ValueType::Int)?])?;
//!         Ok(())
//!     })?
//!     .returns("found")?;
//!
//! repo.invoke(&find, vec![Value::Int(7)])?;
//!
//! session.verify(Ordering::Unordered, VerificationBounds::exactly(1), |s| {
//!     repo.invoke(&find, vec![s.eq(7)?])?;
//!     Ok(())
//! })?;
//! ```
//!
//! Mocks keep a weak reference to their session. Once every session handle is
//! dropped, calling a mock fails with [`Error::SessionClosed`].

use crate::answer::Answer;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::instantiator::{DefaultInstantiator, FactoryRegistration, InstanceFactory, Instantiator};
use crate::invocation::{Call, Invocation};
use crate::matcher::{CaptureSlot, Matcher};
use crate::recorder::{CallRecorder, Dispatch, RecorderMode};
use crate::stub::{Mock, Stub, StubKind, StubSettings};
use crate::value::{Value, ValueType};
use crate::verifier::{self, Ordering, VerificationBounds, VerificationResult};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, info};

static NEXT_MOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Creates mocks on behalf of stubs and users.
pub trait MockFactory {
    /// Create a mock of `type_name`. Unnamed mocks are named after their id.
    fn mockk(&self, type_name: &str, name: Option<&str>, relaxed: bool) -> Mock;

    /// Create a spy of `type_name`: unanswered calls run the real method.
    fn spyk(&self, type_name: &str, name: Option<&str>) -> Mock;
}

thread_local! {
    static THREAD_RECORDERS: ThreadRecorders = ThreadRecorders::default();
}

/// Sessions holding a recorder for the current thread. Dropped on thread
/// exit, which removes those recorders from their sessions.
#[derive(Default)]
struct ThreadRecorders {
    sessions: RefCell<Vec<(ThreadId, Weak<SessionInner>)>>,
}

impl ThreadRecorders {
    fn track(&self, thread: ThreadId, session: Weak<SessionInner>) {
        let mut sessions = self.sessions.borrow_mut();
        sessions.retain(|(_, s)| s.strong_count() > 0);
        sessions.push((thread, session));
    }
}

impl Drop for ThreadRecorders {
    fn drop(&mut self) {
        for (thread, session) in self.sessions.get_mut().drain(..) {
            if let Some(session) = session.upgrade() {
                session.recorders.lock().remove(&thread);
            }
        }
    }
}

/// State shared by every handle of a session.
pub(crate) struct SessionInner {
    config: EngineConfig,
    instantiator: Arc<dyn Instantiator>,
    recorders: Mutex<HashMap<ThreadId, Arc<Mutex<CallRecorder>>>>,
    this: Weak<SessionInner>,
}

impl SessionInner {
    pub(crate) fn instantiator(&self) -> &dyn Instantiator {
        self.instantiator.as_ref()
    }

    pub(crate) fn create_mock(
        &self,
        type_name: String,
        name: Option<String>,
        kind: StubKind,
        relaxed: bool,
    ) -> Mock {
        let id = NEXT_MOCK_ID.fetch_add(1, atomic::Ordering::Relaxed);
        let name = name.unwrap_or_else(|| format!("#{}", id));
        let settings = StubSettings {
            kind,
            relaxed,
            log_matches: self.config.log_matches,
            log_unanswered: self.config.log_unanswered,
        };
        Mock::new(Stub::new(id, type_name, name, settings, self.this.clone()))
    }

    /// Recorder of the calling thread, created on first use and dropped when
    /// the thread exits.
    pub(crate) fn recorder(&self) -> Arc<Mutex<CallRecorder>> {
        let thread = thread::current().id();
        let recorder = {
            let mut recorders = self.recorders.lock();
            if let Some(recorder) = recorders.get(&thread) {
                return recorder.clone();
            }
            let recorder = Arc::new(Mutex::new(CallRecorder::new(self.config.recorder_settings())));
            recorders.insert(thread, recorder.clone());
            recorder
        };

        // Fails only while the thread is tearing down its locals.
        let tracked = THREAD_RECORDERS.try_with(|owned| owned.track(thread, self.this.clone()));
        if tracked.is_err() {
            debug!(thread = ?thread, "Recorder created during thread teardown");
        }
        recorder
    }

    /// Route an intercepted call: captured while a block is being recorded,
    /// otherwise recorded in the subject's history and answered.
    pub(crate) fn call(&self, invocation: Invocation) -> Result<Value> {
        let recorder = self.recorder();
        // Bind first: the recorder lock must be released before answering.
        let dispatch = recorder.lock().call(invocation, self)?;
        match dispatch {
            Dispatch::Captured(dummy) => Ok(dummy),
            Dispatch::Live(invocation) => {
                let subject = invocation.subject.upgrade().ok_or(Error::SessionClosed)?;
                subject.stub().record_call(invocation.clone());
                subject.stub().answer(&invocation)
            }
        }
    }
}

impl MockFactory for SessionInner {
    fn mockk(&self, type_name: &str, name: Option<&str>, relaxed: bool) -> Mock {
        let mock = self.create_mock(type_name.to_string(), name.map(str::to_string), StubKind::Mock, relaxed);
        debug!(mock = %mock, relaxed = relaxed, "Mock created");
        mock
    }

    fn spyk(&self, type_name: &str, name: Option<&str>) -> Mock {
        let mock = self.create_mock(type_name.to_string(), name.map(str::to_string), StubKind::Spy, false);
        debug!(mock = %mock, "Spy created");
        mock
    }
}

/// Handle to a mocking session. Clones share the same session.
#[derive(Clone)]
pub struct MockSession {
    inner: Arc<SessionInner>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl MockSession {
    /// Create a session with the default instantiator.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_instantiator(config, Arc::new(DefaultInstantiator::new()))
    }

    /// Create a session with a custom instantiator.
    pub fn with_instantiator(config: EngineConfig, instantiator: Arc<dyn Instantiator>) -> Self {
        let inner = Arc::new_cyclic(|this| SessionInner {
            config,
            instantiator,
            recorders: Mutex::new(HashMap::new()),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn instantiator(&self) -> &dyn Instantiator {
        self.inner.instantiator()
    }

    /// Mock of `type_name`, relaxed if the configuration says so.
    pub fn mockk(&self, type_name: &str) -> Mock {
        self.inner.mockk(type_name, None, self.inner.config.relaxed_by_default)
    }

    pub fn mockk_named(&self, type_name: &str, name: &str) -> Mock {
        self.inner
            .mockk(type_name, Some(name), self.inner.config.relaxed_by_default)
    }

    /// Mock answering type defaults for calls without an answer.
    pub fn relaxed_mockk(&self, type_name: &str) -> Mock {
        self.inner.mockk(type_name, None, true)
    }

    pub fn spyk(&self, type_name: &str) -> Mock {
        self.inner.spyk(type_name, None)
    }

    pub fn spyk_named(&self, type_name: &str, name: &str) -> Mock {
        self.inner.spyk(type_name, Some(name))
    }

    /// Record a stubbing block.
    ///
    /// The block runs once per capture round and must make the same calls
    /// every time. The returned scope binds the answer; dropping it without
    /// answering discards the expectation.
    pub fn every<F>(&self, block: F) -> Result<StubScope>
    where
        F: FnMut(&MatcherScope<'_>) -> Result<()>,
    {
        let recorder = self.inner.recorder();
        self.capture(&recorder, RecorderMode::Stubbing, block)?;
        if recorder.lock().calls().is_empty() {
            recorder.lock().cancel();
            return Err(Error::EmptyExpectation("every"));
        }
        Ok(StubScope {
            recorder,
            committed: false,
        })
    }

    /// Record a verification block and fail with
    /// [`Error::VerificationFailed`] when it does not hold.
    pub fn verify<F>(&self, ordering: Ordering, bounds: VerificationBounds, block: F) -> Result<()>
    where
        F: FnMut(&MatcherScope<'_>) -> Result<()>,
    {
        let result = self.verify_result(ordering, bounds, block)?;
        if result.matches {
            return Ok(());
        }
        Err(Error::VerificationFailed(
            result.message.unwrap_or_else(|| "verification failed".to_string()),
        ))
    }

    /// Record a verification block and return the verifier's verdict.
    pub fn verify_result<F>(
        &self,
        ordering: Ordering,
        bounds: VerificationBounds,
        block: F,
    ) -> Result<VerificationResult>
    where
        F: FnMut(&MatcherScope<'_>) -> Result<()>,
    {
        let recorder = self.inner.recorder();
        self.capture(&recorder, RecorderMode::Verifying, block)?;

        let done = recorder.lock().done_verification();
        let calls = done.inspect_err(|_| recorder.lock().cancel())?;

        let (min, max) = bounds.range();
        let mut result = verifier::verifier(ordering).verify(&calls, min, max);
        if bounds.inverse {
            result = result.invert(&calls);
        }

        if result.matches {
            result.capture(&calls);
        } else {
            info!(ordering = ?ordering, calls = calls.len(), "Verification failed");
        }
        Ok(result)
    }

    /// Fail when any of the mocks has been called.
    pub fn check_was_not_called(&self, mocks: &[Mock]) -> Result<()> {
        let result = verifier::check_was_not_called(mocks);
        if result.matches {
            return Ok(());
        }
        Err(Error::VerificationFailed(result.message.unwrap_or_default()))
    }

    /// Reset the selected stores of each mock.
    pub fn clear(&self, mocks: &[Mock], answers: bool, calls: bool, child_mocks: bool) {
        for mock in mocks {
            mock.stub().clear(answers, calls, child_mocks);
        }
        debug!(mocks = mocks.len(), answers, calls, child_mocks, "Mocks cleared");
    }

    /// Register an instance factory for the lifetime of the returned guard.
    pub fn register_instance_factory<F>(&self, factory: F) -> FactoryRegistration
    where
        F: InstanceFactory + 'static,
    {
        FactoryRegistration::new(self.inner.instantiator.clone(), Arc::new(factory))
    }

    /// Run `f` with an instance factory registered, releasing it afterwards.
    pub fn with_instance_factory<F, R>(&self, factory: F, f: impl FnOnce() -> R) -> R
    where
        F: InstanceFactory + 'static,
    {
        let _registration = self.register_instance_factory(factory);
        f()
    }

    /// Drop the calling thread's recorder now, cancelling any open block.
    /// Recorders of exited threads are dropped without this.
    pub fn release_thread(&self) {
        if let Some(recorder) = self.inner.recorders.lock().remove(&thread::current().id()) {
            recorder.lock().cancel();
        }
    }

    /// Number of threads holding a recorder.
    pub fn recorder_count(&self) -> usize {
        self.inner.recorders.lock().len()
    }

    fn capture<F>(&self, recorder: &Arc<Mutex<CallRecorder>>, mode: RecorderMode, mut block: F) -> Result<()>
    where
        F: FnMut(&MatcherScope<'_>) -> Result<()>,
    {
        {
            let mut recorder = recorder.lock();
            match mode {
                RecorderMode::Verifying => recorder.start_verification()?,
                _ => recorder.start_stubbing()?,
            }
        }

        let scope = MatcherScope {
            session: &self.inner,
            recorder,
        };
        let result = self.run_rounds(&scope, &mut block);
        if result.is_err() {
            recorder.lock().cancel();
        }
        result
    }

    fn run_rounds<F>(&self, scope: &MatcherScope<'_>, block: &mut F) -> Result<()>
    where
        F: FnMut(&MatcherScope<'_>) -> Result<()>,
    {
        let mut rounds = 1;
        let mut round = 0;
        while round < rounds {
            block(scope)?;

            let mut recorder = scope.recorder.lock();
            if round == 0 {
                rounds = recorder.estimate_call_rounds(self.inner.instantiator());
                debug!(rounds, calls = recorder.n_calls(), "Capture rounds estimated");
            }
            recorder.catch_args(round, rounds, &self.inner)?;
            round += 1;
        }
        Ok(())
    }
}

impl MockFactory for MockSession {
    fn mockk(&self, type_name: &str, name: Option<&str>, relaxed: bool) -> Mock {
        self.inner.mockk(type_name, name, relaxed)
    }

    fn spyk(&self, type_name: &str, name: Option<&str>) -> Mock {
        self.inner.spyk(type_name, name)
    }
}

/// Matcher constructors available inside a declaration block.
///
/// Each method registers a matcher with the recorder and returns the
/// placeholder value to pass to the mock in its place.
pub struct MatcherScope<'a> {
    session: &'a SessionInner,
    recorder: &'a Mutex<CallRecorder>,
}

impl MatcherScope<'_> {
    /// Register any matcher for an argument of type `ty`.
    pub fn matcher(&self, matcher: Matcher, ty: ValueType) -> Result<Value> {
        self.recorder.lock().matcher(matcher, ty, self.session)
    }

    pub fn eq(&self, value: impl Into<Value>) -> Result<Value> {
        let value = value.into();
        let ty = value.value_type();
        self.matcher(Matcher::Eq(value), ty)
    }

    pub fn any(&self, ty: ValueType) -> Result<Value> {
        self.matcher(Matcher::Any, ty)
    }

    pub fn of_type(&self, ty: ValueType) -> Result<Value> {
        self.matcher(Matcher::OfType(ty.clone()), ty)
    }

    /// Capture every argument the call is answered or verified with.
    pub fn capture(&self, slot: &CaptureSlot, ty: ValueType) -> Result<Value> {
        self.matcher(Matcher::Capture(slot.clone()), ty)
    }

    pub fn matching<F>(&self, description: &str, ty: ValueType, predicate: F) -> Result<Value>
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.matcher(Matcher::matching(description, predicate), ty)
    }

    pub fn not(&self, matcher: Matcher, ty: ValueType) -> Result<Value> {
        self.matcher(Matcher::Not(Box::new(matcher)), ty)
    }

    pub fn and(&self, matchers: Vec<Matcher>, ty: ValueType) -> Result<Value> {
        self.matcher(Matcher::And(matchers), ty)
    }

    pub fn or(&self, matchers: Vec<Matcher>, ty: ValueType) -> Result<Value> {
        self.matcher(Matcher::Or(matchers), ty)
    }

    pub fn regex(&self, pattern: &str) -> Result<Value> {
        self.matcher(Matcher::regex(pattern)?, ValueType::Str)
    }

    pub fn glob(&self, pattern: &str) -> Result<Value> {
        self.matcher(Matcher::glob(pattern)?, ValueType::Str)
    }

    /// Make the `n`-th next call (0 = next) return a dummy of `ty`.
    pub fn hint_next_return_type(&self, ty: ValueType, n: usize) {
        self.recorder.lock().hint_next_return_type(ty, n);
    }

    /// Calls made so far in the current round.
    pub fn n_calls(&self) -> usize {
        self.recorder.lock().n_calls()
    }
}

/// A recorded `every` block waiting for its answer.
pub struct StubScope {
    recorder: Arc<Mutex<CallRecorder>>,
    committed: bool,
}

impl StubScope {
    /// Bind `answer` to the recorded call.
    pub fn answers_with(mut self, answer: Answer) -> Result<()> {
        self.committed = true;
        let result = self.recorder.lock().answer(answer);
        if result.is_err() {
            self.recorder.lock().cancel();
        }
        result
    }

    pub fn returns(self, value: impl Into<Value>) -> Result<()> {
        self.answers_with(Answer::returns(value))
    }

    pub fn throws(self, message: impl Into<String>) -> Result<()> {
        self.answers_with(Answer::throws(message))
    }

    /// Answer with a closure over the matched call.
    pub fn answers<F>(self, f: F) -> Result<()>
    where
        F: Fn(&Call) -> Result<Value> + Send + Sync + 'static,
    {
        self.answers_with(Answer::computes(f))
    }

    /// Return the values in turn, repeating the last one.
    pub fn returns_many<I, V>(self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.answers_with(Answer::returns_many(values))
    }

    pub fn calls_original(self) -> Result<()> {
        self.answers_with(Answer::CallOriginal)
    }

    /// Render a Handlebars template with the call as context.
    pub fn answers_template(self, template: impl Into<String>) -> Result<()> {
        self.answers_with(Answer::template(template))
    }

    /// Return nothing.
    pub fn just_runs(self) -> Result<()> {
        self.answers_with(Answer::Returns(Value::Null))
    }
}

impl Drop for StubScope {
    fn drop(&mut self) {
        if !self.committed {
            debug!("every block dropped without an answer");
            self.recorder.lock().cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiator::type_factory;
    use crate::invocation::MethodDescription;

    fn find() -> Arc<MethodDescription> {
        Arc::new(
            MethodDescription::new("Repo", "find")
                .params([ValueType::Int])
                .returns(ValueType::Str),
        )
    }

    fn save() -> Arc<MethodDescription> {
        Arc::new(
            MethodDescription::new("Repo", "save")
                .params([ValueType::Str, ValueType::Bool])
                .returns(ValueType::Bool),
        )
    }

    fn connection() -> Arc<MethodDescription> {
        Arc::new(
            MethodDescription::new("Repo", "connection")
                .params([ValueType::Str])
                .returns(ValueType::mock("Connection")),
        )
    }

    fn query() -> Arc<MethodDescription> {
        Arc::new(
            MethodDescription::new("Connection", "query")
                .params([ValueType::Str])
                .returns(ValueType::Str),
        )
    }

    #[test]
    fn test_every_with_literal_argument() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();

        session
            .every(|_| {
                repo.invoke(&find, vec![Value::Int(1)])?;
                Ok(())
            })
            .unwrap()
            .returns("one")
            .unwrap();

        assert_eq!(repo.invoke(&find, vec![1.into()]).unwrap(), Value::from("one"));
        assert!(matches!(repo.invoke(&find, vec![2.into()]), Err(Error::UnansweredCall(_))));
        // Capture rounds leave no trace in the history
        assert_eq!(repo.stub().all_recorded_calls().len(), 2);
    }

    #[test]
    fn test_every_with_capture_echoes_argument() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();
        let slot = CaptureSlot::new();

        let echo = slot.clone();
        session
            .every(|s| {
                repo.invoke(&find, vec![s.capture(&slot, ValueType::Int)?])?;
                Ok(())
            })
            .unwrap()
            .answers(move |_| Ok(echo.last().unwrap_or(Value::Null)))
            .unwrap();

        assert!(slot.is_empty());
        assert_eq!(repo.invoke(&find, vec![5.into()]).unwrap(), Value::Int(5));
        assert_eq!(repo.invoke(&find, vec![7.into()]).unwrap(), Value::Int(7));
        assert_eq!(slot.captured(), vec![Value::Int(5), Value::Int(7)]);
    }

    #[test]
    fn test_mixed_matchers_and_literals() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let save = save();

        session
            .every(|s| {
                repo.invoke(&save, vec![s.regex("^user-")?, Value::Bool(true)])?;
                Ok(())
            })
            .unwrap()
            .returns(true)
            .unwrap();

        assert_eq!(
            repo.invoke(&save, vec!["user-1".into(), true.into()]).unwrap(),
            Value::Bool(true)
        );
        assert!(repo.invoke(&save, vec!["user-1".into(), false.into()]).is_err());
        assert!(repo.invoke(&save, vec!["admin".into(), true.into()]).is_err());
    }

    #[test]
    fn test_boolean_matcher() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let save = save();

        session
            .every(|s| {
                repo.invoke(&save, vec![s.eq("a")?, s.any(ValueType::Bool)?])?;
                Ok(())
            })
            .unwrap()
            .returns(false)
            .unwrap();

        assert_eq!(
            repo.invoke(&save, vec!["a".into(), true.into()]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            repo.invoke(&save, vec!["a".into(), false.into()]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_bool_matchers_bind_to_their_own_arguments() {
        let flags = Arc::new(
            MethodDescription::new("Repo", "flags")
                .params([ValueType::Bool, ValueType::Bool])
                .returns(ValueType::Int),
        );

        // Bool placeholders collide in half the rounds; repeat to cover both orders.
        for _ in 0..20 {
            let session = MockSession::default();
            let repo = session.mockk("Repo");
            session
                .every(|s| {
                    let second = s.eq(true)?;
                    let first = s.any(ValueType::Bool)?;
                    repo.invoke(&flags, vec![first, second])?;
                    Ok(())
                })
                .unwrap()
                .returns(1)
                .unwrap();

            assert_eq!(
                repo.invoke(&flags, vec![false.into(), true.into()]).unwrap(),
                Value::Int(1)
            );
            assert!(matches!(
                repo.invoke(&flags, vec![true.into(), false.into()]),
                Err(Error::UnansweredCall(_))
            ));
        }
    }

    #[test]
    fn test_round_with_different_matchers_is_ambiguous() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();
        let mut round = 0;

        let err = session
            .every(|s| {
                round += 1;
                let arg = if round == 1 { s.any(ValueType::Int)? } else { Value::Int(5) };
                repo.invoke(&find, vec![arg])?;
                Ok(())
            })
            .err()
            .unwrap();
        assert!(matches!(err, Error::AmbiguousCaptureRound { round: 1, .. }), "{err:?}");
        assert_eq!(repo.stub().answer_count(), 0);
    }

    #[test]
    fn test_round_with_different_call_count_is_ambiguous() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();
        let mut round = 0;

        let err = session
            .every(|s| {
                round += 1;
                let calls = if round == 1 { 2 } else { 3 };
                for _ in 0..calls {
                    repo.invoke(&find, vec![s.any(ValueType::Int)?])?;
                }
                Ok(())
            })
            .err()
            .unwrap();

        assert!(matches!(err, Error::AmbiguousCaptureRound { round: 1, .. }), "{err:?}");
        assert_eq!(repo.stub().answer_count(), 0);

        // The recorder is usable again
        session
            .every(|_| {
                repo.invoke(&find, vec![Value::Int(1)])?;
                Ok(())
            })
            .unwrap()
            .returns("ok")
            .unwrap();
        assert_eq!(repo.stub().answer_count(), 1);
    }

    #[test]
    fn test_changing_literal_is_ambiguous() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();
        let mut counter = 0;

        let err = session
            .every(|s| {
                counter += 1;
                repo.invoke(&find, vec![Value::Int(counter)])?;
                s.any(ValueType::Str)?;
                Ok(())
            })
            .err()
            .unwrap();
        // The dangling matcher forces a second round, which sees another literal
        assert!(matches!(err, Error::AmbiguousCaptureRound { .. }), "{err:?}");
    }

    #[test]
    fn test_unused_matcher_is_reported() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();

        let err = session
            .every(|s| {
                let _dangling = s.any(ValueType::Str)?;
                repo.invoke(&find, vec![Value::Int(1)])?;
                Ok(())
            })
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnusedMatcher { count: 1, .. }), "{err:?}");
    }

    #[test]
    fn test_empty_block_is_rejected() {
        let session = MockSession::default();
        let err = session.every(|_| Ok(())).err().unwrap();
        assert_eq!(err, Error::EmptyExpectation("every"));

        let err = session
            .verify(Ordering::Unordered, VerificationBounds::default(), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err, Error::EmptyExpectation("verify"));
    }

    #[test]
    fn test_block_error_propagates_and_cancels() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();

        let err = session
            .every(|s| {
                repo.invoke(&find, vec![s.any(ValueType::Int)?])?;
                Err(Error::thrown("boom"))
            })
            .err()
            .unwrap();
        assert_eq!(err, Error::thrown("boom"));
        assert_eq!(repo.stub().answer_count(), 0);

        // Live calls are answered again
        assert!(matches!(repo.invoke(&find, vec![1.into()]), Err(Error::UnansweredCall(_))));
    }

    #[test]
    fn test_nested_block_is_rejected() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();

        let err = session
            .every(|_| {
                repo.invoke(&find, vec![Value::Int(1)])?;
                session.every(|_| Ok(())).map(|_| ())
            })
            .err()
            .unwrap();
        assert_eq!(err, Error::SessionAlreadyOpen("every"));
    }

    #[test]
    fn test_dropped_scope_discards_expectation() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();

        let scope = session
            .every(|_| {
                repo.invoke(&find, vec![Value::Int(1)])?;
                Ok(())
            })
            .unwrap();
        drop(scope);

        assert_eq!(repo.stub().answer_count(), 0);
        assert!(repo.invoke(&find, vec![1.into()]).is_err());
    }

    #[test]
    fn test_chained_calls_return_child_mocks() {
        let session = MockSession::default();
        let repo = session.mockk_named("Repo", "repo");
        let connection = connection();
        let query = query();

        session
            .every(|s| {
                let conn = repo.invoke(&connection, vec![Value::from("main")])?;
                let conn = conn.as_mock().cloned().ok_or(Error::thrown("no mock"))?;
                conn.invoke(&query, vec![s.any(ValueType::Str)?])?;
                Ok(())
            })
            .unwrap()
            .returns("rows")
            .unwrap();

        let conn = repo.invoke(&connection, vec!["main".into()]).unwrap();
        let conn = conn.as_mock().unwrap();
        assert_eq!(conn.name(), "child of repo");
        assert_eq!(conn.invoke(&query, vec!["select".into()]).unwrap(), Value::from("rows"));
        assert!(repo.invoke(&connection, vec!["other".into()]).is_err());

        // A second chain through the same link reuses the child
        session
            .every(|_| {
                let conn = repo.invoke(&connection, vec![Value::from("main")])?;
                let conn = conn.as_mock().cloned().ok_or(Error::thrown("no mock"))?;
                conn.invoke(&query, vec![Value::from("count")])?;
                Ok(())
            })
            .unwrap()
            .returns("1")
            .unwrap();
        assert_eq!(repo.stub().child_count(), 1);
        assert_eq!(conn.invoke(&query, vec!["count".into()]).unwrap(), Value::from("1"));
        assert_eq!(conn.invoke(&query, vec!["select".into()]).unwrap(), Value::from("rows"));
    }

    #[test]
    fn test_mock_typed_matcher() {
        let session = MockSession::default();
        let service = session.mockk("Service");
        let register = Arc::new(
            MethodDescription::new("Service", "register")
                .params([ValueType::mock("Repo")])
                .returns(ValueType::Int),
        );
        let repo = session.mockk("Repo");

        session
            .every(|s| {
                service.invoke(&register, vec![s.of_type(ValueType::mock("Repo"))?])?;
                Ok(())
            })
            .unwrap()
            .returns(3)
            .unwrap();

        assert_eq!(
            service.invoke(&register, vec![Value::Mock(repo)]).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn test_hint_next_return_type() {
        let session = MockSession::default();
        let repo = session.mockk_named("Repo", "repo");
        let lookup = Arc::new(
            MethodDescription::new("Repo", "lookup")
                .params([ValueType::Str])
                .returns(ValueType::Any),
        );
        let query = query();

        session
            .every(|s| {
                s.hint_next_return_type(ValueType::mock("Connection"), 0);
                let conn = repo.invoke(&lookup, vec![Value::from("db")])?;
                let conn = conn.as_mock().cloned().ok_or(Error::thrown("no mock"))?;
                assert_eq!(s.n_calls(), 1);
                conn.invoke(&query, vec![Value::from("q")])?;
                Ok(())
            })
            .unwrap()
            .returns("hinted")
            .unwrap();

        let conn = repo.invoke(&lookup, vec!["db".into()]).unwrap();
        assert_eq!(
            conn.as_mock().unwrap().invoke(&query, vec!["q".into()]).unwrap(),
            Value::from("hinted")
        );
    }

    #[test]
    fn test_verify_counts_and_orders() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        let find = find();
        for arg in [1, 2, 1] {
            repo.invoke(&find, vec![arg.into()]).unwrap();
        }

        let verify_ones = |bounds| {
            session.verify(Ordering::Unordered, bounds, |s| {
                repo.invoke(&find, vec![s.eq(1)?])?;
                Ok(())
            })
        };
        verify_ones(VerificationBounds::exactly(2)).unwrap();
        match verify_ones(VerificationBounds::exactly(1)).unwrap_err() {
            Error::VerificationFailed(message) => assert!(message.contains("2 matching call(s)")),
            other => panic!("unexpected error: {other:?}"),
        }
        verify_ones(VerificationBounds::exactly(1).inverse()).unwrap();

        session
            .verify(Ordering::Sequence, VerificationBounds::default(), |s| {
                repo.invoke(&find, vec![s.eq(2)?])?;
                repo.invoke(&find, vec![s.any(ValueType::Int)?])?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_verify_captures_arguments() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        let find = find();
        repo.invoke(&find, vec![3.into()]).unwrap();
        repo.invoke(&find, vec![4.into()]).unwrap();

        let slot = CaptureSlot::new();
        session
            .verify(Ordering::Ordered, VerificationBounds::default(), |s| {
                repo.invoke(&find, vec![s.capture(&slot, ValueType::Int)?])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(slot.captured(), vec![Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn test_failed_verification_leaves_slots_empty() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        let find = find();
        repo.invoke(&find, vec![1.into()]).unwrap();
        repo.invoke(&save(), vec!["x".into(), true.into()]).unwrap();
        repo.invoke(&find, vec![2.into()]).unwrap();

        let slot = CaptureSlot::new();
        let result = session
            .verify_result(Ordering::All, VerificationBounds::default(), |s| {
                repo.invoke(&find, vec![s.capture(&slot, ValueType::Int)?])?;
                Ok(())
            })
            .unwrap();
        assert!(!result.matches);
        assert!(slot.captured().is_empty());

        // Passes before inversion, so the inverse fails and captures nothing
        let err = session
            .verify(Ordering::Unordered, VerificationBounds::default().inverse(), |s| {
                repo.invoke(&find, vec![s.capture(&slot, ValueType::Int)?])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed(_)));
        assert!(slot.captured().is_empty());
    }

    #[test]
    fn test_check_was_not_called() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        let idle = session.mockk("Repo");
        repo.invoke(&find(), vec![1.into()]).unwrap();

        session.check_was_not_called(&[idle.clone()]).unwrap();
        assert!(matches!(
            session.check_was_not_called(&[idle, repo]),
            Err(Error::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_selective_clear() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        let find = find();
        session
            .every(|s| {
                repo.invoke(&find, vec![s.any(ValueType::Int)?])?;
                Ok(())
            })
            .unwrap()
            .returns("x")
            .unwrap();
        repo.invoke(&find, vec![1.into()]).unwrap();

        session.clear(&[repo.clone()], true, false, false);
        assert_eq!(repo.stub().answer_count(), 0);
        assert_eq!(repo.stub().all_recorded_calls().len(), 1);
    }

    #[test]
    fn test_relaxed_by_default_and_instance_factories() {
        let session = MockSession::new(EngineConfig {
            relaxed_by_default: true,
            ..Default::default()
        });
        let repo = session.mockk("Repo");
        let find = find();

        let answer = session.with_instance_factory(type_factory(ValueType::Str, || Value::from("made")), || {
            repo.invoke(&find, vec![1.into()]).unwrap()
        });
        assert_eq!(answer, Value::from("made"));
        assert_eq!(repo.invoke(&find, vec![1.into()]).unwrap(), Value::from(""));
    }

    #[test]
    fn test_recorders_are_per_thread() {
        let session = MockSession::default();
        let repo = session.relaxed_mockk("Repo");
        let find = find();

        let worker = {
            let session = session.clone();
            let repo = repo.clone();
            let find = find.clone();
            thread::spawn(move || {
                repo.invoke(&find, vec![1.into()]).unwrap();
                session.recorder_count()
            })
        };
        assert!(worker.join().unwrap() >= 1);
        // The worker's recorder went away with the worker
        assert_eq!(session.recorder_count(), 0);

        repo.invoke(&find, vec![2.into()]).unwrap();
        assert_eq!(session.recorder_count(), 1);
        session.release_thread();
        assert_eq!(session.recorder_count(), 0);
    }

    #[test]
    fn test_closed_session() {
        let session = MockSession::default();
        let repo = session.mockk("Repo");
        drop(session);
        assert_eq!(repo.invoke(&find(), vec![1.into()]).unwrap_err(), Error::SessionClosed);
    }

    #[test]
    fn test_mock_ids_are_unique_across_sessions() {
        let a = MockSession::default().mockk("Repo");
        let b = MockSession::default().mockk("Repo");
        assert_ne!(a.id(), b.id());
        assert_ne!(Value::Mock(a), Value::Mock(b));
    }
}

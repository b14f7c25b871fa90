//! Call recorder: the multi-round capture protocol.
//!
//! A declaration block (`every { ... }` / `verify { ... }`) is ordinary code
//! that really calls the mocks, so matcher placeholders have to be concrete
//! values before the call happens. The recorder hands out a random signature
//! value for every matcher, replays the block for several rounds and then
//! tells matcher placeholders (equal to that round's signature in every round)
//! from literal arguments (equal across rounds).
//!
//! ```text
//! Answering --start_stubbing/start_verification--> Stubbing/Verifying
//!     rounds: block runs, matcher()/call() observe, catch_args() closes round
//!     last round: arguments resolved into Calls
//! Stubbing  --answer()------------> Answering (answers pushed into stubs)
//! Verifying --done_verification()-> Answering (calls handed to a verifier)
//! any       --cancel()------------> Answering (nothing committed)
//! ```

use crate::answer::Answer;
use crate::error::{Error, Result};
use crate::gateway::SessionInner;
use crate::instantiator::Instantiator;
use crate::invocation::{Call, Invocation, InvocationMatcher};
use crate::matcher::Matcher;
use crate::stub::{child_name, Mock, StubKind};
use crate::value::{Value, ValueType};
use std::collections::HashMap;
use tracing::debug;

/// What the recorder is doing with intercepted calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderMode {
    /// Live calls are recorded and answered by their stub
    Answering,
    /// An `every` block is being captured
    Stubbing,
    /// A `verify` block is being captured
    Verifying,
}

impl RecorderMode {
    fn block_name(self) -> &'static str {
        match self {
            RecorderMode::Answering => "declaration",
            RecorderMode::Stubbing => "every",
            RecorderMode::Verifying => "verify",
        }
    }
}

/// Round limits.
#[derive(Debug, Clone, Copy)]
pub struct RecorderSettings {
    /// Upper bound on capture rounds
    pub max_rounds: usize,
    /// Rounds needed when a boolean matcher is involved
    pub bool_rounds: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_rounds: 64,
            bool_rounds: 40,
        }
    }
}

/// How the recorder dispatched an intercepted call.
pub enum Dispatch {
    /// Not capturing: the stub must record and answer this invocation
    Live(Invocation),
    /// Captured for a declaration block; return this dummy
    Captured(Value),
}

struct SignedMatcher {
    signature: Value,
    matcher: Matcher,
    ty: ValueType,
}

struct RecordedCall {
    invocation: Invocation,
    ret_type: ValueType,
    returned: Value,
}

#[derive(Default)]
struct Round {
    matchers: Vec<SignedMatcher>,
    calls: Vec<RecordedCall>,
}

impl Round {
    /// Where the subject of call `idx` came from: a mock passed in by the
    /// test, or the dummy returned by an earlier call of the same round.
    fn subject_source(&self, idx: usize) -> SubjectSource {
        let subject = self.calls[idx].invocation.subject.id();
        self.calls[..idx]
            .iter()
            .position(|c| c.returned.as_mock().is_some_and(|m| m.id() == subject))
            .map_or(SubjectSource::Mock(subject), SubjectSource::Returned)
    }

}

#[derive(Debug, PartialEq, Eq)]
enum SubjectSource {
    Mock(u64),
    Returned(usize),
}

/// Per-thread capture state machine.
pub struct CallRecorder {
    mode: RecorderMode,
    settings: RecorderSettings,
    current: Round,
    rounds: Vec<Round>,
    hints: HashMap<usize, ValueType>,
    calls: Vec<Call>,
    chain_children: Vec<Option<Mock>>,
    resolved: bool,
}

impl CallRecorder {
    /// Create an idle recorder.
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            mode: RecorderMode::Answering,
            settings,
            current: Round::default(),
            rounds: Vec::new(),
            hints: HashMap::new(),
            calls: Vec::new(),
            chain_children: Vec::new(),
            resolved: false,
        }
    }

    pub fn mode(&self) -> RecorderMode {
        self.mode
    }

    /// Resolved calls of the last finished capture.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Calls observed so far in the current round.
    pub fn n_calls(&self) -> usize {
        self.current.calls.len()
    }

    fn reset(&mut self) {
        self.current = Round::default();
        self.rounds.clear();
        self.hints.clear();
        self.calls.clear();
        self.chain_children.clear();
        self.resolved = false;
    }

    fn start(&mut self, mode: RecorderMode) -> Result<()> {
        if self.mode != RecorderMode::Answering {
            return Err(Error::SessionAlreadyOpen(self.mode.block_name()));
        }
        self.reset();
        self.mode = mode;
        Ok(())
    }

    /// Open an `every` capture session.
    pub fn start_stubbing(&mut self) -> Result<()> {
        self.start(RecorderMode::Stubbing)
    }

    /// Open a `verify` capture session.
    pub fn start_verification(&mut self) -> Result<()> {
        self.start(RecorderMode::Verifying)
    }

    fn ensure_capturing(&self) -> Result<()> {
        if self.mode == RecorderMode::Answering {
            return Err(Error::NoSession(self.mode.block_name()));
        }
        Ok(())
    }

    /// Register a matcher built inside the block and return the placeholder
    /// to pass to the mock in its place.
    pub(crate) fn matcher(&mut self, matcher: Matcher, ty: ValueType, ctx: &SessionInner) -> Result<Value> {
        self.ensure_capturing()?;
        let signature = match &ty {
            ValueType::Mock(type_name) => Value::Mock(ctx.create_mock(
                type_name.clone(),
                Some("signature".to_string()),
                StubKind::Mock,
                false,
            )),
            other => ctx.instantiator().signature_value(other),
        };
        self.current.matchers.push(SignedMatcher {
            signature: signature.clone(),
            matcher,
            ty,
        });
        Ok(signature)
    }

    /// Use `ty` for the dummy returned by the `n`-th next call (0 = next).
    pub fn hint_next_return_type(&mut self, ty: ValueType, n: usize) {
        self.hints.insert(self.current.calls.len() + n, ty);
    }

    /// Interception hook for every call made on this thread.
    pub(crate) fn call(&mut self, invocation: Invocation, ctx: &SessionInner) -> Result<Dispatch> {
        if self.mode == RecorderMode::Answering {
            return Ok(Dispatch::Live(invocation));
        }

        let idx = self.current.calls.len();
        let ret_type = self
            .hints
            .remove(&idx)
            .unwrap_or_else(|| invocation.method.return_type.clone());

        let returned = match &ret_type {
            ValueType::Mock(type_name) => {
                let parent = invocation
                    .subject
                    .upgrade()
                    .map_or_else(|| invocation.self_name.clone(), |m| m.name().to_string());
                Value::Mock(ctx.create_mock(
                    type_name.clone(),
                    Some(child_name(&parent)),
                    StubKind::Mock,
                    false,
                ))
            }
            other => ctx.instantiator().any_value(other, &|| Value::Null),
        };

        self.current.calls.push(RecordedCall {
            invocation,
            ret_type,
            returned: returned.clone(),
        });
        Ok(Dispatch::Captured(returned))
    }

    /// Number of rounds needed to separate matchers from literals, judged
    /// from the first round. Low-entropy signature types need more rounds.
    pub fn estimate_call_rounds(&self, instantiator: &dyn Instantiator) -> usize {
        self.current
            .matchers
            .iter()
            .map(|m| match &m.ty {
                ValueType::Bool => self.settings.bool_rounds,
                ValueType::Unit => 1,
                ty if !instantiator.is_passed_by_value(ty) => 1,
                _ => 2,
            })
            .max()
            .unwrap_or(1)
            .clamp(1, self.settings.max_rounds.max(1))
    }

    /// Close round `round` of `n`. Every round must make the same calls as
    /// the first one; the last round resolves the final call list.
    pub(crate) fn catch_args(&mut self, round: usize, n: usize, ctx: &SessionInner) -> Result<()> {
        self.ensure_capturing()?;
        let finished = std::mem::take(&mut self.current);
        self.hints.clear();

        if let Some(first) = self.rounds.first() {
            check_same_shape(first, &finished, round)?;
        }
        self.rounds.push(finished);

        if round + 1 >= n {
            self.resolve(round, ctx)?;
        }
        Ok(())
    }

    fn resolve(&mut self, round: usize, ctx: &SessionInner) -> Result<()> {
        let instantiator = ctx.instantiator();
        let Some(last) = self.rounds.last() else {
            return Ok(());
        };

        let mut used = vec![false; last.matchers.len()];
        let mut arg_matchers = Vec::with_capacity(last.calls.len());

        for (i, recorded) in last.calls.iter().enumerate() {
            let mut matchers = Vec::with_capacity(recorded.invocation.args.len());
            for (j, arg) in recorded.invocation.args.iter().enumerate() {
                // Matcher k fills this argument only if its signature was
                // passed here in every round.
                let candidates: Vec<usize> = (0..last.matchers.len())
                    .filter(|&k| {
                        self.rounds
                            .iter()
                            .all(|r| r.matchers[k].signature == r.calls[i].invocation.args[j])
                    })
                    .collect();

                if !candidates.is_empty() {
                    let free: Vec<usize> = candidates.into_iter().filter(|&k| !used[k]).collect();
                    let slot = match free.as_slice() {
                        [] => {
                            return Err(Error::ambiguous(
                                round,
                                format!("argument {} of {} matches no free matcher", j, recorded.invocation),
                            ))
                        }
                        [k] => *k,
                        // Unit placeholders are all null and cannot be told apart.
                        [k, ..] if free.iter().all(|&m| last.matchers[m].ty == ValueType::Unit) => *k,
                        _ => {
                            return Err(Error::ambiguous(
                                round,
                                format!(
                                    "argument {} of {} fits {} matchers in every round",
                                    j,
                                    recorded.invocation,
                                    free.len()
                                ),
                            ))
                        }
                    };
                    used[slot] = true;
                    matchers.push(last.matchers[slot].matcher.clone());
                    continue;
                }

                let stable = self
                    .rounds
                    .iter()
                    .all(|r| instantiator.deep_equals(&r.calls[i].invocation.args[j], arg));
                if !stable {
                    return Err(Error::ambiguous(
                        round,
                        format!(
                            "argument {} of call #{} to {} changes between rounds",
                            j, i, recorded.invocation.method.name
                        ),
                    ));
                }
                matchers.push(Matcher::Eq(arg.clone()));
            }
            arg_matchers.push(matchers);
        }

        let unused: Vec<String> = last
            .matchers
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|(m, _)| m.matcher.to_string())
            .collect();
        if !unused.is_empty() {
            return Err(Error::UnusedMatcher {
                count: unused.len(),
                matchers: unused.join(", "),
            });
        }

        let verification = self.mode == RecorderMode::Verifying;
        let mut retargeted: HashMap<u64, Mock> = HashMap::new();
        let mut calls = Vec::with_capacity(last.calls.len());
        let mut chain_children = Vec::with_capacity(last.calls.len());

        for (i, (recorded, matchers)) in last.calls.iter().zip(arg_matchers).enumerate() {
            let subject_id = recorded.invocation.subject.id();
            let (subject, invocation) = match retargeted.get(&subject_id) {
                Some(child) => (child.clone(), recorded.invocation.retarget(child.downgrade())),
                None => {
                    let subject = recorded.invocation.subject.upgrade().ok_or_else(|| {
                        Error::ambiguous(round, format!("mock of {} dropped while recording", recorded.invocation))
                    })?;
                    (subject, recorded.invocation.clone())
                }
            };

            let matcher = InvocationMatcher::new(subject.downgrade(), invocation.method.clone(), matchers)?;
            let call = Call::new(recorded.ret_type.clone(), invocation, matcher, verification);

            let mut child = None;
            if let Value::Mock(dummy) = &recorded.returned {
                let chained = (i + 1..last.calls.len())
                    .any(|k| last.subject_source(k) == SubjectSource::Returned(i));
                if chained {
                    if let Value::Mock(real) = subject.stub().child_mockk(&call)? {
                        retargeted.insert(dummy.id(), real.clone());
                        child = Some(real);
                    }
                }
            }

            calls.push(call);
            chain_children.push(child);
        }

        debug!(
            mode = ?self.mode,
            rounds = self.rounds.len(),
            calls = calls.len(),
            "Capture resolved"
        );

        self.calls = calls;
        self.chain_children = chain_children;
        self.resolved = true;
        Ok(())
    }

    /// Commit an `every` block: the last call gets `answer`, earlier links of
    /// a call chain return the child mock the next link was recorded on.
    pub fn answer(&mut self, answer: Answer) -> Result<()> {
        if self.mode != RecorderMode::Stubbing || !self.resolved {
            return Err(Error::NoSession(RecorderMode::Stubbing.block_name()));
        }
        if self.calls.is_empty() {
            return Err(Error::EmptyExpectation("every"));
        }

        let calls = std::mem::take(&mut self.calls);
        let children = std::mem::take(&mut self.chain_children);
        let last = calls.len() - 1;

        for (i, (call, child)) in calls.into_iter().zip(children).enumerate() {
            let answer = match child {
                _ if i == last => answer.clone(),
                Some(child) => Answer::Returns(Value::Mock(child)),
                None => {
                    debug!(call = %call.invocation, "Intermediate call left unstubbed");
                    continue;
                }
            };
            let subject = call.matcher.subject.upgrade().ok_or(Error::SessionClosed)?;
            debug!(matcher = %call.matcher, "Answer added");
            subject.stub().add_answer(call.matcher, answer);
        }

        self.mode = RecorderMode::Answering;
        self.reset();
        Ok(())
    }

    /// Finish a `verify` block and hand out the resolved calls.
    pub fn done_verification(&mut self) -> Result<Vec<Call>> {
        if self.mode != RecorderMode::Verifying || !self.resolved {
            return Err(Error::NoSession(RecorderMode::Verifying.block_name()));
        }
        if self.calls.is_empty() {
            return Err(Error::EmptyExpectation("verify"));
        }
        let calls = std::mem::take(&mut self.calls);
        self.mode = RecorderMode::Answering;
        self.reset();
        Ok(calls)
    }

    /// Abort the session without touching any stub.
    pub fn cancel(&mut self) {
        if self.mode != RecorderMode::Answering {
            debug!(mode = ?self.mode, "Capture cancelled");
        }
        self.mode = RecorderMode::Answering;
        self.reset();
    }
}

fn check_same_shape(first: &Round, other: &Round, round: usize) -> Result<()> {
    if first.matchers.len() != other.matchers.len()
        || first.matchers.iter().zip(&other.matchers).any(|(a, b)| a.ty != b.ty)
    {
        return Err(Error::ambiguous(
            round,
            format!(
                "matchers differ between round 0 ({}) and round {} ({})",
                describe_matchers(first),
                round,
                describe_matchers(other)
            ),
        ));
    }
    if first.calls.len() != other.calls.len() {
        return Err(Error::ambiguous(
            round,
            format!(
                "{} call(s) in round 0 but {} call(s) in round {}",
                first.calls.len(),
                other.calls.len(),
                round
            ),
        ));
    }
    for (i, (a, b)) in first.calls.iter().zip(&other.calls).enumerate() {
        if *a.invocation.method != *b.invocation.method
            || a.invocation.args.len() != b.invocation.args.len()
            || first.subject_source(i) != other.subject_source(i)
        {
            return Err(Error::ambiguous(
                round,
                format!("call #{} is {} in round 0 but {} in round {}", i, a.invocation, b.invocation, round),
            ));
        }
    }
    Ok(())
}

fn describe_matchers(round: &Round) -> String {
    round
        .matchers
        .iter()
        .map(|m| format!("{}: {}", m.matcher, m.ty))
        .collect::<Vec<_>>()
        .join(", ")
}

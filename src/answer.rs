//! Answers: what a stubbed call produces.

use crate::error::{Error, Result};
use crate::invocation::Call;
use crate::template::TemplateEngine;
use crate::value::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Computes a result from the answered call.
pub type AnswerFn = Arc<dyn Fn(&Call) -> Result<Value> + Send + Sync>;

/// Successive answers; the last one repeats once the others are used up.
pub struct ManyAnswers {
    answers: Vec<Answer>,
    position: AtomicUsize,
}

/// A Handlebars template rendered with the call as context.
pub struct TemplateAnswer {
    template: String,
    engine: TemplateEngine,
}

/// Action bound to an invocation matcher inside a stub.
#[derive(Clone)]
pub enum Answer {
    /// Return a fixed value
    Returns(Value),
    /// Fail with [`Error::Thrown`]
    Throws(String),
    /// Compute the result from the call
    Computes(AnswerFn),
    /// Delegate to the real implementation
    CallOriginal,
    /// Chain through several answers
    Many(Arc<ManyAnswers>),
    /// Render a string template
    Template(Arc<TemplateAnswer>),
}

impl Answer {
    /// Answer returning a fixed value.
    pub fn returns(value: impl Into<Value>) -> Self {
        Answer::Returns(value.into())
    }

    /// Answer failing with the given message.
    pub fn throws(message: impl Into<String>) -> Self {
        Answer::Throws(message.into())
    }

    /// Answer computed by a closure.
    pub fn computes<F>(f: F) -> Self
    where
        F: Fn(&Call) -> Result<Value> + Send + Sync + 'static,
    {
        Answer::Computes(Arc::new(f))
    }

    /// Answers used one after the other.
    pub fn many(answers: Vec<Answer>) -> Self {
        Answer::Many(Arc::new(ManyAnswers {
            answers,
            position: AtomicUsize::new(0),
        }))
    }

    /// Values returned one after the other.
    pub fn returns_many<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::many(values.into_iter().map(Answer::returns).collect())
    }

    /// Answer rendering a Handlebars template over the call.
    pub fn template(template: impl Into<String>) -> Self {
        Answer::Template(Arc::new(TemplateAnswer {
            template: template.into(),
            engine: TemplateEngine::new(),
        }))
    }

    /// Produce the result for a call.
    ///
    /// Errors raised by user closures are returned unchanged.
    pub fn answer(&self, call: &Call) -> Result<Value> {
        match self {
            Answer::Returns(value) => Ok(value.clone()),
            Answer::Throws(message) => Err(Error::thrown(message.clone())),
            Answer::Computes(f) => f(call),
            Answer::CallOriginal => (call.invocation.original_call)(),
            Answer::Many(many) => {
                let last = match many.answers.len() {
                    0 => return Err(Error::UnansweredCall(call.invocation.to_string())),
                    n => n - 1,
                };
                let position = many.position.fetch_add(1, Ordering::SeqCst).min(last);
                many.answers[position].answer(call)
            }
            Answer::Template(template) => template
                .engine
                .render(&template.template, call)
                .map(Value::Str)
                .map_err(|e| Error::Template(e.to_string())),
        }
    }
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Returns(value) => f.debug_tuple("Returns").field(value).finish(),
            Answer::Throws(message) => f.debug_tuple("Throws").field(message).finish(),
            Answer::Computes(_) => f.write_str("Computes"),
            Answer::CallOriginal => f.write_str("CallOriginal"),
            Answer::Many(many) => f.debug_tuple("Many").field(&many.answers).finish(),
            Answer::Template(template) => f.debug_tuple("Template").field(&template.template).finish(),
        }
    }
}

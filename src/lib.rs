//! Mock Engine
//!
//! A call recording, stubbing and verification engine for test doubles.
//! Mocks record the calls made on them, answer them from declared
//! expectations and let tests verify afterwards what happened, in what order
//! and how many times.
//!
//! # Features
//!
//! - **Stubbing**: `every` blocks with literal arguments or matchers, resolved
//!   by a multi-round capture protocol
//! - **Matchers**: equality, wildcard, type checks, predicates, capture,
//!   regex and glob strings, `not` / `and` / `or` composition
//! - **Answers**: constants, errors, closures, successive values, Handlebars
//!   templates, delegation to the real implementation
//! - **Verification**: unordered, all, sequence and ordered disciplines with
//!   at-least / at-most / exactly bounds
//! - **Relaxed mocks and spies**, chained calls through child mocks
//! - **Scenarios**: the same features driven from YAML files
//!
//! # Example
//!
//! ```ignore
//! use mock_engine::{MethodDescription, MockSession, Value, ValueType};
//! use std::sync::Arc;
//!
//! let session = MockSession::default();
//! let repo = session.mockk("Repo");
//! let find = Arc::new(
//!     MethodDescription::new("Repo", "find")
//!         .params([ValueType::Int])
//!         .returns(ValueType::Str),
//! );
//!
//! session
//!     .every(|s| {
//!         repo.invoke(&find, vec![s.any(ValueType::Int)?])?;
//!         Ok(())
//!     })?
//!     .returns("found")?;
//!
//! assert_eq!(repo.invoke(&find, vec![Value::Int(1)])?, Value::from("found"));
//! ```

pub mod answer;
pub mod config;
pub mod error;
pub mod gateway;
pub mod instantiator;
pub mod invocation;
pub mod matcher;
pub mod recorder;
pub mod scenario;
pub mod stub;
pub mod template;
pub mod value;
pub mod verifier;

pub use answer::Answer;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use gateway::{MatcherScope, MockFactory, MockSession, StubScope};
pub use instantiator::{DefaultInstantiator, FactoryRegistration, InstanceFactory, Instantiator};
pub use invocation::{Call, Invocation, InvocationMatcher, MethodDescription};
pub use matcher::{CaptureSlot, Matcher};
pub use recorder::{CallRecorder, RecorderMode};
pub use scenario::{Scenario, ScenarioReport, ScenarioRunner};
pub use stub::{Mock, Stub, StubKind};
pub use value::{Value, ValueType};
pub use verifier::{CallVerifier, Ordering, VerificationBounds, VerificationResult};

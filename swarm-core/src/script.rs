use std::fmt;
use std::future::Future;

use serde_json::Value;

use crate::vu::{VuContext, VuInitInfo};

/// User code driven by the engine.
///
/// `init_vu` builds per-VU state once before the run starts. `iteration` is called repeatedly
/// with that state; dispatch on [`VuContext::exec`] when several scenarios share a script.
/// `setup` runs once before any iteration and its return value is handed to every iteration
/// and to `teardown`.
pub trait Script: Send + Sync + 'static {
    type Vu: Send + 'static;

    fn init_vu(
        &self,
        info: &VuInitInfo,
    ) -> impl Future<Output = Result<Self::Vu, ScriptError>> + Send;

    fn setup(
        &self,
        _ctx: &VuContext,
    ) -> impl Future<Output = Result<Option<Value>, ScriptError>> + Send {
        async { Ok(None) }
    }

    fn iteration(
        &self,
        vu: &mut Self::Vu,
        ctx: &VuContext,
        data: Option<&Value>,
    ) -> impl Future<Output = Result<(), ScriptError>> + Send;

    fn teardown(
        &self,
        _ctx: &VuContext,
        _data: Option<&Value>,
    ) -> impl Future<Output = Result<(), ScriptError>> + Send {
        async { Ok(()) }
    }
}

/// Error raised by user code. Fails the current iteration (or setup/teardown) only.
pub struct ScriptError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Explicit failure raised by the script itself.
    pub fn fail(message: impl fmt::Display) -> Self {
        Self::new(message.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl fmt::Debug for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptError")
            .field("message", &self.message)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for ScriptError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<u32, ScriptError> {
        Ok(raw.parse::<u32>()?)
    }

    #[test]
    fn wraps_std_errors_with_source() {
        let err = parse("x").err().unwrap_or_else(|| panic!("expected error"));
        assert!(err.message().contains("invalid digit"));
        assert!(err.source().is_some());
    }

    #[test]
    fn plain_messages() {
        let err = ScriptError::new("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(err.source().is_none());
        assert_eq!(ScriptError::fail(format_args!("code {}", 7)).message(), "code 7");
    }
}

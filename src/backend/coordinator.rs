//! Event coordinator: rule matches become jobs.

use serde_json::Value;
use std::sync::Arc;

use super::{Backend, JobsControl};
use crate::codec::Extra;
use crate::rules::{DispatchError, Registry, RuleFailure, RuleMatch};
use crate::store::CasStore;
use crate::types::{Error, JobId, Result};

/// What one event produced.
#[derive(Debug, Default)]
pub struct EventOutcome {
    /// `(rule, job)` for every submitted job, in rule order.
    pub submitted: Vec<(String, JobId)>,
    /// Rules that failed, including matches whose submission failed.
    pub failures: Vec<RuleFailure>,
}

impl EventOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Dispatches events through a [`Registry`] and submits the matches.
#[derive(Debug)]
pub struct Coordinator<S: CasStore> {
    backend: Backend<S>,
    registry: Arc<Registry>,
}

impl<S: CasStore> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: CasStore> Coordinator<S> {
    pub fn new(backend: Backend<S>, registry: Registry) -> Self {
        Self {
            backend,
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dispatch `hook` and submit a job per match.
    ///
    /// Rule failures do not prevent the other matches from being submitted.
    /// `Error::UndefinedHook` is returned when the hook is rejected outright.
    pub async fn on_event(&self, hook: &str, args: &Value) -> Result<EventOutcome> {
        let (matches, mut failures) = match self.registry.dispatch(hook, args) {
            Ok(matches) => (matches, Vec::new()),
            Err(DispatchError::RuleFailures { matches, failures, .. }) => (matches, failures),
            Err(DispatchError::UndefinedHook(hook)) => return Err(Error::undefined_hook(hook)),
        };

        let mut submitted = Vec::with_capacity(matches.len());
        for RuleMatch { rule, call } in matches {
            let mut extra = Extra::new();
            extra.insert("rule".to_string(), Value::String(rule.clone()));
            extra.insert("hook".to_string(), Value::String(hook.to_string()));

            match self.backend.submit(call, extra).await {
                Ok(job_id) => submitted.push((rule, job_id)),
                Err(e @ Error::ConnectionLost(_)) => return Err(e),
                Err(e) => failures.push(RuleFailure {
                    rule,
                    message: e.to_string(),
                }),
            }
        }

        tracing::info!(
            hook = %hook,
            submitted = submitted.len(),
            failures = failures.len(),
            "event_dispatched"
        );
        Ok(EventOutcome { submitted, failures })
    }
}

//! Rules registry: maps hooks to ordered lists of rule handlers.
//!
//! A rule belongs to a group and listens on a hook. Groups marked strict only
//! accept rules for hooks that were explicitly defined, which catches typos in
//! hook names at registration time instead of silently never firing.
//!
//! Dispatch runs every enabled rule for the hook in registration order. A
//! failing (or panicking) rule does not stop the others; failures are
//! returned together once all rules ran.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::codec::Call;
use crate::recovery::with_recovery;
use crate::types::{Error, Result};

/// Rule handler: inspects the event arguments and optionally produces the
/// call that should become a job.
pub type RuleHandler = Arc<dyn Fn(&Value) -> std::result::Result<Option<Call>, String> + Send + Sync>;

/// A registered rule.
#[derive(Clone)]
pub struct Rule {
    pub name: String,
    pub group: String,
    pub hook: String,
    pub enabled: bool,
    handler: RuleHandler,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("hook", &self.hook)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// A rule that fired and produced a call.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule: String,
    pub call: Call,
}

/// A rule that failed during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub rule: String,
    pub message: String,
}

/// Dispatch failure.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The hook was never defined and a strict group exists.
    #[error("undefined hook: {0}")]
    UndefinedHook(String),

    /// One or more rules failed. `matches` holds what the others produced.
    #[error("{} rule(s) failed on hook {hook}", .failures.len())]
    RuleFailures {
        hook: String,
        matches: Vec<RuleMatch>,
        failures: Vec<RuleFailure>,
    },
}

impl From<DispatchError> for Error {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::UndefinedHook(hook) => Error::undefined_hook(hook),
            other => Error::internal(other.to_string()),
        }
    }
}

/// Hook → rules registry.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    hooks: BTreeSet<String>,
    strict_groups: BTreeSet<String>,
    rules: Vec<Rule>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a hook. Idempotent; returns true if the hook is new.
    pub fn define(&mut self, hook: impl Into<String>) -> bool {
        self.hooks.insert(hook.into())
    }

    pub fn is_defined(&self, hook: &str) -> bool {
        self.hooks.contains(hook)
    }

    /// Register a rule.
    ///
    /// Fails with `UndefinedHook` if `group` is strict and `hook` was never
    /// defined, and with `Validation` if a rule with this name exists.
    pub fn register<F>(
        &mut self,
        group: impl Into<String>,
        hook: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&Value) -> std::result::Result<Option<Call>, String> + Send + Sync + 'static,
    {
        let (group, hook, name) = (group.into(), hook.into(), name.into());
        if self.strict_groups.contains(&group) && !self.hooks.contains(&hook) {
            return Err(Error::undefined_hook(format!(
                "group {} is strict and hook {} is not defined",
                group, hook
            )));
        }
        if self.rules.iter().any(|rule| rule.name == name) {
            return Err(Error::validation(format!("rule {} is already registered", name)));
        }

        tracing::debug!(rule = %name, group = %group, hook = %hook, "rule_registered");
        self.rules.push(Rule {
            name,
            group,
            hook,
            enabled: true,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Make a group strict. Fails if it already holds a rule on an undefined hook.
    pub fn set_strict(&mut self, group: impl Into<String>) -> Result<()> {
        let group = group.into();
        if let Some(rule) = self
            .rules
            .iter()
            .find(|rule| rule.group == group && !self.hooks.contains(&rule.hook))
        {
            return Err(Error::undefined_hook(format!(
                "rule {} in group {} listens on undefined hook {}",
                rule.name, group, rule.hook
            )));
        }
        self.strict_groups.insert(group);
        Ok(())
    }

    pub fn is_strict(&self, group: &str) -> bool {
        self.strict_groups.contains(group)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let rule = self
            .rules
            .iter_mut()
            .find(|rule| rule.name == name)
            .ok_or_else(|| Error::not_found(format!("rule {}", name)))?;
        rule.enabled = enabled;
        Ok(())
    }

    /// Defined hooks, sorted.
    pub fn hooks(&self) -> Vec<&str> {
        self.hooks.iter().map(String::as_str).collect()
    }

    /// Rules listening on `hook`, in registration order.
    pub fn rules_for<'a>(&'a self, hook: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules.iter().filter(move |rule| rule.hook == hook)
    }

    /// Run every enabled rule for `hook`.
    pub fn dispatch(&self, hook: &str, args: &Value) -> std::result::Result<Vec<RuleMatch>, DispatchError> {
        // Strict groups never hold rules on undefined hooks, so an undefined
        // hook with listeners belongs to lenient groups only.
        if !self.hooks.contains(hook) && !self.strict_groups.is_empty() && self.rules_for(hook).next().is_none() {
            return Err(DispatchError::UndefinedHook(hook.to_string()));
        }

        let mut matches = Vec::new();
        let mut failures = Vec::new();
        for rule in self.rules_for(hook).filter(|rule| rule.enabled) {
            let handler = Arc::clone(&rule.handler);
            match with_recovery(|| handler(args), &rule.name) {
                Ok(Some(call)) => matches.push(RuleMatch {
                    rule: rule.name.clone(),
                    call,
                }),
                Ok(None) => {}
                Err(message) => {
                    tracing::warn!(rule = %rule.name, hook = %hook, error = %message, "rule_failed");
                    failures.push(RuleFailure {
                        rule: rule.name.clone(),
                        message,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(matches)
        } else {
            Err(DispatchError::RuleFailures {
                hook: hook.to_string(),
                matches,
                failures,
            })
        }
    }
}

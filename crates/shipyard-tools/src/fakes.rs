//! Scripted command runner (testing only)
//!
//! `ScriptedRunner` records every invocation and answers with canned
//! outputs matched by substring of the command line.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::Result;

#[derive(Debug)]
struct Rule {
    pattern: String,
    queued: VecDeque<CommandOutput>,
    fallback: Option<CommandOutput>,
}

/// A [`CommandRunner`] that never spawns processes.
///
/// Rules are checked in registration order; the first rule whose pattern
/// occurs in the command line and still has an answer wins. Unmatched
/// invocations succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `output` for command lines containing `pattern`.
    pub fn on(&self, pattern: impl Into<String>, output: CommandOutput) -> &Self {
        self.lock_rules().push(Rule {
            pattern: pattern.into(),
            queued: VecDeque::new(),
            fallback: Some(output),
        });
        self
    }

    /// Answer `outputs` in order; once drained the rule stops matching.
    pub fn on_sequence(
        &self,
        pattern: impl Into<String>,
        outputs: impl IntoIterator<Item = CommandOutput>,
    ) -> &Self {
        self.lock_rules().push(Rule {
            pattern: pattern.into(),
            queued: outputs.into_iter().collect(),
            fallback: None,
        });
        self
    }

    /// Every invocation seen so far, in call order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Command lines seen so far, in call order.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }

    /// Number of invocations whose command line contains `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|inv| inv.command_line().contains(pattern))
            .count()
    }

    fn lock_rules(&self) -> std::sync::MutexGuard<'_, Vec<Rule>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());

        let line = invocation.command_line();
        let mut rules = self.lock_rules();
        for rule in rules.iter_mut() {
            if !line.contains(&rule.pattern) {
                continue;
            }
            if let Some(output) = rule.queued.pop_front() {
                return Ok(output);
            }
            if let Some(output) = &rule.fallback {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::ok(""))
    }
}

//! Best-effort teardown
//!
//! Each step runs in isolation: an error or a panic in one step is logged and recorded,
//! and the next step runs regardless.

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;
use tracing::{debug, warn};

type StepFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Ordered list of independent teardown steps
#[derive(Default)]
pub struct Teardown {
    steps: Vec<(&'static str, StepFn)>,
}

/// Outcome of a teardown run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Steps that finished cleanly, in order
    pub completed: Vec<String>,
    /// Steps that failed or panicked, with the reason
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn steps_run(&self) -> usize {
        self.completed.len() + self.failures.len()
    }
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step<F>(mut self, name: &'static str, action: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.steps.push((name, Box::new(action)));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, collecting failures instead of propagating them
    pub fn run(self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (name, action) in self.steps {
            match catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => {
                    debug!("Teardown step '{}' done", name);
                    report.completed.push(name.to_string());
                }
                Ok(Err(e)) => {
                    warn!("Teardown step '{}' failed: {}", name, e);
                    report.failures.push((name.to_string(), e.to_string()));
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!("Teardown step '{}' panicked: {}", name, reason);
                    report.failures.push((name.to_string(), reason));
                }
            }
        }
        report
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

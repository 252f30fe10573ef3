use crate::adaptor::ObjectValueAdaptor;
use crate::error::Error;
use crate::model::{StackFrame, Value, VirtualMachine};
use crate::utils::CancellationToken;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Evaluation settings chosen by a front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationOptions {
    /// Upper bound of a single debuggee invocation.
    pub timeout_ms: u64,
    /// How long an aborted invocation may take to unwind.
    pub abort_timeout_ms: u64,
    /// Allow running debuggee code (method calls, property getters, `ToString`).
    pub allow_target_invoke: bool,
    /// Evaluate properties when listing object members.
    pub evaluate_properties: bool,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            abort_timeout_ms: 500,
            allow_target_invoke: true,
            evaluate_properties: true,
        }
    }
}

impl EvaluationOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}

/// Everything an expression needs: the frame it runs in and the runtime behind it.
pub struct EvaluationContext {
    pub vm: Arc<VirtualMachine>,
    pub adaptor: Arc<ObjectValueAdaptor>,
    pub thread: i64,
    pub frame: Arc<StackFrame>,
    pub options: EvaluationOptions,
    /// Exception being thrown in the debuggee, if any.
    pub exception: Option<Value>,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl EvaluationContext {
    pub fn new(
        vm: Arc<VirtualMachine>,
        adaptor: Arc<ObjectValueAdaptor>,
        thread: i64,
        frame: Arc<StackFrame>,
        options: EvaluationOptions,
    ) -> Self {
        Self {
            vm,
            adaptor,
            thread,
            frame,
            options,
            exception: None,
            in_flight: Mutex::default(),
        }
    }

    /// Same frame and runtime, different options.
    pub fn with_options(&self, options: EvaluationOptions) -> Self {
        Self {
            vm: self.vm.clone(),
            adaptor: self.adaptor.clone(),
            thread: self.thread,
            frame: self.frame.clone(),
            options,
            exception: self.exception.clone(),
            in_flight: Mutex::default(),
        }
    }

    pub fn assert_target_invoke_allowed(&self) -> Result<(), Error> {
        if !self.options.allow_target_invoke {
            return Err(Error::InvokeNotAllowed);
        }
        Ok(())
    }

    /// Abort the invocation running in this context, if any.
    pub fn abort_invocation(&self) {
        if let Some(token) = self.in_flight.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    pub fn has_pending_invocation(&self) -> bool {
        self.in_flight.lock().unwrap().is_some()
    }

    pub(super) fn begin_invocation(&self, token: CancellationToken) -> InFlightGuard<'_> {
        *self.in_flight.lock().unwrap() = Some(token);
        InFlightGuard { ctx: self }
    }
}

/// Clears the in-flight invocation of a context when dropped.
pub(super) struct InFlightGuard<'a> {
    ctx: &'a EvaluationContext,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.ctx.in_flight.lock().unwrap() = None;
    }
}

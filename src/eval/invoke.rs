use crate::error::Error;
use crate::eval::context::EvaluationContext;
use crate::model::{InvokeError, MethodId, Value, VirtualMachine};
use crate::rd_debug;
use crate::utils::CancellationToken;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of abort checks while waiting for an invocation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Debuggee method call running on a dedicated thread.
pub struct MethodCall {
    token: CancellationToken,
    done: Receiver<Result<Value, InvokeError>>,
}

impl MethodCall {
    /// Start the call, the debuggee runs in parallel with the caller.
    pub fn invoke(
        vm: Arc<VirtualMachine>,
        method: MethodId,
        this: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Self, Error> {
        let token = CancellationToken::new();
        let (tx, done) = mpsc::channel();
        let call_token = token.clone();
        thread::Builder::new()
            .name("rdbg-invoke".to_string())
            .spawn(move || {
                let result = vm.invoke(method, this.as_ref(), &args, &call_token);
                _ = tx.send(result);
            })?;
        Ok(Self { token, done })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Wait for the result. Returns `None` if the call is still running after `timeout`.
    pub fn wait_for_completed(&self, timeout: Duration) -> Option<Result<Value, Error>> {
        match self.done.recv_timeout(timeout) {
            Ok(result) => Some(result.map_err(into_error)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Error::Evaluation(
                "invocation thread terminated unexpectedly".to_string(),
            ))),
        }
    }
}

fn into_error(err: InvokeError) -> Error {
    match err {
        InvokeError::Exception(ex) => Error::EvaluationException(ex.message),
        InvokeError::Aborted => Error::InvocationAborted,
    }
}

/// Call a debuggee method with the context's timeout and abort rules.
///
/// If the call doesn't finish within the evaluation timeout it is aborted and
/// [`Error::EvaluationTimeout`] is returned. [`EvaluationContext::abort_invocation`]
/// from another thread ends the wait with [`Error::InvocationAborted`]. In both cases
/// the debuggee gets the abort timeout to unwind, the caller doesn't wait longer than that.
pub fn runtime_invoke(
    ctx: &EvaluationContext,
    method: MethodId,
    this: Option<&Value>,
    args: &[Value],
) -> Result<Value, Error> {
    ctx.assert_target_invoke_allowed()?;

    let call = MethodCall::invoke(ctx.vm.clone(), method, this.cloned(), args.to_vec())?;
    let _guard = ctx.begin_invocation(call.token().clone());

    let deadline = Instant::now() + ctx.options.timeout();
    loop {
        if call.token().is_cancelled() {
            return finish_abort(ctx, &call, Error::InvocationAborted);
        }
        let now = Instant::now();
        if now >= deadline {
            rd_debug!(target: "eval", "invocation timed out, abort it");
            call.abort();
            return finish_abort(ctx, &call, Error::EvaluationTimeout);
        }
        if let Some(result) = call.wait_for_completed(POLL_INTERVAL.min(deadline - now)) {
            return result;
        }
    }
}

fn finish_abort(ctx: &EvaluationContext, call: &MethodCall, err: Error) -> Result<Value, Error> {
    if call
        .wait_for_completed(ctx.options.abort_timeout())
        .is_none()
    {
        rd_debug!(target: "eval", "aborted invocation is still running, leave it behind");
    }
    Err(err)
}

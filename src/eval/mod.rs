//! Expression evaluation against a stopped debuggee frame.

mod context;
mod evaluator;
pub mod expr;
mod invoke;
pub mod overload;
mod reference;
mod resolve;

pub use context::{EvaluationContext, EvaluationOptions};
pub use evaluator::{evaluate, evaluate_in_instance};
pub use invoke::{runtime_invoke, MethodCall};
pub use reference::ValueReference;
pub use resolve::{find_member, list_members, resolve_identifier};

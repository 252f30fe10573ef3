//! Call stack snapshot of a stopped thread and the value tree rooted in its frames.
//!
//! Every node of the tree is addressed by an [`ObjectPath`]:
//! `FR/<frame>/LV/<name>/...` for locals, `FR/<frame>/PS/<name>/...` for parameters,
//! `FR/<frame>/TR/...` for `this` and `FR/<frame>/EXP/<expression>/...` for watches.

use crate::adaptor::{ObjectPath, ObjectValue, ObjectValueAdaptor, ObjectValueFlags};
use crate::error::Error;
use crate::eval::{evaluate, EvaluationContext, EvaluationOptions, ValueReference};
use crate::model::{StackFrame, Value, VirtualMachine};
use crate::weak_error;
use itertools::Itertools;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const FRAME_TAG: &str = "FR";
const LOCAL_TAG: &str = "LV";
const PARAM_TAG: &str = "PS";
const THIS_TAG: &str = "TR";
const EXPR_TAG: &str = "EXP";

/// Frame as shown in a call stack view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrameInfo {
    pub address: u64,
    /// Method signature with argument values, like `Program.Run(count = 3)`.
    pub label: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Call stack snapshot, innermost frame first.
///
/// A snapshot is only valid until the target resumes, after that every request
/// fails with [`Error::BacktraceInvalidated`].
pub trait Backtrace: Send + Sync {
    fn frame_count(&self) -> Result<usize, Error>;

    /// Frames from `first` to `last` inclusive, `last` is clamped to the frame count.
    fn get_stack_frames(&self, first: usize, last: usize) -> Result<Vec<StackFrameInfo>, Error>;

    fn get_local_variables(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error>;

    fn get_parameters(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error>;

    fn get_this_reference(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Option<ObjectValue>, Error>;

    /// One node per expression, unresolvable expressions give an unknown value node.
    fn get_expression_values(
        &self,
        frame: usize,
        expressions: &[String],
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error>;

    /// Children of the node at `path`, starting from `index`.
    fn get_children(
        &self,
        path: &ObjectPath,
        index: usize,
        count: Option<usize>,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error>;

    fn is_valid(&self) -> bool {
        true
    }
}

/// [`Backtrace`] over frames of a local [`VirtualMachine`].
pub struct BacktraceWrapper {
    vm: Arc<VirtualMachine>,
    adaptor: Arc<ObjectValueAdaptor>,
    thread: i64,
    frames: Vec<Arc<StackFrame>>,
    infos: Vec<OnceCell<StackFrameInfo>>,
    generation: u64,
    current_generation: Arc<AtomicU64>,
}

impl BacktraceWrapper {
    /// Create a snapshot, it stays valid while `current_generation` equals its value at this moment.
    pub fn new(
        vm: Arc<VirtualMachine>,
        adaptor: Arc<ObjectValueAdaptor>,
        thread: i64,
        frames: Vec<Arc<StackFrame>>,
        current_generation: Arc<AtomicU64>,
    ) -> Self {
        let infos = frames.iter().map(|_| OnceCell::new()).collect();
        Self {
            vm,
            adaptor,
            thread,
            frames,
            infos,
            generation: current_generation.load(Ordering::SeqCst),
            current_generation,
        }
    }

    fn ensure_valid(&self) -> Result<(), Error> {
        if self.current_generation.load(Ordering::SeqCst) != self.generation {
            return Err(Error::BacktraceInvalidated);
        }
        Ok(())
    }

    fn context(&self, frame: usize, options: &EvaluationOptions) -> Result<EvaluationContext, Error> {
        self.ensure_valid()?;
        let frame = self
            .frames
            .get(frame)
            .ok_or(Error::FrameNotFound(frame))?;
        Ok(EvaluationContext::new(
            self.vm.clone(),
            self.adaptor.clone(),
            self.thread,
            frame.clone(),
            options.clone(),
        ))
    }

    fn frame_info(&self, index: usize) -> Result<StackFrameInfo, Error> {
        let cell = self.infos.get(index).ok_or(Error::FrameNotFound(index))?;
        if let Some(info) = cell.get() {
            return Ok(info.clone());
        }
        let frame = &self.frames[index];
        let info = StackFrameInfo {
            address: frame.address,
            label: self.frame_label(index)?,
            file: frame.file.clone(),
            line: frame.line,
        };
        Ok(cell.get_or_init(|| info).clone())
    }

    /// Method name followed by `name = value` pairs of its arguments.
    /// An argument that can't be displayed doesn't spoil the whole label.
    fn frame_label(&self, index: usize) -> Result<String, Error> {
        // labels never run debuggee code
        let options = EvaluationOptions {
            allow_target_invoke: false,
            evaluate_properties: false,
            ..EvaluationOptions::default()
        };
        let ctx = self.context(index, &options)?;
        let frame = &ctx.frame;
        let name = frame
            .method
            .split_once('(')
            .map(|(name, _)| name)
            .unwrap_or(&frame.method);

        let args = frame
            .params
            .iter()
            .map(|slot| {
                let value = weak_error!(
                    self.adaptor.value_display(&ctx, &slot.get()),
                    "frame argument:"
                )
                .unwrap_or_else(|| "<error>".to_string());
                format!("{} = {value}", slot.name)
            })
            .join(", ");
        Ok(format!("{name}({args})"))
    }

    fn frame_path(frame: usize) -> ObjectPath {
        ObjectPath::new([FRAME_TAG.to_string(), frame.to_string()])
    }

    /// Root value of a path and the number of segments it takes, `None` for unrecognized paths.
    fn resolve_root(
        &self,
        ctx: &EvaluationContext,
        segments: &[String],
    ) -> Result<Option<(Value, usize)>, Error> {
        let root = match segments {
            [tag, name, ..] if tag == LOCAL_TAG => ctx.frame.local(name).map(|(_, s)| (s.get(), 2)),
            [tag, name, ..] if tag == PARAM_TAG => ctx.frame.param(name).map(|(_, s)| (s.get(), 2)),
            [tag, ..] if tag == THIS_TAG => ctx.frame.this.clone().map(|this| (this, 1)),
            [tag, expression, ..] if tag == EXPR_TAG => {
                Some((evaluate(ctx, expression)?.value(ctx)?, 2))
            }
            _ => None,
        };
        Ok(root)
    }
}

impl Backtrace for BacktraceWrapper {
    fn frame_count(&self) -> Result<usize, Error> {
        self.ensure_valid()?;
        Ok(self.frames.len())
    }

    fn get_stack_frames(&self, first: usize, last: usize) -> Result<Vec<StackFrameInfo>, Error> {
        self.ensure_valid()?;
        if self.frames.is_empty() || first > last || first >= self.frames.len() {
            return Ok(vec![]);
        }
        let last = last.min(self.frames.len() - 1);
        (first..=last).map(|i| self.frame_info(i)).collect()
    }

    fn get_local_variables(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        let ctx = self.context(frame, options)?;
        let path = Self::frame_path(frame).child(LOCAL_TAG);
        Ok((0..ctx.frame.locals.len())
            .map(|index| {
                let reference = ValueReference::Local {
                    frame: ctx.frame.clone(),
                    index,
                };
                self.adaptor
                    .create_from_reference(&ctx, path.child(reference.name()), &reference)
            })
            .collect())
    }

    fn get_parameters(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        let ctx = self.context(frame, options)?;
        let path = Self::frame_path(frame).child(PARAM_TAG);
        Ok((0..ctx.frame.params.len())
            .map(|index| {
                let reference = ValueReference::Parameter {
                    frame: ctx.frame.clone(),
                    index,
                };
                self.adaptor
                    .create_from_reference(&ctx, path.child(reference.name()), &reference)
            })
            .collect())
    }

    fn get_this_reference(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Option<ObjectValue>, Error> {
        let ctx = self.context(frame, options)?;
        let Some(this) = ctx.frame.this.clone() else {
            return Ok(None);
        };
        let ty = ctx
            .frame
            .declaring_type
            .unwrap_or_else(|| ctx.vm.type_of(&this));
        let reference = ValueReference::This { value: this, ty };
        let path = Self::frame_path(frame).child(THIS_TAG);
        Ok(Some(self.adaptor.create_from_reference(&ctx, path, &reference)))
    }

    fn get_expression_values(
        &self,
        frame: usize,
        expressions: &[String],
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        let ctx = self.context(frame, options)?;
        let base = Self::frame_path(frame).child(EXPR_TAG);
        Ok(expressions
            .iter()
            .map(|expression| {
                let path = base.child(expression.clone());
                match evaluate(&ctx, expression) {
                    Ok(reference) => {
                        let mut node = self.adaptor.create_from_reference(&ctx, path, &reference);
                        node.name = expression.clone();
                        node
                    }
                    Err(
                        Error::ExpressionParsing(_)
                        | Error::UnknownIdentifier(_)
                        | Error::MemberNotFound { .. },
                    ) => ObjectValue {
                        path,
                        ..ObjectValue::unknown(expression)
                    },
                    Err(e) => ObjectValue::error(
                        path,
                        expression,
                        e.to_string(),
                        ObjectValueFlags::LITERAL,
                    ),
                }
            })
            .collect())
    }

    fn get_children(
        &self,
        path: &ObjectPath,
        index: usize,
        count: Option<usize>,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        self.ensure_valid()?;
        let frame = match path.segments() {
            [tag, frame, _, ..] if tag == FRAME_TAG => match frame.parse::<usize>() {
                Ok(frame) => frame,
                Err(_) => return Ok(vec![]),
            },
            _ => return Ok(vec![]),
        };
        let ctx = match self.context(frame, options) {
            Ok(ctx) => ctx,
            Err(Error::FrameNotFound(_)) => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let segments = &path.segments()[2..];

        let (root, consumed) = match self.resolve_root(&ctx, segments) {
            Ok(Some(root)) => root,
            Ok(None) => return Ok(vec![]),
            Err(e) => return Ok(vec![child_error(path, e)]),
        };
        let value = match self
            .adaptor
            .resolve_path(&ctx, root, &segments[consumed..])
        {
            Ok(value) => value,
            Err(e) => return Ok(vec![child_error(path, e)]),
        };
        self.adaptor.get_children(&ctx, path, &value, index, count)
    }

    fn is_valid(&self) -> bool {
        self.ensure_valid().is_ok()
    }
}

fn child_error(path: &ObjectPath, err: Error) -> ObjectValue {
    ObjectValue::error(path.clone(), "", err.to_string(), ObjectValueFlags::empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adaptor::ObjectValueKind;
    use crate::model::{ObjectId, TypeId, VariableSlot};

    struct Fixture {
        backtrace: BacktraceWrapper,
        generation: Arc<AtomicU64>,
    }

    fn fixture() -> Fixture {
        let vm = Arc::new(VirtualMachine::new());
        let point = vm
            .define_class("Point")
            .field("X", TypeId::INT32)
            .field("Y", TypeId::INT32)
            .build();
        let program = vm.define_class("Program").field("runs", TypeId::INT32).build();

        let p = vm.new_object(point);
        let points = vm.new_array(point, vec![p.clone(), Value::Null]);
        let this = vm.new_object(program);

        let inner = Arc::new(StackFrame {
            address: 0x1010,
            method: "Program.Draw(Point p, int scale)".to_string(),
            declaring_type: Some(program),
            file: Some("main.cs".to_string()),
            line: Some(12),
            locals: vec![Arc::new(VariableSlot::new("points", vm.array_type(point), points))],
            params: vec![
                Arc::new(VariableSlot::new("p", point, p)),
                Arc::new(VariableSlot::new("scale", TypeId::INT32, Value::int(2))),
            ],
            this: Some(this),
        });
        let outer = Arc::new(StackFrame {
            address: 0x1000,
            method: "Program.Main(int[] args)".to_string(),
            declaring_type: Some(program),
            file: None,
            line: None,
            locals: vec![],
            params: vec![Arc::new(VariableSlot::new(
                "args",
                vm.array_type(TypeId::INT32),
                Value::Array(ObjectId(9999)),
            ))],
            this: None,
        });

        let generation = Arc::new(AtomicU64::new(0));
        let backtrace = BacktraceWrapper::new(
            vm,
            Arc::new(ObjectValueAdaptor::new()),
            1,
            vec![inner, outer],
            generation.clone(),
        );
        Fixture {
            backtrace,
            generation,
        }
    }

    #[test]
    fn test_stack_frames() {
        let fx = fixture();
        let bt = &fx.backtrace;
        assert_eq!(bt.frame_count().unwrap(), 2);

        let frames = bt.get_stack_frames(0, 100).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].label, "Program.Draw(p = {Point}, scale = 2)");
        assert_eq!(frames[0].file.as_deref(), Some("main.cs"));
        assert_eq!(frames[0].line, Some(12));
        assert_eq!(frames[1].label, "Program.Main(args = <error>)");
        assert_eq!(frames[1].file, None);

        for i in 0..2 {
            let first = bt.get_stack_frames(i, i).unwrap();
            let second = bt.get_stack_frames(i, i).unwrap();
            assert_eq!(first.len(), 1);
            assert_eq!(first, second);
        }

        assert!(bt.get_stack_frames(2, 5).unwrap().is_empty());
        assert!(bt.get_stack_frames(1, 0).unwrap().is_empty());
    }

    #[test]
    fn test_invalidated_on_resume() {
        let fx = fixture();
        assert!(fx.backtrace.is_valid());
        fx.generation.fetch_add(1, Ordering::SeqCst);

        assert!(!fx.backtrace.is_valid());
        assert!(matches!(
            fx.backtrace.get_stack_frames(0, 0),
            Err(Error::BacktraceInvalidated)
        ));
        assert!(matches!(
            fx.backtrace
                .get_local_variables(0, &EvaluationOptions::default()),
            Err(Error::BacktraceInvalidated)
        ));
    }

    #[test]
    fn test_variables() {
        let fx = fixture();
        let options = EvaluationOptions::default();
        let bt = &fx.backtrace;

        let locals = bt.get_local_variables(0, &options).unwrap();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].path.to_string(), "FR/0/LV/points");
        assert_eq!(locals[0].child_count, Some(2));

        let params = bt.get_parameters(0, &options).unwrap();
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["p", "scale"]);
        assert_eq!(params[1].value, "2");
        assert!(params[1].flags.contains(ObjectValueFlags::PARAMETER));

        let this = bt.get_this_reference(0, &options).unwrap().unwrap();
        assert_eq!(this.path.to_string(), "FR/0/TR");
        assert!(this.has_children);
        assert!(bt.get_this_reference(1, &options).unwrap().is_none());

        assert!(matches!(
            bt.get_local_variables(7, &options),
            Err(Error::FrameNotFound(7))
        ));
    }

    #[test]
    fn test_expression_values() {
        let fx = fixture();
        let options = EvaluationOptions::default();
        let expressions = vec![
            "p.X".to_string(),
            "nothing".to_string(),
            "p.".to_string(),
            "points[5]".to_string(),
        ];
        let values = fx
            .backtrace
            .get_expression_values(0, &expressions, &options)
            .unwrap();

        assert_eq!(values[0].name, "p.X");
        assert_eq!(values[0].value, "0");
        assert_eq!(values[1].kind, ObjectValueKind::Unknown);
        assert_eq!(values[1].path.to_string(), "FR/0/EXP/nothing");
        assert_eq!(values[2].kind, ObjectValueKind::Unknown);
        assert!(values[3].is_error());
    }

    #[test]
    fn test_children_by_path() {
        let fx = fixture();
        let options = EvaluationOptions::default();
        let bt = &fx.backtrace;

        let path = ObjectPath::new(["FR", "0", "LV", "points"]);
        let elements = bt.get_children(&path, 0, None, &options).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].path.to_string(), "FR/0/LV/points/[0]");
        assert_eq!(elements[1].value, "(null)");

        let fields = bt
            .get_children(&elements[0].path, 0, None, &options)
            .unwrap();
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["X", "Y"]);

        let path = ObjectPath::new(["FR", "0", "EXP", "p"]);
        assert_eq!(bt.get_children(&path, 1, Some(1), &options).unwrap().len(), 1);

        let path = ObjectPath::new(["FR", "0", "TR"]);
        let members = bt.get_children(&path, 0, None, &options).unwrap();
        assert_eq!(members[0].name, "runs");

        let null_child = ObjectPath::new(["FR", "0", "LV", "points", "[1]", "X"]);
        let nodes = bt.get_children(&null_child, 0, None, &options).unwrap();
        assert!(nodes[0].is_error());

        for unknown in [
            ObjectPath::new(["FR", "0", "ZZ", "a"]),
            ObjectPath::new(["XX"]),
            ObjectPath::new(["FR", "zero", "LV", "a"]),
            ObjectPath::new(["FR", "0", "LV", "missing"]),
            ObjectPath::new(["FR", "99", "LV", "points"]),
        ] {
            assert!(bt.get_children(&unknown, 0, None, &options).unwrap().is_empty());
        }
    }
}

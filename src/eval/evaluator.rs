use crate::error::Error;
use crate::eval::context::EvaluationContext;
use crate::eval::expr::{self, Expr, Literal};
use crate::eval::invoke::runtime_invoke;
use crate::eval::overload::{overload_resolve, ArgType, Binding};
use crate::eval::reference::ValueReference;
use crate::eval::resolve::{find_member, resolve_identifier};
use crate::model::{Primitive, TypeId, TypeKind, Value};
use crate::rd_debug;

/// Result of evaluating a sub expression: a value location or a type name.
enum Evaluated {
    Value(ValueReference),
    Type(TypeId),
}

struct Scope<'a> {
    ctx: &'a EvaluationContext,
    /// Identifiers are first looked up among members of this instance.
    instance: Option<&'a Value>,
}

/// Evaluate an expression in the context frame.
pub fn evaluate(ctx: &EvaluationContext, expression: &str) -> Result<ValueReference, Error> {
    let expr = expr::parse(expression)?;
    rd_debug!(target: "eval", "evaluate {expr}");
    let scope = Scope {
        ctx,
        instance: None,
    };
    expect_value(ctx, scope.eval(&expr)?)
}

/// Evaluate an expression where bare identifiers name members of `instance`,
/// as display templates expect.
pub fn evaluate_in_instance(
    ctx: &EvaluationContext,
    instance: &Value,
    expression: &str,
) -> Result<ValueReference, Error> {
    let expr = expr::parse(expression)?;
    let scope = Scope {
        ctx,
        instance: Some(instance),
    };
    expect_value(ctx, scope.eval(&expr)?)
}

fn expect_value(ctx: &EvaluationContext, evaluated: Evaluated) -> Result<ValueReference, Error> {
    match evaluated {
        Evaluated::Value(r) => Ok(r),
        Evaluated::Type(ty) => Err(Error::Evaluation(format!(
            "`{}` is a type, which is not valid in the given context",
            ctx.vm.type_name(ty)
        ))),
    }
}

fn null_reference() -> Error {
    Error::EvaluationException("Object reference not set to an instance of an object".to_string())
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr) -> Result<Evaluated, Error> {
        let ctx = self.ctx;
        match expr {
            Expr::Literal(lit) => Ok(Evaluated::Value(self.literal(lit, expr.to_string()))),
            Expr::This => {
                let this = self
                    .instance
                    .or(ctx.frame.this.as_ref())
                    .ok_or_else(|| {
                        Error::Evaluation("keyword `this` is not available in a static method".to_string())
                    })?;
                Ok(Evaluated::Value(ValueReference::This {
                    value: this.clone(),
                    ty: ctx.vm.type_of(this),
                }))
            }
            Expr::Ident(name) => {
                if let Some(instance) = self.instance {
                    let ty = ctx.vm.type_of(instance);
                    if let Some(member) = find_member(ctx, ty, Some(instance), name) {
                        return Ok(Evaluated::Value(member));
                    }
                }
                if let Some(reference) = resolve_identifier(ctx, name) {
                    return Ok(Evaluated::Value(reference));
                }
                ctx.vm
                    .find_type(name)
                    .map(Evaluated::Type)
                    .ok_or_else(|| Error::UnknownIdentifier(name.clone()))
            }
            Expr::Member(target, name) => match self.eval(target)? {
                Evaluated::Type(ty) => find_member(ctx, ty, None, name)
                    .map(Evaluated::Value)
                    .ok_or_else(|| Error::MemberNotFound {
                        type_name: ctx.vm.type_name(ty),
                        member: name.clone(),
                    }),
                Evaluated::Value(reference) => {
                    let value = reference.value(ctx)?;
                    self.member_of(&value, name).map(Evaluated::Value)
                }
            },
            Expr::Call {
                target,
                method,
                args,
            } => self.call(expr, target.as_deref(), method, args),
            Expr::Index(target, args) => {
                let reference = expect_value(ctx, self.eval(target)?)?;
                let value = reference.value(ctx)?;
                let index = self.eval_args(args)?;
                self.index(value, index).map(Evaluated::Value)
            }
        }
    }

    fn eval_args(&self, args: &[Expr]) -> Result<Vec<Value>, Error> {
        args.iter()
            .map(|arg| expect_value(self.ctx, self.eval(arg)?)?.value(self.ctx))
            .collect()
    }

    fn literal(&self, lit: &Literal, name: String) -> ValueReference {
        let value = match lit {
            Literal::Int(v) => match i32::try_from(*v) {
                Ok(v) => Value::int(v),
                Err(_) => Value::Primitive(Primitive::Int64(*v)),
            },
            Literal::Float(v) => Value::Primitive(Primitive::Double(*v)),
            Literal::String(s) => Value::string(s),
            Literal::Char(c) => Value::Primitive(Primitive::Char(*c)),
            Literal::Bool(b) => Value::bool(*b),
            Literal::Null => Value::Null,
        };
        let ty = self.ctx.vm.type_of(&value);
        ValueReference::Literal { name, value, ty }
    }

    fn member_of(&self, value: &Value, name: &str) -> Result<ValueReference, Error> {
        let ctx = self.ctx;
        let length = match value {
            Value::Null => return Err(null_reference()),
            Value::Array(_) if name == "Length" => Some(ctx.vm.array_len(value)?),
            Value::String(s) if name == "Length" => Some(s.chars().count()),
            _ => None,
        };
        if let Some(len) = length {
            return Ok(ValueReference::Literal {
                name: name.to_string(),
                value: Value::int(len as i32),
                ty: TypeId::INT32,
            });
        }

        let ty = ctx.vm.type_of(value);
        find_member(ctx, ty, Some(value), name).ok_or_else(|| Error::MemberNotFound {
            type_name: ctx.vm.type_name(ty),
            member: name.to_string(),
        })
    }

    fn call(
        &self,
        expr: &Expr,
        target: Option<&Expr>,
        method: &str,
        args: &[Expr],
    ) -> Result<Evaluated, Error> {
        let ctx = self.ctx;
        let arg_values = self.eval_args(args)?;
        let arg_types: Vec<ArgType> = arg_values
            .iter()
            .map(|v| (!v.is_null()).then(|| ctx.vm.type_of(v)))
            .collect();

        let (ty, this, binding) = match target {
            None => match self.instance.or(ctx.frame.this.as_ref()) {
                Some(this) => (ctx.vm.type_of(this), Some(this.clone()), Binding::ANY),
                None => {
                    let ty = ctx.frame.declaring_type.ok_or_else(|| Error::MethodNotFound {
                        method: method.to_string(),
                        type_name: ctx.frame.method.clone(),
                    })?;
                    (ty, None, Binding::STATIC)
                }
            },
            Some(target) => match self.eval(target)? {
                Evaluated::Type(ty) => (ty, None, Binding::STATIC),
                Evaluated::Value(reference) => {
                    let value = reference.value(ctx)?;
                    if value.is_null() {
                        return Err(null_reference());
                    }
                    (ctx.vm.type_of(&value), Some(value), Binding::INSTANCE)
                }
            },
        };

        let resolved = overload_resolve(&ctx.vm, method, ty, &arg_types, binding)?;
        let this = if resolved.is_static { None } else { this };
        let value = runtime_invoke(ctx, resolved.id, this.as_ref(), &arg_values)?;
        let ty = if value.is_null() {
            resolved.return_type
        } else {
            ctx.vm.type_of(&value)
        };
        Ok(Evaluated::Value(ValueReference::Literal {
            name: expr.to_string(),
            value,
            ty,
        }))
    }

    fn index(&self, target: Value, index: Vec<Value>) -> Result<ValueReference, Error> {
        let ctx = self.ctx;
        let single_index = || match index.as_slice() {
            [i] => i
                .as_i64()
                .ok_or_else(|| Error::Evaluation("array index must be an integer".to_string())),
            _ => Err(Error::Evaluation(format!(
                "wrong number of indexes {}, expected 1",
                index.len()
            ))),
        };

        match &target {
            Value::Null => Err(null_reference()),
            Value::Array(_) => {
                let element_type = match ctx.vm.type_info(ctx.vm.type_of(&target)).kind {
                    TypeKind::Array { element } => element,
                    _ => TypeId::OBJECT,
                };
                Ok(ValueReference::ArrayElement {
                    index: single_index()?,
                    array: target,
                    element_type,
                })
            }
            Value::String(s) => {
                let i = single_index()?;
                let c = usize::try_from(i)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .ok_or(Error::IndexOutOfRange {
                        index: i,
                        len: s.chars().count(),
                    })?;
                Ok(ValueReference::Literal {
                    name: format!("[{i}]"),
                    value: Value::Primitive(Primitive::Char(c)),
                    ty: TypeId::CHAR,
                })
            }
            _ => {
                let ty = ctx.vm.type_of(&target);
                let indexer = ctx
                    .vm
                    .base_chain(ty)
                    .iter()
                    .flat_map(|t| t.properties.clone())
                    .find(|p| {
                        p.is_indexer()
                            && p.index_params.len() == index.len()
                            && p.index_params.iter().zip(&index).all(|(param, arg)| {
                                arg.is_null() || ctx.vm.is_assignable(ctx.vm.type_of(arg), param.ty)
                            })
                    })
                    .ok_or_else(|| Error::MemberNotFound {
                        type_name: ctx.vm.type_name(ty),
                        member: "this[]".to_string(),
                    })?;
                Ok(ValueReference::Property {
                    property: indexer,
                    target: Some(target),
                    index_args: index,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adaptor::ObjectValueAdaptor;
    use crate::eval::EvaluationOptions;
    use crate::model::{StackFrame, TargetException, VariableSlot, VirtualMachine};
    use std::sync::Arc;

    struct Fixture {
        vm: Arc<VirtualMachine>,
        ctx: EvaluationContext,
    }

    fn fixture(options: EvaluationOptions) -> Fixture {
        let vm = Arc::new(VirtualMachine::new());
        let shape = vm.define_class("Shape").field("id", TypeId::INT32).build();
        let point = vm
            .define_class("Point")
            .base(shape)
            .field("x", TypeId::INT32)
            .field("y", TypeId::INT32)
            .property("Sum", TypeId::INT32, |scope, this, _| {
                let this = this.ok_or_else(|| TargetException::new("NullReferenceException", ""))?;
                let info = scope.vm.type_info(scope.vm.type_of(this));
                let mut sum = 0;
                for name in ["x", "y"] {
                    let field = info.field(name).cloned().unwrap();
                    sum += scope.vm.get_field(Some(this), &field).unwrap().as_i64().unwrap();
                }
                Ok(Value::int(sum as i32))
            })
            .build();
        let program = vm
            .define_class("Program")
            .static_field("Counter", TypeId::INT32, Value::int(7))
            .static_method("f", &[("x", TypeId::INT32)], TypeId::STRING, |_, _, _| {
                Ok(Value::string("int"))
            })
            .static_method("f", &[("s", TypeId::STRING)], TypeId::STRING, |_, _, _| {
                Ok(Value::string("string"))
            })
            .build();
        let list = vm
            .define_class("Bag")
            .indexer(
                TypeId::STRING,
                &[("i", TypeId::INT32)],
                |_, _, args| Ok(Value::string(format!("item{}", args[0].as_i64().unwrap_or(-1)))),
                None,
            )
            .build();

        let p = vm.new_object(point);
        let info = vm.type_info(point);
        vm.set_field(Some(&p), info.field("x").unwrap(), Value::int(3)).unwrap();
        vm.set_field(Some(&p), info.field("y").unwrap(), Value::int(4)).unwrap();
        let arr = vm.new_array(TypeId::INT32, vec![Value::int(10), Value::int(20)]);

        let frame = Arc::new(StackFrame {
            address: 0x1000,
            method: "Program.Main(string name)".to_string(),
            declaring_type: Some(program),
            file: Some("main.cs".to_string()),
            line: Some(5),
            locals: vec![
                Arc::new(VariableSlot::new("p", point, p)),
                Arc::new(VariableSlot::new("arr", vm.array_type(TypeId::INT32), arr)),
                Arc::new(VariableSlot::new("bag", list, vm.new_object(list))),
                Arc::new(VariableSlot::new("count", TypeId::INT32, Value::int(1))),
            ],
            params: vec![Arc::new(VariableSlot::new(
                "name",
                TypeId::STRING,
                Value::string("bob"),
            ))],
            this: None,
        });
        let ctx = EvaluationContext::new(
            vm.clone(),
            Arc::new(ObjectValueAdaptor::new()),
            1,
            frame,
            options,
        );
        Fixture { vm, ctx }
    }

    fn eval(ctx: &EvaluationContext, expr: &str) -> Result<Value, Error> {
        evaluate(ctx, expr)?.value(ctx)
    }

    #[test]
    fn test_evaluate_values() {
        struct TestCase {
            expr: &'static str,
            value: Value,
        }
        let cases = vec![
            TestCase {
                expr: "count",
                value: Value::int(1),
            },
            TestCase {
                expr: "name",
                value: Value::string("bob"),
            },
            TestCase {
                expr: "p.x",
                value: Value::int(3),
            },
            TestCase {
                expr: "p.id",
                value: Value::int(0),
            },
            TestCase {
                expr: "p.Sum",
                value: Value::int(7),
            },
            TestCase {
                expr: "arr[1]",
                value: Value::int(20),
            },
            TestCase {
                expr: "arr.Length",
                value: Value::int(2),
            },
            TestCase {
                expr: "name[0]",
                value: Value::Primitive(Primitive::Char('b')),
            },
            TestCase {
                expr: "Counter",
                value: Value::int(7),
            },
            TestCase {
                expr: "Program.Counter",
                value: Value::int(7),
            },
            TestCase {
                expr: "f(1)",
                value: Value::string("int"),
            },
            TestCase {
                expr: "f(\"a\")",
                value: Value::string("string"),
            },
            TestCase {
                expr: "bag[2]",
                value: Value::string("item2"),
            },
            TestCase {
                expr: "p.ToString()",
                value: Value::string("Point"),
            },
        ];

        let fx = fixture(EvaluationOptions::default());
        for tc in cases {
            assert_eq!(eval(&fx.ctx, tc.expr).unwrap(), tc.value, "case: {}", tc.expr);
        }
    }

    #[test]
    fn test_evaluate_errors() {
        let fx = fixture(EvaluationOptions::default());
        assert!(matches!(
            eval(&fx.ctx, "missing"),
            Err(Error::UnknownIdentifier(name)) if name == "missing"
        ));
        assert!(matches!(
            eval(&fx.ctx, "p.z"),
            Err(Error::MemberNotFound { .. })
        ));
        assert!(matches!(
            eval(&fx.ctx, "arr[5]"),
            Err(Error::IndexOutOfRange { index: 5, len: 2 })
        ));
        assert!(matches!(eval(&fx.ctx, "this"), Err(Error::Evaluation(_))));
        assert!(matches!(eval(&fx.ctx, "Program"), Err(Error::Evaluation(_))));
        assert!(matches!(eval(&fx.ctx, "f(1.5)"), Err(Error::InvalidArguments { .. })));
        assert!(matches!(
            eval(&fx.ctx, "p.x +"),
            Err(Error::ExpressionParsing(_))
        ));
    }

    #[test]
    fn test_invoke_disabled() {
        let fx = fixture(EvaluationOptions {
            allow_target_invoke: false,
            ..EvaluationOptions::default()
        });
        assert!(matches!(eval(&fx.ctx, "p.Sum"), Err(Error::InvokeNotAllowed)));
        assert!(matches!(eval(&fx.ctx, "f(1)"), Err(Error::InvokeNotAllowed)));
        assert_eq!(eval(&fx.ctx, "p.x").unwrap(), Value::int(3));
    }

    #[test]
    fn test_assign_through_reference() {
        let fx = fixture(EvaluationOptions::default());
        let count = evaluate(&fx.ctx, "count").unwrap();
        count.set_value(&fx.ctx, Value::int(5)).unwrap();
        assert_eq!(eval(&fx.ctx, "count").unwrap(), Value::int(5));

        let x = evaluate(&fx.ctx, "p.x").unwrap();
        x.set_value(&fx.ctx, Value::int(11)).unwrap();
        assert_eq!(eval(&fx.ctx, "p.Sum").unwrap(), Value::int(15));

        let err = count.set_value(&fx.ctx, Value::string("five")).unwrap_err();
        assert!(matches!(err, Error::CastFailure { .. }));

        let literal = evaluate(&fx.ctx, "42").unwrap();
        assert!(matches!(
            literal.set_value(&fx.ctx, Value::int(1)),
            Err(Error::ReadOnly(_))
        ));
        assert!(fx.vm.find_type("Point").is_some());
    }

    #[test]
    fn test_instance_scope() {
        let fx = fixture(EvaluationOptions::default());
        let p = eval(&fx.ctx, "p").unwrap();
        let sum = evaluate_in_instance(&fx.ctx, &p, "Sum").unwrap();
        assert_eq!(sum.value(&fx.ctx).unwrap(), Value::int(7));
        let x = evaluate_in_instance(&fx.ctx, &p, "this.x").unwrap();
        assert_eq!(x.value(&fx.ctx).unwrap(), Value::int(3));
        // falls back to frame lookup
        let count = evaluate_in_instance(&fx.ctx, &p, "count").unwrap();
        assert_eq!(count.value(&fx.ctx).unwrap(), Value::int(1));
    }
}

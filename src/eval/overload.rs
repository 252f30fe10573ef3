//! Method overload resolution.
use crate::error::Error;
use crate::model::{MethodMirror, TypeId, TypeMirror, VirtualMachine};
use itertools::Itertools;
use std::sync::Arc;

/// Argument type as seen by overload resolution, `None` stands for a `null` argument.
pub type ArgType = Option<TypeId>;

/// Which kinds of methods are acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub instance: bool,
    pub statics: bool,
}

impl Binding {
    pub const INSTANCE: Binding = Binding {
        instance: true,
        statics: false,
    };
    pub const STATIC: Binding = Binding {
        instance: false,
        statics: true,
    };
    pub const ANY: Binding = Binding {
        instance: true,
        statics: true,
    };

    fn accepts(&self, method: &MethodMirror) -> bool {
        if method.is_static {
            self.statics
        } else {
            self.instance
        }
    }
}

/// Pick a method named `name` that accepts arguments of `arg_types`.
///
/// Candidates are collected along the whole base chain of `ty`, most derived first.
/// A single candidate must accept all arguments. Among several candidates the one
/// with the most exactly matching argument types wins; on a tie the first found wins.
pub fn overload_resolve(
    vm: &VirtualMachine,
    name: &str,
    ty: TypeId,
    arg_types: &[ArgType],
    binding: Binding,
) -> Result<Arc<MethodMirror>, Error> {
    let candidates: Vec<_> = vm
        .base_chain(ty)
        .iter()
        .flat_map(|t: &Arc<TypeMirror>| t.methods.clone())
        .map(|id| vm.method(id))
        .filter(|m| m.name == name && m.params.len() == arg_types.len() && binding.accepts(m))
        .collect();

    let type_name = vm.type_name(ty);
    match candidates.len() {
        0 => Err(Error::MethodNotFound {
            method: name.to_string(),
            type_name,
        }),
        1 => {
            let method = &candidates[0];
            check_applicable(vm, method, arg_types).map_err(|reason| Error::InvalidArguments {
                method: name.to_string(),
                reason,
            })?;
            Ok(method.clone())
        }
        _ => {
            let mut best: Option<(usize, &Arc<MethodMirror>)> = None;
            for method in &candidates {
                let Ok(matches) = check_applicable(vm, method, arg_types) else {
                    continue;
                };
                if best.map(|(count, _)| matches > count).unwrap_or(true) {
                    best = Some((matches, method));
                }
            }
            best.map(|(_, m)| m.clone())
                .ok_or_else(|| Error::InvalidArguments {
                    method: name.to_string(),
                    reason: format!(
                        "no overload accepts arguments ({})",
                        arg_types.iter().map(|a| arg_name(vm, *a)).join(", ")
                    ),
                })
        }
    }
}

fn arg_name(vm: &VirtualMachine, arg: ArgType) -> String {
    arg.map(|t| vm.type_name(t))
        .unwrap_or_else(|| "null".to_string())
}

/// Count exact parameter type matches, or explain the first argument that doesn't fit.
fn check_applicable(
    vm: &VirtualMachine,
    method: &MethodMirror,
    arg_types: &[ArgType],
) -> Result<usize, String> {
    let mut matches = 0;
    for (i, (param, arg)) in method.params.iter().zip(arg_types).enumerate() {
        match arg {
            Some(arg) if *arg == param.ty => matches += 1,
            Some(arg) if vm.is_assignable(*arg, param.ty) => {}
            None if !vm.type_info(param.ty).is_value_type() => {}
            _ => {
                return Err(format!(
                    "Argument {i}: Cannot implicitly convert `{}` to `{}`",
                    arg_name(vm, *arg),
                    vm.type_name(param.ty)
                ))
            }
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Value;

    fn define_f(vm: &VirtualMachine) -> TypeId {
        vm.define_class("Calc")
            .static_method("f", &[("x", TypeId::INT32)], TypeId::STRING, |_, _, _| {
                Ok(Value::string("int"))
            })
            .static_method("f", &[("s", TypeId::STRING)], TypeId::STRING, |_, _, _| {
                Ok(Value::string("string"))
            })
            .static_method("g", &[("o", TypeId::OBJECT)], TypeId::VOID, |_, _, _| {
                Ok(Value::Null)
            })
            .static_method("h", &[("n", TypeId::INT64)], TypeId::VOID, |_, _, _| {
                Ok(Value::Null)
            })
            .method("i", &[], TypeId::VOID, |_, _, _| Ok(Value::Null))
            .build()
    }

    #[test]
    fn test_overload_by_argument_type() {
        struct TestCase {
            args: Vec<ArgType>,
            param_type: TypeId,
        }
        let cases = vec![
            TestCase {
                args: vec![Some(TypeId::INT32)],
                param_type: TypeId::INT32,
            },
            TestCase {
                args: vec![Some(TypeId::STRING)],
                param_type: TypeId::STRING,
            },
            TestCase {
                args: vec![None],
                param_type: TypeId::STRING,
            },
        ];

        let vm = VirtualMachine::new();
        let calc = define_f(&vm);
        for tc in cases {
            let m = overload_resolve(&vm, "f", calc, &tc.args, Binding::STATIC).unwrap();
            assert_eq!(m.params[0].ty, tc.param_type);
        }
    }

    #[test]
    fn test_no_applicable_overload() {
        let vm = VirtualMachine::new();
        let calc = define_f(&vm);
        let err =
            overload_resolve(&vm, "f", calc, &[Some(TypeId::DOUBLE)], Binding::STATIC).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments { .. }));
    }

    #[test]
    fn test_single_candidate() {
        let vm = VirtualMachine::new();
        let calc = define_f(&vm);

        let m = overload_resolve(&vm, "g", calc, &[Some(TypeId::STRING)], Binding::STATIC).unwrap();
        assert_eq!(m.name, "g");

        let err =
            overload_resolve(&vm, "h", calc, &[Some(TypeId::STRING)], Binding::STATIC).unwrap_err();
        match err {
            Error::InvalidArguments { method, reason } => {
                assert_eq!(method, "h");
                assert_eq!(reason, "Argument 0: Cannot implicitly convert `string` to `long`");
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_not_found() {
        let vm = VirtualMachine::new();
        let calc = define_f(&vm);

        let err = overload_resolve(&vm, "nope", calc, &[], Binding::ANY).unwrap_err();
        assert!(matches!(err, Error::MethodNotFound { method, type_name } if method == "nope" && type_name == "Calc"));

        // instance method is invisible for static binding
        let err = overload_resolve(&vm, "i", calc, &[], Binding::STATIC).unwrap_err();
        assert!(matches!(err, Error::MethodNotFound { .. }));
        assert!(overload_resolve(&vm, "i", calc, &[], Binding::INSTANCE).is_ok());
    }

    #[test]
    fn test_most_derived_wins_tie() {
        let vm = VirtualMachine::new();
        let base = vm
            .define_class("Base")
            .method("Describe", &[], TypeId::STRING, |_, _, _| Ok(Value::string("base")))
            .build();
        let derived = vm
            .define_class("Derived")
            .base(base)
            .method("Describe", &[], TypeId::STRING, |_, _, _| {
                Ok(Value::string("derived"))
            })
            .build();

        let m = overload_resolve(&vm, "Describe", derived, &[], Binding::INSTANCE).unwrap();
        assert_eq!(m.declaring, derived);
        let m = overload_resolve(&vm, "ToString", derived, &[], Binding::INSTANCE).unwrap();
        assert_eq!(m.declaring, TypeId::OBJECT);
    }
}

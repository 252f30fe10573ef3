//! Name lookup in a frame and in types.
use crate::eval::context::EvaluationContext;
use crate::eval::reference::ValueReference;
use crate::model::{TypeId, Value};

/// Find what `name` refers to in the context frame.
///
/// Lookup order: locals, parameters, instance members of the enclosing type chain
/// (only when the frame has `this`), static members of the enclosing type chain.
pub fn resolve_identifier(ctx: &EvaluationContext, name: &str) -> Option<ValueReference> {
    let frame = &ctx.frame;
    if let Some((index, _)) = frame.local(name) {
        return Some(ValueReference::Local {
            frame: frame.clone(),
            index,
        });
    }
    if let Some((index, _)) = frame.param(name) {
        return Some(ValueReference::Parameter {
            frame: frame.clone(),
            index,
        });
    }

    let enclosing = frame.declaring_type?;
    if let Some(this) = &frame.this {
        if let Some(member) = find_member(ctx, enclosing, Some(this), name) {
            return Some(member);
        }
    }
    find_member(ctx, enclosing, None, name)
}

/// Find a field or a property named `name` in `ty` or its ancestors.
///
/// With a `target` only instance members are considered, without it only static ones.
/// Fields are looked up before properties on each level of the chain.
pub fn find_member(
    ctx: &EvaluationContext,
    ty: TypeId,
    target: Option<&Value>,
    name: &str,
) -> Option<ValueReference> {
    let is_static = target.is_none();
    for info in ctx.vm.base_chain(ty) {
        if let Some(field) = info.field(name).filter(|f| f.is_static == is_static) {
            return Some(ValueReference::Field {
                field: field.clone(),
                target: target.cloned(),
            });
        }
        if let Some(property) = info.property(name).filter(|p| p.is_static == is_static) {
            return Some(ValueReference::Property {
                property: property.clone(),
                target: target.cloned(),
                index_args: vec![],
            });
        }
    }
    None
}

/// All members visible in a listing of `ty`: fields first, then properties, most
/// derived type first. Hidden members are skipped.
pub fn list_members(
    ctx: &EvaluationContext,
    ty: TypeId,
    target: Option<&Value>,
) -> Vec<ValueReference> {
    let is_static = target.is_none();
    let chain = ctx.vm.base_chain(ty);

    let fields = chain.iter().flat_map(|info| {
        info.fields
            .iter()
            .filter(|f| f.is_static == is_static && !f.hidden)
            .map(|f| ValueReference::Field {
                field: f.clone(),
                target: target.cloned(),
            })
    });
    let properties = chain.iter().flat_map(|info| {
        info.properties
            .iter()
            .filter(|p| p.is_static == is_static && !p.hidden && !p.is_indexer())
            .map(|p| ValueReference::Property {
                property: p.clone(),
                target: target.cloned(),
                index_args: vec![],
            })
    });
    fields.chain(properties).collect()
}

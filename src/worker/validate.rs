use crate::model::{Edge, EdgeValue};
use crate::schema::{SchemaUpdate, PERMISSION_PREDICATE};
use crate::types::{convert, decode, marshal, MutationError, Result, ValidationError, ValueType};

/// Checks `edge` against the predicate's schema and converts its value to the
/// schema type in place.
///
/// After a successful call the edge's value holds the binary encoding of the
/// converted value and `value_type` is the schema type, unless the schema has no
/// concrete type yet, in which case the edge keeps its own.
pub fn validate_and_convert(edge: &mut Edge, su: &SchemaUpdate, acl_enabled: bool) -> Result<()> {
    if edge.is_delete_predicate() {
        return Ok(());
    }
    let storage_type = edge.storage_type();
    if storage_type == ValueType::Default && edge.is_star() {
        return Ok(());
    }
    let schema_type = su.value_type;
    let predicate = || edge.attr.clone();

    if edge.lang.is_some() && !su.lang {
        return Err(ValidationError::LangNotAllowed {
            predicate: predicate(),
        }
        .into());
    }
    match (schema_type.is_scalar(), storage_type.is_scalar()) {
        (false, false) => return Ok(()),
        (false, true) => {
            return Err(ValidationError::UidGotScalar {
                predicate: predicate(),
            }
            .into())
        }
        (true, false) => {
            return Err(ValidationError::ScalarGotUid {
                predicate: predicate(),
            }
            .into())
        }
        _ => {}
    }
    if schema_type == ValueType::VFloat
        && !matches!(
            storage_type,
            ValueType::VFloat | ValueType::String | ValueType::Default
        )
    {
        return Err(ValidationError::VectorExpected {
            predicate: predicate(),
        }
        .into());
    }

    if storage_type != schema_type && schema_type != ValueType::Default {
        let conversion = |source| MutationError::Conversion {
            predicate: edge.attr.clone(),
            from: storage_type,
            to: schema_type,
            source,
        };
        let src = decode(storage_type, edge.value_bytes()).map_err(conversion)?;
        let dst = convert(&src, schema_type).map_err(conversion)?;
        edge.value = EdgeValue::Bytes(marshal(&dst));
        edge.value_type = schema_type;
    }

    if acl_enabled && edge.attr == PERMISSION_PREDICATE {
        check_permission(edge)?;
    }
    Ok(())
}

fn check_permission(edge: &Edge) -> Result<()> {
    let predicate = edge.attr.clone();
    if edge.value_type != ValueType::Int {
        return Err(ValidationError::PermissionNotInt { predicate }.into());
    }
    let value = decode(ValueType::Int, edge.value_bytes())
        .ok()
        .and_then(|val| val.as_int())
        .ok_or_else(|| ValidationError::PermissionNotInt {
            predicate: predicate.clone(),
        })?;
    if !(0..=7).contains(&value) {
        return Err(ValidationError::PermissionOutOfRange { predicate, value }.into());
    }
    Ok(())
}

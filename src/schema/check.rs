//! Validation of schema and type updates against the live schema.

use super::{is_internal_predicate, Directive, SchemaCtx, SchemaState, SchemaUpdate, TypeUpdate};
use crate::posting::{has_edges, Tokenizer};
use crate::storage::KvStore;
use crate::types::{Result, Ts, ValidationError, ValueType};

/// Tokenizers that make a predicate usable with `@unique`.
const UNIQUE_TOKENIZERS: &[&str] = &["hash", "exact", "int"];

fn has_unique_tokenizer(tokenizers: &[String]) -> bool {
    tokenizers
        .iter()
        .any(|t| UNIQUE_TOKENIZERS.contains(&t.as_str()))
}

/// Checks a proposed schema update.
///
/// `su` may be modified: `@unique` forces `@upsert`. Conversions between list and
/// scalar, or between uid and scalar, are refused while the predicate has data
/// according to [`has_edges`].
pub fn check_schema(state: &SchemaState, store: &dyn KvStore, su: &mut SchemaUpdate) -> Result<()> {
    let predicate = su.predicate.clone();
    if predicate.is_empty() {
        return Err(ValidationError::NoPredicate.into());
    }
    if is_internal_predicate(&predicate) {
        return Err(ValidationError::InternalPredicate { predicate }.into());
    }
    if su.directive == Directive::Index && !su.has_tokenizer_or_vector_spec() {
        return Err(ValidationError::TokenizerRequired { predicate }.into());
    }
    if su.has_tokenizer_or_vector_spec() && su.directive != Directive::Index {
        return Err(ValidationError::IndexDirectiveRequired { predicate }.into());
    }
    match (su.value_type, su.directive) {
        (ValueType::Uid, Directive::Index) => {
            return Err(ValidationError::IndexOnUid { predicate }.into())
        }
        (ty, Directive::Reverse) if ty != ValueType::Uid => {
            return Err(ValidationError::ReverseOnScalar { predicate }.into())
        }
        _ => {}
    }
    if su.upsert && su.tokenizers.is_empty() && !su.unique {
        return Err(ValidationError::UpsertWithoutIndex { predicate }.into());
    }
    if su.unique {
        let prev = state.get(SchemaCtx::Read, &predicate);
        validate_schema_for_unique(prev.as_ref(), su)?;
    }
    for name in &su.tokenizers {
        let Some(tokenizer) = Tokenizer::by_name(name) else {
            return Err(ValidationError::UnknownTokenizer {
                predicate,
                tokenizer: name.clone(),
            }
            .into());
        };
        if !tokenizer.accepts(su.value_type) {
            return Err(ValidationError::TokenizerTypeMismatch {
                predicate,
                tokenizer: name.clone(),
                value_type: su.value_type,
            }
            .into());
        }
    }

    let Ok(current) = state.type_of(&predicate) else {
        // First definition, nothing to convert from.
        return Ok(());
    };
    let proposed = su.value_type;
    if current.is_scalar()
        && (current == ValueType::Password || proposed == ValueType::Password)
    {
        if current != proposed {
            return Err(ValidationError::PasswordTypeChange {
                from: current,
                to: proposed,
            }
            .into());
        }
    } else if current.is_scalar() == proposed.is_scalar() {
        if state.is_list(&predicate) && !su.list && has_edges(store, &predicate, Ts::MAX)? {
            return Err(ValidationError::ListChangeWithData {
                predicate,
                from: current,
                to: proposed,
            }
            .into());
        }
    } else if has_edges(store, &predicate, Ts::MAX)? {
        return Err(ValidationError::ShapeChangeWithData { predicate }.into());
    }
    Ok(())
}

/// Checks the `@unique` rules and forces `@upsert` on `current`.
pub fn validate_schema_for_unique(
    prev: Option<&SchemaUpdate>,
    current: &mut SchemaUpdate,
) -> Result<()> {
    if let Some(prev) = prev {
        if prev.upsert && !current.upsert {
            return Err(ValidationError::UniqueDropsUpsert {
                predicate: current.predicate.clone(),
            }
            .into());
        }
        if prev.unique && !has_unique_tokenizer(&current.tokenizers) {
            return Err(ValidationError::UniqueDropsIndex {
                predicate: current.predicate.clone(),
                tokenizers: prev.tokenizers.clone(),
            }
            .into());
        }
    }
    current.upsert = true;
    let hint = match current.value_type {
        ValueType::String => {
            if has_unique_tokenizer(&current.tokenizers) {
                return Ok(());
            }
            "either hash or exact"
        }
        ValueType::Int => {
            if !current.tokenizers.is_empty() {
                return Ok(());
            }
            "int"
        }
        value_type => return Err(ValidationError::UniqueUnsupportedType { value_type }.into()),
    };
    Err(ValidationError::UniqueIndexMissing {
        predicate: current.predicate.clone(),
        hint,
    }
    .into())
}

/// Checks the shape of a type definition's fields.
pub fn type_sanity_check(tu: &TypeUpdate) -> Result<()> {
    if tu.type_name.is_empty() {
        return Err(ValidationError::TypeNameMissing.into());
    }
    for field in &tu.fields {
        if field.predicate.trim_start_matches('~').is_empty() {
            return Err(ValidationError::FieldNameMissing.into());
        }
        if field.value_type == ValueType::Object
            && field.object_type_name.as_deref().unwrap_or("").is_empty()
        {
            return Err(ValidationError::ObjectTypeNameMissing.into());
        }
        if field.directive != Directive::None {
            return Err(ValidationError::FieldDirective.into());
        }
        if !field.tokenizers.is_empty() {
            return Err(ValidationError::FieldTokenizer.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::EdgeOp;
    use crate::posting::{Posting, Txn};
    use crate::schema::TypeField;
    use crate::storage::{Key, MemStore};
    use crate::types::{MutationError, Uid};

    fn setup() -> (Arc<MemStore>, SchemaState) {
        let store = Arc::new(MemStore::new());
        let state = SchemaState::new(store.clone());
        (store, state)
    }

    fn validation(err: MutationError) -> ValidationError {
        match err {
            MutationError::Validation(inner) => inner,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    fn seed_uid_edge(store: &Arc<MemStore>, attr: &str) -> Result<()> {
        let txn = Txn::new(1, store.clone());
        txn.get_from_delta(&Key::data(attr, Uid(1)))?
            .lock()
            .add(Posting::uid(2, EdgeOp::Set));
        txn.commit_to_store(2)
    }

    #[test]
    fn index_requires_tokenizer() {
        let (store, state) = setup();
        let mut su = SchemaUpdate::new("name", ValueType::String);
        su.directive = Directive::Index;
        let err = check_schema(&state, store.as_ref(), &mut su).unwrap_err();
        assert!(matches!(validation(err), ValidationError::TokenizerRequired { .. }));

        let mut su = SchemaUpdate::new("name", ValueType::String).indexed(&["exact"]);
        assert!(check_schema(&state, store.as_ref(), &mut su).is_ok());
    }

    #[test]
    fn vector_spec_satisfies_index_directive() {
        let (store, state) = setup();
        let mut su = SchemaUpdate::new("embedding", ValueType::VFloat);
        su.directive = Directive::Index;
        su.index_specs.push(crate::schema::VectorIndexSpec {
            name: "hnsw".into(),
            options: vec![("metric".into(), "euclidean".into())],
        });
        assert!(check_schema(&state, store.as_ref(), &mut su).is_ok());
    }

    #[test]
    fn rejects_reserved_and_misplaced_directives() {
        let (store, state) = setup();
        let mut reserved = SchemaUpdate::new("sombra.type", ValueType::String);
        assert!(matches!(
            validation(check_schema(&state, store.as_ref(), &mut reserved).unwrap_err()),
            ValidationError::InternalPredicate { .. }
        ));

        let mut uid_index = SchemaUpdate::new("friend", ValueType::Uid).indexed(&["exact"]);
        assert!(matches!(
            validation(check_schema(&state, store.as_ref(), &mut uid_index).unwrap_err()),
            ValidationError::IndexOnUid { .. }
        ));

        let mut scalar_reverse = SchemaUpdate::new("name", ValueType::String).reversed();
        assert!(matches!(
            validation(check_schema(&state, store.as_ref(), &mut scalar_reverse).unwrap_err()),
            ValidationError::ReverseOnScalar { .. }
        ));

        let mut bad_tok = SchemaUpdate::new("age", ValueType::Int).indexed(&["term"]);
        assert!(matches!(
            validation(check_schema(&state, store.as_ref(), &mut bad_tok).unwrap_err()),
            ValidationError::TokenizerTypeMismatch { .. }
        ));
    }

    #[test]
    fn uid_scalar_flip_rejected_with_data() -> Result<()> {
        let (store, state) = setup();
        state.set(SchemaUpdate::new("friend", ValueType::Uid).list());
        let mut flip = SchemaUpdate::new("friend", ValueType::String).list();
        assert!(check_schema(&state, store.as_ref(), &mut flip).is_ok());

        seed_uid_edge(&store, "friend")?;
        let mut flip = SchemaUpdate::new("friend", ValueType::String).list().counted();
        assert!(matches!(
            validation(check_schema(&state, store.as_ref(), &mut flip).unwrap_err()),
            ValidationError::ShapeChangeWithData { .. }
        ));
        Ok(())
    }

    #[test]
    fn list_to_scalar_rejected_with_data() -> Result<()> {
        let (store, state) = setup();
        state.set(SchemaUpdate::new("friend", ValueType::Uid).list());
        seed_uid_edge(&store, "friend")?;
        let mut single = SchemaUpdate::new("friend", ValueType::Uid);
        assert!(matches!(
            validation(check_schema(&state, store.as_ref(), &mut single).unwrap_err()),
            ValidationError::ListChangeWithData { .. }
        ));
        Ok(())
    }

    #[test]
    fn password_type_is_frozen() {
        let (store, state) = setup();
        state.set(SchemaUpdate::new("secret", ValueType::Password));
        let mut change = SchemaUpdate::new("secret", ValueType::String);
        assert!(matches!(
            validation(check_schema(&state, store.as_ref(), &mut change).unwrap_err()),
            ValidationError::PasswordTypeChange { .. }
        ));
    }

    #[test]
    fn unique_forces_upsert_and_needs_tokenizer() {
        let mut su = SchemaUpdate::new("email", ValueType::String).indexed(&["hash"]).unique();
        validate_schema_for_unique(None, &mut su).expect("hash satisfies unique");
        assert!(su.upsert);

        let mut term_only = SchemaUpdate::new("email", ValueType::String).indexed(&["term"]).unique();
        let err = validation(validate_schema_for_unique(None, &mut term_only).unwrap_err());
        assert!(matches!(err, ValidationError::UniqueIndexMissing { hint: "either hash or exact", .. }));

        let mut float = SchemaUpdate::new("score", ValueType::Float).indexed(&["float"]).unique();
        assert!(matches!(
            validation(validate_schema_for_unique(None, &mut float).unwrap_err()),
            ValidationError::UniqueUnsupportedType { value_type: ValueType::Float }
        ));
    }

    #[test]
    fn unique_cannot_drop_upsert_or_index() {
        let prev = SchemaUpdate::new("email", ValueType::String)
            .indexed(&["exact"])
            .unique()
            .upsert();
        let mut no_upsert = SchemaUpdate::new("email", ValueType::String).indexed(&["exact"]).unique();
        assert!(matches!(
            validation(validate_schema_for_unique(Some(&prev), &mut no_upsert).unwrap_err()),
            ValidationError::UniqueDropsUpsert { .. }
        ));

        let mut no_index = SchemaUpdate::new("email", ValueType::String).indexed(&["term"]).unique().upsert();
        assert!(matches!(
            validation(validate_schema_for_unique(Some(&prev), &mut no_index).unwrap_err()),
            ValidationError::UniqueDropsIndex { .. }
        ));
    }

    #[test]
    fn type_fields_are_sanity_checked() {
        assert!(type_sanity_check(&TypeUpdate::new("Person", &["name", "~friend"])).is_ok());

        let mut unnamed = TypeUpdate::new("Person", &["name"]);
        unnamed.fields.push(TypeField::new("~"));
        assert!(type_sanity_check(&unnamed).is_err());

        let mut object = TypeUpdate::new("Person", &[]);
        let mut field = TypeField::new("address");
        field.value_type = ValueType::Object;
        object.fields.push(field);
        assert!(matches!(
            validation(type_sanity_check(&object).unwrap_err()),
            ValidationError::ObjectTypeNameMissing
        ));

        let mut indexed = TypeUpdate::new("Person", &[]);
        let mut field = TypeField::new("name");
        field.tokenizers.push("exact".into());
        indexed.fields.push(field);
        assert!(matches!(
            validation(type_sanity_check(&indexed).unwrap_err()),
            ValidationError::FieldTokenizer
        ));
    }
}

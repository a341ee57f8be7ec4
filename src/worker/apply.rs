use rustc_hash::FxHashMap;
use tracing::{debug, info};

use super::validate::validate_and_convert;
use super::Worker;
use crate::model::{DropOp, Edge, EdgeOp, Mutations};
use crate::posting::{add_mutation_with_index, Txn};
use crate::schema::{check_schema, initial_schema, SchemaCtx, SchemaUpdate};
use crate::storage::{Key, KeyPrefix};
use crate::types::{MutationError, Result, Ts, ValidationError, ValueType};

impl Worker {
    /// Validates `edge` against the write schema, converts its value, and applies it
    /// to the transaction's posting lists together with index maintenance.
    pub fn run_mutation(&self, edge: &mut Edge, txn: &Txn) -> Result<()> {
        let su = match self.schema.get(SchemaCtx::Write, &edge.attr) {
            Some(su) => su,
            None if edge.op == EdgeOp::Del => SchemaUpdate::new(edge.attr.clone(), ValueType::Default),
            None => {
                return Err(ValidationError::MissingSchema {
                    predicate: edge.attr.clone(),
                }
                .into())
            }
        };
        if edge.is_delete_predicate() {
            return Err(MutationError::Invariant(
                "predicate deletion must not reach the edge applier",
            ));
        }
        validate_and_convert(edge, &su, self.opts.acl_enabled)?;

        let key = Key::data(edge.attr.clone(), edge.entity);
        let list = if edge.lang.is_none() && !su.list {
            txn.get_scalar_list(&key)?
        } else if edge.lang.is_some() || su.count || edge.op == EdgeOp::Del {
            txn.get(&key)?
        } else {
            txn.get_from_delta(&key)?
        };
        let latency = txn.last_read_latency();
        if latency > self.opts.slow_read_threshold {
            debug!(key = %key, ?latency, "worker.mutation.slow_read");
        }
        add_mutation_with_index(txn, &list, edge, &su)
    }

    /// Applies a proposal that consensus committed to the log.
    ///
    /// Drop operations go first, then type and schema changes, then edges. An edge
    /// for a predicate without a schema installs one derived from the edge.
    pub async fn apply_proposal(&self, m: Mutations) -> Result<()> {
        if m.start_ts == 0 {
            return Err(MutationError::Invariant("proposal without start timestamp"));
        }
        self.metrics.proposal_applied();
        self.validate_batch(&m)?;
        let start_ts = m.start_ts;

        if let Some(op) = &m.drop_op {
            self.apply_drop(op, start_ts)?;
        }
        for tu in &m.types {
            self.run_type_mutation(tu, start_ts)?;
        }
        if !m.schema.is_empty() {
            self.run_schema_mutation(m.schema, start_ts).await?;
        }
        if m.edges.is_empty() {
            return Ok(());
        }

        let txn = self.oracle.register_start_ts(start_ts);
        for mut edge in m.edges {
            if edge.is_delete_predicate() {
                self.delete_predicate(&edge.attr, start_ts)?;
                continue;
            }
            if self.schema.get(SchemaCtx::Write, &edge.attr).is_none() {
                self.create_schema(&edge.attr, edge.storage_type(), start_ts)?;
            }
            self.run_mutation(&mut edge, &txn)?;
        }
        Ok(())
    }

    /// Checks every schema update and edge of `m` without touching storage.
    ///
    /// Edges are checked against the schema the batch itself installs, then the
    /// live write schema, then the schema a first edge would create.
    pub(crate) fn validate_batch(&self, m: &Mutations) -> Result<()> {
        let mut batch_schema: FxHashMap<&str, SchemaUpdate> = FxHashMap::default();
        for su in &m.schema {
            let mut checked = su.clone();
            check_schema(&self.schema, self.store.as_ref(), &mut checked)?;
            batch_schema.insert(su.predicate.as_str(), checked);
        }
        for edge in &m.edges {
            if edge.is_delete_predicate() {
                continue;
            }
            let su = match batch_schema.get(edge.attr.as_str()) {
                Some(su) => su.clone(),
                None => match self.schema.get(SchemaCtx::Write, &edge.attr) {
                    Some(su) => su,
                    None if edge.op == EdgeOp::Del => {
                        SchemaUpdate::new(edge.attr.clone(), ValueType::Default)
                    }
                    None => SchemaUpdate::new(edge.attr.clone(), edge.storage_type()),
                },
            };
            validate_and_convert(&mut edge.clone(), &su, self.opts.acl_enabled)?;
        }
        Ok(())
    }

    /// Removes every data, index, reverse, and count key of `attr` and its schema.
    pub(crate) fn delete_predicate(&self, attr: &str, ts: Ts) -> Result<()> {
        self.store.drop_prefix(&KeyPrefix::Predicate(attr.to_owned()))?;
        self.schema.delete(attr);
        info!(predicate = attr, ts, "worker.predicate.deleted");
        Ok(())
    }

    fn apply_drop(&self, op: &DropOp, ts: Ts) -> Result<()> {
        match op {
            DropOp::All => {
                self.store.drop_prefix(&KeyPrefix::All)?;
                self.schema.delete_all();
                for su in initial_schema(self.opts.acl_enabled) {
                    self.schema.set(su);
                }
            }
            DropOp::Data => self.store.drop_prefix(&KeyPrefix::AllData)?,
            DropOp::Attr(attr) => self.delete_predicate(attr, ts)?,
            DropOp::Type(name) => self.schema.remove_type(name, ts)?,
        }
        info!(?op, ts, "worker.drop.applied");
        Ok(())
    }
}

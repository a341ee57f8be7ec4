use tracing::debug;

use super::Worker;
use crate::cluster::Context;
use crate::model::TxnContext;
use crate::types::{MutationError, Result, Ts};

impl Worker {
    /// Asks the cluster coordinator to commit `tc` and returns the commit timestamp.
    ///
    /// A context with `aborted` set is a client discard: it is forwarded so the
    /// coordinator releases the transaction, and reported as [`MutationError::Aborted`].
    pub async fn commit_over_network(&self, ctx: &Context, mut tc: TxnContext) -> Result<Ts> {
        let client_discard = tc.aborted;
        if client_discard {
            self.metrics.commit_outcome("discarded");
        }
        let zero = self.membership.zero().ok_or(MutationError::NoConnection)?;
        tc.dedup();

        let reply = zero.commit_or_abort(ctx, tc).await?;
        if reply.aborted || reply.commit_ts == 0 {
            if !client_discard {
                self.metrics.commit_outcome("aborted");
            }
            debug!(start_ts = reply.start_ts, client_discard, "worker.commit.aborted");
            return Err(MutationError::Aborted);
        }
        self.metrics.commit_outcome("committed");
        Ok(reply.commit_ts)
    }
}

use std::sync::Arc;

use simplebank_core::{Context, Database, RecordStore, StoreError, Transaction};

/// Runs units of work inside a database transaction.
pub struct TransactionExecutor<D: Database> {
    db: Arc<D>,
}

impl<D: Database> Clone for TransactionExecutor<D> {
    fn clone(&self) -> Self {
        Self { db: self.db.clone() }
    }
}

impl<D: Database> TransactionExecutor<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    /// Begins a transaction, hands its record store to `unit_of_work`, and
    /// commits if it succeeds. On failure the transaction is rolled back and
    /// the original error returned; a failed rollback is reported alongside it.
    pub fn run_in_transaction<T, F>(&self, ctx: &Context, unit_of_work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn RecordStore) -> Result<T, StoreError>,
    {
        ctx.err()?;
        let mut tx = self.db.begin_transaction(ctx)?;
        let tx_id = tx.id();

        let outcome = unit_of_work(&mut tx).and_then(|value| {
            ctx.err()?;
            Ok(value)
        });

        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => match tx.rollback() {
                Ok(()) => {
                    tracing::debug!(tx_id, error = %err, "Unit of work failed, rolled back");
                    Err(err)
                }
                Err(rb_err) => {
                    tracing::warn!(tx_id, error = %err, rollback_error = %rb_err, "Rollback failed");
                    Err(StoreError::Rollback {
                        source: Box::new(err),
                        rollback: Box::new(rb_err),
                    })
                }
            },
        }
    }
}

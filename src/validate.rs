//! Startup validation of destinations against the store.
//!
//! Each destination is probed by opening a transaction, preparing its bulk
//! statement and rolling back. No rows are written. The first destination that
//! fails aborts startup with [`Error::Probe`].

use crate::error::{Error, Result};
use crate::store::BulkStore;
use crate::types::Destination;

/// Probes every destination in order.
pub(crate) fn validate<'a, I>(store: &dyn BulkStore, destinations: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Destination>,
{
    for destination in destinations {
        probe(store, destination).map_err(|source| Error::Probe {
            destination: destination.name().to_string(),
            source: Box::new(source),
        })?;

        tracing::debug!(destination = %destination.name(), "destination validated");
    }
    Ok(())
}

fn probe(store: &dyn BulkStore, destination: &Destination) -> Result<()> {
    let mut tx = store.begin().map_err(Error::Connection)?;

    let prepared = tx.prepare(destination.name(), destination.columns());
    let rolled_back = tx.rollback();

    prepared.map_err(|source| Error::Statement {
        destination: destination.name().to_string(),
        source,
    })?;
    rolled_back
        .map_err(|source| Error::Connection(format!("rollback failed: {source}").into()))?;
    Ok(())
}

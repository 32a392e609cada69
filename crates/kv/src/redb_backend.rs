//! Durable kv backend on redb
//!
//! One table holds every prefixed row. Each batch commit is one redb write
//! transaction, which gives the atomic, durable multi-key commit the store
//! relies on; redb fsyncs on commit by default.

use crate::{full_key, Batch, BatchOp, KvEngine, Prefix};
use fragstore_core::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::io;
use std::path::Path;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("fragstore");

fn backend_err<E: Into<redb::Error>>(e: E) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("redb: {}", e.into()),
    ))
}

/// redb-backed engine; the database is a single file under `db/`
pub struct RedbEngine {
    db: Database,
}

impl RedbEngine {
    /// Open or create the database file and ensure the table exists.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(backend_err)?;
        let txn = db.begin_write().map_err(backend_err)?;
        txn.open_table(TABLE).map_err(backend_err)?;
        txn.commit().map_err(backend_err)?;
        Ok(Self { db })
    }
}

impl KvEngine for RedbEngine {
    fn get(&self, prefix: Prefix, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(TABLE).map_err(backend_err)?;
        let row = table
            .get(full_key(prefix, key).as_slice())
            .map_err(backend_err)?;
        Ok(row.map(|guard| guard.value().to_vec()))
    }

    fn scan(
        &self,
        prefix: Prefix,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let lo = full_key(prefix, start);
        let hi = match end {
            Some(end) => full_key(prefix, end),
            None => vec![prefix.byte() + 1],
        };
        if hi <= lo {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(TABLE).map_err(backend_err)?;
        let mut out = Vec::new();
        let range = table
            .range::<&[u8]>(lo.as_slice()..hi.as_slice())
            .map_err(backend_err)?;
        for row in range {
            let (k, v) = row.map_err(backend_err)?;
            out.push((k.value()[1..].to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        let txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut table = txn.open_table(TABLE).map_err(backend_err)?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Set { prefix, key, value } => {
                        table
                            .insert(full_key(prefix, &key).as_slice(), value.as_slice())
                            .map_err(backend_err)?;
                    }
                    BatchOp::Remove { prefix, key } => {
                        table
                            .remove(full_key(prefix, &key).as_slice())
                            .map_err(backend_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(backend_err)?;
        Ok(())
    }
}

//! Monotonic counters
//!
//! Each counter lives at `(column family, key)` and holds an `i64`, big-endian.

use crate::codec;
use crate::db::{ColumnFamily, StateDb};
use crate::error::Result;
use std::sync::Arc;

/// Read-increment-write counters
///
/// There is no compare-and-swap: callers must serialize every call for the
/// same counter. The partition's single processing thread does this.
pub struct NextValueManager {
    db: Arc<dyn StateDb>,
}

impl NextValueManager {
    pub fn new(db: Arc<dyn StateDb>) -> Self {
        Self { db }
    }

    /// Increment the counter and return the new value (1 on first use)
    pub fn get_next_value(&self, cf: ColumnFamily, key: &[u8]) -> Result<i64> {
        let next = self.get_current_value(cf, key)? + 1;
        self.db.put(cf, key, &next.to_be_bytes())?;
        Ok(next)
    }

    /// Current value without incrementing; 0 if never used
    pub fn get_current_value(&self, cf: ColumnFamily, key: &[u8]) -> Result<i64> {
        match self.db.get(cf, key)? {
            Some(bytes) => Ok(codec::decode_i64(&bytes)?),
            None => Ok(0),
        }
    }
}

//! Timer state
//!
//! Timers are indexed twice: by the element instance that owns them, and by
//! `(due date, owner)` so due timers can be found with one ascending scan.
//! Both entries are always written and removed in the same batch.
//!
//! # Schema
//!
//! - `TimerInstances`: `owner key` -> [`TimerInstance`]
//! - `TimerDueDates`: `(due date, owner key)` -> nil

use crate::codec::{self, BufferReader, BufferWriter, DecodeError, EncodeError};
use crate::db::key::read_i64_key;
use crate::db::{ColumnFamily, DbKey, StateDb, WriteBatch};
use crate::error::Result;
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use slog::{debug, Logger};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TimerInstance {
    pub key: i64,
    /// Owner of the timer
    pub element_instance_key: i64,
    pub workflow_instance_key: i64,
    pub workflow_key: i64,
    /// Element to activate when the timer fires
    pub handler_node_id: String,
    /// Epoch milliseconds
    pub due_date: i64,
    pub repetitions: i32,
}

impl BufferWriter for TimerInstance {
    fn encoded_len(&self) -> usize {
        1 + 8 + 8 + 8 + 8 + codec::blob_len(self.handler_node_id.as_bytes()) + 8 + 4
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codec::LAYOUT_VERSION);
        buf.put_i64(self.key);
        buf.put_i64(self.element_instance_key);
        buf.put_i64(self.workflow_instance_key);
        buf.put_i64(self.workflow_key);
        codec::put_string(buf, &self.handler_node_id)?;
        buf.put_i64(self.due_date);
        buf.put_i32(self.repetitions);
        Ok(())
    }
}

impl BufferReader for TimerInstance {
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        codec::read_version(buf)?;
        Ok(Self {
            key: codec::read_i64(buf)?,
            element_instance_key: codec::read_i64(buf)?,
            workflow_instance_key: codec::read_i64(buf)?,
            workflow_key: codec::read_i64(buf)?,
            handler_node_id: codec::read_string(buf)?,
            due_date: codec::read_i64(buf)?,
            repetitions: codec::read_i32(buf)?,
        })
    }
}

pub struct TimerInstanceState {
    db: Arc<dyn StateDb>,
    logger: Logger,
}

impl TimerInstanceState {
    pub fn new(db: Arc<dyn StateDb>, logger: Logger) -> Self {
        Self { db, logger }
    }

    /// Store a timer under its owner and its due date
    ///
    /// A timer already held by the same owner is replaced, including its
    /// due-date entry.
    pub fn put(&self, timer: &TimerInstance) -> Result<()> {
        let owner = timer.element_instance_key;
        let mut batch = WriteBatch::new();
        if let Some(previous) = self.get(owner)? {
            if previous.due_date != timer.due_date {
                batch.delete(
                    ColumnFamily::TimerDueDates,
                    (previous.due_date, owner).to_key_bytes()?,
                );
            }
        }
        batch.put(
            ColumnFamily::TimerInstances,
            owner.to_key_bytes()?,
            timer.to_bytes()?.to_vec(),
        );
        batch.put(
            ColumnFamily::TimerDueDates,
            (timer.due_date, owner).to_key_bytes()?,
            Vec::new(),
        );
        self.db.write_batch(batch)
    }

    pub fn remove(&self, timer: &TimerInstance) -> Result<()> {
        let owner = timer.element_instance_key;
        let mut batch = WriteBatch::new();
        batch.delete(ColumnFamily::TimerInstances, owner.to_key_bytes()?);
        batch.delete(
            ColumnFamily::TimerDueDates,
            (timer.due_date, owner).to_key_bytes()?,
        );
        self.db.write_batch(batch)
    }

    pub fn get(&self, element_instance_key: i64) -> Result<Option<TimerInstance>> {
        match self
            .db
            .get(ColumnFamily::TimerInstances, &element_instance_key.to_key_bytes()?)?
        {
            Some(bytes) => Ok(Some(TimerInstance::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Visit timers due at or before `timestamp`, earliest first
    ///
    /// Stops at the first timer due later, or when `consumer` returns false.
    /// Returns the due date of the entry the scan stopped at, which is when
    /// the caller should look again; `None` if every timer was consumed.
    pub fn find_timers_with_due_date_before<F>(&self, timestamp: i64, mut consumer: F) -> Result<Option<i64>>
    where
        F: FnMut(&TimerInstance) -> bool,
    {
        let mut next_due_date = None;
        self.db.scan(ColumnFamily::TimerDueDates, &mut |k, _| {
            let mut buf = k;
            let due_date = read_i64_key(&mut buf)?;
            let owner = read_i64_key(&mut buf)?;

            if due_date > timestamp {
                debug!(self.logger, "Timer scan reached a future due date";
                    "timestamp" => timestamp,
                    "due_date" => due_date
                );
                next_due_date = Some(due_date);
                return Ok(false);
            }

            let timer = match self.get(owner)? {
                Some(timer) => timer,
                None => {
                    debug!(self.logger, "Due date without timer"; "owner" => owner, "due_date" => due_date);
                    return Ok(true);
                }
            };
            if !consumer(&timer) {
                debug!(self.logger, "Timer scan stopped by consumer"; "owner" => owner);
                next_due_date = Some(due_date);
                return Ok(false);
            }
            Ok(true)
        })?;
        Ok(next_due_date)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.db.is_empty(ColumnFamily::TimerInstances)?
            && self.db.is_empty(ColumnFamily::TimerDueDates)?)
    }

    /// Owners indexed in the timer keyspace, ascending
    pub fn owner_keys(&self) -> Result<Vec<i64>> {
        let mut owners = Vec::new();
        self.db.scan(ColumnFamily::TimerInstances, &mut |k, _| {
            owners.push(read_i64_key(&mut &k[..])?);
            Ok(true)
        })?;
        Ok(owners)
    }

    /// Owners indexed in the due-date keyspace, in due-date order
    pub fn due_date_owner_keys(&self) -> Result<Vec<i64>> {
        let mut owners = Vec::new();
        self.db.scan(ColumnFamily::TimerDueDates, &mut |k, _| {
            let mut buf = k;
            read_i64_key(&mut buf)?;
            owners.push(read_i64_key(&mut buf)?);
            Ok(true)
        })?;
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::logging::test_logger;

    fn create_state() -> TimerInstanceState {
        TimerInstanceState::new(Arc::new(MemoryDb::new()), test_logger())
    }

    fn timer(owner: i64, due_date: i64) -> TimerInstance {
        TimerInstance {
            key: owner + 1000,
            element_instance_key: owner,
            workflow_instance_key: 1,
            workflow_key: 2,
            handler_node_id: "timer".to_string(),
            due_date,
            repetitions: 1,
        }
    }

    #[test]
    fn test_due_timers_in_order_with_hint() {
        let state = create_state();
        state.put(&timer(1, 300)).unwrap();
        state.put(&timer(2, 100)).unwrap();
        state.put(&timer(3, 200)).unwrap();

        let mut fired = Vec::new();
        let hint = state
            .find_timers_with_due_date_before(250, |t| {
                fired.push(t.element_instance_key);
                true
            })
            .unwrap();

        assert_eq!(fired, vec![2, 3]);
        assert_eq!(hint, Some(300));
    }

    #[test]
    fn test_all_due_returns_no_hint() {
        let state = create_state();
        state.put(&timer(1, 10)).unwrap();

        let hint = state.find_timers_with_due_date_before(10, |_| true).unwrap();
        assert_eq!(hint, None);
    }

    #[test]
    fn test_consumer_can_stop_the_scan() {
        let state = create_state();
        state.put(&timer(1, 10)).unwrap();
        state.put(&timer(2, 20)).unwrap();

        let mut fired = Vec::new();
        let hint = state
            .find_timers_with_due_date_before(100, |t| {
                fired.push(t.element_instance_key);
                false
            })
            .unwrap();

        assert_eq!(fired, vec![1]);
        assert_eq!(hint, Some(10));
    }

    #[test]
    fn test_negative_due_dates_sort_first() {
        let state = create_state();
        state.put(&timer(1, 5)).unwrap();
        state.put(&timer(2, -5)).unwrap();

        assert_eq!(state.due_date_owner_keys().unwrap(), vec![2, 1]);
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let state = create_state();
        let t = timer(1, 10);
        state.put(&t).unwrap();
        assert_eq!(state.get(1).unwrap(), Some(t.clone()));

        state.remove(&t).unwrap();
        assert!(state.get(1).unwrap().is_none());
        assert!(state.is_empty().unwrap());
    }

    #[test]
    fn test_replacing_a_timer_moves_its_due_date() {
        let state = create_state();
        state.put(&timer(1, 10)).unwrap();
        state.put(&timer(1, 50)).unwrap();

        assert_eq!(state.owner_keys().unwrap(), vec![1]);
        assert_eq!(state.due_date_owner_keys().unwrap(), vec![1]);
        assert_eq!(state.find_timers_with_due_date_before(20, |_| true).unwrap(), Some(50));
    }
}

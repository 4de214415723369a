//! Event scope state
//!
//! An event scope is an element that can be interrupted or notified by events
//! (boundary events, event sub-processes, event-based gateways). Each scope
//! has an accept flag and a FIFO queue of triggers ordered by record position.
//!
//! ```text
//! create_instance -> accepting
//!   accepting --trigger (interrupting)--> closed
//!   accepting --trigger (non-interrupting)--> accepting
//!   any --delete_instance--> gone (with all pending triggers)
//! ```
//!
//! # Schema
//!
//! - `EventScope`: `scope key` -> [`EventScopeInstance`]
//! - `EventTrigger`: `(scope key, position)` -> [`EventTrigger`]

use crate::codec::{self, BufferReader, BufferWriter, DecodeError, EncodeError};
use crate::db::key::read_i64_key;
use crate::db::{ColumnFamily, DbKey, StateDb, WriteBatch};
use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use slog::{debug, Logger};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventScopeInstance {
    pub accepting: bool,
    pub interrupting: bool,
}

impl BufferWriter for EventScopeInstance {
    fn encoded_len(&self) -> usize {
        3
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codec::LAYOUT_VERSION);
        buf.put_u8(self.accepting as u8);
        buf.put_u8(self.interrupting as u8);
        Ok(())
    }
}

impl BufferReader for EventScopeInstance {
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        codec::read_version(buf)?;
        Ok(Self {
            accepting: codec::read_bool(buf)?,
            interrupting: codec::read_bool(buf)?,
        })
    }
}

/// A pending event for a scope
///
/// The position is part of the key and is not repeated in the stored value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventTrigger {
    pub position: i64,
    pub element_id: String,
    pub payload: Bytes,
}

impl EventTrigger {
    fn decode(position: i64, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = bytes;
        codec::read_version(&mut buf)?;
        let element_id = codec::read_string(&mut buf)?;
        let payload = codec::read_blob(&mut buf)?;
        if !buf.is_empty() {
            return Err(DecodeError::TrailingBytes(buf.len()));
        }
        Ok(Self {
            position,
            element_id,
            payload,
        })
    }
}

impl BufferWriter for EventTrigger {
    fn encoded_len(&self) -> usize {
        1 + codec::blob_len(self.element_id.as_bytes()) + codec::blob_len(&self.payload)
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codec::LAYOUT_VERSION);
        codec::put_string(buf, &self.element_id)?;
        codec::put_blob(buf, &self.payload)?;
        Ok(())
    }
}

pub struct EventScopeInstanceState {
    db: Arc<dyn StateDb>,
    logger: Logger,
}

impl EventScopeInstanceState {
    pub fn new(db: Arc<dyn StateDb>, logger: Logger) -> Self {
        Self { db, logger }
    }

    /// Open a scope for triggers
    pub fn create_instance(&self, scope_key: i64, interrupting: bool) -> Result<()> {
        let instance = EventScopeInstance {
            accepting: true,
            interrupting,
        };
        self.db.put(
            ColumnFamily::EventScope,
            &scope_key.to_key_bytes()?,
            &instance.to_bytes()?,
        )
    }

    pub fn get_instance(&self, scope_key: i64) -> Result<Option<EventScopeInstance>> {
        match self.db.get(ColumnFamily::EventScope, &scope_key.to_key_bytes()?)? {
            Some(bytes) => Ok(Some(EventScopeInstance::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stop accepting triggers without dropping the ones already queued
    pub fn shutdown_instance(&self, scope_key: i64) -> Result<()> {
        if let Some(mut instance) = self.get_instance(scope_key)? {
            instance.accepting = false;
            self.db.put(
                ColumnFamily::EventScope,
                &scope_key.to_key_bytes()?,
                &instance.to_bytes()?,
            )?;
        }
        Ok(())
    }

    /// Queue a trigger for a scope
    ///
    /// Returns false if the scope does not exist or no longer accepts
    /// triggers. An interrupting scope closes after its first trigger.
    pub fn trigger_event(
        &self,
        scope_key: i64,
        position: i64,
        element_id: &str,
        payload: &[u8],
    ) -> Result<bool> {
        let mut instance = match self.get_instance(scope_key)? {
            Some(instance) if instance.accepting => instance,
            _ => {
                debug!(self.logger, "Event trigger rejected";
                    "scope_key" => scope_key,
                    "position" => position
                );
                return Ok(false);
            }
        };

        let trigger = EventTrigger {
            position,
            element_id: element_id.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };

        let mut batch = WriteBatch::new();
        batch.put(
            ColumnFamily::EventTrigger,
            (scope_key, position).to_key_bytes()?,
            trigger.to_bytes()?.to_vec(),
        );
        if instance.interrupting {
            instance.accepting = false;
            batch.put(
                ColumnFamily::EventScope,
                scope_key.to_key_bytes()?,
                instance.to_bytes()?.to_vec(),
            );
        }
        self.db.write_batch(batch)?;
        Ok(true)
    }

    /// Trigger with the smallest position, left in the queue
    pub fn peek_event_trigger(&self, scope_key: i64) -> Result<Option<EventTrigger>> {
        let mut head = None;
        self.db
            .scan_prefix(ColumnFamily::EventTrigger, &scope_key.to_key_bytes()?, &mut |k, v| {
                let mut buf = k;
                read_i64_key(&mut buf)?;
                let position = read_i64_key(&mut buf)?;
                head = Some(EventTrigger::decode(position, v)?);
                Ok(false)
            })?;
        Ok(head)
    }

    /// Trigger with the smallest position, removed from the queue
    pub fn poll_event_trigger(&self, scope_key: i64) -> Result<Option<EventTrigger>> {
        let head = self.peek_event_trigger(scope_key)?;
        if let Some(trigger) = &head {
            self.delete_trigger(scope_key, trigger.position)?;
        }
        Ok(head)
    }

    pub fn delete_trigger(&self, scope_key: i64, position: i64) -> Result<()> {
        self.db
            .delete(ColumnFamily::EventTrigger, &(scope_key, position).to_key_bytes()?)
    }

    /// Remove the scope and every trigger queued for it
    pub fn delete_instance(&self, scope_key: i64) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(ColumnFamily::EventScope, scope_key.to_key_bytes()?);
        self.db
            .scan_prefix(ColumnFamily::EventTrigger, &scope_key.to_key_bytes()?, &mut |k, _| {
                batch.delete(ColumnFamily::EventTrigger, k.to_vec());
                Ok(true)
            })?;
        self.db.write_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::logging::test_logger;

    fn create_state() -> EventScopeInstanceState {
        EventScopeInstanceState::new(Arc::new(MemoryDb::new()), test_logger())
    }

    #[test]
    fn test_triggers_are_polled_in_position_order() {
        let state = create_state();
        state.create_instance(1, false).unwrap();

        for position in [5, 2, 9] {
            assert!(state
                .trigger_event(1, position, &format!("event-{}", position), b"")
                .unwrap());
        }

        let polled: Vec<i64> = (0..3)
            .map(|_| state.poll_event_trigger(1).unwrap().unwrap().position)
            .collect();
        assert_eq!(polled, vec![2, 5, 9]);
        assert!(state.poll_event_trigger(1).unwrap().is_none());
    }

    #[test]
    fn test_interrupting_scope_accepts_one_trigger() {
        let state = create_state();
        state.create_instance(1, true).unwrap();

        assert!(state.trigger_event(1, 1, "timer", b"").unwrap());
        assert!(!state.trigger_event(1, 2, "message", b"").unwrap());
        assert!(!state.get_instance(1).unwrap().unwrap().accepting);

        let head = state.peek_event_trigger(1).unwrap().unwrap();
        assert_eq!(head.element_id, "timer");
    }

    #[test]
    fn test_trigger_on_missing_scope_rejected() {
        let state = create_state();
        assert!(!state.trigger_event(7, 1, "timer", b"").unwrap());
        assert!(state.peek_event_trigger(7).unwrap().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let state = create_state();
        state.create_instance(1, false).unwrap();
        state.trigger_event(1, 3, "msg", b"\x80").unwrap();

        assert_eq!(state.peek_event_trigger(1).unwrap().unwrap().position, 3);
        let polled = state.poll_event_trigger(1).unwrap().unwrap();
        assert_eq!(polled.payload.as_ref(), b"\x80");
    }

    #[test]
    fn test_delete_instance_drops_triggers_of_that_scope_only() {
        let state = create_state();
        state.create_instance(1, false).unwrap();
        state.create_instance(2, false).unwrap();
        state.trigger_event(1, 1, "a", b"").unwrap();
        state.trigger_event(1, 2, "b", b"").unwrap();
        state.trigger_event(2, 3, "c", b"").unwrap();

        state.delete_instance(1).unwrap();

        assert!(state.get_instance(1).unwrap().is_none());
        assert!(state.peek_event_trigger(1).unwrap().is_none());
        assert_eq!(state.peek_event_trigger(2).unwrap().unwrap().position, 3);
    }

    #[test]
    fn test_delete_single_trigger() {
        let state = create_state();
        state.create_instance(1, false).unwrap();
        state.trigger_event(1, 1, "a", b"").unwrap();
        state.trigger_event(1, 2, "b", b"").unwrap();

        state.delete_trigger(1, 1).unwrap();
        assert_eq!(state.peek_event_trigger(1).unwrap().unwrap().position, 2);
    }

    #[test]
    fn test_shutdown_keeps_queued_triggers() {
        let state = create_state();
        state.create_instance(1, false).unwrap();
        state.trigger_event(1, 1, "a", b"").unwrap();

        state.shutdown_instance(1).unwrap();

        assert!(!state.trigger_event(1, 2, "b", b"").unwrap());
        assert_eq!(state.poll_event_trigger(1).unwrap().unwrap().position, 1);
    }
}

//! Element instance records
//!
//! - [`ElementInstance`]: one per instantiated element (a scope), with its
//!   child and token counters and a snapshot of the last event payload
//! - [`IndexedRecord`]: an event (key, intent, payload) parked against a scope
//! - [`StoredRecord`]: an [`IndexedRecord`] tagged with the [`Purpose`] it is
//!   held for

use crate::codec::{self, BufferReader, BufferWriter, DecodeError, EncodeError};
use crate::engine::intent::WorkflowInstanceIntent;
use crate::record::{WorkflowInstanceRecord, NO_SCOPE};
use bytes::{BufMut, BytesMut};

/// Sentinel for "no key" fields
pub const NO_KEY: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementInstance {
    key: i64,
    parent_key: i64,
    state: WorkflowInstanceIntent,
    child_count: i32,
    active_tokens: i32,
    job_key: i64,
    attached_to_key: i64,
    value: WorkflowInstanceRecord,
}

impl ElementInstance {
    pub(crate) fn new(
        key: i64,
        parent_key: Option<i64>,
        state: WorkflowInstanceIntent,
        value: WorkflowInstanceRecord,
    ) -> Self {
        Self {
            key,
            parent_key: parent_key.unwrap_or(NO_SCOPE),
            state,
            child_count: 0,
            active_tokens: 0,
            job_key: NO_KEY,
            attached_to_key: NO_KEY,
            value,
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn parent_key(&self) -> i64 {
        self.parent_key
    }

    pub fn is_root(&self) -> bool {
        self.parent_key < 0
    }

    pub fn state(&self) -> WorkflowInstanceIntent {
        self.state
    }

    pub fn set_state(&mut self, state: WorkflowInstanceIntent) {
        self.state = state;
    }

    pub fn value(&self) -> &WorkflowInstanceRecord {
        &self.value
    }

    pub fn set_value(&mut self, value: WorkflowInstanceRecord) {
        self.value = value;
    }

    pub fn child_count(&self) -> i32 {
        self.child_count
    }

    pub fn active_tokens(&self) -> i32 {
        self.active_tokens
    }

    pub fn job_key(&self) -> i64 {
        self.job_key
    }

    pub fn set_job_key(&mut self, job_key: i64) {
        self.job_key = job_key;
    }

    pub fn attached_to_key(&self) -> i64 {
        self.attached_to_key
    }

    pub fn set_attached_to_key(&mut self, attached_to_key: i64) {
        self.attached_to_key = attached_to_key;
    }

    /// Tokens in this scope plus the children that still have to complete
    pub fn pending_work(&self) -> i32 {
        self.active_tokens + self.child_count
    }

    pub(crate) fn spawn_token(&mut self) {
        self.active_tokens += 1;
    }

    /// Returns false if there was no token left to consume
    pub(crate) fn consume_token(&mut self) -> bool {
        if self.active_tokens == 0 {
            return false;
        }
        self.active_tokens -= 1;
        true
    }

    pub(crate) fn increment_child_count(&mut self) {
        self.child_count += 1;
    }

    pub(crate) fn decrement_child_count(&mut self) {
        self.child_count = (self.child_count - 1).max(0);
    }
}

impl BufferWriter for ElementInstance {
    fn encoded_len(&self) -> usize {
        1 + 8 + 8 + 1 + 4 + 4 + 8 + 8 + self.value.encoded_len()
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codec::LAYOUT_VERSION);
        buf.put_i64(self.key);
        buf.put_i64(self.parent_key);
        buf.put_u8(self.state.code());
        buf.put_i32(self.child_count);
        buf.put_i32(self.active_tokens);
        buf.put_i64(self.job_key);
        buf.put_i64(self.attached_to_key);
        self.value.write(buf)
    }
}

impl BufferReader for ElementInstance {
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        codec::read_version(buf)?;
        Ok(Self {
            key: codec::read_i64(buf)?,
            parent_key: codec::read_i64(buf)?,
            state: WorkflowInstanceIntent::from_code(codec::read_u8(buf)?)?,
            child_count: codec::read_i32(buf)?,
            active_tokens: codec::read_i32(buf)?,
            job_key: codec::read_i64(buf)?,
            attached_to_key: codec::read_i64(buf)?,
            value: WorkflowInstanceRecord::read(buf)?,
        })
    }
}

/// Why a record is parked against a scope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Waiting for a join; still counted as an active token of the scope
    DeferredToken,
    /// Suspended by an incident
    FailedToken,
    /// Reached an end state, kept for scope completion
    FinishedToken,
}

impl Purpose {
    pub fn code(&self) -> u8 {
        match self {
            Purpose::DeferredToken => 0,
            Purpose::FailedToken => 1,
            Purpose::FinishedToken => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(Purpose::DeferredToken),
            1 => Ok(Purpose::FailedToken),
            2 => Ok(Purpose::FinishedToken),
            tag => Err(DecodeError::UnknownTag {
                kind: "purpose",
                tag: tag as u16,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedRecord {
    pub key: i64,
    pub state: WorkflowInstanceIntent,
    pub value: WorkflowInstanceRecord,
}

impl IndexedRecord {
    pub fn new(key: i64, state: WorkflowInstanceIntent, value: WorkflowInstanceRecord) -> Self {
        Self { key, state, value }
    }
}

impl BufferWriter for IndexedRecord {
    fn encoded_len(&self) -> usize {
        8 + 1 + self.value.encoded_len()
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_i64(self.key);
        buf.put_u8(self.state.code());
        self.value.write(buf)
    }
}

impl BufferReader for IndexedRecord {
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            key: codec::read_i64(buf)?,
            state: WorkflowInstanceIntent::from_code(codec::read_u8(buf)?)?,
            value: WorkflowInstanceRecord::read(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub purpose: Purpose,
    pub record: IndexedRecord,
}

impl BufferWriter for StoredRecord {
    fn encoded_len(&self) -> usize {
        1 + 1 + self.record.encoded_len()
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codec::LAYOUT_VERSION);
        buf.put_u8(self.purpose.code());
        self.record.write(buf)
    }
}

impl BufferReader for StoredRecord {
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        codec::read_version(buf)?;
        Ok(Self {
            purpose: Purpose::from_code(codec::read_u8(buf)?)?,
            record: IndexedRecord::read(buf)?,
        })
    }
}

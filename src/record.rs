//! Workflow instance record
//!
//! The payload carried by every lifecycle event of a workflow instance. The
//! state layer embeds a snapshot of it in element instances, parked token
//! events and deferred records.

use crate::codec::{self, BufferReader, BufferWriter, DecodeError, EncodeError};
use bytes::{BufMut, Bytes, BytesMut};

/// Scope key used by elements that have no flow scope (the workflow instance itself)
pub const NO_SCOPE: i64 = -1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkflowInstanceRecord {
    pub bpmn_process_id: String,
    pub version: i32,
    pub workflow_key: i64,
    pub workflow_instance_key: i64,
    pub element_id: String,
    /// Key of the enclosing flow scope, [`NO_SCOPE`] for the root
    pub scope_instance_key: i64,
    /// MessagePack variables document
    pub payload: Bytes,
}

impl WorkflowInstanceRecord {
    pub fn new(bpmn_process_id: impl Into<String>, workflow_instance_key: i64) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            workflow_instance_key,
            workflow_key: -1,
            scope_instance_key: NO_SCOPE,
            ..Default::default()
        }
    }

    pub fn with_element_id(mut self, element_id: impl Into<String>) -> Self {
        self.element_id = element_id.into();
        self
    }

    pub fn with_scope(mut self, scope_instance_key: i64) -> Self {
        self.scope_instance_key = scope_instance_key;
        self
    }

    pub fn with_workflow(mut self, workflow_key: i64, version: i32) -> Self {
        self.workflow_key = workflow_key;
        self.version = version;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn is_root_scope(&self) -> bool {
        self.scope_instance_key < 0
    }
}

impl BufferWriter for WorkflowInstanceRecord {
    fn encoded_len(&self) -> usize {
        1 + codec::blob_len(self.bpmn_process_id.as_bytes())
            + 4
            + 8
            + 8
            + codec::blob_len(self.element_id.as_bytes())
            + 8
            + codec::blob_len(&self.payload)
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codec::LAYOUT_VERSION);
        codec::put_string(buf, &self.bpmn_process_id)?;
        buf.put_i32(self.version);
        buf.put_i64(self.workflow_key);
        buf.put_i64(self.workflow_instance_key);
        codec::put_string(buf, &self.element_id)?;
        buf.put_i64(self.scope_instance_key);
        codec::put_blob(buf, &self.payload)?;
        Ok(())
    }
}

impl BufferReader for WorkflowInstanceRecord {
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        codec::read_version(buf)?;
        Ok(Self {
            bpmn_process_id: codec::read_string(buf)?,
            version: codec::read_i32(buf)?,
            workflow_key: codec::read_i64(buf)?,
            workflow_instance_key: codec::read_i64(buf)?,
            element_id: codec::read_string(buf)?,
            scope_instance_key: codec::read_i64(buf)?,
            payload: codec::read_blob(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_len_matches_written_bytes() {
        let record = WorkflowInstanceRecord::new("order-process", 10)
            .with_element_id("collect-money")
            .with_scope(10)
            .with_workflow(3, 2)
            .with_payload(vec![0x80]);

        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(WorkflowInstanceRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_undersized_buffer_is_rejected() {
        let bytes = WorkflowInstanceRecord::new("p", 1).to_bytes().unwrap();
        let result = WorkflowInstanceRecord::from_bytes(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_root_scope_detection() {
        assert!(WorkflowInstanceRecord::new("p", 1).is_root_scope());
        assert!(!WorkflowInstanceRecord::new("p", 1).with_scope(1).is_root_scope());
    }
}

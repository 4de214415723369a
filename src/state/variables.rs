//! Variables state
//!
//! Variables are bound to `(scope key, name)` and are local to that scope.
//! Reads that collect a document walk the scope and then its ancestors; a
//! variable in a descendant scope shadows one of the same name further up.
//!
//! The scope hierarchy is stored here independently of the element instance
//! tree. The engine state keeps both trees the same shape.
//!
//! Values are stored as raw MessagePack, exactly as they appear inside a
//! variables document, so documents can be assembled without re-encoding.
//!
//! # Schema
//!
//! - `Variables`: `(scope key, name)` -> MessagePack value
//! - `ElementInstanceChildParent`: `child key` -> parent key (`i64`, big-endian)

use crate::codec;
use crate::db::key::{read_i64_key, read_string_key};
use crate::db::{ColumnFamily, DbKey, StateDb, WriteBatch};
use crate::error::{Result, StateError};
use rmpv::Value;
use serde::Serialize;
use slog::{debug, Logger};
use std::collections::HashSet;
use std::sync::Arc;

pub struct VariablesState {
    db: Arc<dyn StateDb>,
    logger: Logger,
}

impl VariablesState {
    pub fn new(db: Arc<dyn StateDb>, logger: Logger) -> Self {
        Self { db, logger }
    }

    /// Store every entry of a MessagePack map document as a local variable of `scope_key`
    pub fn set_variables_local_from_document(&self, scope_key: i64, document: &[u8]) -> Result<()> {
        let mut cursor = document;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| StateError::Document(e.to_string()))?;
        if !cursor.is_empty() {
            return Err(StateError::Document(format!(
                "{} trailing bytes after document",
                cursor.len()
            )));
        }

        let entries = match value {
            Value::Map(entries) => entries,
            Value::Nil => return Ok(()),
            other => {
                return Err(StateError::Document(format!("expected a map, got {}", other)));
            }
        };

        let mut batch = WriteBatch::new();
        for (name, value) in entries {
            let name = name
                .as_str()
                .ok_or_else(|| StateError::Document(format!("variable name {} is not a string", name)))?;
            let mut encoded = Vec::new();
            rmpv::encode::write_value(&mut encoded, &value)
                .map_err(|e| StateError::Document(e.to_string()))?;
            batch.put(ColumnFamily::Variables, (scope_key, name).to_key_bytes()?, encoded);
        }
        self.db.write_batch(batch)
    }

    /// Bind a raw MessagePack value to `name` in `scope_key`
    pub fn set_variable_local(&self, scope_key: i64, name: &str, value: &[u8]) -> Result<()> {
        self.db
            .put(ColumnFamily::Variables, &(scope_key, name).to_key_bytes()?, value)
    }

    /// Serialize `value` as MessagePack and bind it to `name` in `scope_key`
    pub fn set_variable_local_from_value<T: Serialize + ?Sized>(
        &self,
        scope_key: i64,
        name: &str,
        value: &T,
    ) -> Result<()> {
        let encoded = rmp_serde::to_vec(value).map_err(|e| StateError::Document(e.to_string()))?;
        self.set_variable_local(scope_key, name, &encoded)
    }

    /// Value bound to `name` in exactly this scope
    pub fn get_variable_local(&self, scope_key: i64, name: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(ColumnFamily::Variables, &(scope_key, name).to_key_bytes()?)
    }

    pub fn remove_variable_local(&self, scope_key: i64, name: &str) -> Result<()> {
        self.db
            .delete(ColumnFamily::Variables, &(scope_key, name).to_key_bytes()?)
    }

    /// Value of `name` visible from `scope_key`, searching ancestors outward
    pub fn get_variable(&self, scope_key: i64, name: &str) -> Result<Option<Vec<u8>>> {
        let names = [name];
        let variables = self.collect_variables(scope_key, Some(&names[..]))?;
        Ok(variables.into_iter().next().map(|(_, value)| value))
    }

    /// All variables visible from `scope_key` as one MessagePack map document
    pub fn get_variables_as_document(&self, scope_key: i64) -> Result<Vec<u8>> {
        let variables = self.collect_variables(scope_key, None)?;
        write_document(&variables)
    }

    /// The requested variables visible from `scope_key`
    ///
    /// The walk up the hierarchy stops as soon as every name was found.
    /// Names that are not bound anywhere are left out of the document.
    pub fn get_variables_as_document_with_names(&self, scope_key: i64, names: &[&str]) -> Result<Vec<u8>> {
        let variables = self.collect_variables(scope_key, Some(names))?;
        write_document(&variables)
    }

    /// Link `child_key` to its parent scope
    ///
    /// Root scopes (`parent_key < 0`) get no link.
    pub fn create_scope(&self, child_key: i64, parent_key: i64) -> Result<()> {
        if parent_key < 0 {
            return Ok(());
        }
        self.db.put(
            ColumnFamily::ElementInstanceChildParent,
            &child_key.to_key_bytes()?,
            &parent_key.to_be_bytes(),
        )
    }

    /// Remove the scope link and every local variable of the scope
    pub fn remove_scope(&self, scope_key: i64) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(ColumnFamily::ElementInstanceChildParent, scope_key.to_key_bytes()?);
        self.db
            .scan_prefix(ColumnFamily::Variables, &scope_key.to_key_bytes()?, &mut |k, _| {
                batch.delete(ColumnFamily::Variables, k.to_vec());
                Ok(true)
            })?;
        self.db.write_batch(batch)
    }

    pub fn get_parent_scope_key(&self, scope_key: i64) -> Result<Option<i64>> {
        match self
            .db
            .get(ColumnFamily::ElementInstanceChildParent, &scope_key.to_key_bytes()?)?
        {
            Some(bytes) => Ok(Some(codec::decode_i64(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.db.is_empty(ColumnFamily::ElementInstanceChildParent)?
            && self.db.is_empty(ColumnFamily::Variables)?)
    }

    fn collect_variables(&self, scope_key: i64, names: Option<&[&str]>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut collected: Vec<(String, Vec<u8>)> = Vec::new();
        let mut seen_names: HashSet<String> = HashSet::new();
        let mut visited_scopes: HashSet<i64> = HashSet::new();
        let all_found = |seen: &HashSet<String>| match names {
            Some(names) => names.iter().all(|name| seen.contains(*name)),
            None => false,
        };

        let mut current = Some(scope_key);
        while let Some(scope) = current {
            if all_found(&seen_names) {
                break;
            }
            if !visited_scopes.insert(scope) {
                debug!(self.logger, "Cycle in variable scope hierarchy"; "scope_key" => scope);
                break;
            }

            self.db
                .scan_prefix(ColumnFamily::Variables, &scope.to_key_bytes()?, &mut |k, v| {
                    let mut buf = k;
                    read_i64_key(&mut buf)?;
                    let name = read_string_key(&mut buf)?;

                    let wanted = names.map_or(true, |names| names.contains(&name.as_str()));
                    if wanted && !seen_names.contains(&name) {
                        seen_names.insert(name.clone());
                        collected.push((name, v.to_vec()));
                    }
                    Ok(!all_found(&seen_names))
                })?;

            current = self.get_parent_scope_key(scope)?;
        }
        Ok(collected)
    }
}

fn write_document(variables: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut document = Vec::new();
    let len = u32::try_from(variables.len())
        .map_err(|_| StateError::Document(format!("{} variables do not fit one map", variables.len())))?;
    rmp::encode::write_map_len(&mut document, len).map_err(|e| StateError::Document(e.to_string()))?;
    for (name, value) in variables {
        rmp::encode::write_str(&mut document, name).map_err(|e| StateError::Document(e.to_string()))?;
        document.extend_from_slice(value);
    }
    Ok(document)
}

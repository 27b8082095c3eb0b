//! Typed reads from the option tables scripts pass to constructors.

use std::collections::HashMap;

use mlua::{FromLua, Function, Table};
use tether_bridge::BridgeError;

pub(crate) struct Options<'a> {
    table: &'a Table,
    what: &'static str,
}

impl<'a> Options<'a> {
    pub fn new(table: &'a Table, what: &'static str) -> Self {
        Self { table, what }
    }

    fn get<V: FromLua>(&self, key: &str, expected: &str) -> Result<Option<V>, BridgeError> {
        self.table
            .get::<Option<V>>(key)
            .map_err(|_| BridgeError::config(format!("{}.{} must be {}", self.what, key, expected)))
    }

    pub fn string(&self, key: &str) -> Result<Option<String>, BridgeError> {
        self.get(key, "a string")
    }

    pub fn required_string(&self, key: &str) -> Result<String, BridgeError> {
        match self.string(key)? {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(BridgeError::config(format!("{}.{} is required", self.what, key))),
        }
    }

    pub fn integer(&self, key: &str) -> Result<Option<u64>, BridgeError> {
        self.get(key, "a non-negative integer")
    }

    pub fn port(&self, key: &str) -> Result<Option<u16>, BridgeError> {
        self.get(key, "a port number")
    }

    pub fn boolean(&self, key: &str) -> Result<Option<bool>, BridgeError> {
        self.get(key, "a boolean")
    }

    pub fn strings(&self, key: &str) -> Result<Vec<String>, BridgeError> {
        Ok(self.get(key, "a list of strings")?.unwrap_or_default())
    }

    pub fn string_map(&self, key: &str) -> Result<HashMap<String, String>, BridgeError> {
        Ok(self.get(key, "a table of strings")?.unwrap_or_default())
    }

    pub fn function(&self, key: &str) -> Result<Option<Function>, BridgeError> {
        self.get(key, "a function")
    }
}

//! Key-value storage behind the session layer.
//!
//! Stands in for the host's durable storage. Only pending elicitations are
//! kept here today.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use switchboard_transport::BoxFuture;

use crate::error::ServerError;

/// Async get/put/delete over JSON values.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, ServerError>>;

    fn put<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), ServerError>>;

    /// Remove `key`, returning whether it existed.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, ServerError>>;
}

/// Process-local [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Value>>, ServerError> {
        self.entries
            .lock()
            .map_err(|_| ServerError::Storage("store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, ServerError>> {
        Box::pin(async move { Ok(self.lock()?.get(key).cloned()) })
    }

    fn put<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), ServerError>> {
        Box::pin(async move {
            self.lock()?.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, ServerError>> {
        Box::pin(async move { Ok(self.lock()?.remove(key).is_some()) })
    }
}

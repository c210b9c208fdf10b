use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Host-owned storage surface exposed to sandboxed code.
///
/// The sandbox only ever sees this narrow contract, never the concrete store:
/// - `get_user` fails for unknown ids,
/// - `update_user` / `delete_user` return `false` for unknown ids,
/// - `create_user` always succeeds, last write wins.
pub trait StorageApi: Send + Sync {
    fn create_user(&self, id: &str, name: &str, age: i64) -> bool;

    /// Serialized user record (`{"id","name","age"}`).
    fn get_user(&self, id: &str) -> Result<String, StorageError>;

    fn update_user(&self, id: &str, age: i64) -> bool;

    fn delete_user(&self, id: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub age: i64,
}

/// In-memory [`StorageApi`] used by the host's demo wiring and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, UserRecord>> {
        self.users.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, UserRecord>> {
        self.users.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl StorageApi for MemoryStorage {
    fn create_user(&self, id: &str, name: &str, age: i64) -> bool {
        tracing::info!(id, name, age, "storage: create_user");
        self.write().insert(
            id.to_string(),
            UserRecord {
                id: id.to_string(),
                name: name.to_string(),
                age,
            },
        );
        true
    }

    fn get_user(&self, id: &str) -> Result<String, StorageError> {
        tracing::info!(id, "storage: get_user");
        let users = self.read();
        let user = users
            .get(id)
            .ok_or_else(|| StorageError::UserNotFound(id.to_string()))?;
        Ok(serde_json::to_string(user)?)
    }

    fn update_user(&self, id: &str, age: i64) -> bool {
        tracing::info!(id, age, "storage: update_user");
        match self.write().get_mut(id) {
            Some(user) => {
                user.age = age;
                true
            }
            None => false,
        }
    }

    fn delete_user(&self, id: &str) -> bool {
        tracing::info!(id, "storage: delete_user");
        self.write().remove(id).is_some()
    }
}

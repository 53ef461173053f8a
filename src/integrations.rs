//! Integration Store: per-clone messaging-platform configs in one shared file.
//!
//! Every operation runs its whole read-modify-write cycle under one async
//! mutex. Tokio's mutex grants the lock in FIFO order and the guard is
//! released on every exit path, including errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clonesmith_common::IntegrationConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::IntegrationError;

type IntegrationMap = BTreeMap<String, Vec<IntegrationConfig>>;

/// Partial update for one platform. `token: Some("")` clears the token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationUpdate {
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Full entry used when replacing a clone's list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationSpec {
    pub platform: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Clone)]
pub struct IntegrationStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl IntegrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get_integrations(
        &self,
        clone_id: &str,
    ) -> Result<Vec<IntegrationConfig>, IntegrationError> {
        let _guard = self.lock.lock().await;
        let all = self.read_all().await?;
        Ok(all.get(clone_id).cloned().unwrap_or_default())
    }

    /// Create or patch the entry for `platform`. New entries start inactive.
    pub async fn upsert_integration(
        &self,
        clone_id: &str,
        platform: &str,
        update: IntegrationUpdate,
    ) -> Result<Vec<IntegrationConfig>, IntegrationError> {
        validate_clone_id(clone_id)?;
        let platform = normalize_platform(platform)?;

        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        let list = all.entry(clone_id.to_string()).or_default();
        let now = Utc::now();

        let entry = match list.iter_mut().position(|c| c.platform == platform) {
            Some(index) => &mut list[index],
            None => {
                list.push(IntegrationConfig {
                    platform: platform.clone(),
                    active: false,
                    token: None,
                    updated_at: now,
                });
                let last = list.len() - 1;
                &mut list[last]
            }
        };
        if let Some(active) = update.active {
            entry.active = active;
        }
        if let Some(token) = update.token {
            entry.token = if token.is_empty() { None } else { Some(token) };
        }
        entry.updated_at = now;

        let result = list.clone();
        self.write_all(all).await?;
        debug!(clone_id, platform = %platform, "Integration upserted");
        Ok(result)
    }

    /// Replace a clone's whole list, preserving the given order.
    pub async fn set_integrations(
        &self,
        clone_id: &str,
        specs: Vec<IntegrationSpec>,
    ) -> Result<Vec<IntegrationConfig>, IntegrationError> {
        validate_clone_id(clone_id)?;
        let now = Utc::now();
        let mut list: Vec<IntegrationConfig> = Vec::with_capacity(specs.len());
        for spec in specs {
            let platform = normalize_platform(&spec.platform)?;
            if list.iter().any(|c| c.platform == platform) {
                return Err(IntegrationError::Validation(format!(
                    "duplicate platform '{}'",
                    platform
                )));
            }
            list.push(IntegrationConfig {
                platform,
                active: spec.active,
                token: spec.token.filter(|t| !t.is_empty()),
                updated_at: now,
            });
        }

        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        if list.is_empty() {
            all.remove(clone_id);
        } else {
            all.insert(clone_id.to_string(), list.clone());
        }
        self.write_all(all).await?;
        debug!(clone_id, count = list.len(), "Integrations replaced");
        Ok(list)
    }

    async fn read_all(&self) -> Result<IntegrationMap, IntegrationError> {
        let path = self.path.as_ref();
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IntegrationMap::new()),
            Err(source) => {
                return Err(IntegrationError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(IntegrationMap::new());
        }
        serde_json::from_slice(&content).map_err(|source| IntegrationError::Corrupt {
            path: path.clone(),
            source,
        })
    }

    async fn write_all(&self, all: IntegrationMap) -> Result<(), IntegrationError> {
        let path = self.path.as_ref().clone();
        let io_err = |source| IntegrationError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(&all).map_err(|source| IntegrationError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }
}

fn validate_clone_id(clone_id: &str) -> Result<(), IntegrationError> {
    if clone_id.trim().is_empty() {
        return Err(IntegrationError::Validation("clone id is empty".to_string()));
    }
    Ok(())
}

/// Lowercase and check a platform name.
pub fn normalize_platform(platform: &str) -> Result<String, IntegrationError> {
    let platform = platform.trim().to_ascii_lowercase();
    if platform.is_empty() {
        return Err(IntegrationError::Validation(
            "platform name is empty".to_string(),
        ));
    }
    if !platform
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(IntegrationError::Validation(format!(
            "platform '{}' may only contain a-z, 0-9, '_' and '-'",
            platform
        )));
    }
    Ok(platform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> IntegrationStore {
        IntegrationStore::new(dir.path().join("records").join("integrations.json"))
    }

    #[tokio::test]
    async fn test_upsert_creates_inactive_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let list = store
            .upsert_integration("c1", "Telegram", IntegrationUpdate::default())
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].platform, "telegram");
        assert!(!list[0].active);
        assert!(list[0].token.is_none());
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_upsert_patches_existing_entry_in_place() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .upsert_integration("c1", "telegram", IntegrationUpdate::default())
            .await
            .unwrap();
        store
            .upsert_integration("c1", "discord", IntegrationUpdate::default())
            .await
            .unwrap();
        let list = store
            .upsert_integration(
                "c1",
                "telegram",
                IntegrationUpdate {
                    active: Some(true),
                    token: Some("123:abc".to_string()),
                },
            )
            .await
            .unwrap();

        let platforms: Vec<&str> = list.iter().map(|c| c.platform.as_str()).collect();
        assert_eq!(platforms, vec!["telegram", "discord"]);
        assert!(list[0].active);
        assert_eq!(list[0].token.as_deref(), Some("123:abc"));

        // Only `active` changes; the token survives.
        let list = store
            .upsert_integration(
                "c1",
                "telegram",
                IntegrationUpdate {
                    active: Some(false),
                    token: None,
                },
            )
            .await
            .unwrap();
        assert!(!list[0].active);
        assert_eq!(list[0].token.as_deref(), Some("123:abc"));
    }

    #[tokio::test]
    async fn test_clones_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .upsert_integration("c1", "telegram", IntegrationUpdate::default())
            .await
            .unwrap();
        assert!(store.get_integrations("c2").await.unwrap().is_empty());
        assert_eq!(store.get_integrations("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_integrations_replaces_and_validates() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .upsert_integration("c1", "telegram", IntegrationUpdate::default())
            .await
            .unwrap();

        let list = store
            .set_integrations(
                "c1",
                vec![
                    IntegrationSpec {
                        platform: "slack".into(),
                        active: true,
                        token: Some("xoxb".into()),
                    },
                    IntegrationSpec {
                        platform: "discord".into(),
                        active: false,
                        token: Some(String::new()),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].platform, "slack");
        assert!(list[1].token.is_none());
        assert_eq!(store.get_integrations("c1").await.unwrap(), list);

        let err = store
            .set_integrations(
                "c1",
                vec![
                    IntegrationSpec {
                        platform: "slack".into(),
                        active: true,
                        token: None,
                    },
                    IntegrationSpec {
                        platform: "SLACK".into(),
                        active: false,
                        token: None,
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::Validation(_)));
        assert_eq!(store.get_integrations("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_platform_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for bad in ["", "   ", "tele gram", "../x", "ünï"] {
            let err = store
                .upsert_integration("c1", bad, IntegrationUpdate::default())
                .await
                .unwrap_err();
            assert!(matches!(err, IntegrationError::Validation(_)), "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_concurrent_upserts_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert_integration("c1", &format!("platform-{}", i), IntegrationUpdate::default())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let list = store.get_integrations("c1").await.unwrap();
        assert_eq!(list.len(), 20);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_same_platform_keep_one_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert_integration(
                        "c1",
                        "telegram",
                        IntegrationUpdate {
                            active: Some(i % 2 == 0),
                            token: Some(format!("token-{}", i)),
                        },
                    )
                    .await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        let list = store.get_integrations("c1").await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(results.iter().all(|r| r.len() == 1));
        // The file holds exactly one caller's complete write.
        assert!(results.iter().any(|r| r[0] == list[0]));
        let token = list[0].token.as_deref().unwrap();
        let i: usize = token.trim_start_matches("token-").parse().unwrap();
        assert_eq!(list[0].active, i % 2 == 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_failure() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{broken").unwrap();

        let err = store
            .upsert_integration("c1", "telegram", IntegrationUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::Corrupt { .. }));

        std::fs::write(store.path(), "{}").unwrap();
        let list = store
            .upsert_integration("c1", "telegram", IntegrationUpdate::default())
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
    }
}

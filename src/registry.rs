//! Solution-triple registry (spec §3 "Solution triple", §5 "Shared
//! resources").
//!
//! Grounded on `self.vals['task solution triples']` in
//! `klever/core/vrp/__init__.py`: a dict shared between the poller and the
//! worker pool, where each key (`fragment:env:requirement`) has exactly
//! one owner at a time (the worker currently processing that task), so
//! updates are always read-whole-value / modify / write-whole-value
//! rather than fine-grained field mutation.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// `[remote_status, resources_measured, termination_reason]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolutionTriple {
    pub remote_status: Option<String>,
    pub resources_measured: Option<serde_json::Value>,
    pub termination_reason: Option<String>,
}

pub fn triple_key(fragment: &str, envmodel: &str, requirement: &str) -> String {
    format!("{fragment}:{envmodel}:{requirement}")
}

#[derive(Default)]
pub struct TripleRegistry {
    inner: RwLock<HashMap<String, SolutionTriple>>,
}

impl TripleRegistry {
    pub fn new() -> Self {
        TripleRegistry::default()
    }

    /// Create the pending entry when C5 first sees the task.
    pub async fn insert(&self, key: &str) {
        self.inner
            .write()
            .await
            .insert(key.to_string(), SolutionTriple::default());
    }

    /// Read-modify-write the whole value for `key`. Panics (a fatal
    /// accounting bug, per the single-owner discipline) if the key is
    /// missing, mirroring a `KeyError` on the Python dict.
    pub async fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&mut SolutionTriple),
    {
        let mut guard = self.inner.write().await;
        let triple = guard
            .get_mut(key)
            .unwrap_or_else(|| panic!("solution triple registry: no entry for {key}"));
        f(triple);
    }

    /// Remove and return the triple after C6 emits the closing report.
    pub async fn take(&self, key: &str) -> SolutionTriple {
        self.inner
            .write()
            .await
            .remove(key)
            .unwrap_or_else(|| panic!("solution triple registry: no entry for {key}"))
    }

    pub async fn get(&self, key: &str) -> Option<SolutionTriple> {
        self.inner.read().await.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_update_take_round_trip() {
        let reg = TripleRegistry::new();
        let key = triple_key("pf1", "none", "req1");
        reg.insert(&key).await;

        reg.update(&key, |t| t.remote_status = Some("finished".into()))
            .await;

        let triple = reg.get(&key).await.unwrap();
        assert_eq!(triple.remote_status.as_deref(), Some("finished"));

        let taken = reg.take(&key).await;
        assert_eq!(taken.remote_status.as_deref(), Some("finished"));
        assert!(reg.get(&key).await.is_none());
    }
}

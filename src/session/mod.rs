//! Sessions and the registry of live job reporters.
//!
//! A session is an opaque handle issued by the cluster manager, bound to one
//! coordinator address. Blacklisting is monotonic: a handle never comes back.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::reporter::ReporterHandle;
use crate::tasks::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionInfo {
    pub handle: String,
    /// host:port of the job's coordinator
    pub coordinator_addr: String,
}

impl SessionInfo {
    pub fn new(handle: impl Into<String>, coordinator_addr: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            coordinator_addr: coordinator_addr.into(),
        }
    }

    /// Both the handle and the coordinator address are present.
    pub fn is_complete(&self) -> bool {
        !self.handle.is_empty() && !self.coordinator_addr.is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    blacklisted: HashSet<String>,
    reporters: HashMap<JobId, ReporterHandle>,
}

/// Blacklisted sessions and active job reporters, behind one lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a handle is blacklisted.
    pub async fn blacklist(&self, handle: &str) -> bool {
        self.inner.lock().await.blacklisted.insert(handle.to_string())
    }

    pub async fn is_blacklisted(&self, handle: &str) -> bool {
        self.inner.lock().await.blacklisted.contains(handle)
    }

    /// Register a reporter unless one already exists for the job. On
    /// conflict the rejected handle is given back.
    pub async fn register_reporter(&self, handle: ReporterHandle) -> Result<(), ReporterHandle> {
        let mut inner = self.inner.lock().await;
        if inner.reporters.contains_key(&handle.job_id) {
            return Err(handle);
        }
        inner.reporters.insert(handle.job_id.clone(), handle);
        Ok(())
    }

    pub async fn contains_reporter(&self, job_id: &JobId) -> bool {
        self.inner.lock().await.reporters.contains_key(job_id)
    }

    pub async fn remove_reporter(&self, job_id: &JobId) -> Option<ReporterHandle> {
        self.inner.lock().await.reporters.remove(job_id)
    }

    /// Remove the entry only if it still belongs to the given reporter
    /// instance, so an exiting reporter never evicts its replacement.
    pub async fn remove_reporter_instance(&self, job_id: &JobId, instance: uuid::Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.reporters.get(job_id) {
            Some(handle) if handle.instance == instance => {
                inner.reporters.remove(job_id);
                true
            }
            _ => false,
        }
    }

    /// Fire the edge-triggered wake of a job's reporter.
    pub async fn wake_reporter(&self, job_id: &JobId) -> bool {
        match self.inner.lock().await.reporters.get(job_id) {
            Some(handle) => {
                handle.wake();
                true
            }
            None => false,
        }
    }

    pub async fn jobs_for_session(&self, handle: &str) -> BTreeSet<JobId> {
        self.inner
            .lock()
            .await
            .reporters
            .values()
            .filter(|r| r.session.handle == handle)
            .map(|r| r.job_id.clone())
            .collect()
    }

    pub async fn drain_reporters(&self) -> Vec<ReporterHandle> {
        self.inner
            .lock()
            .await
            .reporters
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }

    pub async fn reporter_count(&self) -> usize {
        self.inner.lock().await.reporters.len()
    }
}

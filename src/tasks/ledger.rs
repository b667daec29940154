use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::time::Instant;

use crate::tasks::{JobId, TaskId, TaskInProgress, TaskRunState};

/// Why a task was not added to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The job was killed on this node; launches for it are stale
    JobKilled,
    SessionBlacklisted,
    AlreadyRunning,
    NotAccepting,
}

/// Running-task bookkeeping for the node.
///
/// Guarded by a single lock owned by the agent. Callers copy what they need
/// out and release the lock before any network I/O.
#[derive(Debug)]
pub struct TaskLedger {
    running: HashMap<TaskId, TaskInProgress>,
    /// Pruned when the task leaves the running set
    committed: HashSet<TaskId>,
    /// Jobs killed locally. Never cleared, so a stale launch can't bring one
    /// back; grows by one id per killed job for the life of the process.
    killed_jobs: HashSet<JobId>,
    /// Same lifetime as `killed_jobs`, one handle per blacklisted session
    blacklisted_sessions: HashSet<String>,
    accept_new_tasks: bool,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLedger {
    pub fn new() -> Self {
        Self {
            running: HashMap::new(),
            committed: HashSet::new(),
            killed_jobs: HashSet::new(),
            blacklisted_sessions: HashSet::new(),
            accept_new_tasks: true,
        }
    }

    pub fn add_task(&mut self, tip: TaskInProgress) -> Result<(), Rejection> {
        if self.blacklisted_sessions.contains(&tip.session.handle) {
            return Err(Rejection::SessionBlacklisted);
        }
        if self.killed_jobs.contains(tip.job_id()) {
            return Err(Rejection::JobKilled);
        }
        if !self.accept_new_tasks {
            return Err(Rejection::NotAccepting);
        }
        if self.running.contains_key(tip.task_id()) {
            return Err(Rejection::AlreadyRunning);
        }
        self.running.insert(tip.task_id().clone(), tip);
        Ok(())
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&TaskInProgress> {
        self.running.get(task_id)
    }

    pub fn remove_task(&mut self, task_id: &TaskId) -> Option<TaskInProgress> {
        self.committed.remove(task_id);
        self.running.remove(task_id)
    }

    /// Drop every task of the job and remember the job as killed.
    /// Returns the ids of the removed tasks.
    pub fn remove_job(&mut self, job_id: &JobId) -> Vec<TaskId> {
        self.killed_jobs.insert(job_id.clone());
        let ids: Vec<TaskId> = self
            .running
            .values()
            .filter(|tip| tip.job_id() == job_id)
            .map(|tip| tip.task_id().clone())
            .collect();
        for id in &ids {
            self.remove_task(id);
        }
        ids
    }

    pub fn is_job_killed(&self, job_id: &JobId) -> bool {
        self.killed_jobs.contains(job_id)
    }

    /// Refuse every later task of the session. Returns false if it was
    /// already refused.
    pub fn blacklist_session(&mut self, handle: &str) -> bool {
        self.blacklisted_sessions.insert(handle.to_string())
    }

    pub fn tracks_job(&self, job_id: &JobId) -> bool {
        self.running.values().any(|tip| tip.job_id() == job_id)
    }

    /// Copies of every task owned by the session.
    pub fn tasks_for_session(&self, handle: &str) -> Vec<TaskInProgress> {
        self.running
            .values()
            .filter(|tip| tip.session.handle == handle)
            .cloned()
            .collect()
    }

    pub fn jobs_for_session(&self, handle: &str) -> BTreeSet<JobId> {
        self.running
            .values()
            .filter(|tip| tip.session.handle == handle)
            .map(|tip| tip.job_id().clone())
            .collect()
    }

    /// Record a commit. Returns false if the task was already committed.
    pub fn commit(&mut self, task_id: TaskId) -> bool {
        self.committed.insert(task_id)
    }

    pub fn is_committed(&self, task_id: &TaskId) -> bool {
        self.committed.contains(task_id)
    }

    pub fn update_progress(
        &mut self,
        task_id: &TaskId,
        progress: f32,
        counters: BTreeMap<String, u64>,
    ) -> bool {
        match self.running.get_mut(task_id) {
            Some(tip) if tip.state == TaskRunState::Running => {
                tip.progress = progress.clamp(0.0, 1.0);
                tip.counters.extend(counters);
                tip.last_progress = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Record a terminal state. Returns the owning job so the caller can
    /// wake its reporter.
    pub fn finish(
        &mut self,
        task_id: &TaskId,
        state: TaskRunState,
        diagnostics: Option<String>,
    ) -> Option<JobId> {
        let tip = self.running.get_mut(task_id)?;
        if tip.state.is_terminal() {
            return None;
        }
        tip.state = state;
        if state == TaskRunState::Succeeded {
            tip.progress = 1.0;
        }
        tip.diagnostics = diagnostics;
        Some(tip.job_id().clone())
    }

    /// Forget terminal tasks once a heartbeat carrying them went through.
    pub fn forget_reported(&mut self, reported: &[TaskId]) -> usize {
        let before = self.running.len();
        for id in reported {
            if self
                .running
                .get(id)
                .is_some_and(|tip| tip.state.is_terminal())
            {
                self.remove_task(id);
            }
        }
        before - self.running.len()
    }

    /// Fail every running task that stopped reporting progress.
    pub fn reclaim_timed_out(&mut self, now: Instant) -> Vec<TaskId> {
        let mut reclaimed = Vec::new();
        for tip in self.running.values_mut() {
            if tip.is_timed_out(now) {
                tip.state = TaskRunState::Failed;
                tip.diagnostics = Some(format!(
                    "Task {} failed to report progress for {}ms",
                    tip.task_id(),
                    tip.work.timeout_ms
                ));
                reclaimed.push(tip.task_id().clone());
            }
        }
        reclaimed
    }

    /// No task in `Running` state.
    pub fn is_idle(&self) -> bool {
        self.running
            .values()
            .all(|tip| tip.state != TaskRunState::Running)
    }

    pub fn accepting_new_tasks(&self) -> bool {
        self.accept_new_tasks
    }

    pub fn set_accepting_new_tasks(&mut self, accept: bool) {
        self.accept_new_tasks = accept;
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

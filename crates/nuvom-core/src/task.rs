//! Process-wide task registry
use crate::error::{NuvomError, Result};
use crate::job::{JobOptions, TimeoutPolicy};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

/// Hooks invoked around a task's execution. Hook errors are logged and do
/// not abort the job (§4.6).
#[derive(Clone, Default)]
pub struct TaskHooks {
    pub before: Option<Arc<dyn Fn() + Send + Sync>>,
    pub after: Option<Arc<dyn Fn(&serde_json::Value) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl std::fmt::Debug for TaskHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The callable signature a registered task must implement: positional
/// args and keyword args in, a JSON result or an error string out.
pub type TaskFn = Arc<
    dyn Fn(
            Vec<serde_json::Value>,
            serde_json::Map<String, serde_json::Value>,
        ) -> std::result::Result<serde_json::Value, String>
        + Send
        + Sync,
>;

/// A registered task: its callable plus default execution parameters.
/// Created once at registration time and never mutated afterwards.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub callable: TaskFn,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: Option<f64>,
    pub timeout_policy: TimeoutPolicy,
    pub store_result: bool,
    pub hooks: TaskHooks,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("retries", &self.retries)
            .field("retry_delay_secs", &self.retry_delay_secs)
            .field("timeout_secs", &self.timeout_secs)
            .field("timeout_policy", &self.timeout_policy)
            .field("store_result", &self.store_result)
            .field("tags", &self.tags)
            .finish()
    }
}

impl TaskDefinition {
    /// The default job options a submission gets if it doesn't override them.
    pub fn default_job_options(&self) -> JobOptions {
        JobOptions {
            max_retries: self.retries,
            retry_delay_secs: self.retry_delay_secs,
            timeout_secs: self.timeout_secs,
            timeout_policy: self.timeout_policy,
            store_result: self.store_result,
            tags: self.tags.clone(),
            description: self.description.clone(),
        }
    }
}

/// Registration conflict policy for [`TaskRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Fail with [`NuvomError::DuplicateTask`] if the name already exists.
    Strict,
    /// Replace the existing definition unconditionally.
    Force,
    /// Ignore the new registration if the name already exists.
    Silent,
}

/// A thread-safe, keyed container of [`TaskDefinition`]s.
///
/// Populated either by decorator-equivalent builder calls at import time,
/// or by loading a pre-built task manifest at worker startup; both paths
/// end in [`TaskRegistry::register`].
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: TaskDefinition, mode: RegisterMode) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        if tasks.contains_key(&def.name) {
            match mode {
                RegisterMode::Strict => {
                    return Err(NuvomError::DuplicateTask(def.name.clone()));
                }
                RegisterMode::Silent => {
                    debug!("Task \"{}\" already registered, ignoring", def.name);
                    return Ok(());
                }
                RegisterMode::Force => {
                    warn!("Task \"{}\" re-registered, replacing definition", def.name);
                }
            }
        }
        info!("Registered task \"{}\"", def.name);
        tasks.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<TaskDefinition> {
        self.tasks
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| NuvomError::UnknownTask(name.to_string()))
    }

    /// Returns all registered definitions, ordered by name for determinism.
    pub fn list(&self) -> Vec<TaskDefinition> {
        let tasks = self.tasks.read().unwrap();
        let mut names: Vec<&String> = tasks.keys().collect();
        names.sort();
        names.into_iter().map(|n| tasks[n].clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_def(name: &str) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            callable: Arc::new(|_args, _kwargs| Ok(serde_json::Value::Null)),
            retries: 0,
            retry_delay_secs: 0,
            timeout_secs: None,
            timeout_policy: TimeoutPolicy::default(),
            store_result: true,
            hooks: TaskHooks::default(),
            tags: vec![],
            description: None,
        }
    }

    #[test]
    fn strict_registration_rejects_duplicates() {
        let reg = TaskRegistry::new();
        reg.register(dummy_def("add"), RegisterMode::Strict).unwrap();
        let err = reg.register(dummy_def("add"), RegisterMode::Strict).unwrap_err();
        assert!(matches!(err, NuvomError::DuplicateTask(name) if name == "add"));
    }

    #[test]
    fn force_registration_replaces() {
        let reg = TaskRegistry::new();
        reg.register(dummy_def("add"), RegisterMode::Strict).unwrap();
        reg.register(dummy_def("add"), RegisterMode::Force).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn silent_registration_ignores_duplicates() {
        let reg = TaskRegistry::new();
        reg.register(dummy_def("add"), RegisterMode::Strict).unwrap();
        reg.register(dummy_def("add"), RegisterMode::Silent).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unknown_task_errors() {
        let reg = TaskRegistry::new();
        let err = reg.get("missing").unwrap_err();
        assert!(matches!(err, NuvomError::UnknownTask(name) if name == "missing"));
    }

    #[test]
    fn list_is_ordered_by_name() {
        let reg = TaskRegistry::new();
        reg.register(dummy_def("zeta"), RegisterMode::Strict).unwrap();
        reg.register(dummy_def("alpha"), RegisterMode::Strict).unwrap();
        let names: Vec<String> = reg.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}

//! Declarative template stack driver.
//!
//! A stack is rendered from an embedded template, written next to the
//! configuration document (so it is exported with the other artifacts),
//! submitted, and polled to `CREATE_COMPLETE`. The stack ID is persisted
//! through the caller's callback before the first poll. Deletes poll with a
//! stop signal that cannot fire, so an interrupt never strands a
//! half-deleted stack.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::abort::StopSignal;
use crate::config::{Config, Store};
use crate::poller::{poll, wait_for, PollSpec};
use crate::provider::{CreateStackRequest, StackApi, StackDescription};
use crate::{template, Error, Result};

/// Stack status after a successful create
pub const CREATE_COMPLETE: &str = "CREATE_COMPLETE";
/// Stack status after a successful delete
pub const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

const CREATE_FAILURE_STATES: &[&str] = &[
    "CREATE_FAILED",
    "ROLLBACK_IN_PROGRESS",
    "ROLLBACK_COMPLETE",
    "ROLLBACK_FAILED",
    "DELETE_COMPLETE",
];
const DELETE_FAILURE_STATES: &[&str] = &["DELETE_FAILED"];

/// Everything needed to create one stack
#[derive(Clone, Debug)]
pub struct StackSpec {
    /// Stack name
    pub name: String,
    /// Embedded template name, see [`template::cfn`]
    pub template: &'static str,
    /// Template rendering context
    pub context: serde_json::Value,
    /// Stack parameters; lists are comma-joined
    pub parameters: BTreeMap<String, String>,
    /// Stack tags
    pub tags: BTreeMap<String, String>,
    /// Wait before the first describe
    pub initial_wait: Duration,
    /// Describe interval
    pub interval: Duration,
    /// Phase deadline
    pub timeout: Duration,
}

impl StackSpec {
    /// Spec with the default timing (1 min initial wait, 10 s interval, 15 min deadline)
    pub fn new(name: impl Into<String>, template: &'static str, context: impl Serialize) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            template,
            context: serde_json::to_value(context)?,
            parameters: BTreeMap::new(),
            tags: BTreeMap::new(),
            initial_wait: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(15 * 60),
        })
    }

    /// Add a scalar parameter
    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a list parameter (`CommaDelimitedList`)
    pub fn list_param<S: AsRef<str>>(mut self, key: &str, values: &[S]) -> Self {
        let joined = values.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        self.parameters.insert(key.to_string(), joined);
        self
    }

    /// Set the stack tags
    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Override the timing
    pub fn timing(mut self, initial_wait: Duration, interval: Duration, timeout: Duration) -> Self {
        self.initial_wait = initial_wait;
        self.interval = interval;
        self.timeout = timeout;
        self
    }
}

/// Outputs of a completed stack
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackOutputs(pub BTreeMap<String, String>);

impl StackOutputs {
    /// A required output
    pub fn get(&self, key: &str) -> Result<String> {
        self.0
            .get(key)
            .cloned()
            .ok_or_else(|| Error::stack(format!("stack output {key:?} missing")))
    }

    /// A required comma-separated output
    pub fn list(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .get(key)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Creates and deletes template stacks
#[derive(Clone)]
pub struct StackDriver {
    store: Store,
    stacks: Arc<dyn StackApi>,
}

impl StackDriver {
    /// Driver writing through `store`
    pub fn new(store: Store, stacks: Arc<dyn StackApi>) -> Self {
        Self { store, stacks }
    }

    /// Render, submit and wait for a stack.
    ///
    /// `persist_id` runs under the store lock right after the provider
    /// accepts the stack, before any polling.
    pub async fn create(
        &self,
        stop: &StopSignal,
        spec: StackSpec,
        persist_id: impl FnOnce(&mut Config, &str),
    ) -> Result<StackOutputs> {
        let body = template::render(spec.template, &spec.context)?;
        let path = self.write_body(&spec.name, &body)?;
        info!(stack = %spec.name, path = %path.display(), "creating stack");

        let req = CreateStackRequest {
            stack_name: spec.name.clone(),
            template_body: body,
            parameters: spec.parameters.clone(),
            tags: spec.tags.clone(),
        };
        let stack_id = self.stacks.create_stack(&req).await?;
        self.store.update(|cfg| {
            cfg.status
                .stack_template_paths
                .insert(spec.name.clone(), path.display().to_string());
            persist_id(cfg, &stack_id);
        });
        info!(stack = %spec.name, stack_id = %stack_id, "stack submitted");

        let poll_spec = PollSpec::new(format!("stack {}", spec.name), CREATE_COMPLETE)
            .failure_states(CREATE_FAILURE_STATES.iter().copied())
            .initial_wait(spec.initial_wait)
            .interval(spec.interval)
            .timeout(spec.timeout);
        let stacks = self.stacks.clone();
        let id = stack_id.clone();
        let stream = poll(poll_spec, stop, move || {
            let stacks = stacks.clone();
            let id = id.clone();
            async move { stacks.describe_stack(&id).await }
        });

        let reached = wait_for(stream).await.map_err(|e| match e {
            Error::Aborted(_) | Error::Timeout(_) => e,
            other => Error::stack(format!("{} ({stack_id}): {other}", spec.name)),
        })?;
        let outputs = reached.resource.map(|d| d.outputs).unwrap_or_default();
        info!(stack = %spec.name, outputs = outputs.len(), "stack created");
        Ok(StackOutputs(outputs))
    }

    /// Delete a stack and wait for `DELETE_COMPLETE`. A stack that no longer
    /// exists is already deleted.
    pub async fn delete(&self, what: &str, stack_id: &str, timeout: Duration) -> Result<()> {
        if stack_id.is_empty() {
            return Ok(());
        }
        info!(stack = %what, stack_id = %stack_id, "deleting stack");
        match self.stacks.delete_stack(stack_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(stack = %what, "stack already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let poll_spec = PollSpec::new(format!("stack {what}"), DELETE_COMPLETE)
            .failure_states(DELETE_FAILURE_STATES.iter().copied())
            .initial_wait(Duration::from_secs(10))
            .interval(Duration::from_secs(10))
            .timeout(timeout)
            .ignore_stop(true);
        let stacks = self.stacks.clone();
        let id = stack_id.to_string();
        let stream = poll(poll_spec, &StopSignal::never(), move || {
            let stacks = stacks.clone();
            let id = id.clone();
            async move {
                match stacks.describe_stack(&id).await {
                    Err(e) if e.is_not_found() => Ok(StackDescription {
                        stack_id: id,
                        status: DELETE_COMPLETE.to_string(),
                        ..Default::default()
                    }),
                    other => other,
                }
            }
        });
        wait_for(stream).await.map_err(|e| {
            warn!(stack = %what, error = %e, "stack delete failed");
            Error::stack(format!("delete {what} ({stack_id}): {e}"))
        })?;
        info!(stack = %what, "stack deleted");
        Ok(())
    }

    fn write_body(&self, name: &str, body: &str) -> Result<PathBuf> {
        let dir = self.store.read(|c| c.config_dir());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.cfn.yaml"));
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockStackApi, ProviderError, ProviderErrorKind};
    use crate::template::cfn;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn store_in(dir: &std::path::Path) -> Store {
        Store::new(Config {
            config_path: dir.join("test-001.yaml").display().to_string(),
            name: "test-001".into(),
            ..Default::default()
        })
    }

    fn role_spec() -> StackSpec {
        StackSpec::new(
            "test-001-role-cluster",
            cfn::ROLE,
            serde_json::json!({ "description": "cluster role" }),
        )
        .unwrap()
        .param("RoleName", "test-001-role-cluster")
        .list_param("RoleServicePrincipals", &["eks.amazonaws.com"])
        .list_param("RoleManagedPolicyARNs", &["arn:aws:iam::aws:policy/A", "arn:aws:iam::aws:policy/B"])
        .timing(Duration::ZERO, Duration::from_secs(5), Duration::from_secs(300))
    }

    // =========================================================================
    // Story: a role stack is created and its outputs come back
    // =========================================================================

    /// Story: the ID is persisted before polling and outputs are returned
    #[tokio::test(start_paused = true)]
    async fn story_create_persists_id_then_returns_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let mut mock = MockStackApi::new();
        mock.expect_create_stack()
            .withf(|req| {
                req.stack_name == "test-001-role-cluster"
                    && req.parameters["RoleManagedPolicyARNs"]
                        == "arn:aws:iam::aws:policy/A,arn:aws:iam::aws:policy/B"
                    && req.template_body.contains("cluster role")
            })
            .returning(|_| Ok("stack-id-1".into()));
        mock.expect_describe_stack().returning(move |id| {
            let n = p.fetch_add(1, Ordering::SeqCst);
            let status = if n < 2 { "CREATE_IN_PROGRESS" } else { CREATE_COMPLETE };
            let mut outputs = BTreeMap::new();
            outputs.insert("RoleARN".to_string(), "arn:aws:iam::123:role/r".to_string());
            Ok(StackDescription {
                stack_id: id.to_string(),
                status: status.into(),
                outputs,
                ..Default::default()
            })
        });

        let driver = StackDriver::new(store.clone(), Arc::new(mock));
        let outputs = driver
            .create(&StopSignal::new(), role_spec(), |cfg, id| {
                cfg.status.cluster_role_cfn_stack_id = id.to_string();
            })
            .await
            .unwrap();

        assert_eq!(outputs.get("RoleARN").unwrap(), "arn:aws:iam::123:role/r");
        assert!(outputs.get("Missing").is_err());
        let on_disk = Config::load(dir.path().join("test-001.yaml")).unwrap();
        assert_eq!(on_disk.status.cluster_role_cfn_stack_id, "stack-id-1");
        let body_path = &on_disk.status.stack_template_paths["test-001-role-cluster"];
        assert!(std::path::Path::new(body_path).exists());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    /// Story: a rollback surfaces as a stack error but the ID stays recorded
    #[tokio::test(start_paused = true)]
    async fn story_rollback_is_a_stack_error_and_id_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let mut mock = MockStackApi::new();
        mock.expect_create_stack().returning(|_| Ok("stack-id-2".into()));
        mock.expect_describe_stack().returning(|_| {
            Ok(StackDescription {
                status: "ROLLBACK_COMPLETE".into(),
                ..Default::default()
            })
        });

        let driver = StackDriver::new(store.clone(), Arc::new(mock));
        let err = driver
            .create(&StopSignal::new(), role_spec(), |cfg, id| {
                cfg.status.cluster_role_cfn_stack_id = id.to_string();
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stack(_)));
        assert!(err.to_string().contains("ROLLBACK_COMPLETE"));
        assert_eq!(store.read(|c| c.status.cluster_role_cfn_stack_id.clone()), "stack-id-2");
    }

    // =========================================================================
    // Story: deletes are idempotent and uninterruptible
    // =========================================================================

    /// Story: a stack that vanished counts as deleted
    #[tokio::test(start_paused = true)]
    async fn story_delete_treats_missing_stack_as_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockStackApi::new();
        mock.expect_delete_stack().returning(|_| Ok(()));
        mock.expect_describe_stack().returning(|_| {
            Err(ProviderError::new(
                "cloudformation",
                "DescribeStacks",
                ProviderErrorKind::NotFound,
                "Stack with id x does not exist",
            ))
        });
        let driver = StackDriver::new(store_in(dir.path()), Arc::new(mock));
        driver
            .delete("test-001-vpc", "stack-id-3", Duration::from_secs(600))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_stack_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        // no expectations: any call would panic
        let driver = StackDriver::new(store_in(dir.path()), Arc::new(MockStackApi::new()));
        driver.delete("nothing", "", Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delete_failed_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockStackApi::new();
        mock.expect_delete_stack().returning(|_| Ok(()));
        mock.expect_describe_stack().returning(|_| {
            Ok(StackDescription {
                status: "DELETE_FAILED".into(),
                ..Default::default()
            })
        });
        let driver = StackDriver::new(store_in(dir.path()), Arc::new(mock));
        let err = driver
            .delete("test-001-vpc", "stack-id-4", Duration::from_secs(600))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DELETE_FAILED"));
    }
}

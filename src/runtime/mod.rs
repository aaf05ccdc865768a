//! The DAG executor (`executor`) plus the suspend/resume orchestration
//! layer (`suspension`) built on top of it.
//!
//! [`Runtime`] is the component spec.md §4.1/§4.2 calls out as the single
//! collaborator HTTP handlers talk to: it runs a pipeline to completion or
//! suspension, persists suspensions, and resumes them under a per-handle
//! single-writer lock.

pub mod executor;
pub mod suspension;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use executor::{ExecutionOptions, RunOutcome};
pub use suspension::{SuspendedExecution, SuspensionFilter, SuspensionStore, SuspensionSummary};

use crate::dag::NodeId;
use crate::error::ConstellationError;
use crate::pipeline::PipelineImage;
use crate::store::PipelineStore;
use crate::value::CValue;

/// What running or resuming a pipeline produced.
pub enum ExecutionOutcome {
    Completed { outputs: BTreeMap<String, CValue> },
    Suspended(SuspensionDescriptor),
}

/// The part of a suspension an HTTP caller needs to resume it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SuspensionDescriptor {
    pub handle: String,
    pub missing_inputs: BTreeMap<String, crate::value::CType>,
    pub pending_outputs: Vec<String>,
    pub resumption_count: u32,
}

/// Runs pipelines and owns suspend/resume orchestration. Stateless beyond
/// the suspension store and per-handle resume locks; the `PipelineStore`
/// used to validate a resume's structural hash is passed in per call since
/// it's shared with the rest of the service, not owned by the runtime.
pub struct Runtime {
    suspensions: Arc<dyn SuspensionStore>,
    resume_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Runtime {
    pub fn new(suspensions: Arc<dyn SuspensionStore>) -> Self {
        Self { suspensions, resume_locks: DashMap::new() }
    }

    /// Run `pipeline` against `inputs`, type-checking provided values first.
    pub async fn run(
        &self,
        pipeline: &PipelineImage,
        inputs: BTreeMap<String, CValue>,
        options: &ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ConstellationError> {
        type_check_inputs(pipeline, &inputs)?;

        let outcome = executor::run(pipeline, inputs.clone(), BTreeMap::new(), options, cancel).await?;
        self.package_outcome(pipeline, inputs, outcome).await
    }

    /// Resume a suspended execution, merging `additional_inputs` and
    /// `resolved_nodes` into its previously-recorded state.
    pub async fn resume(
        &self,
        handle: &str,
        pipeline_store: &PipelineStore,
        additional_inputs: BTreeMap<String, CValue>,
        resolved_nodes: BTreeMap<NodeId, CValue>,
        options: &ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ConstellationError> {
        let lock = self.resume_locks.entry(handle.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _guard = lock.try_lock().map_err(|_| ConstellationError::ResumeInProgress(handle.to_string()))?;

        let suspension = self
            .suspensions
            .load(handle)
            .await
            .ok_or_else(|| ConstellationError::SuspensionNotFound(handle.to_string()))?;

        let structural_hash = crate::content_hash::ContentHash::from_hex(&suspension.structural_hash)?;
        let pipeline: std::sync::Arc<PipelineImage> = pipeline_store
            .get(&structural_hash)
            .ok_or_else(|| ConstellationError::PipelineChanged(suspension.structural_hash.clone()))?;

        for name in additional_inputs.keys() {
            if suspension.provided_inputs.contains_key(name) {
                return Err(ConstellationError::AlreadyProvided(name.clone()));
            }
            if !suspension.missing_inputs.contains_key(name) {
                return Err(ConstellationError::UnknownInput(name.clone()));
            }
        }
        for node_id in resolved_nodes.keys() {
            if suspension.computed_nodes.contains_key(node_id) {
                return Err(ConstellationError::AlreadyResolved(node_id.clone()));
            }
        }
        for (name, value) in &additional_inputs {
            let declared = &suspension.missing_inputs[name];
            if !value.is_valid(declared) {
                return Err(ConstellationError::TypeMismatch {
                    name: name.clone(),
                    expected: declared.to_string(),
                    actual: value.infer_type().to_string(),
                });
            }
        }

        let mut merged_inputs = suspension.provided_inputs.clone();
        merged_inputs.extend(additional_inputs);
        let mut merged_nodes = suspension.computed_nodes.clone();
        merged_nodes.extend(resolved_nodes);

        let outcome = executor::run(&pipeline, merged_inputs.clone(), merged_nodes, options, cancel).await?;

        match outcome {
            RunOutcome::Completed { outputs } => {
                self.suspensions.delete(handle).await;
                Ok(ExecutionOutcome::Completed { outputs })
            }
            RunOutcome::Suspended { resolved_nodes, missing_inputs, pending_outputs } => {
                let declared_types: BTreeMap<String, crate::value::CType> =
                    pipeline.dag_spec.inputs.iter().cloned().collect();
                let missing_inputs: BTreeMap<String, crate::value::CType> = missing_inputs
                    .into_iter()
                    .filter_map(|name| declared_types.get(&name).cloned().map(|ty| (name, ty)))
                    .collect();
                let new_suspension = SuspendedExecution {
                    structural_hash: pipeline.structural_hash.to_string(),
                    provided_inputs: merged_inputs,
                    computed_nodes: resolved_nodes,
                    missing_inputs,
                    pending_outputs: pending_outputs.clone(),
                    resumption_count: suspension.resumption_count + 1,
                    created_at_millis: suspension.created_at_millis,
                };
                let descriptor = SuspensionDescriptor {
                    handle: handle.to_string(),
                    missing_inputs: new_suspension.missing_inputs.clone(),
                    pending_outputs,
                    resumption_count: new_suspension.resumption_count,
                };
                self.suspensions.save(handle, new_suspension).await?;
                Ok(ExecutionOutcome::Suspended(descriptor))
            }
        }
    }

    pub async fn get_suspension(&self, handle: &str) -> Option<SuspendedExecution> {
        self.suspensions.load(handle).await
    }

    pub async fn delete_suspension(&self, handle: &str) -> bool {
        self.suspensions.delete(handle).await
    }

    pub async fn list_suspensions(&self, filter: &SuspensionFilter) -> Vec<SuspensionSummary> {
        self.suspensions.list(filter).await
    }

    async fn package_outcome(
        &self,
        pipeline: &PipelineImage,
        provided_inputs: BTreeMap<String, CValue>,
        outcome: RunOutcome,
    ) -> Result<ExecutionOutcome, ConstellationError> {
        match outcome {
            RunOutcome::Completed { outputs } => Ok(ExecutionOutcome::Completed { outputs }),
            RunOutcome::Suspended { resolved_nodes, missing_inputs, pending_outputs } => {
                let declared_types: BTreeMap<String, crate::value::CType> =
                    pipeline.dag_spec.inputs.iter().cloned().collect();
                let missing_inputs: BTreeMap<String, crate::value::CType> = missing_inputs
                    .into_iter()
                    .filter_map(|name| declared_types.get(&name).cloned().map(|ty| (name, ty)))
                    .collect();
                let handle = suspension::new_handle();
                let suspension = SuspendedExecution {
                    structural_hash: pipeline.structural_hash.to_string(),
                    provided_inputs,
                    computed_nodes: resolved_nodes,
                    missing_inputs: missing_inputs.clone(),
                    pending_outputs: pending_outputs.clone(),
                    resumption_count: 0,
                    created_at_millis: now_millis(),
                };
                let descriptor = SuspensionDescriptor {
                    handle: handle.clone(),
                    missing_inputs,
                    pending_outputs,
                    resumption_count: 0,
                };
                self.suspensions.save(&handle, suspension).await?;
                Ok(ExecutionOutcome::Suspended(descriptor))
            }
        }
    }
}

fn type_check_inputs(pipeline: &PipelineImage, inputs: &BTreeMap<String, CValue>) -> Result<(), ConstellationError> {
    for (name, declared) in &pipeline.dag_spec.inputs {
        if let Some(value) = inputs.get(name) {
            if !value.is_valid(declared) {
                return Err(ConstellationError::TypeMismatch {
                    name: name.clone(),
                    expected: declared.to_string(),
                    actual: value.infer_type().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DagNode, DagSpec, InputRef, OutputRef};
    use crate::module::ModuleRegistry;
    use crate::runtime::suspension::InMemorySuspensionStore;
    use crate::value::CType;
    use std::collections::BTreeMap as Map;

    fn get_user_pipeline(registry: &ModuleRegistry) -> PipelineImage {
        let dag = DagSpec {
            inputs: vec![("userId".to_string(), CType::String), ("approval".to_string(), CType::Bool)],
            nodes: Map::from([
                (
                    "n_u".to_string(),
                    DagNode {
                        module_name: "std.GetUser".to_string(),
                        inputs: Map::from([("userId".to_string(), InputRef::PipelineInput("userId".to_string()))]),
                    },
                ),
                (
                    "n_user".to_string(),
                    DagNode {
                        module_name: "std.when".to_string(),
                        inputs: Map::from([
                            ("value".to_string(), InputRef::NodeOutput("n_u".to_string())),
                            ("cond".to_string(), InputRef::PipelineInput("approval".to_string())),
                        ]),
                    },
                ),
            ]),
            outputs: Map::from([("user".to_string(), OutputRef::NodeOutput("n_user".to_string()))]),
        };
        PipelineImage::new(dag, None, registry).unwrap()
    }

    #[tokio::test]
    async fn run_completes_with_all_inputs() {
        let registry = ModuleRegistry::new();
        crate::module::builtins::register_all(&registry);
        let pipeline = get_user_pipeline(&registry);
        let runtime = Runtime::new(Arc::new(InMemorySuspensionStore::new()));
        let inputs = Map::from([
            ("userId".to_string(), CValue::String("u1".to_string())),
            ("approval".to_string(), CValue::Bool(true)),
        ]);
        let outcome =
            runtime.run(&pipeline, inputs, &ExecutionOptions::default(), CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn suspend_then_resume_completes() {
        let registry = ModuleRegistry::new();
        crate::module::builtins::register_all(&registry);
        let pipeline = get_user_pipeline(&registry);
        let store = PipelineStore::new();
        let hash = store.store(pipeline.clone());

        let runtime = Runtime::new(Arc::new(InMemorySuspensionStore::new()));
        let inputs = Map::from([("userId".to_string(), CValue::String("u1".to_string()))]);
        let outcome =
            runtime.run(&pipeline, inputs, &ExecutionOptions::default(), CancellationToken::new()).await.unwrap();
        let handle = match outcome {
            ExecutionOutcome::Suspended(descriptor) => {
                assert!(descriptor.missing_inputs.contains_key("approval"));
                descriptor.handle
            }
            ExecutionOutcome::Completed { .. } => panic!("expected suspension"),
        };

        let resumed = runtime
            .resume(
                &handle,
                &store,
                Map::from([("approval".to_string(), CValue::Bool(true))]),
                Map::new(),
                &ExecutionOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(resumed, ExecutionOutcome::Completed { .. }));
        assert!(runtime.get_suspension(&handle).await.is_none());
        let _ = hash;
    }

    #[tokio::test]
    async fn resume_rejects_unknown_input() {
        let registry = ModuleRegistry::new();
        crate::module::builtins::register_all(&registry);
        let pipeline = get_user_pipeline(&registry);
        let store = PipelineStore::new();
        store.store(pipeline.clone());

        let runtime = Runtime::new(Arc::new(InMemorySuspensionStore::new()));
        let inputs = Map::from([("userId".to_string(), CValue::String("u1".to_string()))]);
        let outcome =
            runtime.run(&pipeline, inputs, &ExecutionOptions::default(), CancellationToken::new()).await.unwrap();
        let handle = match outcome {
            ExecutionOutcome::Suspended(descriptor) => descriptor.handle,
            ExecutionOutcome::Completed { .. } => panic!("expected suspension"),
        };

        let err = runtime
            .resume(
                &handle,
                &store,
                Map::from([("nope".to_string(), CValue::Bool(true))]),
                Map::new(),
                &ExecutionOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownInput");
    }

    #[tokio::test]
    async fn resume_rejects_pipeline_changed() {
        let registry = ModuleRegistry::new();
        crate::module::builtins::register_all(&registry);
        let pipeline = get_user_pipeline(&registry);
        let store = PipelineStore::new();
        // Not stored: simulates the image having been removed since suspend.

        let runtime = Runtime::new(Arc::new(InMemorySuspensionStore::new()));
        let inputs = Map::from([("userId".to_string(), CValue::String("u1".to_string()))]);
        let outcome =
            runtime.run(&pipeline, inputs, &ExecutionOptions::default(), CancellationToken::new()).await.unwrap();
        let handle = match outcome {
            ExecutionOutcome::Suspended(descriptor) => descriptor.handle,
            ExecutionOutcome::Completed { .. } => panic!("expected suspension"),
        };

        let err = runtime
            .resume(&handle, &store, Map::new(), Map::new(), &ExecutionOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PipelineChanged");
    }
}

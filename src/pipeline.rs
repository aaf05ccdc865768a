//! Compiled pipeline images and the (out-of-scope, toy) reference compiler
//! that produces them.
//!
//! The real language parser/type checker/IR optimizer is an external
//! collaborator per spec.md §1; this module defines the `PipelineCompiler`
//! trait those collaborators implement, plus a minimal built-in compiler
//! covering only the toy surface syntax used in the spec's own E1/E2
//! scenarios, so the crate is runnable end to end without depending on an
//! actual language implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::content_hash::{hash_canonical, ContentHash};
use crate::dag::{DagNode, DagSpec, InputRef, NodeId, OutputRef};
use crate::error::ConstellationError;
use crate::module::{ModuleFactory, ModuleRegistry};
use crate::value::CType;

/// `{ structuralHash, syntacticHash?, dagSpec, moduleFactories }`.
///
/// `module_factories` is not part of the persisted form (it's resolved at
/// load time from a `ModuleRegistry`, since factories aren't serializable
/// themselves) — see [`PipelineImage::resolve_modules`].
#[derive(Clone)]
pub struct PipelineImage {
    pub structural_hash: ContentHash,
    pub syntactic_hash: Option<ContentHash>,
    pub dag_spec: DagSpec,
    pub module_factories: BTreeMap<NodeId, Arc<dyn ModuleFactory>>,
}

/// The subset of `PipelineImage` that's actually written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPipelineImage {
    pub structural_hash: String,
    pub syntactic_hash: Option<String>,
    pub dag_spec: DagSpec,
}

impl PipelineImage {
    /// Build an image from a `DagSpec`, computing its structural hash as
    /// SHA-256 over the canonical serialization of the dag plus the sorted
    /// module factory identifiers actually wired into it.
    pub fn new(
        dag_spec: DagSpec,
        syntactic_hash: Option<ContentHash>,
        registry: &ModuleRegistry,
    ) -> Result<Self, ConstellationError> {
        dag_spec.validate()?;
        let module_factories = registry.init_modules(&dag_spec)?;

        let mut module_names: Vec<&str> = dag_spec.nodes.values().map(|n| n.module_name.as_str()).collect();
        module_names.sort_unstable();
        let dag_json = serde_json::to_value(&dag_spec)?;
        let mut hasher_input = crate::content_hash::canonical_json(&dag_json);
        hasher_input.push('|');
        hasher_input.push_str(&module_names.join(","));
        let structural_hash = ContentHash::from_bytes(hasher_input.as_bytes());

        Ok(Self { structural_hash, syntactic_hash, dag_spec, module_factories })
    }

    pub fn to_persisted(&self) -> PersistedPipelineImage {
        PersistedPipelineImage {
            structural_hash: self.structural_hash.to_hex(),
            syntactic_hash: self.syntactic_hash.as_ref().map(ContentHash::to_hex),
            dag_spec: self.dag_spec.clone(),
        }
    }

    /// Rehydrate from a persisted form, re-resolving module factories
    /// against a (possibly newer) registry.
    pub fn from_persisted(
        persisted: PersistedPipelineImage,
        registry: &ModuleRegistry,
    ) -> Result<Self, ConstellationError> {
        let structural_hash = ContentHash::from_hex(&persisted.structural_hash)?;
        let syntactic_hash = persisted.syntactic_hash.as_deref().map(ContentHash::from_hex).transpose()?;
        let module_factories = registry.init_modules(&persisted.dag_spec)?;
        Ok(Self {
            structural_hash,
            syntactic_hash,
            dag_spec: persisted.dag_spec,
            module_factories,
        })
    }
}

/// `{ loadedPipeline: dagSpec-ish, warnings }` — what the compiler emits.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    pub dag_spec: DagSpec,
    pub warnings: Vec<String>,
}

/// `{ loadedPipeline, warnings }` — cached compile result. Holds no
/// closures itself (the reference compiler returns plain data), but is
/// treated as in-memory-only per spec.md §4.5/§9 since a real compiler's
/// `LoadedPipeline` may carry closures.
#[derive(Debug, Clone)]
pub struct CompilationOutput {
    pub loaded_pipeline: LoadedPipeline,
    pub warnings: Vec<String>,
}

/// External collaborator: turns source text into a `LoadedPipeline`.
/// The real implementation (parser/type checker/IR optimizer) is out of
/// scope; this crate ships only [`ToyCompiler`].
#[async_trait]
pub trait PipelineCompiler: Send + Sync {
    async fn compile(&self, source: &str) -> Result<LoadedPipeline, ConstellationError>;
}

/// A minimal reference compiler for the toy surface syntax used in the
/// spec's E1/E2 scenarios:
///
/// ```text
/// in name:Type
/// out name = expr
/// name = expr
/// ```
///
/// Where `expr` is either `moduleName(arg1, arg2, ...)` (arguments are
/// input or node names) or a bare name (an alias for an input/node).
/// `Type` is one of `Int64`, `Float64`, `Bool`, `String`, `Bytes`.
pub struct ToyCompiler {
    registry: Arc<ModuleRegistry>,
}

impl ToyCompiler {
    /// `registry` resolves each call expression's declared parameter
    /// names, so `add(a, b)` wires its positional arguments to module
    /// `std.add`'s actual `("a", "b")` signature rather than an opaque
    /// `arg0`/`arg1`, which a real module instance would not recognize.
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PipelineCompiler for ToyCompiler {
    async fn compile(&self, source: &str) -> Result<LoadedPipeline, ConstellationError> {
        let mut inputs: Vec<(String, CType)> = Vec::new();
        let mut nodes: BTreeMap<NodeId, DagNode> = BTreeMap::new();
        let mut outputs: BTreeMap<String, OutputRef> = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut alias_targets: BTreeMap<String, OutputRef> = BTreeMap::new();

        for (line_no, raw_line) in source.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("in ") {
                let (name, ty) = parse_input_decl(rest).map_err(|msg| compile_err(line_no, msg))?;
                inputs.push((name, ty));
                continue;
            }
            if let Some(rest) = line.strip_prefix("out ") {
                let (name, expr) = split_assignment(rest).map_err(|msg| compile_err(line_no, msg))?;
                let node_id = parse_expr_into_node(&name, expr, &mut nodes, &alias_targets, &self.registry)
                    .map_err(|msg| compile_err(line_no, msg))?;
                outputs.insert(name, node_id);
                continue;
            }
            let (name, expr) = split_assignment(line).map_err(|msg| compile_err(line_no, msg))?;
            let out_ref = parse_expr_into_node(&name, expr, &mut nodes, &alias_targets, &self.registry)
                .map_err(|msg| compile_err(line_no, msg))?;
            alias_targets.insert(name, out_ref);
        }

        if outputs.is_empty() {
            warnings.push("pipeline declares no `out` statement".to_string());
        }

        let dag_spec = DagSpec { inputs, nodes, outputs };
        dag_spec.validate()?;
        Ok(LoadedPipeline { dag_spec, warnings })
    }
}

fn compile_err(line_no: usize, msg: String) -> ConstellationError {
    ConstellationError::CompileError {
        messages: vec![crate::error::CompileMessage { line: line_no as u32 + 1, col: 0, msg }],
    }
}

fn parse_input_decl(rest: &str) -> Result<(String, CType), String> {
    let mut parts = rest.splitn(2, ':');
    let name = parts.next().ok_or_else(|| "expected `in name:Type`".to_string())?.trim().to_string();
    let ty_str = parts.next().ok_or_else(|| "expected `in name:Type`".to_string())?.trim();
    let ty = parse_type(ty_str)?;
    Ok((name, ty))
}

fn parse_type(s: &str) -> Result<CType, String> {
    match s {
        "Int64" => Ok(CType::Int64),
        "Float64" => Ok(CType::Float64),
        "Bool" => Ok(CType::Bool),
        "String" => Ok(CType::String),
        "Bytes" => Ok(CType::Bytes),
        other => Err(format!("unknown type `{other}`")),
    }
}

fn split_assignment(line: &str) -> Result<(String, &str), String> {
    let mut parts = line.splitn(2, '=');
    let name = parts.next().ok_or_else(|| "expected `name = expr`".to_string())?.trim().to_string();
    let expr = parts.next().ok_or_else(|| "expected `name = expr`".to_string())?.trim();
    Ok((name, expr))
}

/// Parse a call expression `module(arg1, arg2)` (or a bare name alias) into
/// a freshly-allocated node (or a reference to an existing alias/input),
/// returning the `OutputRef` callers should use.
///
/// Positional arguments are bound to the callee's *declared* parameter
/// names (looked up in `registry`), not a positional placeholder, since
/// `ModuleInstance::invoke` looks values up by the module's own parameter
/// names (e.g. `std.add`'s `"a"`/`"b"`): wiring `arg0`/`arg1` instead would
/// silently compile but every invocation would fail to find its inputs.
/// An unregistered callee falls back to positional `arg{i}` names so the
/// error surfaces as the expected `InvalidDag` at `PipelineImage::new`
/// rather than here.
fn parse_expr_into_node(
    binding_name: &str,
    expr: &str,
    nodes: &mut BTreeMap<NodeId, DagNode>,
    alias_targets: &BTreeMap<String, OutputRef>,
    registry: &ModuleRegistry,
) -> Result<OutputRef, String> {
    if let Some(open) = expr.find('(') {
        if !expr.ends_with(')') {
            return Err(format!("unterminated call in `{expr}`"));
        }
        let module_name = format!("std.{}", expr[..open].trim());
        let args_str = &expr[open + 1..expr.len() - 1];
        let param_names = registry.get(&module_name).map(|f| {
            f.input_params().iter().map(|(name, _)| name.clone()).collect::<Vec<_>>()
        });
        let mut input_map = BTreeMap::new();
        for (i, arg) in args_str.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
            let input_ref = resolve_name_ref(arg, nodes, alias_targets);
            let param_name = param_names
                .as_ref()
                .and_then(|names| names.get(i).cloned())
                .unwrap_or_else(|| format!("arg{i}"));
            input_map.insert(param_name, input_ref);
        }
        let node_id = format!("n_{binding_name}");
        nodes.insert(node_id.clone(), DagNode { module_name, inputs: input_map });
        Ok(OutputRef::NodeOutput(node_id))
    } else {
        // Bare-name alias: resolve directly without allocating a node.
        Ok(match resolve_name_ref(expr, nodes, alias_targets) {
            InputRef::PipelineInput(name) => OutputRef::PipelineInput(name),
            InputRef::NodeOutput(node_id) => OutputRef::NodeOutput(node_id),
        })
    }
}

fn resolve_name_ref(
    name: &str,
    nodes: &BTreeMap<NodeId, DagNode>,
    alias_targets: &BTreeMap<String, OutputRef>,
) -> InputRef {
    if let Some(alias) = alias_targets.get(name) {
        return match alias {
            OutputRef::NodeOutput(n) => InputRef::NodeOutput(n.clone()),
            OutputRef::PipelineInput(n) => InputRef::PipelineInput(n.clone()),
        };
    }
    let candidate_node = format!("n_{name}");
    if nodes.contains_key(&candidate_node) {
        InputRef::NodeOutput(candidate_node)
    } else {
        InputRef::PipelineInput(name.to_string())
    }
}

/// Hash the full `CValue` input map for cache-key / module-signature
/// comparisons (used by the compile cache and by module signature checks).
pub fn hash_inputs(inputs: &BTreeMap<String, crate::value::CValue>) -> Result<ContentHash, ConstellationError> {
    hash_canonical(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_compiler() -> ToyCompiler {
        let registry = Arc::new(ModuleRegistry::new());
        crate::module::builtins::register_all(&registry);
        ToyCompiler::new(registry)
    }

    #[tokio::test]
    async fn toy_compiler_handles_e1_scenario() {
        let compiler = toy_compiler();
        let source = "in a:Int64\nin b:Int64\nout r = add(a,b)";
        let loaded = compiler.compile(source).await.unwrap();
        assert_eq!(loaded.dag_spec.inputs.len(), 2);
        assert_eq!(loaded.dag_spec.nodes.len(), 1);
        assert!(loaded.dag_spec.outputs.contains_key("r"));
        let node = loaded.dag_spec.nodes.values().next().unwrap();
        assert_eq!(node.inputs.get("a"), Some(&InputRef::PipelineInput("a".to_string())));
        assert_eq!(node.inputs.get("b"), Some(&InputRef::PipelineInput("b".to_string())));
    }

    #[tokio::test]
    async fn toy_compiler_handles_e2_scenario() {
        let compiler = toy_compiler();
        let source = "in userId:String\nin approval:Bool\nu = GetUser(userId)\nout user = when(u, approval)";
        let loaded = compiler.compile(source).await.unwrap();
        assert_eq!(loaded.dag_spec.nodes.len(), 2);
        assert!(loaded.dag_spec.outputs.contains_key("user"));
        let when_node = loaded.dag_spec.nodes.get("n_user").unwrap();
        assert_eq!(when_node.inputs.get("value"), Some(&InputRef::NodeOutput("n_u".to_string())));
        assert_eq!(when_node.inputs.get("cond"), Some(&InputRef::PipelineInput("approval".to_string())));
    }

    #[tokio::test]
    async fn toy_compiler_rejects_unknown_type() {
        let compiler = toy_compiler();
        let err = compiler.compile("in a:NotAType\nout r = a").await.unwrap_err();
        assert_eq!(err.kind(), "CompileError");
    }

    #[test]
    fn pipeline_image_structural_hash_stable_under_rebuild() {
        let registry = ModuleRegistry::new();
        crate::module::builtins::register_all(&registry);
        let dag = DagSpec {
            inputs: vec![("a".to_string(), CType::Int64), ("b".to_string(), CType::Int64)],
            nodes: BTreeMap::from([(
                "n1".to_string(),
                DagNode {
                    module_name: "std.add".to_string(),
                    inputs: BTreeMap::from([
                        ("a".to_string(), InputRef::PipelineInput("a".to_string())),
                        ("b".to_string(), InputRef::PipelineInput("b".to_string())),
                    ]),
                },
            )]),
            outputs: BTreeMap::from([("r".to_string(), OutputRef::NodeOutput("n1".to_string()))]),
        };
        let image1 = PipelineImage::new(dag.clone(), None, &registry).unwrap();
        let image2 = PipelineImage::new(dag, None, &registry).unwrap();
        assert_eq!(image1.structural_hash, image2.structural_hash);
    }
}

//! Modules: the typed, named computations a `DagSpec` wires together.
//!
//! A [`ModuleFactory`] is a polymorphic, cloneable description of a module
//! (`Uninitialized` in the spec's vocabulary); `instantiate` produces a
//! [`ModuleInstance`] bound to an execution context, which `invoke`s with a
//! parameter map to produce a value.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConstellationError;
use crate::value::{CType, CValue};

/// Per-execution context handed to a module at instantiation time.
///
/// Kept intentionally small today (just the node id, for error
/// attribution); the type exists so module signatures don't need to change
/// when the runtime needs to thread more through later (cancellation
/// tokens, deadlines) — those are passed to `invoke` directly instead, to
/// keep `ModuleInstance` object-safe.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub node_id: String,
}

/// A running module instance, bound to one node of one execution.
#[async_trait]
pub trait ModuleInstance: Send + Sync {
    async fn invoke(&self, params: BTreeMap<String, CValue>) -> Result<CValue, ConstellationError>;
}

/// A factory describing a module's signature and producing instances of it.
#[async_trait]
pub trait ModuleFactory: Send + Sync {
    /// The module's fully-qualified name (`ns.Name`).
    fn name(&self) -> &str;

    /// Declared input parameters, in declaration order.
    fn input_params(&self) -> &[(String, CType)];

    /// Declared output type.
    fn output_type(&self) -> &CType;

    /// Produce a bound instance for one execution.
    async fn instantiate(&self, ctx: ExecutionContext) -> Result<Arc<dyn ModuleInstance>, ConstellationError>;
}

/// Name-indexed registry of module factories.
///
/// Registration rule (spec.md §4.3): insert the full name verbatim, then
/// for each "short name" form (the part after the last `.`), insert only
/// if not already present — first-registered wins, which keeps short-name
/// resolution stable across later registrations that happen to collide.
pub struct ModuleRegistry {
    factories: dashmap::DashMap<String, Arc<dyn ModuleFactory>>,
    short_names: dashmap::DashMap<String, String>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            factories: dashmap::DashMap::new(),
            short_names: dashmap::DashMap::new(),
        }
    }

    /// Register a module factory under its full name, and its short name if
    /// not already claimed.
    pub fn register(&self, factory: Arc<dyn ModuleFactory>) {
        let full_name = factory.name().to_string();
        if let Some(short) = full_name.rsplit('.').next() {
            if short != full_name {
                self.short_names.entry(short.to_string()).or_insert_with(|| full_name.clone());
            }
        }
        self.factories.insert(full_name, factory);
    }

    /// Resolve a name: exact match first, then the stripped short-name
    /// index.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ModuleFactory>> {
        if let Some(factory) = self.factories.get(name) {
            return Some(factory.clone());
        }
        let full_name = self.short_names.get(name)?;
        self.factories.get(full_name.as_str()).map(|f| f.clone())
    }

    /// Resolve every `node.moduleName` in a `DagSpec`, failing if any
    /// module is unregistered.
    pub fn init_modules(
        &self,
        dag: &crate::dag::DagSpec,
    ) -> Result<BTreeMap<crate::dag::NodeId, Arc<dyn ModuleFactory>>, ConstellationError> {
        let mut out = BTreeMap::new();
        for (node_id, node) in &dag.nodes {
            let factory = self.get(&node.module_name).ok_or_else(|| {
                ConstellationError::InvalidDag(format!(
                    "node `{node_id}` references unregistered module `{}`",
                    node.module_name
                ))
            })?;
            out.insert(node_id.clone(), factory);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// A small standard library of demonstration modules, sufficient to run the
/// spec's own E1/E2 scenarios end to end without an external compiler.
pub mod builtins {
    use super::*;

    struct SimpleFactory {
        name: String,
        input_params: Vec<(String, CType)>,
        output_type: CType,
        invoke: fn(&BTreeMap<String, CValue>) -> Result<CValue, ConstellationError>,
    }

    struct SimpleInstance {
        invoke: fn(&BTreeMap<String, CValue>) -> Result<CValue, ConstellationError>,
        node_id: String,
    }

    #[async_trait]
    impl ModuleInstance for SimpleInstance {
        async fn invoke(&self, params: BTreeMap<String, CValue>) -> Result<CValue, ConstellationError> {
            (self.invoke)(&params).map_err(|e| match e {
                ConstellationError::ModuleFailure { .. } => e,
                other => ConstellationError::ModuleFailure {
                    node_id: self.node_id.clone(),
                    cause: other.to_string(),
                },
            })
        }
    }

    #[async_trait]
    impl ModuleFactory for SimpleFactory {
        fn name(&self) -> &str {
            &self.name
        }

        fn input_params(&self) -> &[(String, CType)] {
            &self.input_params
        }

        fn output_type(&self) -> &CType {
            &self.output_type
        }

        async fn instantiate(&self, ctx: ExecutionContext) -> Result<Arc<dyn ModuleInstance>, ConstellationError> {
            Ok(Arc::new(SimpleInstance { invoke: self.invoke, node_id: ctx.node_id }))
        }
    }

    fn add(params: &BTreeMap<String, CValue>) -> Result<CValue, ConstellationError> {
        let a = expect_int(params, "a")?;
        let b = expect_int(params, "b")?;
        Ok(CValue::Int64(a + b))
    }

    fn get_user(params: &BTreeMap<String, CValue>) -> Result<CValue, ConstellationError> {
        let user_id = expect_string(params, "userId")?;
        let mut record = BTreeMap::new();
        record.insert("id".to_string(), CValue::String(user_id.clone()));
        record.insert("name".to_string(), CValue::String(format!("User-{user_id}")));
        Ok(CValue::Map(record))
    }

    fn when(params: &BTreeMap<String, CValue>) -> Result<CValue, ConstellationError> {
        let cond = match params.get("cond") {
            Some(CValue::Bool(b)) => *b,
            _ => false,
        };
        if cond {
            Ok(params.get("value").cloned().unwrap_or(CValue::Null))
        } else {
            Ok(CValue::Null)
        }
    }

    fn expect_int(params: &BTreeMap<String, CValue>, name: &str) -> Result<i64, ConstellationError> {
        match params.get(name) {
            Some(CValue::Int64(v)) => Ok(*v),
            other => Err(ConstellationError::TypeMismatch {
                name: name.to_string(),
                expected: "Int64".to_string(),
                actual: other.map(CValue::infer_type).unwrap_or(CType::Null).to_string(),
            }),
        }
    }

    fn expect_string(params: &BTreeMap<String, CValue>, name: &str) -> Result<String, ConstellationError> {
        match params.get(name) {
            Some(CValue::String(v)) => Ok(v.clone()),
            other => Err(ConstellationError::TypeMismatch {
                name: name.to_string(),
                expected: "String".to_string(),
                actual: other.map(CValue::infer_type).unwrap_or(CType::Null).to_string(),
            }),
        }
    }

    /// Register the builtin module set into a registry.
    pub fn register_all(registry: &ModuleRegistry) {
        registry.register(Arc::new(SimpleFactory {
            name: "std.add".to_string(),
            input_params: vec![("a".to_string(), CType::Int64), ("b".to_string(), CType::Int64)],
            output_type: CType::Int64,
            invoke: add,
        }));
        registry.register(Arc::new(SimpleFactory {
            name: "std.GetUser".to_string(),
            input_params: vec![("userId".to_string(), CType::String)],
            output_type: CType::Record(BTreeMap::from([
                ("id".to_string(), CType::String),
                ("name".to_string(), CType::String),
            ])),
            invoke: get_user,
        }));
        registry.register(Arc::new(SimpleFactory {
            name: "std.when".to_string(),
            input_params: vec![("value".to_string(), CType::Null), ("cond".to_string(), CType::Bool)],
            output_type: CType::Null,
            invoke: when,
        }));
    }
}

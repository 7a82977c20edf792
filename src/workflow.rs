//! Workflows: a DAG of cacheable operations
//!
//! A [`Workflow`] is grown with [`Workflow::first`], [`Workflow::link`] and
//! [`Workflow::last`], evaluated with [`Workflow::run`] (or stepwise with
//! [`Workflow::step`] / [`Workflow::upto`]), persisted with
//! [`Workflow::marshal`], and brought up to date with a revised definition
//! through [`Workflow::sync`], which keeps every cached result the revision
//! did not affect.
//!
//! Evaluation takes `&self`, so independent branches can be driven
//! concurrently. `sync` takes `&mut self` and therefore cannot overlap with
//! an evaluation in flight.

use crate::dag::Dag;
use crate::error::{FlowError, Result};
use crate::function::{Callable, FunctionRegistry};
use crate::models::{
    decode_validated, decode_value, encode_value, GraphSnapshot, WorkflowSnapshot,
};
use crate::operation::Operation;
use crate::shape::ShapeError;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of [`Workflow::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Validation::Valid => None,
            Validation::Invalid(message) => Some(message),
        }
    }
}

/// Outcome of [`Workflow::step`]
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// One operation was evaluated
    Evaluated { id: String, output: Value },
    /// Every operation was already done
    Idle,
}

/// Read-only view of a workflow's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInspection {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
    pub sources: Vec<String>,
    pub sinks: Vec<String>,
    pub operations: Vec<OperationInspection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationInspection {
    pub id: String,
    pub function_id: String,
    pub hash: String,
    pub done: bool,
    pub input_hash: Option<String>,
}

/// A DAG of operations plus its topology
pub struct Workflow<C = ()> {
    dag: Dag,
    operations: IndexMap<String, Arc<Operation<C>>>,
}

impl<C> Workflow<C> {
    pub fn new() -> Self {
        Self {
            dag: Dag::new(),
            operations: IndexMap::new(),
        }
    }

    /// Add the source operation
    ///
    /// Fails if `id` is taken or the workflow already has a source.
    pub fn first(
        &mut self,
        id: impl Into<String>,
        callable: impl Callable<C> + 'static,
    ) -> Result<Arc<Operation<C>>> {
        let id = id.into();
        self.ensure_vacant(&id)?;
        if let Some(source) = self.dag.sources().first() {
            return Err(FlowError::FailedWorkflowAction(format!(
                "Cannot add source '{}': source node '{}' already exists",
                id, source
            )));
        }

        self.dag.add_node(&id);
        Ok(self.register(Operation::new(id, callable)))
    }

    /// Add an operation fed by `inputs`
    ///
    /// Source and sink counts are not checked here; [`Workflow::validate`]
    /// catches a workflow left with several.
    pub fn link(
        &mut self,
        inputs: &[&Arc<Operation<C>>],
        id: impl Into<String>,
        callable: impl Callable<C> + 'static,
    ) -> Result<Arc<Operation<C>>> {
        let id = id.into();
        self.ensure_vacant(&id)?;
        for input in inputs {
            if !self.dag.has_node(input.id()) {
                return Err(FlowError::FailedWorkflowAction(format!(
                    "Input operation '{}' of '{}' is not part of this workflow",
                    input.id(),
                    id
                )));
            }
        }

        self.dag.add_node(&id);
        for input in inputs {
            self.dag.add_edge(input.id(), &id)?;
        }
        Ok(self.register(Operation::new(id, callable)))
    }

    /// Same as [`Workflow::link`]; marks the caller's intent to end the graph
    ///
    /// Nothing stops further operations from being linked downstream of the
    /// result, which leaves more than one sink and fails validation.
    pub fn last(
        &mut self,
        inputs: &[&Arc<Operation<C>>],
        id: impl Into<String>,
        callable: impl Callable<C> + 'static,
    ) -> Result<Arc<Operation<C>>> {
        self.link(inputs, id, callable)
    }

    fn ensure_vacant(&self, id: &str) -> Result<()> {
        if self.dag.has_node(id) || self.operations.contains_key(id) {
            return Err(FlowError::FailedWorkflowAction(format!(
                "Node '{}' already exists",
                id
            )));
        }
        Ok(())
    }

    fn register(&mut self, operation: Operation<C>) -> Arc<Operation<C>> {
        debug!("Registered operation '{}'", operation.id());
        let operation = Arc::new(operation);
        self.operations
            .insert(operation.id().to_string(), Arc::clone(&operation));
        operation
    }

    /// Check structure, reporting the first failing rule
    pub fn validate(&self) -> Validation {
        let sources = self.dag.sources();
        if sources.len() != 1 {
            return Validation::Invalid(format!(
                "Workflow must have exactly one source node, found {}",
                sources.len()
            ));
        }

        let sinks = self.dag.sinks();
        if sinks.len() != 1 {
            return Validation::Invalid(format!(
                "Workflow must have exactly one sink node, found {}",
                sinks.len()
            ));
        }

        if !self.dag.is_acyclic() {
            let cycle = self
                .dag
                .find_cycle()
                .unwrap_or_else(|| "unknown".to_string());
            return Validation::Invalid(format!("Workflow graph contains a cycle: {}", cycle));
        }

        if let Some(id) = self.operations.keys().find(|id| !self.dag.has_node(id)) {
            return Validation::Invalid(format!(
                "Operation '{}' has no corresponding graph node",
                id
            ));
        }

        if let Some(id) = self
            .dag
            .nodes()
            .into_iter()
            .find(|id| !self.operations.contains_key(id))
        {
            return Validation::Invalid(format!(
                "Graph node '{}' has no corresponding operation",
                id
            ));
        }

        let mut seen = HashSet::with_capacity(self.operations.len());
        for (key, operation) in &self.operations {
            if key != operation.id() || !seen.insert(operation.id()) {
                return Validation::Invalid(format!(
                    "Duplicate operation id '{}'",
                    operation.id()
                ));
            }
        }

        Validation::Valid
    }

    pub fn operation(&self, id: &str) -> Option<Arc<Operation<C>>> {
        self.operations.get(id).cloned()
    }

    /// Operations in insertion order
    pub fn operations(&self) -> impl Iterator<Item = &Arc<Operation<C>>> {
        self.operations.values()
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Evaluate one operation from its upstream outputs
    ///
    /// A source operation is fed `input`, which must be present. Any other
    /// operation is fed an object mapping each upstream id to that
    /// operation's cached value, and every upstream must be done.
    pub async fn eval(&self, id: &str, ctx: &C, input: Option<Value>) -> Result<Value> {
        let upstream = self.dag.dependencies(id)?;
        let operation = self.require_operation(id)?;

        let input = if upstream.is_empty() {
            input.ok_or_else(|| {
                FlowError::FailedWorkflowAction(format!(
                    "Source operation '{}' requires an input",
                    id
                ))
            })?
        } else {
            let mut composite = Map::new();
            for upstream_id in upstream {
                let dependency = self.require_operation(&upstream_id)?;
                if !dependency.done() {
                    return Err(FlowError::FailedWorkflowAction(format!(
                        "Upstream operation '{}' of '{}' has not been evaluated",
                        upstream_id, id
                    )));
                }
                let value = dependency.value()?;
                composite.insert(upstream_id, value);
            }
            Value::Object(composite)
        };

        debug!("Evaluating operation '{}'", id);
        operation.eval(ctx, input).await.map_err(|source| {
            error!("Operation '{}' failed: {}", id, source);
            FlowError::OperationFailed {
                id: id.to_string(),
                source,
            }
        })
    }

    /// Evaluate the first operation in topological order that is not done
    ///
    /// The order is recomputed on every call.
    pub async fn step(&self, ctx: &C, input: Option<Value>) -> Result<Step> {
        for id in self.dag.topological_sort()? {
            if !self.require_operation(&id)?.done() {
                let output = self.eval(&id, ctx, input).await?;
                return Ok(Step::Evaluated { id, output });
            }
        }
        Ok(Step::Idle)
    }

    /// Evaluate `id` and everything it depends on, returning its output
    ///
    /// With `id` of `None` the unique sink is targeted.
    pub async fn upto(&self, id: Option<&str>, ctx: &C, input: Option<Value>) -> Result<Value> {
        let target = match id {
            Some(id) => id.to_string(),
            None => self.unique_sink()?,
        };

        let required: HashSet<String> = self.required_nodes(&target)?.into_iter().collect();
        let order = self.dag.topological_sort()?;

        for node in order.into_iter().filter(|node| required.contains(node)) {
            let output = self.eval(&node, ctx, input.clone()).await?;
            if node == target {
                return Ok(output);
            }
        }

        Err(FlowError::UnexpectedEmptyValue(format!(
            "Operation '{}' was not reached",
            target
        )))
    }

    /// Validate, then evaluate through the sink
    pub async fn run(&self, ctx: &C, input: Value) -> Result<Value> {
        if let Validation::Invalid(message) = self.validate() {
            warn!("Refusing to run invalid workflow: {}", message);
            return Err(FlowError::FailedWorkflowAction(message));
        }

        info!("Running workflow with {} operations", self.operations.len());
        let output = self.upto(None, ctx, Some(input)).await?;
        info!("Workflow run completed");
        Ok(output)
    }

    /// Whether the source already holds a result for `input`
    pub fn test(&self, input: &Value) -> Result<bool> {
        let source = self.unique_source()?;
        Ok(self.require_operation(&source)?.test(input))
    }

    /// `id` followed by all of its ancestors, walked backwards edge by edge
    ///
    /// Shared ancestors are listed once per path reaching them. The list is
    /// only used for membership tests.
    fn required_nodes(&self, id: &str) -> Result<Vec<String>> {
        let mut required = Vec::new();
        let mut pending = vec![id.to_string()];
        while let Some(node) = pending.pop() {
            pending.extend(self.dag.dependencies(&node)?);
            required.push(node);
        }
        Ok(required)
    }

    fn unique_source(&self) -> Result<String> {
        exactly_one(self.dag.sources(), "source")
    }

    fn unique_sink(&self) -> Result<String> {
        exactly_one(self.dag.sinks(), "sink")
    }

    fn require_operation(&self, id: &str) -> Result<Arc<Operation<C>>> {
        self.operation(id).ok_or_else(|| {
            FlowError::UnexpectedEmptyValue(format!("Operation '{}' is not registered", id))
        })
    }

    pub fn marshal(&self) -> Result<WorkflowSnapshot> {
        let graph = serde_json::to_value(self.dag.to_snapshot())
            .map_err(|e| FlowError::SerializationFailed(format!("graph export failed: {}", e)))?;

        Ok(WorkflowSnapshot {
            graph: encode_value(&graph),
            operations: self.operations.values().map(|op| op.marshal()).collect(),
        })
    }

    /// Validate a raw snapshot value, then restore it against `registry`
    pub fn unmarshal(data: Value, registry: &FunctionRegistry<C>) -> Result<Self> {
        let snapshot: WorkflowSnapshot = decode_validated(data, &WorkflowSnapshot::shape())?;
        Self::from_snapshot(&snapshot, registry)
    }

    pub fn from_snapshot(snapshot: &WorkflowSnapshot, registry: &FunctionRegistry<C>) -> Result<Self> {
        let graph: GraphSnapshot = decode_validated(
            decode_value("$.graph", &snapshot.graph)?,
            &GraphSnapshot::shape(),
        )?;
        let dag = Dag::from_snapshot(&graph)?;

        let mut operations = IndexMap::with_capacity(snapshot.operations.len());
        for (index, op_snapshot) in snapshot.operations.iter().enumerate() {
            if operations.contains_key(&op_snapshot.id) {
                return Err(FlowError::ValueValidationFailed {
                    errors: vec![ShapeError::new(
                        format!("$.operations[{}].id", index),
                        format!("duplicate operation id '{}'", op_snapshot.id),
                    )],
                });
            }
            let operation =
                Operation::restore(op_snapshot, registry, &format!("$.operations[{}]", index))?;
            operations.insert(op_snapshot.id.clone(), Arc::new(operation));
        }

        info!(
            "Restored workflow with {} operations ({} cached)",
            operations.len(),
            operations.values().filter(|op| op.done()).count()
        );
        Ok(Self { dag, operations })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.marshal()?)
            .map_err(|e| FlowError::SerializationFailed(e.to_string()))
    }

    pub fn from_json(text: &str, registry: &FunctionRegistry<C>) -> Result<Self> {
        let data: Value = serde_json::from_str(text)
            .map_err(|e| FlowError::invalid("$", format!("invalid JSON: {}", e)))?;
        Self::unmarshal(data, registry)
    }

    /// Callables of this workflow keyed by function id
    pub fn registry(&self) -> FunctionRegistry<C> {
        let mut registry = FunctionRegistry::new();
        for operation in self.operations.values() {
            let func = operation.func();
            registry.register_shared(func.id(), func.callable());
        }
        registry
    }

    /// Deep, independent copy made by marshalling through the own registry
    pub fn try_clone(&self) -> Result<Self> {
        Self::from_snapshot(&self.marshal()?, &self.registry())
    }

    /// Adopt the structure and logic of `new`, keeping still-valid caches
    ///
    /// The topology of `new` replaces the current one. For each operation of
    /// `new`, in its order:
    /// - an id unknown here is added as-is;
    /// - an id whose function hash changed is replaced, and it plus
    ///   everything downstream of it in the *old* graph is cleared;
    /// - an unchanged id keeps the existing operation and its cache.
    ///
    /// Operations missing from `new` are dropped. An operation whose hash is
    /// unchanged keeps its cache even if its upstream edges changed; the next
    /// evaluation recomputes it once its input hash differs.
    ///
    /// Nothing is modified when an error is returned.
    pub fn sync(&mut self, new: Workflow<C>) -> Result<()> {
        let Workflow {
            dag: new_dag,
            operations: new_operations,
        } = new;

        let mut working = self.operations.clone();
        let mut invalidated: Vec<Arc<Operation<C>>> = Vec::new();
        let (mut added, mut replaced, mut removed) = (0, 0, 0);

        for (id, new_operation) in &new_operations {
            match self.operations.get(id) {
                None => {
                    working.insert(id.clone(), Arc::clone(new_operation));
                    added += 1;
                }
                Some(old_operation) if old_operation.hash() != new_operation.hash() => {
                    working.insert(id.clone(), Arc::clone(new_operation));
                    replaced += 1;

                    if !self.dag.has_node(id) {
                        return Err(FlowError::UnexpectedEmptyValue(format!(
                            "Operation '{}' has no node in the current graph",
                            id
                        )));
                    }
                    for downstream in self.dag.preorder(&[id.as_str()])? {
                        if let Some(operation) = working.get(&downstream) {
                            invalidated.push(Arc::clone(operation));
                        }
                    }
                }
                Some(_) => {}
            }
        }

        for id in self.operations.keys() {
            if !new_operations.contains_key(id) {
                working.shift_remove(id);
                removed += 1;
            }
        }

        for operation in &invalidated {
            operation.clear();
        }
        self.dag = new_dag;
        self.operations = working;

        info!(
            "Synced workflow: {} added, {} replaced, {} removed, {} invalidated",
            added,
            replaced,
            removed,
            invalidated.len()
        );
        Ok(())
    }

    /// Owned snapshot of topology and cache state
    pub fn inspect(&self) -> WorkflowInspection {
        WorkflowInspection {
            nodes: self.dag.nodes(),
            edges: self.dag.edges(),
            sources: self.dag.sources(),
            sinks: self.dag.sinks(),
            operations: self
                .operations
                .values()
                .map(|op| OperationInspection {
                    id: op.id().to_string(),
                    function_id: op.func().id().to_string(),
                    hash: op.hash().to_string(),
                    done: op.done(),
                    input_hash: op.input_hash(),
                })
                .collect(),
        }
    }
}

fn exactly_one(mut nodes: Vec<String>, role: &str) -> Result<String> {
    if nodes.len() != 1 {
        return Err(FlowError::FailedWorkflowAction(format!(
            "Workflow must have exactly one {} node, found {}",
            role,
            nodes.len()
        )));
    }
    nodes.pop().ok_or_else(|| {
        FlowError::UnexpectedEmptyValue(format!("{} node list is empty", role))
    })
}

impl<C> Default for Workflow<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Workflow<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("dag", &self.dag)
            .field("operations", &self.operations)
            .finish()
    }
}

//! Workflow graph model.
//!
//! A [`Graph`] is an ordered set of [`Node`]s and [`Edge`]s. Every node
//! declares named [`OutcomeSlot`]s; every declared slot must have exactly
//! one outgoing edge, and every edge must originate from a declared slot.
//! Validation happens when a [`RuntimeGraph`] is built, before anything
//! executes.
//!
//! Nodes carry the scheduling attributes shared by all executor types
//! (`skip`, `max_runs`, `message_mode`, `output_mode`, `confirmation`,
//! `reset_policy`) plus a flattened parameter map that each executor
//! deserializes into its own typed config.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{CoreError, Result};

/// Message sender role, aligned with the OpenAI chat roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Developer,
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Developer => "developer",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// How node confirmation is handled before a final response is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    /// Always request the user's approval.
    #[default]
    Manual,
    /// Automatically approve everything.
    Auto,
}

/// How executor state is handled when a node is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateResetPolicy {
    /// Start a fresh execution, linking back to the previous one.
    #[default]
    Reset,
    /// Keep the complete state from the previous run.
    Keep,
}

/// What the successor node receives as its input messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    /// Only the final executor message.
    #[default]
    FinalResponse,
    /// All complete messages of the source node, inputs included.
    AllMessages,
    /// A single synthetic message joining inputs and the final output.
    ConcatenateFinal,
}

/// How a step's output is presented in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Show,
    HideAll,
    HideFinal,
}

/// How an `llm` node communicates its outcome selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStrategy {
    /// A trailing `OUTCOME: <name>` line in the response text.
    #[default]
    Tag,
    /// A dedicated synthetic tool call.
    Function,
}

/// A named exit point on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSlot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OutcomeSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// Preprocessor reference applied to the LLM prompt before a request.
///
/// Accepts either a bare string (the preprocessor name) or a mapping with
/// `name`, optional `options`, `mode` and `prepend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PreprocessorSpecRepr")]
pub struct PreprocessorSpec {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
    #[serde(default = "default_preprocessor_mode")]
    pub mode: Role,
    #[serde(default)]
    pub prepend: bool,
}

fn default_preprocessor_mode() -> Role {
    Role::System
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PreprocessorSpecRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        options: serde_json::Map<String, Value>,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        prepend: bool,
    },
}

impl TryFrom<PreprocessorSpecRepr> for PreprocessorSpec {
    type Error = String;

    fn try_from(repr: PreprocessorSpecRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PreprocessorSpecRepr::Name(name) => {
                if name.is_empty() {
                    return Err("Preprocessor spec must include non-empty 'name'".into());
                }
                Ok(Self {
                    name,
                    options: Default::default(),
                    mode: Role::System,
                    prepend: false,
                })
            }
            PreprocessorSpecRepr::Full {
                name,
                options,
                mode,
                prepend,
            } => {
                if name.is_empty() {
                    return Err("Preprocessor spec must include non-empty 'name'".into());
                }
                let mode = match mode.as_deref() {
                    None => Role::System,
                    Some(m) => match m.trim().to_ascii_lowercase().as_str() {
                        "system" => Role::System,
                        "user" => Role::User,
                        _ => return Err("Preprocessor 'mode' must be 'system' or 'user'".into()),
                    },
                };
                Ok(Self {
                    name,
                    options,
                    mode,
                    prepend,
                })
            }
        }
    }
}

/// A workflow graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node name within the graph.
    pub name: String,
    /// Node type identifier resolved through the executor registry.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub outcomes: Vec<OutcomeSlot>,
    /// Skip executing this node; inputs pass through to the successor.
    #[serde(default)]
    pub skip: bool,
    /// Maximum executions within one runner session. `Some(0)` behaves like
    /// `skip = true`; `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub message_mode: ResultMode,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub confirmation: Confirmation,
    #[serde(default)]
    pub reset_policy: StateResetPolicy,
    /// Executor-specific parameters, deserialized by the executor itself.
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: node_type.into(),
            description: None,
            outcomes: Vec::new(),
            skip: false,
            max_runs: None,
            message_mode: ResultMode::default(),
            output_mode: OutputMode::default(),
            confirmation: Confirmation::default(),
            reset_policy: StateResetPolicy::default(),
            params: Default::default(),
        }
    }

    pub fn with_outcomes(mut self, outcomes: Vec<OutcomeSlot>) -> Self {
        self.outcomes = outcomes;
        self
    }

    pub fn with_confirmation(mut self, confirmation: Confirmation) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn with_message_mode(mut self, mode: ResultMode) -> Self {
        self.message_mode = mode;
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    /// Deserialize the flattened parameter map into an executor config.
    pub fn typed_params<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.params.clone())).map_err(|e| {
            CoreError::Configuration(format!(
                "invalid parameters for node '{}' of type '{}': {e}",
                self.name, self.node_type
            ))
        })
    }

    fn validate_outcomes(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for slot in &self.outcomes {
            if !seen.insert(slot.name.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate outcome slot names found in node '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

static EDGE_ALT_SYNTAX_RE: OnceLock<Regex> = OnceLock::new();

fn edge_alt_syntax_re() -> &'static Regex {
    EDGE_ALT_SYNTAX_RE.get_or_init(|| {
        Regex::new(
            r"^\s*([A-Za-z0-9_\-]+)\.([A-Za-z0-9_\-]+)\s*->\s*([A-Za-z0-9_\-]+)(?::([A-Za-z0-9_\-]+))?\s*$",
        )
        .unwrap()
    })
}

/// A directed edge `source_node.source_outcome -> target_node`.
///
/// The string shorthand `"n1.done -> n2"` (with an optional
/// `:reset`/`:keep` suffix) is accepted wherever an edge is deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "EdgeRepr")]
pub struct Edge {
    pub source_node: String,
    pub source_outcome: String,
    pub target_node: String,
    /// Optional reset policy override applied when traversing this edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_policy: Option<StateResetPolicy>,
}

impl Edge {
    pub fn new(
        source_node: impl Into<String>,
        source_outcome: impl Into<String>,
        target_node: impl Into<String>,
    ) -> Self {
        Self {
            source_node: source_node.into(),
            source_outcome: source_outcome.into(),
            target_node: target_node.into(),
            reset_policy: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EdgeRepr {
    Shorthand(String),
    Full {
        source_node: String,
        source_outcome: String,
        target_node: String,
        #[serde(default)]
        reset_policy: Option<StateResetPolicy>,
    },
}

impl TryFrom<EdgeRepr> for Edge {
    type Error = String;

    fn try_from(repr: EdgeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            EdgeRepr::Shorthand(s) => {
                let caps = edge_alt_syntax_re().captures(&s).ok_or_else(|| {
                    "Edge string must be '<source_node>.<source_outcome> -> \
                     <target_node>[:<reset_policy>]'"
                        .to_string()
                })?;
                let reset_policy = match caps.get(4).map(|m| m.as_str()) {
                    None => None,
                    Some("reset") => Some(StateResetPolicy::Reset),
                    Some("keep") => Some(StateResetPolicy::Keep),
                    Some(other) => return Err(format!("Unknown reset policy '{other}'")),
                };
                Ok(Edge {
                    source_node: caps[1].to_string(),
                    source_outcome: caps[2].to_string(),
                    target_node: caps[3].to_string(),
                    reset_policy,
                })
            }
            EdgeRepr::Full {
                source_node,
                source_outcome,
                target_node,
                reset_policy,
            } => Ok(Edge {
                source_node,
                source_outcome,
                target_node,
                reset_policy,
            }),
        }
    }
}

/// A workflow graph: nodes plus outcome-labeled edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Validate the graph shape.
    ///
    /// Checks, in order: unique node names, unique outcome slot names per
    /// node, edges referencing existing nodes and declared outcomes, at
    /// most one edge per `(source_node, source_outcome)` pair, and the
    /// exact correspondence between declared slots and edge keys.
    pub fn validate(&self) -> Result<()> {
        let mut node_names = std::collections::HashSet::new();
        for node in &self.nodes {
            if !node_names.insert(node.name.as_str()) {
                return Err(CoreError::Validation(
                    "Duplicate node names detected in graph.nodes".into(),
                ));
            }
            node.validate_outcomes()?;
        }

        let declared: std::collections::HashSet<(String, String)> = self
            .nodes
            .iter()
            .flat_map(|n| {
                n.outcomes
                    .iter()
                    .map(move |s| (n.name.clone(), s.name.clone()))
            })
            .collect();

        let mut edge_keys = std::collections::HashSet::new();
        for e in &self.edges {
            let source = self.node_by_name(&e.source_node).ok_or_else(|| {
                CoreError::Validation(format!(
                    "Edge source_node '{}' does not exist in graph.nodes",
                    e.source_node
                ))
            })?;
            if self.node_by_name(&e.target_node).is_none() {
                return Err(CoreError::Validation(format!(
                    "Edge target_node '{}' does not exist in graph.nodes",
                    e.target_node
                )));
            }
            if !source.outcomes.iter().any(|s| s.name == e.source_outcome) {
                return Err(CoreError::Validation(format!(
                    "Edge references unknown source_outcome '{}' on node '{}'",
                    e.source_outcome, e.source_node
                )));
            }
            if !edge_keys.insert((e.source_node.clone(), e.source_outcome.clone())) {
                return Err(CoreError::Validation(format!(
                    "Multiple edges found from the same outcome slot: node='{}', slot='{}'",
                    e.source_node, e.source_outcome
                )));
            }
        }

        let missing: Vec<_> = declared.difference(&edge_keys).collect();
        let extra: Vec<_> = edge_keys.difference(&declared).collect();
        if !missing.is_empty() || !extra.is_empty() {
            let mut msgs = Vec::new();
            if !missing.is_empty() {
                let mut items: Vec<String> =
                    missing.iter().map(|(n, s)| format!("{n}:{s}")).collect();
                items.sort();
                msgs.push(format!(
                    "Missing edges for declared outcome slots: {}",
                    items.join(", ")
                ));
            }
            if !extra.is_empty() {
                let mut items: Vec<String> =
                    extra.iter().map(|(n, s)| format!("{n}:{s}")).collect();
                items.sort();
                msgs.push(format!(
                    "Edges originate from undeclared outcome slots: {}",
                    items.join(", ")
                ));
            }
            return Err(CoreError::Validation(msgs.join("; ")));
        }

        Ok(())
    }
}

/// A validated graph with resolved outcome-to-target links.
///
/// The first node of the graph is the root; traversal starts there.
#[derive(Debug, Clone)]
pub struct RuntimeGraph {
    graph: Graph,
    children: HashMap<(String, String), String>,
}

impl RuntimeGraph {
    pub fn new(graph: Graph) -> Result<Self> {
        if graph.nodes.is_empty() {
            return Err(CoreError::Validation(
                "RuntimeGraph requires a graph with at least one node".into(),
            ));
        }
        graph.validate()?;
        let children = graph
            .edges
            .iter()
            .map(|e| {
                (
                    (e.source_node.clone(), e.source_outcome.clone()),
                    e.target_node.clone(),
                )
            })
            .collect();
        Ok(Self { graph, children })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn root(&self) -> &Node {
        &self.graph.nodes[0]
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.graph.node_by_name(name)
    }

    pub fn edge(&self, source_node: &str, source_outcome: &str) -> Option<&Edge> {
        self.graph
            .edges
            .iter()
            .find(|e| e.source_node == source_node && e.source_outcome == source_outcome)
    }

    pub fn child_by_outcome(&self, source_node: &str, source_outcome: &str) -> Option<&Node> {
        self.children
            .get(&(source_node.to_string(), source_outcome.to_string()))
            .and_then(|target| self.node(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> Graph {
        let n1 = Node::new("n1", "fake").with_outcomes(vec![OutcomeSlot::new("done")]);
        let n2 = Node::new("n2", "fake");
        Graph::new(vec![n1, n2], vec![Edge::new("n1", "done", "n2")])
    }

    #[test]
    fn valid_graph_passes_validation() {
        assert!(two_node_graph().validate().is_ok());
    }

    #[test]
    fn duplicate_node_names_rejected() {
        let graph = Graph::new(vec![Node::new("a", "fake"), Node::new("a", "fake")], vec![]);
        assert!(matches!(graph.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn edge_to_missing_node_rejected() {
        let n1 = Node::new("n1", "fake").with_outcomes(vec![OutcomeSlot::new("done")]);
        let graph = Graph::new(vec![n1], vec![Edge::new("n1", "done", "ghost")]);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn edge_from_undeclared_outcome_rejected() {
        let n1 = Node::new("n1", "fake").with_outcomes(vec![OutcomeSlot::new("done")]);
        let n2 = Node::new("n2", "fake");
        let graph = Graph::new(
            vec![n1, n2],
            vec![Edge::new("n1", "done", "n2"), Edge::new("n1", "oops", "n2")],
        );
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("unknown source_outcome"));
    }

    #[test]
    fn declared_outcome_without_edge_rejected() {
        let n1 = Node::new("n1", "fake").with_outcomes(vec![OutcomeSlot::new("done")]);
        let graph = Graph::new(vec![n1], vec![]);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("Missing edges"));
    }

    #[test]
    fn duplicate_edge_for_slot_rejected() {
        let n1 = Node::new("n1", "fake").with_outcomes(vec![OutcomeSlot::new("done")]);
        let n2 = Node::new("n2", "fake");
        let n3 = Node::new("n3", "fake");
        let graph = Graph::new(
            vec![n1, n2, n3],
            vec![Edge::new("n1", "done", "n2"), Edge::new("n1", "done", "n3")],
        );
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("Multiple edges"));
    }

    #[test]
    fn edge_shorthand_parses() {
        let edge: Edge = serde_json::from_value(serde_json::json!("n1.done -> n2:keep")).unwrap();
        assert_eq!(edge.source_node, "n1");
        assert_eq!(edge.source_outcome, "done");
        assert_eq!(edge.target_node, "n2");
        assert_eq!(edge.reset_policy, Some(StateResetPolicy::Keep));

        let bad: std::result::Result<Edge, _> =
            serde_json::from_value(serde_json::json!("nonsense"));
        assert!(bad.is_err());
    }

    #[test]
    fn runtime_graph_resolves_children() {
        let rt = RuntimeGraph::new(two_node_graph()).unwrap();
        assert_eq!(rt.root().name, "n1");
        assert_eq!(rt.child_by_outcome("n1", "done").unwrap().name, "n2");
        assert!(rt.child_by_outcome("n1", "missing").is_none());
    }

    #[test]
    fn node_params_flatten_into_typed_config() {
        #[derive(serde::Deserialize)]
        struct P {
            command: String,
            timeout_s: Option<f64>,
        }
        let node: Node = serde_json::from_value(serde_json::json!({
            "name": "sh",
            "type": "exec",
            "command": "echo hi",
            "timeout_s": 5.0,
        }))
        .unwrap();
        let p: P = node.typed_params().unwrap();
        assert_eq!(p.command, "echo hi");
        assert_eq!(p.timeout_s, Some(5.0));
    }
}

use crate::core::flow_graph::schema::{FlowDocument, FlowStep, StepConfig};
use crate::core::flow_graph::template::Template;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Diagnostic severity levels emitted by flow lint rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LintSeverity {
    Error,
    Warning,
    Info,
}

impl LintSeverity {
    fn rank(&self) -> u8 {
        match self {
            LintSeverity::Error => 3,
            LintSeverity::Warning => 2,
            LintSeverity::Info => 1,
        }
    }
}

impl fmt::Display for LintSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintSeverity::Error => write!(f, "Error"),
            LintSeverity::Warning => write!(f, "Warning"),
            LintSeverity::Info => write!(f, "Info"),
        }
    }
}

/// Individual lint result emitted by a rule.
#[derive(Debug, Clone, Serialize)]
pub struct LintResult {
    pub code: String,
    pub severity: LintSeverity,
    pub message: String,
    pub location: Option<String>,
    pub suggestion: Option<String>,
}

impl LintResult {
    pub fn new(
        code: impl Into<String>,
        severity: LintSeverity,
        message: impl Into<String>,
        location: Option<String>,
        suggestion: Option<String>,
    ) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
            location,
            suggestion,
        }
    }
}

/// Trait implemented by flow lint rules.
pub trait FlowLintRule {
    fn validate(&self, flow: &FlowDocument) -> Vec<LintResult>;
}

/// Registry that runs all built-in flow lint rules.
pub struct LintRegistry {
    rules: Vec<Box<dyn FlowLintRule>>,
}

impl LintRegistry {
    pub fn new() -> Self {
        let rules: Vec<Box<dyn FlowLintRule>> = vec![
            Box::new(DuplicateStepNamesRule),
            Box::new(UnknownTransitionTargetsRule),
            Box::new(UnreachableStepsRule),
            Box::new(MissingTerminalStepRule),
            Box::new(UnsetVariableRule),
            Box::new(AutoAdvanceCycleRule),
        ];
        Self { rules }
    }

    /// Run every rule. Results come back sorted by
    /// `(severity desc, code asc, location asc)`.
    pub fn run(&self, flow: &FlowDocument) -> Vec<LintResult> {
        let mut results = Vec::new();
        for rule in &self.rules {
            results.extend(rule.validate(flow));
        }
        results.sort_by(|a, b| {
            b.severity
                .rank()
                .cmp(&a.severity.rank())
                .then(a.code.cmp(&b.code))
                .then(a.location.cmp(&b.location))
        });
        results
    }
}

impl Default for LintRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct DuplicateStepNamesRule;

impl FlowLintRule for DuplicateStepNamesRule {
    fn validate(&self, flow: &FlowDocument) -> Vec<LintResult> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for step in &flow.steps {
            *counts.entry(step.name.as_str()).or_insert(0) += 1;
        }
        let mut out = Vec::new();
        for (name, count) in counts {
            if count > 1 {
                out.push(LintResult::new(
                    "FLOW-LINT-001",
                    LintSeverity::Error,
                    format!("duplicate step name '{}' found {} times", name, count),
                    Some(name.to_string()),
                    Some("rename steps so every step name is unique".to_string()),
                ));
            }
        }
        out
    }
}

struct UnknownTransitionTargetsRule;

impl FlowLintRule for UnknownTransitionTargetsRule {
    fn validate(&self, flow: &FlowDocument) -> Vec<LintResult> {
        let known: HashSet<&str> = flow.steps.iter().map(|s| s.name.as_str()).collect();
        let mut out = Vec::new();
        for step in &flow.steps {
            for transition in &step.transitions {
                if !known.contains(transition.to_step.as_str()) {
                    out.push(LintResult::new(
                        "FLOW-LINT-002",
                        LintSeverity::Error,
                        format!(
                            "transition from '{}' references unknown target '{}'",
                            step.name, transition.to_step
                        ),
                        Some(step.name.clone()),
                        Some("point transitions to an existing step name".to_string()),
                    ));
                }
            }
        }
        out
    }
}

struct UnreachableStepsRule;

impl FlowLintRule for UnreachableStepsRule {
    fn validate(&self, flow: &FlowDocument) -> Vec<LintResult> {
        let Some(entry) = flow.entry_step() else {
            return vec![LintResult::new(
                "FLOW-LINT-003",
                LintSeverity::Error,
                "flow has no entry point step",
                None,
                Some("mark exactly one step with is_entry_point".to_string()),
            )];
        };
        let (graph, node_map) = build_step_graph(&flow.steps);
        let Some(&entry_idx) = node_map.get(entry.name.as_str()) else {
            return Vec::new();
        };
        let mut reachable = HashSet::new();
        let mut bfs = petgraph::visit::Bfs::new(&graph, entry_idx);
        while let Some(idx) = bfs.next(&graph) {
            reachable.insert(idx);
        }
        let mut out = Vec::new();
        for step in &flow.steps {
            if let Some(idx) = node_map.get(step.name.as_str()) {
                if !reachable.contains(idx) {
                    out.push(LintResult::new(
                        "FLOW-LINT-003",
                        LintSeverity::Warning,
                        format!("step '{}' is unreachable from the entry point", step.name),
                        Some(step.name.clone()),
                        Some(
                            "connect the step from a reachable transition or remove it"
                                .to_string(),
                        ),
                    ));
                }
            }
        }
        out
    }
}

struct MissingTerminalStepRule;

impl FlowLintRule for MissingTerminalStepRule {
    fn validate(&self, flow: &FlowDocument) -> Vec<LintResult> {
        if flow.steps.iter().any(|s| s.config.is_terminal()) {
            return Vec::new();
        }
        vec![LintResult::new(
            "FLOW-LINT-004",
            LintSeverity::Warning,
            "flow has no end_flow or human_handover step; contacts can only \
             leave it via the idle-timeout sweep",
            None,
            Some("add an end_flow step reachable from the conversation".to_string()),
        )]
    }
}

/// Variables read by templates or conditions that nothing in the flow ever
/// writes: a transition guarded on such a variable can never fire.
struct UnsetVariableRule;

impl FlowLintRule for UnsetVariableRule {
    fn validate(&self, flow: &FlowDocument) -> Vec<LintResult> {
        let mut written: HashSet<String> = [
            "contact_id".to_string(),
            "whatsapp_flow_response_received".to_string(),
            "flow_response".to_string(),
        ]
        .into_iter()
        .collect();
        if let Some(declared) = &flow.declared_variables {
            written.extend(declared.iter().cloned());
        }
        for step in &flow.steps {
            if let StepConfig::Question { reply, .. } = &step.config {
                written.insert(root(&reply.save_to_variable));
            }
            for action in step.config.actions() {
                for variable in action.written_variables() {
                    written.insert(variable);
                }
            }
        }

        let mut out = Vec::new();
        let mut reported = HashSet::new();
        for step in &flow.steps {
            let mut reads: Vec<String> = Vec::new();
            for transition in &step.transitions {
                reads.extend(transition.condition.read_variables());
            }
            for spec in step.config.message_specs() {
                for source in spec.template_strings() {
                    if let Ok(template) = Template::compile(source) {
                        reads.extend(template.referenced_variables());
                    }
                }
            }
            for variable in reads {
                let variable = root(&variable);
                if !written.contains(&variable) && reported.insert(variable.clone()) {
                    out.push(LintResult::new(
                        "FLOW-LINT-005",
                        LintSeverity::Warning,
                        format!(
                            "step '{}' reads variable '{}' that no step writes",
                            step.name, variable
                        ),
                        Some(step.name.clone()),
                        Some("capture or set the variable before reading it".to_string()),
                    ));
                }
            }
        }
        out
    }
}

/// Cycles made only of auto-advancing steps run until the per-turn step cap
/// trips; a question step inside the cycle is what normally breaks it.
struct AutoAdvanceCycleRule;

impl FlowLintRule for AutoAdvanceCycleRule {
    fn validate(&self, flow: &FlowDocument) -> Vec<LintResult> {
        let (graph, node_map) = build_step_graph(&flow.steps);
        let by_idx: HashMap<NodeIndex, &FlowStep> = flow
            .steps
            .iter()
            .filter_map(|step| node_map.get(step.name.as_str()).map(|&idx| (idx, step)))
            .collect();
        let mut out = Vec::new();
        for component in tarjan_scc(&graph) {
            let is_cycle = component.len() > 1
                || graph.find_edge(component[0], component[0]).is_some();
            if !is_cycle {
                continue;
            }
            let has_question = component.iter().any(|idx| {
                by_idx
                    .get(idx)
                    .map(|step| matches!(step.config, StepConfig::Question { .. }))
                    .unwrap_or(false)
            });
            if has_question {
                continue;
            }
            for idx in component {
                if let Some(step) = by_idx.get(&idx) {
                    out.push(LintResult::new(
                        "FLOW-LINT-006",
                        LintSeverity::Warning,
                        format!(
                            "step '{}' is part of a cycle with no question step; it can only \
                             stop at the per-turn step cap",
                            step.name
                        ),
                        Some(step.name.clone()),
                        Some("insert a question step or break the cycle".to_string()),
                    ));
                }
            }
        }
        out
    }
}

fn root(path: &str) -> String {
    path.split('.').next().unwrap_or(path).to_string()
}

fn build_step_graph(steps: &[FlowStep]) -> (DiGraph<(), ()>, HashMap<&str, NodeIndex>) {
    let mut graph = DiGraph::<(), ()>::new();
    let mut node_map: HashMap<&str, NodeIndex> = HashMap::new();
    for step in steps {
        let idx = graph.add_node(());
        node_map.insert(step.name.as_str(), idx);
    }
    for step in steps {
        if let Some(&from) = node_map.get(step.name.as_str()) {
            for transition in &step.transitions {
                if let Some(&to) = node_map.get(transition.to_step.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
        }
    }
    (graph, node_map)
}

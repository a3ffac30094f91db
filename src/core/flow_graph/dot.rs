use crate::core::flow_graph::schema::{FlowDocument, FlowTransition};
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::fmt;

/// Node weight carrying step display information.
struct StepNode {
    name: String,
    step_type: &'static str,
}

impl fmt::Display for StepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\n{}", self.name, self.step_type)
    }
}

/// Edge weight carrying a formatted transition label.
struct EdgeData {
    label: String,
}

impl fmt::Display for EdgeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

fn build_graph(flow: &FlowDocument) -> DiGraph<StepNode, EdgeData> {
    let mut graph = DiGraph::new();
    let mut node_map: HashMap<&str, NodeIndex> = HashMap::new();
    for step in &flow.steps {
        let idx = graph.add_node(StepNode {
            name: step.name.clone(),
            step_type: step.config.type_name(),
        });
        node_map.insert(step.name.as_str(), idx);
    }
    for step in &flow.steps {
        if let Some(&from) = node_map.get(step.name.as_str()) {
            for transition in &step.transitions {
                if let Some(&to) = node_map.get(transition.to_step.as_str()) {
                    graph.add_edge(
                        from,
                        to,
                        EdgeData {
                            label: format_transition_label(transition),
                        },
                    );
                }
            }
        }
    }
    graph
}

/// Render the flow graph as a Graphviz DOT string.
pub fn flow_to_dot(flow: &FlowDocument) -> String {
    let graph = build_graph(flow);
    format!("{}", Dot::new(&graph))
}

fn format_transition_label(transition: &FlowTransition) -> String {
    let base = format!(
        "{} priority={}",
        transition.condition.summary(),
        transition.priority
    );
    escape_label(&truncate(&base, 80))
}

fn truncate(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        value.to_string()
    } else {
        format!("{}...", &value[..limit])
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\"', "\\\"")
}

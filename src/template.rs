//! Workflow Template Engine (§4.5): turns a `(template-name, parameters)`
//! pair into a concrete job graph, with dynamic adapter-chain injection.
//!
//! Template parameter substitution is a two-phase pass — structural clone
//! and placeholder discovery, then type-sensitive substitution — so a
//! numeric or boolean placeholder occupying an entire value keeps its type
//! instead of being stringified, while a placeholder embedded in a larger
//! string is substituted textually.
use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{model::AdapterSpec, util::error::OrchestratorError};

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").unwrap());
static WHOLE_PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\{\{(\w+)\}\}$").unwrap());

/// One node's declaration inside a template manifest, before substitution.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateNodeDef {
    pub id: String,
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

/// A named link: node `to_node`'s input `input_key` is fed by `from_node`'s
/// primary output.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateLinkDef {
    pub from_node: String,
    pub input_key: String,
    pub to_node: String,
}

/// One manifest entry: a template's identity, flags, and node/link shape.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDef {
    pub name: String,
    pub supported_model_families: Vec<String>,
    #[serde(default)]
    pub accepts_img2img: bool,
    #[serde(default)]
    pub accepts_adapters: bool,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    pub nodes: Vec<TemplateNodeDef>,
    #[serde(default)]
    pub links: Vec<TemplateLinkDef>,
    /// The node whose output is the splice point for adapter injection.
    pub model_loader_node: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateManifest {
    pub templates: Vec<TemplateDef>,
}

/// An edge simply records which input key on the target node is fed by the
/// source node's output; node identity is the stable, serializable string id
/// carried in each node's weight.
#[derive(Debug, Clone)]
struct EdgeLabel(String);

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub class_type: String,
    pub inputs: BTreeMap<String, Value>,
}

/// A concrete, parameterized job graph ready for submission to a worker.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    graph: DiGraph<GraphNode, EdgeLabel>,
    index_by_id: HashMap<String, NodeIndex>,
}

impl JobGraph {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    fn add_node(&mut self, node: GraphNode) -> NodeIndex {
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.index_by_id.insert(id, idx);
        idx
    }

    fn link(&mut self, from_id: &str, input_key: &str, to_id: &str) {
        if let (Some(&from), Some(&to)) = (self.index_by_id.get(from_id), self.index_by_id.get(to_id)) {
            self.graph.add_edge(from, to, EdgeLabel(input_key.to_string()));
        }
    }

    /// Renders the graph into the `{node_id: {class_type, inputs}}` shape
    /// the worker protocol expects; link-typed inputs render as `[from_id]`.
    #[must_use]
    pub fn to_submission_payload(&self) -> Value {
        let mut out = serde_json::Map::new();
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let mut inputs = serde_json::Map::new();
            for (key, value) in &node.inputs {
                inputs.insert(key.clone(), value.clone());
            }
            // Linked inputs are recorded on the edge, not the input map, so
            // render them here keyed by the edge's input label.
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                let source = &self.graph[edge.source()];
                inputs.insert(
                    edge.weight().0.clone(),
                    Value::Array(vec![Value::String(source.id.clone())]),
                );
            }
            out.insert(
                node.id.clone(),
                serde_json::json!({ "class_type": node.class_type, "inputs": inputs }),
            );
        }
        Value::Object(out)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn contains_node(&self, id: &str) -> bool {
        self.index_by_id.contains_key(id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    templates: Vec<TemplateDef>,
}

impl TemplateEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a manifest naming every template, its supported model families,
    /// and its flags/defaults.
    pub fn load_all(&mut self, manifest: TemplateManifest) {
        self.templates = manifest.templates;
    }

    /// Deterministic selection: the first manifest entry whose flags match.
    #[must_use]
    pub fn select(&self, model_family: &str, needs_img2img: bool, needs_adapters: bool) -> Option<&str> {
        self.templates
            .iter()
            .find(|t| {
                t.supported_model_families.iter().any(|f| f == model_family)
                    && (!needs_img2img || t.accepts_img2img)
                    && (!needs_adapters || t.accepts_adapters)
            })
            .map(|t| t.name.as_str())
    }

    fn find(&self, template_name: &str) -> Option<&TemplateDef> {
        self.templates.iter().find(|t| t.name == template_name)
    }

    /// Substitutes placeholders and builds the concrete job graph.
    /// Unresolved placeholders fail with `MissingParameter`.
    pub fn build(
        &self,
        template_name: &str,
        params: &BTreeMap<String, Value>,
    ) -> Result<JobGraph, OrchestratorError> {
        let template = self
            .find(template_name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("template {template_name}")))?;

        // Phase 1: structural clone + placeholder discovery.
        let mut needed = Vec::new();
        for node in &template.nodes {
            for value in node.inputs.values() {
                collect_placeholders(value, &mut needed);
            }
        }

        let mut resolved: BTreeMap<String, Value> = template.defaults.clone();
        for (k, v) in params {
            resolved.insert(k.clone(), v.clone());
        }
        for name in &needed {
            if !resolved.contains_key(name) {
                return Err(OrchestratorError::MissingParameter(name.clone()));
            }
        }

        // Phase 2: type-sensitive substitution.
        let mut graph = JobGraph::empty();
        for node_def in &template.nodes {
            let mut inputs = BTreeMap::new();
            for (key, value) in &node_def.inputs {
                inputs.insert(key.clone(), substitute(value, &resolved));
            }
            graph.add_node(GraphNode {
                id: node_def.id.clone(),
                class_type: node_def.class_type.clone(),
                inputs,
            });
        }
        for link in &template.links {
            graph.link(&link.from_node, &link.input_key, &link.to_node);
        }

        Ok(graph)
    }

    /// Inserts an adapter-loader node between the model loader's output and
    /// its downstream consumers for each adapter, in order. An empty list is
    /// a no-op; injecting into a template whose manifest forbids adapters
    /// fails with `UnsupportedAdapter`.
    pub fn inject_adapters(
        &self,
        template_name: &str,
        mut graph: JobGraph,
        adapters: &[AdapterSpec],
    ) -> Result<JobGraph, OrchestratorError> {
        if adapters.is_empty() {
            return Ok(graph);
        }
        let template = self
            .find(template_name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("template {template_name}")))?;
        if !template.accepts_adapters {
            return Err(OrchestratorError::UnsupportedAdapter(template_name.to_string()));
        }

        let mut splice_point = template.model_loader_node.clone();
        for (i, adapter) in adapters.iter().enumerate() {
            let adapter_id = format!("adapter_loader_{i}");
            let splice_idx = *graph
                .index_by_id
                .get(&splice_point)
                .expect("splice point must exist in graph");

            // Capture the current consumers of the splice point before we
            // add the new node, so we can rewire them afterward.
            let consumer_edges: Vec<_> = graph
                .graph
                .edges_directed(splice_idx, Direction::Outgoing)
                .map(|edge| (edge.id(), edge.target(), edge.weight().0.clone()))
                .collect();
            let mut consumers = Vec::with_capacity(consumer_edges.len());
            for (edge_id, target, input_key) in consumer_edges {
                graph.graph.remove_edge(edge_id);
                consumers.push((target, input_key));
            }

            graph.add_node(GraphNode {
                id: adapter_id.clone(),
                class_type: "adapter_loader".to_string(),
                inputs: BTreeMap::from([
                    ("adapter_id".to_string(), Value::String(adapter.adapter_id.clone())),
                    (
                        "strength".to_string(),
                        serde_json::Number::from_f64(f64::from(adapter.strength))
                            .map(Value::Number)
                            .unwrap_or(Value::Null),
                    ),
                ]),
            });
            graph.link(&splice_point, "model", &adapter_id);
            for (target, input_key) in consumers {
                let target_id = graph.graph[target].id.clone();
                graph.link(&adapter_id, &input_key, &target_id);
            }

            splice_point = adapter_id;
        }

        Ok(graph)
    }
}

fn collect_placeholders(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for cap in PLACEHOLDER_RE.captures_iter(s) {
                out.push(cap[1].to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_placeholders(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_placeholders(v, out);
            }
        }
        _ => {}
    }
}

fn substitute(value: &Value, params: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(cap) = WHOLE_PLACEHOLDER_RE.captures(s) {
                // Scalar placeholder occupying the entire value: preserve type.
                return params.get(&cap[1]).cloned().unwrap_or(Value::Null);
            }
            let replaced = PLACEHOLDER_RE.replace_all(s, |cap: &regex::Captures| {
                params
                    .get(&cap[1])
                    .map(render_as_text)
                    .unwrap_or_default()
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> TemplateManifest {
        TemplateManifest {
            templates: vec![TemplateDef {
                name: "txt2img_sdxl".to_string(),
                supported_model_families: vec!["sdxl".to_string()],
                accepts_img2img: false,
                accepts_adapters: true,
                defaults: BTreeMap::from([("steps".to_string(), serde_json::json!(20))]),
                nodes: vec![
                    TemplateNodeDef {
                        id: "model".to_string(),
                        class_type: "model_loader".to_string(),
                        inputs: BTreeMap::from([(
                            "model_family".to_string(),
                            serde_json::json!("{{model_family}}"),
                        )]),
                    },
                    TemplateNodeDef {
                        id: "sampler".to_string(),
                        class_type: "ksampler".to_string(),
                        inputs: BTreeMap::from([
                            ("prompt".to_string(), serde_json::json!("prefix: {{prompt}}")),
                            ("steps".to_string(), serde_json::json!("{{steps}}")),
                            ("seed".to_string(), serde_json::json!("{{seed}}")),
                        ]),
                    },
                ],
                links: vec![TemplateLinkDef {
                    from_node: "model".to_string(),
                    input_key: "model".to_string(),
                    to_node: "sampler".to_string(),
                }],
                model_loader_node: "model".to_string(),
            }],
        }
    }

    #[test]
    fn select_matches_family_and_flags() {
        let mut engine = TemplateEngine::new();
        engine.load_all(sample_manifest());
        assert_eq!(engine.select("sdxl", false, true), Some("txt2img_sdxl"));
        assert_eq!(engine.select("flux", false, false), None);
    }

    #[test]
    fn build_substitutes_scalar_and_string_placeholders() {
        let mut engine = TemplateEngine::new();
        engine.load_all(sample_manifest());
        let params = BTreeMap::from([
            ("model_family".to_string(), serde_json::json!("sdxl")),
            ("prompt".to_string(), serde_json::json!("a cat")),
            ("seed".to_string(), serde_json::json!(42)),
        ]);
        let graph = engine.build("txt2img_sdxl", &params).expect("build should succeed");
        assert_eq!(graph.node_count(), 2);

        let payload = graph.to_submission_payload();
        let sampler_inputs = &payload["sampler"]["inputs"];
        assert_eq!(sampler_inputs["prompt"], serde_json::json!("prefix: a cat"));
        assert_eq!(sampler_inputs["seed"], serde_json::json!(42));
        assert_eq!(sampler_inputs["steps"], serde_json::json!(20));
        // The link input renders as a reference, not a literal.
        assert_eq!(sampler_inputs["model"], serde_json::json!(["model"]));
    }

    #[test]
    fn build_fails_on_missing_parameter() {
        let mut engine = TemplateEngine::new();
        engine.load_all(sample_manifest());
        let params = BTreeMap::from([("model_family".to_string(), serde_json::json!("sdxl"))]);
        let error = engine.build("txt2img_sdxl", &params).unwrap_err();
        assert!(matches!(error, OrchestratorError::MissingParameter(_)));
    }

    #[test]
    fn inject_adapters_empty_list_is_noop() {
        let mut engine = TemplateEngine::new();
        engine.load_all(sample_manifest());
        let params = BTreeMap::from([
            ("model_family".to_string(), serde_json::json!("sdxl")),
            ("prompt".to_string(), serde_json::json!("a cat")),
            ("seed".to_string(), serde_json::json!(1)),
        ]);
        let graph = engine.build("txt2img_sdxl", &params).unwrap();
        let before = graph.node_count();
        let graph = engine.inject_adapters("txt2img_sdxl", graph, &[]).unwrap();
        assert_eq!(graph.node_count(), before);
    }

    #[test]
    fn inject_adapters_splices_loader_between_model_and_consumer() {
        let mut engine = TemplateEngine::new();
        engine.load_all(sample_manifest());
        let params = BTreeMap::from([
            ("model_family".to_string(), serde_json::json!("sdxl")),
            ("prompt".to_string(), serde_json::json!("a cat")),
            ("seed".to_string(), serde_json::json!(1)),
        ]);
        let graph = engine.build("txt2img_sdxl", &params).unwrap();
        let adapters = vec![AdapterSpec {
            adapter_id: "style_lora".to_string(),
            strength: 0.7,
        }];
        let graph = engine
            .inject_adapters("txt2img_sdxl", graph, &adapters)
            .expect("injection should succeed");

        assert_eq!(graph.node_count(), 3);
        assert!(graph.contains_node("adapter_loader_0"));

        let payload = graph.to_submission_payload();
        assert_eq!(
            payload["sampler"]["inputs"]["model"],
            serde_json::json!(["adapter_loader_0"])
        );
        assert_eq!(
            payload["adapter_loader_0"]["inputs"]["model"],
            serde_json::json!(["model"])
        );
    }

    #[test]
    fn inject_adapters_rejects_unsupported_template() {
        let mut manifest = sample_manifest();
        manifest.templates[0].accepts_adapters = false;
        let mut engine = TemplateEngine::new();
        engine.load_all(manifest);
        let params = BTreeMap::from([
            ("model_family".to_string(), serde_json::json!("sdxl")),
            ("prompt".to_string(), serde_json::json!("a cat")),
            ("seed".to_string(), serde_json::json!(1)),
        ]);
        let graph = engine.build("txt2img_sdxl", &params).unwrap();
        let adapters = vec![AdapterSpec {
            adapter_id: "style_lora".to_string(),
            strength: 0.5,
        }];
        let error = engine
            .inject_adapters("txt2img_sdxl", graph, &adapters)
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::UnsupportedAdapter(_)));
    }
}

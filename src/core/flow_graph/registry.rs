#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::flow_graph::schema::{FlowDocument, FlowStep};
use crate::core::flow_graph::state::compute_sha256_hex;
use crate::core::types::ErrorCategory;
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A validated flow plus the lookups the engine needs each turn.
#[derive(Debug)]
pub struct CompiledFlow {
    pub document: FlowDocument,
    steps: IndexMap<String, FlowStep>,
    pub entry_step: String,
    /// SHA-256 of the definition bytes; logged so operators can tell which
    /// revision of a flow a contact is running.
    pub fingerprint: String,
    pub source_path: Option<PathBuf>,
}

impl CompiledFlow {
    pub fn from_document(
        document: FlowDocument,
        source_bytes: &[u8],
        source_path: Option<PathBuf>,
    ) -> Result<Self, AppError> {
        document.validate()?;
        let entry_step = document
            .entry_step()
            .map(|step| step.name.clone())
            .ok_or_else(|| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("flow '{}' has no entry point", document.name),
                )
                .with_code("FLOW-REG-001")
            })?;
        let steps = document
            .steps
            .iter()
            .map(|step| (step.name.clone(), step.clone()))
            .collect();
        Ok(CompiledFlow {
            fingerprint: compute_sha256_hex(source_bytes),
            entry_step,
            steps,
            source_path,
            document,
        })
    }

    pub fn name(&self) -> &str {
        &self.document.name
    }

    pub fn step(&self, name: &str) -> Option<&FlowStep> {
        self.steps.get(name)
    }
}

/// Immutable registry of all loaded flows, built once at startup and passed
/// to the engine by reference — never ambient global state.
#[derive(Default)]
pub struct FlowRegistry {
    flows: IndexMap<String, Arc<CompiledFlow>>,
}

impl FlowRegistry {
    /// Build a registry from documents paired with their definition bytes.
    /// Flows are ordered by `(trigger_priority, name)` so keyword matching
    /// is deterministic when keywords overlap.
    pub fn from_documents(
        documents: Vec<(FlowDocument, Vec<u8>, Option<PathBuf>)>,
    ) -> Result<Self, AppError> {
        let mut compiled = Vec::with_capacity(documents.len());
        for (document, bytes, path) in documents {
            compiled.push(CompiledFlow::from_document(document, &bytes, path)?);
        }
        compiled.sort_by(|a, b| {
            a.document
                .trigger_priority
                .cmp(&b.document.trigger_priority)
                .then_with(|| a.name().cmp(b.name()))
        });
        let mut flows = IndexMap::new();
        for flow in compiled {
            let name = flow.name().to_string();
            debug!(
                flow = %name,
                fingerprint = %flow.fingerprint,
                source = %flow
                    .source_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<inline>".to_string()),
                "flow compiled"
            );
            if flows.insert(name.clone(), Arc::new(flow)).is_some() {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    format!("duplicate flow name: {}", name),
                )
                .with_code("FLOW-REG-002"));
            }
        }
        Ok(FlowRegistry { flows })
    }

    /// Load every `.json`/`.yaml`/`.yml` file in a directory.
    pub fn load_dir(dir: &Path) -> Result<Self, AppError> {
        let entries = fs::read_dir(dir).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to read flows directory {}: {}", dir.display(), err),
            )
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("json") | Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path).map_err(|err| {
                AppError::new(
                    ErrorCategory::IoError,
                    format!("failed to read {}: {}", path.display(), err),
                )
            })?;
            let document = FlowDocument::load_from_file(&path)?;
            documents.push((document, bytes, Some(path)));
        }
        let registry = Self::from_documents(documents)?;
        info!(flows = registry.flows.len(), "flow registry loaded");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CompiledFlow>> {
        self.flows.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompiledFlow>> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// First active flow whose trigger keywords contain the message text,
    /// compared trimmed and case-insensitively. Registry order makes the
    /// winner deterministic.
    pub fn match_trigger(&self, text: &str) -> Option<Arc<CompiledFlow>> {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }
        self.flows
            .values()
            .find(|flow| {
                flow.document.is_active
                    && flow
                        .document
                        .trigger_keywords
                        .iter()
                        .any(|keyword| keyword.trim().to_lowercase() == normalized)
            })
            .cloned()
    }
}

//! Multi-file project merging (Terraform-style)
//!
//! A project may be split across any number of `.af` files in one directory.
//! Merging enforces exactly one metadata block across the set and rejects
//! duplicate names within each block kind, naming both declaring files.

use crate::ast::AgentflowFile;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Structural conflict across files
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("No Agentflow files to merge")]
    NoFiles,

    #[error("No 'agentflow' metadata block found across {0} file(s)")]
    MissingMetadata(usize),

    #[error("Multiple 'agentflow' blocks found (in {first} and {second})")]
    MultipleMetadata { first: String, second: String },

    #[error("Duplicate {kind} '{name}' (declared in {first} and {second})")]
    Duplicate {
        kind: &'static str,
        name: String,
        first: String,
        second: String,
    },
}

/// Tracks (kind, name) → declaring file for duplicate detection
struct SeenNames {
    seen: HashMap<(&'static str, String), String>,
}

impl SeenNames {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    fn record(&mut self, kind: &'static str, name: &str, file: &str) -> Result<(), MergeError> {
        if let Some(first) = self.seen.get(&(kind, name.to_string())) {
            return Err(MergeError::Duplicate {
                kind,
                name: name.to_string(),
                first: first.clone(),
                second: file.to_string(),
            });
        }
        self.seen
            .insert((kind, name.to_string()), file.to_string());
        Ok(())
    }
}

/// Merge parsed files into a single logical project.
///
/// Files are ordered by their label before merging so the result is stable
/// regardless of discovery order; within a file, declaration order is kept.
pub fn merge_files(mut files: Vec<AgentflowFile>) -> Result<AgentflowFile, MergeError> {
    if files.is_empty() {
        return Err(MergeError::NoFiles);
    }

    files.sort_by(|a, b| a.label().to_string().cmp(&b.label().to_string()));

    let file_count = files.len();
    let mut merged = AgentflowFile::default();
    let mut metadata_source: Option<String> = None;
    let mut seen = SeenNames::new();

    for file in files {
        let label = file.label().to_string();

        if let Some(metadata) = file.metadata {
            if let Some(first) = &metadata_source {
                return Err(MergeError::MultipleMetadata {
                    first: first.clone(),
                    second: label,
                });
            }
            metadata_source = Some(label.clone());
            merged.metadata = Some(metadata);
        }

        for block in file.variables {
            seen.record("variable", &block.name, &label)?;
            merged.variables.push(block);
        }
        for block in file.providers {
            seen.record("provider", &block.full_name(), &label)?;
            merged.providers.push(block);
        }
        for block in file.models {
            seen.record("model", &block.name, &label)?;
            merged.models.push(block);
        }
        for block in file.agents {
            seen.record("agent", &block.name, &label)?;
            merged.agents.push(block);
        }
        for block in file.policies {
            seen.record("policy", &block.name, &label)?;
            merged.policies.push(block);
        }
        for block in file.servers {
            seen.record("server", &block.name, &label)?;
            merged.servers.push(block);
        }
        for block in file.capabilities {
            seen.record("capability", &block.name, &label)?;
            merged.capabilities.push(block);
        }
        for block in file.schemas {
            seen.record("schema", &block.name, &label)?;
            merged.schemas.push(block);
        }
        for block in file.modules {
            seen.record("module", &block.name, &label)?;
            merged.modules.push(block);
        }
        for block in file.workflows {
            seen.record("workflow", &block.name, &label)?;
            merged.workflows.push(block);
        }
    }

    if merged.metadata.is_none() {
        return Err(MergeError::MissingMetadata(file_count));
    }

    Ok(merged)
}

/// Discover `.af` source files in a directory (case-insensitive extension),
/// sorted by path for deterministic merging.
pub fn discover_files(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let walker = if recursive {
        walkdir::WalkDir::new(dir)
    } else {
        walkdir::WalkDir::new(dir).max_depth(1)
    };

    let mut files: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("af"))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

//! Cluster inventory lookups
//!
//! These back the autocomplete endpoints. They are plain request/response
//! shell-outs to `kubectl` and share nothing with streaming sessions.

use std::collections::BTreeSet;
use std::path::PathBuf;

use kubestream_types::InventoryQuery;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// What to list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InventoryKind {
    Namespaces,
    Pods,
    Containers,
    Contexts,
    Nodes,
}

/// `kubectl` wrapper for listing cluster resources
#[derive(Clone, Debug)]
pub struct Inventory {
    kubectl: PathBuf,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl Inventory {
    pub fn new(kubectl: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    /// Build the `kubectl` argument list for a lookup
    pub fn args(kind: InventoryKind, query: &InventoryQuery) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        if kind != InventoryKind::Contexts && !query.context.is_empty() {
            args.extend(["--context".to_string(), query.context.clone()]);
        }

        match kind {
            InventoryKind::Contexts => {
                args.extend(["config", "get-contexts", "-o", "name"].map(String::from));
            }
            InventoryKind::Namespaces => {
                args.extend(
                    [
                        "get",
                        "namespaces",
                        "-o",
                        "jsonpath={.items[*].metadata.name}",
                    ]
                    .map(String::from),
                );
            }
            InventoryKind::Nodes => {
                args.extend(
                    ["get", "nodes", "-o", "jsonpath={.items[*].metadata.name}"].map(String::from),
                );
            }
            InventoryKind::Pods | InventoryKind::Containers => {
                let path = if kind == InventoryKind::Pods {
                    "jsonpath={.items[*].metadata.name}"
                } else {
                    "jsonpath={.items[*].spec.containers[*].name}"
                };
                args.extend(["get", "pods", "-o", path].map(String::from));

                if query.all_namespaces == "true" {
                    args.push("--all-namespaces".to_string());
                } else if !query.namespace.is_empty() {
                    args.extend(["-n".to_string(), query.namespace.clone()]);
                }
            }
        }

        args
    }

    /// Run a lookup and return the listed names
    pub async fn list(
        &self,
        kind: InventoryKind,
        query: &InventoryQuery,
    ) -> Result<Vec<String>, InventoryError> {
        let args = Self::args(kind, query);
        let program = self.kubectl.display().to_string();
        tracing::debug!(?kind, ?args, "running inventory lookup");

        let output = tokio::process::Command::new(&self.kubectl)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| InventoryError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(InventoryError::Failed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_names(kind, &stdout))
    }

    /// Split command output into names. Container names are deduplicated.
    pub fn parse_names(kind: InventoryKind, output: &str) -> Vec<String> {
        let names = output.split_whitespace().map(str::to_string);
        if kind == InventoryKind::Containers {
            names.collect::<BTreeSet<_>>().into_iter().collect()
        } else {
            names.collect()
        }
    }
}

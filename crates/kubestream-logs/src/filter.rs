use regex::Regex;
use std::sync::LazyLock;

use kubestream_types::{ContainerState, SessionParams};

/// A filter field that failed validation. Sessions carrying one never start.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid {field} regex: {source}")]
    Regex {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("invalid {field}: {reason}")]
    Selector { field: &'static str, reason: String },
    #[error("missing {field}")]
    Missing { field: &'static str },
}

impl FilterError {
    /// Name of the request parameter that failed
    pub fn field(&self) -> &'static str {
        match self {
            Self::Regex { field, .. } | Self::Selector { field, .. } | Self::Missing { field } => {
                field
            }
        }
    }
}

fn compile(field: &'static str, pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(pattern).map_err(|source| FilterError::Regex { field, source })
}

/// Ordered list of independently compiled patterns from a comma-separated field.
/// An empty list places no restriction.
#[derive(Clone, Default)]
pub struct PatternList {
    regexes: Vec<Regex>,
}

impl PatternList {
    /// Split on commas, trim, drop empty entries, compile each one.
    /// A single bad entry fails the whole field.
    pub fn compile(field: &'static str, list: &str) -> Result<Self, FilterError> {
        let regexes = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| compile(field, p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { regexes })
    }

    pub fn is_empty(&self) -> bool {
        self.regexes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regexes.len()
    }

    /// True if any pattern matches
    pub fn any_match(&self, text: &str) -> bool {
        self.regexes.iter().any(|re| re.is_match(text))
    }

    /// Source patterns, in order
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.regexes.iter().map(Regex::as_str)
    }
}

impl std::fmt::Debug for PatternList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.patterns()).finish()
    }
}

const KEY: &str = r"(?:[A-Za-z0-9][-A-Za-z0-9_.]*/)?[A-Za-z0-9](?:[-A-Za-z0-9_.]*[A-Za-z0-9])?";
const VALUE: &str = r"(?:[A-Za-z0-9](?:[-A-Za-z0-9_.]*[A-Za-z0-9])?)?";

static REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        r"^(?:!\s*{KEY}|{KEY}|{KEY}\s*(?:==|=|!=)\s*{VALUE}|{KEY}\s+(?:in|notin)\s*\(\s*{VALUE}\s*(?:,\s*{VALUE}\s*)*\))$"
    );
    Regex::new(&pattern).expect("label selector grammar compiles")
});

/// A syntactically valid label selector (`app=web,tier in (fe,be),!legacy`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSelector(String);

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self, FilterError> {
        let selector = selector.trim();
        for requirement in split_requirements(selector) {
            let requirement = requirement.trim();
            if !REQUIREMENT.is_match(requirement) {
                return Err(FilterError::Selector {
                    field: "selector",
                    reason: format!("unable to parse requirement {:?}", requirement),
                });
            }
        }
        Ok(Self(selector.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Split a selector on top-level commas (commas inside `in (...)` sets are kept)
fn split_requirements(selector: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&selector[start..]);
    parts
}

/// Field selector restricting pods to one node
fn node_selector(node: &str) -> Result<String, FilterError> {
    let node = node.trim();
    if node.is_empty() || node.contains(|c: char| c == ',' || c == '=' || c == '!' || c.is_whitespace()) {
        return Err(FilterError::Selector {
            field: "node",
            reason: format!("invalid node name {:?}", node),
        });
    }
    Ok(format!("spec.nodeName={}", node))
}

/// Container states to follow. "all" and empty both mean running.
fn container_states(state: &str) -> Vec<ContainerState> {
    if state.is_empty() || state == "all" {
        vec![ContainerState::Running]
    } else {
        vec![ContainerState::from(state)]
    }
}

/// Every matcher a session needs, compiled from its parameters
#[derive(Clone, Debug)]
pub struct CompiledFilters {
    /// Pods whose name matches are followed
    pub pod_query: Regex,
    /// Containers whose name matches are followed
    pub container_query: Regex,
    pub exclude_pod: PatternList,
    pub exclude_container: PatternList,
    /// Lines must match at least one of these (if any)
    pub include: PatternList,
    /// Lines matching any of these are dropped
    pub exclude: PatternList,
    /// Carried for the client, never alters messages
    pub highlight: PatternList,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<String>,
    pub container_states: Vec<ContainerState>,
}

impl CompiledFilters {
    /// Compile all filter fields, failing on the first invalid one
    pub fn compile(params: &SessionParams) -> Result<Self, FilterError> {
        if params.query.is_empty() {
            return Err(FilterError::Missing { field: "query" });
        }
        let pod_query = compile("query", &params.query)?;

        let container_query = if params.container.is_empty() {
            compile("container", ".*")?
        } else {
            compile("container", &params.container)?
        };

        let include = PatternList::compile("include", &params.include)?;
        let exclude = PatternList::compile("exclude", &params.exclude)?;
        let highlight = PatternList::compile("highlight", &params.highlight)?;
        let exclude_container = PatternList::compile("excludeContainer", &params.exclude_container)?;
        let exclude_pod = PatternList::compile("excludePod", &params.exclude_pod)?;

        let label_selector = if params.selector.trim().is_empty() {
            None
        } else {
            Some(LabelSelector::parse(&params.selector)?)
        };

        let field_selector = if params.node.is_empty() {
            None
        } else {
            Some(node_selector(&params.node)?)
        };

        Ok(Self {
            pod_query,
            container_query,
            exclude_pod,
            exclude_container,
            include,
            exclude,
            highlight,
            label_selector,
            field_selector,
            container_states: container_states(&params.container_state),
        })
    }

    /// Check if a pod name is selected
    pub fn matches_pod(&self, pod_name: &str) -> bool {
        self.pod_query.is_match(pod_name) && !self.exclude_pod.any_match(pod_name)
    }

    /// Check if a container name is selected
    pub fn matches_container(&self, container_name: &str) -> bool {
        self.container_query.is_match(container_name)
            && !self.exclude_container.any_match(container_name)
    }

    /// Check if a log line passes the include/exclude filters
    pub fn accepts_line(&self, line: &str) -> bool {
        if self.exclude.any_match(line) {
            return false;
        }
        self.include.is_empty() || self.include.any_match(line)
    }
}

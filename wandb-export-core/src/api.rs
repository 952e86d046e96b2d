//! Remote tracking service: the [`TrackingApi`] seam and its W&B GraphQL
//! implementation.

use std::fmt;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::config::ApiSettings;
use crate::error::ApiError;
use crate::history::HistoryTable;
use crate::history::Row;

/// Runs requested per page when listing a project.
const RUNS_PAGE_SIZE: u64 = 50;

const RUNS_QUERY: &str = r#"
query Runs($project: String!, $entity: String, $cursor: String, $perPage: Int, $filters: JSONString) {
    project(name: $project, entityName: $entity) {
        runs(filters: $filters, after: $cursor, first: $perPage) {
            edges {
                node {
                    name
                    displayName
                    config
                }
            }
            pageInfo {
                endCursor
                hasNextPage
            }
        }
    }
}
"#;

const HISTORY_QUERY: &str = r#"
query RunSampledHistory($project: String!, $entity: String, $name: String!, $samples: Int) {
    project(name: $project, entityName: $entity) {
        run(name: $name) {
            history(samples: $samples)
        }
    }
}
"#;

/// `entity/project` namespace of a set of runs. The entity may be empty, in
/// which case the server picks the API key's default entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPath {
    pub entity: String,
    pub project: String,
}

impl ProjectPath {
    pub fn new(entity: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            project: project.into(),
        }
    }

    /// File-browser URL of a run, e.g.
    /// `https://api.wandb.ai/files/<entity>/<project>/<run_id>`.
    pub fn files_url(&self, base_url: &str, run_id: &str) -> String {
        let mut url = format!("{}/files", base_url.trim_end_matches('/'));
        for segment in [self.entity.as_str(), self.project.as_str(), run_id] {
            if !segment.is_empty() {
                url.push('/');
                url.push_str(segment);
            }
        }
        url
    }

    fn entity_variable(&self) -> Value {
        if self.entity.is_empty() {
            Value::Null
        } else {
            Value::String(self.entity.clone())
        }
    }
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entity.is_empty() {
            write!(f, "{}", self.project)
        } else {
            write!(f, "{}/{}", self.entity, self.project)
        }
    }
}

/// A run as returned by the listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    /// Stable identifier.
    pub id: String,
    /// Human label; may be absent or renamed over time.
    pub name: Option<String>,
    pub config: Map<String, Value>,
}

impl Run {
    /// The run's name, or its id when it has none.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.id)
    }
}

/// Operations the exporter needs from the tracking service.
#[async_trait]
pub trait TrackingApi: Send + Sync {
    /// Every run of `project` matching `filters`. Pagination is internal.
    async fn list_runs(
        &self,
        project: &ProjectPath,
        filters: Option<&Value>,
    ) -> Result<Vec<Run>, ApiError>;

    /// Up to `samples` rows of the run's logged history.
    async fn history(
        &self,
        project: &ProjectPath,
        run: &Run,
        samples: u64,
    ) -> Result<HistoryTable, ApiError>;
}

/// [`TrackingApi`] over the W&B GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct WandbClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl WandbClient {
    pub fn new(settings: &ApiSettings) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }

    /// POST a query and return its `data` object.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, ApiError> {
        let url = format!("{}/graphql", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .json(&json!({ "query": query, "variables": variables }));

        if let Some(api_key) = &self.api_key {
            request = request.basic_auth("api", Some(api_key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            let messages: Vec<String> = errors
                .iter()
                .map(|error| {
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string())
                })
                .collect();
            return Err(ApiError::GraphQl(messages.join("; ")));
        }

        body.get("data")
            .cloned()
            .ok_or_else(|| ApiError::Decode("response has no 'data' field".to_string()))
    }
}

#[async_trait]
impl TrackingApi for WandbClient {
    async fn list_runs(
        &self,
        project: &ProjectPath,
        filters: Option<&Value>,
    ) -> Result<Vec<Run>, ApiError> {
        let filters = filters
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ApiError::Decode(format!("filters are not serializable: {e}")))?;

        let mut runs = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let variables = json!({
                "project": project.project,
                "entity": project.entity_variable(),
                "cursor": cursor,
                "perPage": RUNS_PAGE_SIZE,
                "filters": filters,
            });
            let data = self.graphql(RUNS_QUERY, variables).await?;
            let page = parse_runs_page(&data, project)?;
            debug!(
                project = %project,
                fetched = page.runs.len(),
                "fetched page of runs"
            );
            runs.extend(page.runs);

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(runs)
    }

    async fn history(
        &self,
        project: &ProjectPath,
        run: &Run,
        samples: u64,
    ) -> Result<HistoryTable, ApiError> {
        let variables = json!({
            "project": project.project,
            "entity": project.entity_variable(),
            "name": run.id,
            "samples": samples,
        });
        let data = self.graphql(HISTORY_QUERY, variables).await?;
        parse_history(&data, project, &run.id)
    }
}

/// One page of the runs listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunsPage {
    pub runs: Vec<Run>,
    /// Cursor of the next page, `None` on the last one.
    pub next_cursor: Option<String>,
}

pub fn parse_runs_page(data: &Value, project: &ProjectPath) -> Result<RunsPage, ApiError> {
    let project_node = data
        .get("project")
        .filter(|node| !node.is_null())
        .ok_or_else(|| ApiError::ProjectNotFound(project.to_string()))?;

    let connection = project_node
        .get("runs")
        .ok_or_else(|| ApiError::Decode("project has no 'runs' field".to_string()))?;

    let edges = connection
        .get("edges")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::Decode("runs have no 'edges' list".to_string()))?;

    let runs = edges
        .iter()
        .map(|edge| {
            edge.get("node")
                .ok_or_else(|| ApiError::Decode("run edge has no 'node'".to_string()))
                .and_then(parse_run_node)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let page_info = connection.get("pageInfo");
    let has_next = page_info
        .and_then(|info| info.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = page_info
        .and_then(|info| info.get("endCursor"))
        .and_then(Value::as_str)
        .filter(|_| has_next)
        .map(str::to_string);

    Ok(RunsPage { runs, next_cursor })
}

fn parse_run_node(node: &Value) -> Result<Run, ApiError> {
    let id = node
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Decode("run node has no 'name'".to_string()))?
        .to_string();

    let name = node
        .get("displayName")
        .and_then(Value::as_str)
        .map(str::to_string);

    let config = parse_run_config(node.get("config").unwrap_or(&Value::Null))
        .map_err(|e| ApiError::Decode(format!("config of run '{id}': {e}")))?;

    Ok(Run { id, name, config })
}

/// Run configs arrive as a JSON string mapping each key to
/// `{"value": ..., "desc": ...}`. Unwrap the values and drop the internal
/// `_wandb` entries.
pub fn parse_run_config(raw: &Value) -> Result<Map<String, Value>, serde_json::Error> {
    let parsed = match raw {
        Value::Null => return Ok(Map::new()),
        Value::String(text) if text.trim().is_empty() => return Ok(Map::new()),
        Value::String(text) => serde_json::from_str(text)?,
        other => other.clone(),
    };

    let Value::Object(entries) = parsed else {
        return Ok(Map::new());
    };

    Ok(entries
        .into_iter()
        .filter(|(key, _)| !key.starts_with("_wandb"))
        .map(|(key, entry)| {
            let value = match entry {
                Value::Object(mut wrapper) if wrapper.contains_key("value") => {
                    wrapper.remove("value").unwrap_or(Value::Null)
                }
                other => other,
            };
            (key, value)
        })
        .collect())
}

pub fn parse_history(
    data: &Value,
    project: &ProjectPath,
    run_id: &str,
) -> Result<HistoryTable, ApiError> {
    let project_node = data
        .get("project")
        .filter(|node| !node.is_null())
        .ok_or_else(|| ApiError::ProjectNotFound(project.to_string()))?;

    let run_node = project_node
        .get("run")
        .filter(|node| !node.is_null())
        .ok_or_else(|| ApiError::RunNotFound(run_id.to_string()))?;

    let lines = match run_node.get("history") {
        None | Some(Value::Null) => return Ok(HistoryTable::default()),
        Some(Value::Array(lines)) => lines,
        Some(_) => {
            return Err(ApiError::Decode(format!(
                "history of run '{run_id}' is not a list"
            )));
        }
    };

    let rows = lines
        .iter()
        .map(|line| parse_history_row(line, run_id))
        .collect::<Result<Vec<Row>, _>>()?;

    Ok(HistoryTable::from_rows(rows))
}

/// History rows are JSON-encoded objects; already decoded objects are
/// accepted as well.
fn parse_history_row(line: &Value, run_id: &str) -> Result<Row, ApiError> {
    let decoded = match line {
        Value::String(text) => serde_json::from_str(text).map_err(|e| {
            ApiError::Decode(format!("history row of run '{run_id}' is not JSON: {e}"))
        })?,
        other => other.clone(),
    };

    match decoded {
        Value::Object(row) => Ok(row),
        other => Err(ApiError::Decode(format!(
            "history row of run '{run_id}' is not an object: {other}"
        ))),
    }
}

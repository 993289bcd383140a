use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use octocrab::service::middleware::retry::RetryConfig;
use octocrab::Octocrab;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{IssueSource, Page, PageInfo, PageRequest};
use crate::error::SyncError;
use crate::types::{Issue, IssueKind, Repository};

const ISSUE_FIELDS: &str = "author { login } createdAt updatedAt number title url isReadByViewer";
const RATE_LIMIT_FIELDS: &str = "rateLimit { cost remaining resetAt }";
const SEARCH_PAGE_SIZE: u32 = 100;
const REPOSITORY_PAGE_SIZE: u32 = 100;

/// GitHub GraphQL backend using octocrab
pub struct GitHubSource {
    client: Octocrab,
    page_size: u32,
    retries: u32,
    retry_backoff: Duration,
}

impl GitHubSource {
    /// Create a new GitHub source with a bearer token
    pub fn new(token: &str) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .add_retry_config(RetryConfig::None)
            .build()
            .context("Failed to create GitHub client")?;

        Ok(Self::with_client(client))
    }

    /// Wrap an already configured client. Retries are handled here, so the
    /// client's own retry layer should be disabled.
    pub fn with_client(client: Octocrab) -> Self {
        Self {
            client,
            page_size: 50,
            retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Items requested per collection per repository in a bulk request
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Retry transient failures `retries` times, doubling `backoff` each time
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Public, non-archived repositories owned by the authenticated user
    pub async fn viewer_repositories(&self) -> Result<Vec<Repository>, SyncError> {
        let query = format!(
            "query($after: String) {{ viewer {{ repositories(after: $after, first: {REPOSITORY_PAGE_SIZE}, \
             visibility: PUBLIC, ownerAffiliations: [OWNER], isArchived: false) \
             {{ nodes {{ nameWithOwner }} pageInfo {{ endCursor hasNextPage }} }} }} }}"
        );
        self.list_repositories(&query, Map::new(), "viewer").await
    }

    /// Public, non-archived repositories of an organization
    pub async fn organization_repositories(
        &self,
        organization: &str,
    ) -> Result<Vec<Repository>, SyncError> {
        let query = format!(
            "query($after: String, $organization: String!) {{ organization(login: $organization) \
             {{ repositories(after: $after, first: {REPOSITORY_PAGE_SIZE}, visibility: PUBLIC, isArchived: false) \
             {{ nodes {{ nameWithOwner }} pageInfo {{ endCursor hasNextPage }} }} }} }}"
        );
        let mut variables = Map::new();
        variables.insert("organization".into(), json!(organization));
        self.list_repositories(&query, variables, "organization").await
    }

    async fn list_repositories(
        &self,
        query: &str,
        mut variables: Map<String, Value>,
        owner_field: &str,
    ) -> Result<Vec<Repository>, SyncError> {
        let mut repos = Vec::new();
        let mut after: Option<String> = None;

        loop {
            variables.insert("after".into(), json!(after));
            let data = self.graphql(query, Value::Object(variables.clone())).await?;

            let owner = data
                .get(owner_field)
                .filter(|v| !v.is_null())
                .ok_or_else(|| SyncError::FatalApi(format!("{owner_field} not found")))?;
            let connection: Connection<RepositoryNode> =
                decode(owner.get("repositories"), "repositories")?;

            for node in connection.nodes.into_iter().flatten() {
                repos.push(Repository::parse(&node.name_with_owner)?);
            }

            match next_page(connection.page_info)? {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        Ok(repos)
    }

    /// Run a GraphQL document, retrying transient failures
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, SyncError> {
        let payload = json!({ "query": query, "variables": variables });
        let mut delay = self.retry_backoff;
        let mut attempt = 0;

        loop {
            match self.execute(&payload).await {
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "retrying GitHub request");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                result => return result,
            }
        }
    }

    async fn execute(&self, payload: &Value) -> Result<Value, SyncError> {
        let response = self.client._post("/graphql", Some(payload)).await?;
        let status = response.status();
        let body = self.client.body_to_string(response).await?;

        // Gateway timeouts and outage pages rarely carry a GitHub error body
        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), &response_message(&body)));
        }

        extract_data(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl IssueSource for GitHubSource {
    async fn fetch_pages(&self, requests: &[PageRequest]) -> Result<Vec<Page>, SyncError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let batch = BulkQuery::build(requests, self.page_size);
        debug!(repos = batch.groups.len(), pages = requests.len(), "fetching issue pages");
        let data = self.graphql(&batch.query, Value::Object(batch.variables.clone())).await?;
        batch.decode(&data)
    }

    async fn search_updated(
        &self,
        kind: IssueKind,
        since: DateTime<Utc>,
        repositories: &[Repository],
    ) -> Result<Vec<Issue>, SyncError> {
        if repositories.is_empty() {
            return Ok(Vec::new());
        }

        let query = search_document();
        let search = search_string(kind, since, repositories);
        let mut issues = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let data = self
                .graphql(&query, json!({ "search": search, "after": after }))
                .await?;
            let (page, page_info) = decode_search(&data)?;
            issues.extend(page);

            match next_page(page_info)? {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        debug!(%kind, found = issues.len(), "search finished");
        Ok(issues)
    }
}

fn collection_field(kind: IssueKind) -> &'static str {
    match kind {
        IssueKind::Issue => "issues",
        IssueKind::PullRequest => "pullRequests",
    }
}

fn cursor_variable(kind: IssueKind, index: usize) -> String {
    match kind {
        IssueKind::Issue => format!("issues{index}"),
        IssueKind::PullRequest => format!("pulls{index}"),
    }
}

/// One combined GraphQL request covering several repositories
#[derive(Debug)]
struct BulkQuery {
    query: String,
    variables: Map<String, Value>,
    /// Alias, repository and the collections requested for it
    groups: Vec<(String, Repository, Vec<IssueKind>)>,
}

impl BulkQuery {
    fn build(requests: &[PageRequest], page_size: u32) -> Self {
        let mut grouped: Vec<(Repository, Vec<&PageRequest>)> = Vec::new();
        for request in requests {
            match grouped.iter_mut().find(|(repo, _)| *repo == request.repository) {
                Some((_, group)) => group.push(request),
                None => grouped.push((request.repository.clone(), vec![request])),
            }
        }

        let mut declarations = Vec::new();
        let mut blocks = Vec::new();
        let mut variables = Map::new();
        let mut groups = Vec::new();

        for (index, (repository, group)) in grouped.into_iter().enumerate() {
            let alias = format!("r{index}");
            declarations.push(format!("$owner{index}: String!, $name{index}: String!"));
            variables.insert(format!("owner{index}"), json!(repository.owner));
            variables.insert(format!("name{index}"), json!(repository.name));

            let mut collections = Vec::new();
            let mut kinds = Vec::new();
            for request in group {
                let var = cursor_variable(request.kind, index);
                declarations.push(format!("${var}: String"));
                variables.insert(var.clone(), json!(request.after));
                collections.push(format!(
                    "{field}(first: {page_size}, after: ${var}, \
                     orderBy: {{field: UPDATED_AT, direction: DESC}}, states: [OPEN]) \
                     {{ nodes {{ {ISSUE_FIELDS} }} pageInfo {{ endCursor hasNextPage }} }}",
                    field = collection_field(request.kind),
                ));
                kinds.push(request.kind);
            }

            blocks.push(format!(
                "{alias}: repository(owner: $owner{index}, name: $name{index}) {{ {} }}",
                collections.join(" ")
            ));
            groups.push((alias, repository, kinds));
        }

        let query = format!(
            "query({}) {{ {} {RATE_LIMIT_FIELDS} }}",
            declarations.join(", "),
            blocks.join(" ")
        );

        Self {
            query,
            variables,
            groups,
        }
    }

    fn decode(&self, data: &Value) -> Result<Vec<Page>, SyncError> {
        log_rate_limit(data);
        let mut pages = Vec::new();

        for (alias, repository, kinds) in &self.groups {
            let repo_data = data
                .get(alias.as_str())
                .ok_or_else(|| SyncError::Protocol(format!("response is missing {alias}")))?;

            if repo_data.is_null() {
                warn!(%repository, "repository could not be resolved, skipping");
                pages.extend(kinds.iter().map(|kind| Page::empty(repository.clone(), *kind)));
                continue;
            }

            for kind in kinds {
                let field = collection_field(*kind);
                let connection: Connection<IssueNode> = decode(repo_data.get(field), field)?;
                let issues = connection
                    .nodes
                    .into_iter()
                    .flatten()
                    .map(|node| node.into_issue(repository.clone(), *kind))
                    .collect();

                pages.push(Page {
                    repository: repository.clone(),
                    kind: *kind,
                    issues,
                    page_info: connection.page_info.into(),
                });
            }
        }

        Ok(pages)
    }
}

fn search_document() -> String {
    format!(
        "query($search: String!, $after: String) {{ search(query: $search, type: ISSUE, \
         first: {SEARCH_PAGE_SIZE}, after: $after) {{ nodes {{ __typename \
         ... on Issue {{ {ISSUE_FIELDS} repository {{ owner {{ login }} name }} }} \
         ... on PullRequest {{ {ISSUE_FIELDS} repository {{ owner {{ login }} name }} }} }} \
         pageInfo {{ endCursor hasNextPage }} }} {RATE_LIMIT_FIELDS} }}"
    )
}

fn search_string(kind: IssueKind, since: DateTime<Utc>, repositories: &[Repository]) -> String {
    let repos: Vec<String> = repositories.iter().map(|r| format!("repo:{r}")).collect();
    format!(
        "{} {} is:open updated:>{}",
        repos.join(" "),
        kind.search_qualifier(),
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

fn decode_search(data: &Value) -> Result<(Vec<Issue>, PageInfoNode), SyncError> {
    log_rate_limit(data);
    let connection: Connection<SearchNode> = decode(data.get("search"), "search")?;

    let mut issues = Vec::new();
    for node in connection.nodes.into_iter().flatten() {
        let (kind, node) = match node {
            SearchNode::Issue(node) => (IssueKind::Issue, node),
            SearchNode::PullRequest(node) => (IssueKind::PullRequest, node),
        };
        let repository = node
            .repository
            .as_ref()
            .map(|r| Repository::new(&r.owner.login, &r.name))
            .ok_or_else(|| SyncError::Protocol("search result without repository".into()))?;
        issues.push(node.into_issue(repository, kind));
    }

    Ok((issues, connection.page_info))
}

/// Split the `data` member out of a GraphQL response, classifying `errors`
fn extract_data(mut response: Value) -> Result<Value, SyncError> {
    let errors: Vec<GraphQlError> = match response.get_mut("errors").map(Value::take) {
        Some(errors) if !errors.is_null() => serde_json::from_value(errors)?,
        _ => Vec::new(),
    };

    match response.get_mut("data").map(Value::take) {
        Some(data) if !data.is_null() => {
            for error in &errors {
                warn!(kind = ?error.kind, path = ?error.path, "{}", error.message);
            }
            Ok(data)
        }
        _ => Err(classify(&errors)),
    }
}

/// Short description of an error reply, JSON or not
fn response_message(body: &str) -> String {
    let json: Option<Value> = serde_json::from_str(body).ok();
    let message = json
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.pointer("/errors/0/message")))
        .and_then(Value::as_str);

    match message {
        Some(message) => message.to_string(),
        None => body.lines().next().unwrap_or_default().chars().take(200).collect(),
    }
}

fn classify(errors: &[GraphQlError]) -> SyncError {
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    if errors.iter().any(|e| e.kind.as_deref() == Some("RATE_LIMITED")) {
        SyncError::TransientNetwork(message)
    } else if errors
        .iter()
        .any(|e| matches!(e.kind.as_deref(), Some("FORBIDDEN" | "INSUFFICIENT_SCOPES")))
    {
        SyncError::FatalApi(message)
    } else if message.is_empty() {
        SyncError::Protocol("response has neither data nor errors".into())
    } else {
        SyncError::Protocol(message)
    }
}

fn log_rate_limit(data: &Value) {
    if let Some(limit) = data.get("rateLimit").filter(|v| !v.is_null()) {
        debug!(
            cost = ?limit.get("cost"),
            remaining = ?limit.get("remaining"),
            reset_at = ?limit.get("resetAt"),
            "GitHub rate limit"
        );
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Option<&Value>, field: &str) -> Result<T, SyncError> {
    let value = value.ok_or_else(|| SyncError::Protocol(format!("response is missing {field}")))?;
    T::deserialize(value).map_err(|e| SyncError::Protocol(format!("malformed {field}: {e}")))
}

/// Cursor for the next page, or `None` when the collection is exhausted
fn next_page(page_info: PageInfoNode) -> Result<Option<String>, SyncError> {
    match (page_info.has_next_page, page_info.end_cursor) {
        (false, _) => Ok(None),
        (true, Some(cursor)) => Ok(Some(cursor)),
        (true, None) => Err(SyncError::Protocol(
            "hasNextPage is set but endCursor is missing".into(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    path: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<Option<T>>,
    page_info: PageInfoNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfoNode {
    end_cursor: Option<String>,
    has_next_page: bool,
}

impl From<PageInfoNode> for PageInfo {
    fn from(node: PageInfoNode) -> Self {
        PageInfo {
            end_cursor: node.end_cursor,
            has_next_page: node.has_next_page,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    name_with_owner: String,
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    owner: Login,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    author: Option<Login>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    number: u64,
    title: String,
    url: String,
    is_read_by_viewer: Option<bool>,
    repository: Option<RepositoryRef>,
}

impl IssueNode {
    fn into_issue(self, repository: Repository, kind: IssueKind) -> Issue {
        Issue {
            repository,
            kind,
            // Deleted accounts come back as a null author
            author: self.author.map_or_else(|| "ghost".to_string(), |a| a.login),
            created_at: self.created_at,
            updated_at: self.updated_at,
            number: self.number,
            title: self.title,
            url: self.url,
            is_read: self.is_read_by_viewer.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum SearchNode {
    Issue(IssueNode),
    PullRequest(IssueNode),
}

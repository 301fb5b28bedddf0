//! Optional GitHub client behind the repository views. Only built when a
//! token is configured.

use agentrix_protocol::github::{
    GitHubUser, IssueDetail, IssueSummary, PullDetail, PullSummary, RepoSummary,
};
use anyhow::{Context, Result};
use libagentrix::AgentrixError;
use reqwest::{StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const LIST_QUERY: &str = "state=open&per_page=100&sort=updated&direction=desc";

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    /// `None` without a token: the integration is off.
    pub fn from_token(token: Option<String>, api_url: &str) -> Result<Option<Self>> {
        let Some(token) = token else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .user_agent(format!("agentrix/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build GitHub client")?;
        Ok(Some(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        }))
    }

    pub async fn repo_summary(&self, owner: &str, repo: &str) -> Result<RepoSummary, AgentrixError> {
        let issues: Vec<IssueItem> = self
            .get(&format!("/repos/{owner}/{repo}/issues?{LIST_QUERY}"), "issues")
            .await?;
        let pulls: Vec<PullItem> = self
            .get(&format!("/repos/{owner}/{repo}/pulls?{LIST_QUERY}"), "pull requests")
            .await?;

        // The issues endpoint lists pull requests too.
        let issues: Vec<IssueSummary> = issues
            .into_iter()
            .filter(|item| item.pull_request.is_none())
            .map(|item| IssueSummary {
                number: item.number,
                title: item.title,
                html_url: item.html_url,
                labels: label_names(item.labels),
                assignee: item.assignee.map(User::into_wire),
            })
            .collect();
        let pull_requests: Vec<PullSummary> = pulls
            .into_iter()
            .map(|item| PullSummary {
                number: item.number,
                title: item.title,
                html_url: item.html_url,
                labels: label_names(item.labels),
                user: item.user.into_wire(),
            })
            .collect();

        Ok(RepoSummary {
            open_issues_count: count(issues.len()),
            open_prs_count: count(pull_requests.len()),
            issues,
            pull_requests,
        })
    }

    pub async fn issue_detail(
        &self,
        owner: &str,
        repo: &str,
        number: u32,
    ) -> Result<IssueDetail, AgentrixError> {
        let item: IssueDetailItem = self
            .get(&format!("/repos/{owner}/{repo}/issues/{number}"), "issue")
            .await?;
        Ok(IssueDetail {
            number: item.number,
            title: item.title,
            body: item.body.unwrap_or_default(),
            html_url: item.html_url,
            labels: label_names(item.labels),
            assignee: item.assignee.map(User::into_wire),
            user: item.user.into_wire(),
            state: item.state,
        })
    }

    pub async fn pull_detail(
        &self,
        owner: &str,
        repo: &str,
        number: u32,
    ) -> Result<PullDetail, AgentrixError> {
        let item: PullDetailItem = self
            .get(&format!("/repos/{owner}/{repo}/pulls/{number}"), "pull request")
            .await?;
        Ok(PullDetail {
            number: item.number,
            title: item.title,
            body: item.body.unwrap_or_default(),
            html_url: item.html_url,
            labels: label_names(item.labels),
            user: item.user.into_wire(),
            state: item.state,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T, AgentrixError> {
        let url = format!("{}{path}", self.api_url);
        debug!(%url, "github request");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .with_context(|| format!("failed to reach GitHub for {what}"))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AgentrixError::NotFound(format!("GitHub {what} not found")));
        }
        if !status.is_success() {
            return Err(AgentrixError::internal(format!(
                "GitHub {what} fetch failed with status {status}"
            )));
        }
        let body = response
            .json()
            .await
            .with_context(|| format!("failed to parse GitHub {what}"))?;
        Ok(body)
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn label_names(labels: Vec<Label>) -> Vec<String> {
    labels.into_iter().map(|l| l.name).collect()
}

#[derive(Deserialize)]
struct Label {
    name: String,
}

#[derive(Deserialize)]
struct User {
    login: String,
    avatar_url: Option<String>,
}

impl User {
    fn into_wire(self) -> GitHubUser {
        GitHubUser {
            login: self.login,
            avatar_url: self.avatar_url,
        }
    }
}

#[derive(Deserialize)]
struct IssueItem {
    number: u32,
    title: String,
    html_url: String,
    #[serde(default)]
    labels: Vec<Label>,
    assignee: Option<User>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct PullItem {
    number: u32,
    title: String,
    html_url: String,
    user: User,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct IssueDetailItem {
    number: u32,
    title: String,
    body: Option<String>,
    html_url: String,
    #[serde(default)]
    labels: Vec<Label>,
    assignee: Option<User>,
    user: User,
    state: String,
}

#[derive(Deserialize)]
struct PullDetailItem {
    number: u32,
    title: String,
    body: Option<String>,
    html_url: String,
    #[serde(default)]
    labels: Vec<Label>,
    user: User,
    state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_token_means_no_client() {
        assert!(GitHubClient::from_token(None, DEFAULT_API_URL).expect("build").is_none());
        let client = GitHubClient::from_token(Some("t".to_string()), "http://localhost:9/")
            .expect("build")
            .expect("client");
        assert_eq!(client.api_url, "http://localhost:9");
    }

    #[test]
    fn pull_request_marker_is_detected() {
        let items: Vec<IssueItem> = serde_json::from_str(
            r#"[
                {"number": 1, "title": "bug", "html_url": "u1", "labels": [], "assignee": null},
                {"number": 2, "title": "pr", "html_url": "u2", "labels": [], "assignee": null,
                 "pull_request": {"url": "x"}}
            ]"#,
        )
        .expect("parse");
        assert!(items[0].pull_request.is_none());
        assert!(items[1].pull_request.is_some());
    }
}

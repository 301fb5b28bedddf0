//! Read-only GitHub views served next to the repository list.

use serde::{Deserialize, Serialize};

/// A GitHub account as shown in issue and pull request lists.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitHubUser {
    pub login: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssueSummary {
    pub number: u32,
    pub title: String,
    pub html_url: String,
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<GitHubUser>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PullSummary {
    pub number: u32,
    pub title: String,
    pub html_url: String,
    pub labels: Vec<String>,
    pub user: GitHubUser,
}

/// Open issues and pull requests of one repository, most recently updated
/// first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummary {
    pub open_issues_count: u32,
    pub open_prs_count: u32,
    pub issues: Vec<IssueSummary>,
    pub pull_requests: Vec<PullSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssueDetail {
    pub number: u32,
    pub title: String,
    pub body: String,
    pub html_url: String,
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<GitHubUser>,
    pub user: GitHubUser,
    pub state: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PullDetail {
    pub number: u32,
    pub title: String,
    pub body: String,
    pub html_url: String,
    pub labels: Vec<String>,
    pub user: GitHubUser,
    pub state: String,
}

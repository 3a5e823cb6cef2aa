//! Teams directory lookup.
//!
//! Human users come from an external teams service. The reconciler only
//! sees the [`TeamsApi`] trait, so tests and installations without a teams
//! service plug in their own implementation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::Deserialize;
use thiserror::Error;

use crate::util::NamespacedName;

#[derive(Error, Debug)]
pub enum TeamsError {
    #[error("could not get OAuth token: {0}")]
    Token(String),

    #[error("teams API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("teams API returned status {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait TeamsApi: Send + Sync {
    /// Member usernames of the given team.
    async fn team_members(&self, team_id: &str) -> Result<Vec<String>, TeamsError>;
}

/// Used when `enable_teams_api` is off: every team is empty.
pub struct DisabledTeamsApi;

#[async_trait]
impl TeamsApi for DisabledTeamsApi {
    async fn team_members(&self, _team_id: &str) -> Result<Vec<String>, TeamsError> {
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
struct Team {
    #[serde(default, rename = "member")]
    members: Vec<String>,
}

/// HTTP client for the teams service, authenticating with a bearer token
/// read from a secret.
pub struct HttpTeamsApi {
    base_url: String,
    token_secret: NamespacedName,
    kube: Client,
    http: reqwest::Client,
}

impl HttpTeamsApi {
    pub fn new(base_url: String, token_secret: NamespacedName, kube: Client) -> Self {
        Self {
            base_url,
            token_secret,
            kube,
            http: reqwest::Client::new(),
        }
    }

    async fn oauth_token(&self) -> Result<String, TeamsError> {
        let secrets: Api<Secret> =
            Api::namespaced(self.kube.clone(), &self.token_secret.namespace);
        let secret = secrets
            .get(&self.token_secret.name)
            .await
            .map_err(|e| TeamsError::Token(e.to_string()))?;
        let data = secret.data.unwrap_or_default();

        let token_type = data
            .get("read-only-token-type")
            .map(|b| String::from_utf8_lossy(&b.0).to_string())
            .unwrap_or_default();
        if token_type != "Bearer" {
            return Err(TeamsError::Token(format!("wrong token type: {token_type:?}")));
        }
        data.get("read-only-token-secret")
            .map(|b| String::from_utf8_lossy(&b.0).to_string())
            .ok_or_else(|| TeamsError::Token("token secret is missing".to_string()))
    }
}

#[async_trait]
impl TeamsApi for HttpTeamsApi {
    async fn team_members(&self, team_id: &str) -> Result<Vec<String>, TeamsError> {
        let token = self.oauth_token().await?;
        let url = format!("{}/teams/{}", self.base_url.trim_end_matches('/'), team_id);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(TeamsError::Status(response.status()));
        }
        let team: Team = response.json().await?;
        Ok(team.members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_teams_api_returns_no_members() {
        let api = DisabledTeamsApi;
        assert!(api.team_members("acid").await.unwrap().is_empty());
    }

    #[test]
    fn team_payload_parses() {
        let team: Team =
            serde_json::from_str(r#"{"member": ["jdoe", "asmith"], "id": "acid"}"#).unwrap();
        assert_eq!(team.members, vec!["jdoe", "asmith"]);
    }
}

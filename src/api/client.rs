use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::types::{NewProject, RuleFilter};
use crate::config::Config;

/// Backend API client.
///
/// Every call returns raw JSON; decoding into typed values happens at the
/// edge that reads from the cache.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid API url {}: {}", config.api.url, e))?;

    let http = reqwest::Client::builder()
      .timeout(config.api.timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token: config.api_token(),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// List all projects
  pub async fn list_projects(&self) -> Result<Value> {
    self.get("/api/projects/").await
  }

  pub async fn get_project(&self, project_id: &str) -> Result<Value> {
    self.get(&format!("/api/projects/{}", project_id)).await
  }

  pub async fn list_guidelines(&self, project_id: &str) -> Result<Value> {
    self
      .get(&format!("/api/projects/{}/guidelines", project_id))
      .await
  }

  /// List rules, filtered by project, page and category
  pub async fn list_rules(&self, filter: &RuleFilter) -> Result<Value> {
    let request = self.request(Method::GET, "/api/admin/rules")?.query(filter);
    self.send(request, "/api/admin/rules").await
  }

  pub async fn get_compliance(&self, submission_id: &str) -> Result<Value> {
    self
      .get(&format!("/api/compliance/{}", submission_id))
      .await
  }

  pub async fn list_violations(&self, submission_id: &str) -> Result<Value> {
    self
      .get(&format!("/api/compliance/{}/violations", submission_id))
      .await
  }

  pub async fn create_project(&self, project: &NewProject) -> Result<Value> {
    let request = self.request(Method::POST, "/api/projects/")?.json(project);
    self.send(request, "create project").await
  }

  pub async fn delete_project(&self, project_id: &str) -> Result<Value> {
    let path = format!("/api/projects/{}", project_id);
    self.send(self.request(Method::DELETE, &path)?, &path).await
  }

  pub async fn delete_guideline(&self, project_id: &str, guideline_id: &str) -> Result<Value> {
    let path = format!("/api/projects/{}/guidelines/{}", project_id, guideline_id);
    self.send(self.request(Method::DELETE, &path)?, &path).await
  }

  pub async fn delete_rule(&self, project_id: &str, rule_id: &str) -> Result<Value> {
    let path = format!("/api/projects/{}/rules/{}", project_id, rule_id);
    self.send(self.request(Method::DELETE, &path)?, &path).await
  }

  /// Ask the backend to rewrite a rule following free-text instructions
  pub async fn refine_rule(
    &self,
    project_id: &str,
    rule_id: &str,
    instructions: &str,
  ) -> Result<Value> {
    let path = format!("/api/projects/{}/rules/{}/refine", project_id, rule_id);
    let request = self
      .request(Method::POST, &path)?
      .json(&json!({ "instructions": instructions }));
    self.send(request, &path).await
  }

  async fn get(&self, path: &str) -> Result<Value> {
    self.send(self.request(Method::GET, path)?, path).await
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid API path {}: {}", path, e))?;

    let mut request = self.http.request(method, url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    Ok(request)
  }

  async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value> {
    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request failed ({}): {}", what, e))?;

    let status = response.status();
    debug!(%status, what, "API response");

    if status == StatusCode::NO_CONTENT {
      return Ok(Value::Null);
    }

    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read response ({}): {}", what, e))?;

    if !status.is_success() {
      return Err(eyre!("{} returned {}: {}", what, status, error_detail(&body)));
    }

    if body.trim().is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| eyre!("Failed to parse response ({}): {}", what, e))
  }
}

/// FastAPI reports failures as `{"detail": ...}`
fn error_detail(body: &str) -> String {
  serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| v.get("detail").cloned())
    .map(|d| match d {
      Value::String(s) => s,
      other => other.to_string(),
    })
    .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(url: &str) -> Config {
    Config::from_yaml(&format!("api:\n  url: {}\n  token: secret\n", url)).expect("parse")
  }

  #[test]
  fn test_rejects_invalid_url() {
    assert!(ApiClient::new(&config("not a url")).is_err());
  }

  #[test]
  fn test_paths_join_onto_base() {
    let client = ApiClient::new(&config("http://localhost:8000")).expect("client");
    let request = client
      .request(Method::GET, "/api/projects/p1/guidelines")
      .expect("request")
      .build()
      .expect("build");
    assert_eq!(
      request.url().as_str(),
      "http://localhost:8000/api/projects/p1/guidelines"
    );
  }

  #[test]
  fn test_error_detail_prefers_detail_field() {
    assert_eq!(error_detail(r#"{"detail":"Project not found"}"#), "Project not found");
    assert_eq!(error_detail("Bad Gateway"), "Bad Gateway");
  }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Project summary
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Project {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  pub created_by: String,
}

/// Payload for creating a project
#[derive(Debug, Clone, Serialize)]
pub struct NewProject {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

/// Uploaded guideline document
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Guideline {
  pub id: String,
  pub title: String,
  pub created_at: DateTime<Utc>,
}

/// Compliance rule extracted from a guideline
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Rule {
  pub id: String,
  pub category: String,
  pub rule_text: String,
  pub severity: String,
  #[serde(default)]
  pub keywords: Vec<String>,
  pub pattern: Option<String>,
  #[serde(default = "default_active")]
  pub is_active: bool,
  pub created_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
  true
}

/// Rule list filters. Each distinct filter is its own cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub project_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

impl RuleFilter {
  pub fn for_project(project_id: impl Into<String>) -> Self {
    Self {
      project_id: Some(project_id.into()),
      ..Self::default()
    }
  }

  pub fn page(mut self, page: u32) -> Self {
    self.page = Some(page);
    self
  }

  pub fn category(mut self, category: impl Into<String>) -> Self {
    self.category = Some(category.into());
    self
  }
}

/// Result of a compliance check on one submission
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ComplianceCheck {
  pub id: Option<String>,
  pub submission_id: String,
  pub overall_score: Option<f64>,
  pub status: Option<String>,
  pub summary: Option<String>,
  pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Violation {
  pub id: Option<String>,
  pub category: String,
  pub severity: String,
  pub rule_id: Option<String>,
  pub description: String,
  pub location: Option<String>,
  pub current_text: Option<String>,
  pub suggested_fix: Option<String>,
  #[serde(default)]
  pub auto_fixable: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_rule_defaults_for_missing_fields() {
    let rule: Rule = serde_json::from_value(json!({
      "id": "r1",
      "category": "irdai",
      "rule_text": "Disclose the insurer name",
      "severity": "high",
      "pattern": null,
      "created_at": null
    }))
    .expect("decode");

    assert!(rule.is_active);
    assert!(rule.keywords.is_empty());
  }

  #[test]
  fn test_filter_skips_unset_fields() {
    let filter = RuleFilter::for_project("p1").page(2);
    assert_eq!(
      serde_json::to_value(&filter).expect("encode"),
      json!({"project_id": "p1", "page": 2})
    );
  }
}

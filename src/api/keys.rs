//! Query keys for the compliance backend.
//!
//! Keys are hierarchical so that a mutation can invalidate a whole family,
//! e.g. `["rules","list"]` covers every filtered rule list.

use serde_json::Value;

use super::types::RuleFilter;
use crate::cache::{QueryKey, Segment};
use crate::query_key;

/// Query key types for backend API calls.
#[derive(Clone, Debug, PartialEq)]
pub enum ApiKey {
  /// All projects visible to the user
  Projects,
  /// A single project
  ProjectDetail { project_id: String },
  /// Guidelines uploaded to a project
  Guidelines { project_id: String },
  /// Rule list under a filter
  Rules { filter: RuleFilter },
  /// Compliance check for a submission
  Submission { submission_id: String },
  /// Violations found in a submission
  Violations { submission_id: String },
}

impl ApiKey {
  pub fn to_query_key(&self) -> QueryKey {
    match self {
      Self::Projects => query_key!["projects", "list"],
      Self::ProjectDetail { project_id } => query_key!["projects", "detail", project_id],
      Self::Guidelines { project_id } => query_key!["guidelines", "list", project_id],
      Self::Rules { filter } => {
        // RuleFilter only holds strings and integers
        let filter = serde_json::to_value(filter).unwrap_or(Value::Null);
        query_key!["rules", "list"].with(Segment::from_json(&filter))
      }
      Self::Submission { submission_id } => {
        query_key!["compliance", "submission", submission_id]
      }
      Self::Violations { submission_id } => {
        query_key!["compliance", "violations", submission_id]
      }
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Projects => "all projects".to_string(),
      Self::ProjectDetail { project_id } => format!("project {}", project_id),
      Self::Guidelines { project_id } => format!("guidelines for project {}", project_id),
      Self::Rules { filter } => match &filter.project_id {
        Some(p) => format!("rules for project {}", p),
        None => "all rules".to_string(),
      },
      Self::Submission { submission_id } => format!("compliance check {}", submission_id),
      Self::Violations { submission_id } => format!("violations in {}", submission_id),
    }
  }
}

impl From<ApiKey> for QueryKey {
  fn from(key: ApiKey) -> Self {
    key.to_query_key()
  }
}

impl From<&ApiKey> for QueryKey {
  fn from(key: &ApiKey) -> Self {
    key.to_query_key()
  }
}

/// Every project query, lists and details alike
pub fn projects() -> QueryKey {
  query_key!["projects"]
}

/// Every rule list, whatever the filter
pub fn rule_lists() -> QueryKey {
  query_key!["rules", "list"]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rule_lists_cover_every_filter() {
    let unfiltered = ApiKey::Rules {
      filter: RuleFilter::default(),
    };
    let paged = ApiKey::Rules {
      filter: RuleFilter::for_project("p1").page(3).category("brand"),
    };

    assert!(unfiltered.to_query_key().starts_with(&rule_lists()));
    assert!(paged.to_query_key().starts_with(&rule_lists()));
    assert_ne!(unfiltered.to_query_key(), paged.to_query_key());
  }

  #[test]
  fn test_projects_prefix_covers_list_and_detail() {
    let list: QueryKey = ApiKey::Projects.into();
    let detail: QueryKey = ApiKey::ProjectDetail {
      project_id: "p1".into(),
    }
    .into();

    assert!(list.starts_with(&projects()));
    assert!(detail.starts_with(&projects()));
    assert!(!list.starts_with(&detail));
  }

  #[test]
  fn test_guidelines_are_scoped_per_project() {
    let a = ApiKey::Guidelines {
      project_id: "a".into(),
    }
    .to_query_key();
    let b = ApiKey::Guidelines {
      project_id: "b".into(),
    }
    .to_query_key();

    assert!(!a.starts_with(&b));
    assert!(a.starts_with(&query_key!["guidelines"]));
  }

  #[test]
  fn test_same_filter_builds_same_key() {
    let a = ApiKey::Rules {
      filter: RuleFilter::for_project("p1").category("seo"),
    };
    let b = ApiKey::Rules {
      filter: RuleFilter::for_project("p1").category("seo"),
    };
    assert_eq!(a.to_query_key(), b.to_query_key());
  }
}

//! Append-only audit trail of actor mutations.

use crate::error::{ResolverError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PERSON_SCOPE: &str = "Person";

pub const ACTIVITY_DELETED: &str = "deleted";
pub const ACTIVITY_WAS_MERGED_INTO_PERSON: &str = "was_merged_into_person";
pub const ACTIVITY_PEOPLE_MERGED_INTO: &str = "people_merged_into";
pub const ACTIVITY_SPLIT_PERSON: &str = "split_person";
pub const ACTIVITY_DELETE_PROPERTY: &str = "delete_property";
pub const ACTIVITY_UPDATED: &str = "updated";

/// User performing the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub email: Option<String>,
    pub first_name: Option<String>,
}

/// Who is acting, and for which team.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditContext {
    pub team_id: i64,
    pub organization_id: Uuid,
    pub user: Option<UserRef>,
}

impl AuditContext {
    pub fn record(&self, item_id: impl ToString, activity: &str, detail: Detail) -> ActivityRecord {
        ActivityRecord::person(
            self.team_id,
            self.organization_id,
            self.user.clone(),
            item_id,
            activity,
            detail,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub change_type: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl Change {
    pub fn new(change_type: &str, action: &str) -> Self {
        Self {
            change_type: change_type.to_string(),
            action: action.to_string(),
            field: None,
            before: None,
            after: None,
        }
    }

    pub fn field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    pub fn after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }
}

/// Source/target snapshots of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merge {
    #[serde(rename = "type")]
    pub merge_type: String,
    pub source: Option<Value>,
    pub target: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<Change>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<Merge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub team_id: i64,
    pub organization_id: Uuid,
    pub user: Option<UserRef>,
    pub scope: String,
    pub item_id: String,
    pub activity: String,
    pub detail: Detail,
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn person(
        team_id: i64,
        organization_id: Uuid,
        user: Option<UserRef>,
        item_id: impl ToString,
        activity: &str,
        detail: Detail,
    ) -> Self {
        Self {
            team_id,
            organization_id,
            user,
            scope: PERSON_SCOPE.to_string(),
            item_id: item_id.to_string(),
            activity: activity.to_string(),
            detail,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityQuery {
    pub scope: String,
    pub team_id: i64,
    pub item_id: Option<String>,
    pub limit: u32,
    /// 1-based
    pub page: u32,
}

impl ActivityQuery {
    pub const DEFAULT_LIMIT: u32 = 10;

    pub fn new(scope: &str, team_id: i64, item_id: Option<String>, limit: u32, page: u32) -> Result<Self> {
        if limit == 0 || page == 0 {
            return Err(ResolverError::validation(
                "Invalid parameter",
                "limit and page must be positive",
            ));
        }
        Ok(Self {
            scope: scope.to_string(),
            team_id,
            item_id,
            limit,
            page,
        })
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.limit as u64
    }
}

/// One page of records, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityPage {
    pub results: Vec<ActivityRecord>,
    pub total_count: u64,
    pub limit: u32,
    pub page: u32,
}

impl ActivityPage {
    pub fn has_next(&self) -> bool {
        (self.page as u64) * (self.limit as u64) < self.total_count
    }

    pub fn has_previous(&self) -> bool {
        self.page > 1
    }
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn log(&self, record: ActivityRecord) -> Result<()>;

    async fn load(&self, query: &ActivityQuery) -> Result<ActivityPage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detail_serialization_skips_empty() {
        let detail = Detail {
            changes: vec![Change::new("Person", "split").after(json!({"distinct_ids": ["a", "b"]}))],
            ..Default::default()
        };
        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(
            value,
            json!({"changes": [{"type": "Person", "action": "split", "after": {"distinct_ids": ["a", "b"]}}]})
        );
    }

    #[test]
    fn test_page_flags() {
        let page = ActivityPage {
            results: Vec::new(),
            total_count: 25,
            limit: 10,
            page: 2,
        };
        assert!(page.has_next());
        assert!(page.has_previous());
        let last = ActivityPage { page: 3, ..page };
        assert!(!last.has_next());
    }

    #[test]
    fn test_zero_page_rejected() {
        assert!(ActivityQuery::new(PERSON_SCOPE, 1, None, 10, 0).is_err());
    }
}

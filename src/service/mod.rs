//! Request-facing services
//!
//! Framework-agnostic handlers: a transport parses the request into a
//! [`RequestContext`], calls a service method and writes the [`Reply`] it gets
//! back. Errors are turned into replies with [`error_reply`].

pub mod person;
pub mod property_definition;

pub use person::PersonService;
pub use property_definition::PropertyDefinitionService;

use crate::activity::{AuditContext, UserRef};
use crate::error::{ErrorBody, ResolverError, Result};
use crate::filter::RequestParams;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamScope {
    pub team_id: i64,
    pub organization_id: Uuid,
}

/// Everything a handler needs from the incoming request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub team: TeamScope,
    pub user: Option<UserRef>,
    /// Absolute request URL; pagination links are derived from it
    pub url: String,
    pub params: RequestParams,
    pub now: DateTime<Utc>,
}

impl RequestContext {
    /// Query string from `url`, overlaid with the JSON `body` when present.
    pub fn new(team: TeamScope, user: Option<UserRef>, url: &str, body: Option<Value>) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| ResolverError::validation("Invalid request URL", e.to_string()))?;
        let mut params = RequestParams::from_url(&parsed);
        if let Some(body) = body {
            params = params.merge_body(body)?;
        }
        Ok(Self {
            team,
            user,
            url: url.to_string(),
            params,
            now: Utc::now(),
        })
    }

    pub fn team_id(&self) -> i64 {
        self.team.team_id
    }

    pub fn audit(&self) -> AuditContext {
        AuditContext {
            team_id: self.team.team_id,
            organization_id: self.team.organization_id,
            user: self.user.clone(),
        }
    }
}

/// Status plus body. `body` is `None` for bodiless replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub status: u16,
    pub body: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(body: T) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    pub fn created(body: T) -> Self {
        Self {
            status: 201,
            body: Some(body),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }
}

/// Reply for a failed request. 404s carry no body; server errors carry the
/// generic body only.
pub fn error_reply(err: &ResolverError) -> Reply<ErrorBody> {
    Reply {
        status: err.status_code(),
        body: err.error_body(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Success {
    pub success: bool,
}

impl Success {
    pub fn new() -> Self {
        Self { success: true }
    }
}

impl Default for Success {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn team() -> TeamScope {
        TeamScope {
            team_id: 2,
            organization_id: Uuid::nil(),
        }
    }

    #[test]
    fn test_body_overrides_query() {
        let ctx = RequestContext::new(
            team(),
            None,
            "http://localhost/api/person/?limit=5&search=bob",
            Some(json!({"limit": 7})),
        )
        .unwrap();
        assert_eq!(ctx.params.get_u32("limit").unwrap(), Some(7));
        assert_eq!(ctx.params.get_str("search").as_deref(), Some("bob"));
    }

    #[test]
    fn test_relative_url_rejected() {
        let err = RequestContext::new(team(), None, "/api/person/", None).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_error_reply_shapes() {
        let reply = error_reply(&ResolverError::NotFound("person '9'".into()));
        assert_eq!(reply.status, 404);
        assert!(reply.body.is_none());

        let reply = error_reply(&ResolverError::missing_parameter("target_date"));
        assert_eq!(reply.status, 400);
        assert!(reply.body.is_some());
    }
}

//! Training session resources — the one business fact the call client
//! consumes is who the session's trainer is.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::client::FitClient;
use crate::call::CallRole;

/// A user profile as the API returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

impl Profile {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("unknown")
    }
}

/// A training session resource.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingSession {
    pub id: String,
    pub title: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "scheduledAt")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub trainer: Profile,
    pub trainee: Option<Profile>,
}

impl TrainingSession {
    /// The trainer drives the offer side of the call; everyone else answers.
    pub fn role_for(&self, user_id: &str) -> CallRole {
        if self.trainer.id == user_id {
            CallRole::Offerer
        } else {
            CallRole::Answerer
        }
    }
}

pub async fn get_session(client: &FitClient, session_id: &str) -> Result<TrainingSession> {
    client
        .get_json(&format!("/api/v1/sessions/{}", session_id))
        .await
}

pub async fn list_upcoming(client: &FitClient, limit: usize) -> Result<Vec<TrainingSession>> {
    #[derive(Deserialize)]
    struct Page {
        sessions: Vec<TrainingSession>,
    }
    let page: Page = client
        .get_json(&format!("/api/v1/sessions/upcoming?limit={}", limit))
        .await?;
    Ok(page.sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_session() {
        let json = r#"{
            "id": "s-42",
            "title": "Strength basics",
            "status": "scheduled",
            "scheduledAt": "2026-08-07T09:00:00Z",
            "trainer": {"id": "u-1", "displayName": "Sam"},
            "trainee": {"id": "u-2", "displayName": "Kim"}
        }"#;
        let session: TrainingSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.role_for("u-1"), CallRole::Offerer);
        assert_eq!(session.role_for("u-2"), CallRole::Answerer);
        assert_eq!(session.role_for("u-999"), CallRole::Answerer);
    }

    #[test]
    fn test_sparse_session_parses() {
        // The API omits optional fields freely.
        let json = r#"{"id": "s-1", "trainer": {"id": "u-1"}}"#;
        let session: TrainingSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.trainer.name(), "unknown");
        assert!(session.trainee.is_none());
        assert!(session.scheduled_at.is_none());
    }
}

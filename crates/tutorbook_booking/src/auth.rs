// --- File: crates/tutorbook_booking/src/auth.rs ---
//! Caller identity.
//!
//! Authentication happens upstream; the proxy forwards the resolved user as `X-User-Id` and
//! `X-User-Role`. Handlers take an [`AuthContext`] and pass it explicitly into every engine call.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tutorbook_common::TutorbookError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Learner,
    Tutor,
    Admin,
}

impl FromStr for Role {
    type Err = TutorbookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "learner" => Ok(Role::Learner),
            "tutor" => Ok(Role::Tutor),
            "admin" => Ok(Role::Admin),
            other => Err(TutorbookError::AuthError(format!("unknown role '{}'", other))),
        }
    }
}

/// The already-authenticated caller of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub role: Role,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn learner(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Learner)
    }

    pub fn tutor(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Tutor)
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn is(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = TutorbookError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| -> Result<String, TutorbookError> {
            parts
                .headers
                .get(name)
                .ok_or_else(|| TutorbookError::AuthError(format!("missing {} header", name)))?
                .to_str()
                .map(|value| value.trim().to_string())
                .map_err(|_| TutorbookError::AuthError(format!("malformed {} header", name)))
        };

        let user_id = header(USER_ID_HEADER)?;
        if user_id.is_empty() {
            return Err(TutorbookError::AuthError("empty user id".to_string()));
        }
        let role = header(USER_ROLE_HEADER)?.parse()?;
        Ok(AuthContext { user_id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tutorbook_common::HttpStatusCode;

    async fn extract(request: Request<()>) -> Result<AuthContext, TutorbookError> {
        let (mut parts, _) = request.into_parts();
        AuthContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_extracts_user_and_role() {
        let request = Request::builder()
            .header(USER_ID_HEADER, "learner-1")
            .header(USER_ROLE_HEADER, "Learner")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.unwrap(), AuthContext::learner("learner-1"));
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthenticated() {
        let request = Request::builder()
            .header(USER_ROLE_HEADER, "tutor")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.unwrap_err().status_code(), 401);

        let request = Request::builder()
            .header(USER_ID_HEADER, "u-1")
            .header(USER_ROLE_HEADER, "owner")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.unwrap_err().status_code(), 401);
    }
}

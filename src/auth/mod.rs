//! Caller identity.
//!
//! The service sits behind the Engage gateway, which authenticates the user and
//! forwards the identity as trusted headers.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub is_admin: bool,
}

impl AuthenticatedUser {
    /// Admins may act on any user's orders.
    pub fn can_access(&self, owner: Option<Uuid>) -> bool {
        self.is_admin || owner == Some(self.user_id)
    }

    fn from_parts(parts: &Parts) -> Result<Self, ServiceError> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ServiceError::Unauthorized("Missing user identity".into()))?;

        let user_id = raw
            .to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .ok_or_else(|| ServiceError::Unauthorized("Invalid user identity".into()))?;

        let is_admin = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|role| role.trim().eq_ignore_ascii_case(ADMIN_ROLE))
            .unwrap_or(false);

        Ok(Self { user_id, is_admin })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_parts(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn reads_user_and_role() {
        let id = Uuid::new_v4();
        let id_header = id.to_string();
        let mut p = parts(&[(USER_ID_HEADER, id_header.as_str()), (USER_ROLE_HEADER, "Admin")]);
        let user = AuthenticatedUser::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(user.user_id, id);
        assert!(user.is_admin);
        assert!(user.can_access(Some(Uuid::new_v4())));
    }

    #[tokio::test]
    async fn plain_users_only_access_their_own_orders() {
        let id = Uuid::new_v4();
        let id_header = id.to_string();
        let mut p = parts(&[(USER_ID_HEADER, id_header.as_str())]);
        let user = AuthenticatedUser::from_request_parts(&mut p, &()).await.unwrap();
        assert!(!user.is_admin);
        assert!(user.can_access(Some(id)));
        assert!(!user.can_access(Some(Uuid::new_v4())));
        assert!(!user.can_access(None));
    }

    #[tokio::test]
    async fn missing_or_invalid_identity_is_unauthorized() {
        let mut missing = parts(&[]);
        assert_matches!(
            AuthenticatedUser::from_request_parts(&mut missing, &()).await,
            Err(ServiceError::Unauthorized(_))
        );

        let mut invalid = parts(&[(USER_ID_HEADER, "not-a-uuid")]);
        assert_matches!(
            AuthenticatedUser::from_request_parts(&mut invalid, &()).await,
            Err(ServiceError::Unauthorized(_))
        );
    }
}

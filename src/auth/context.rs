use uuid::Uuid;

use crate::errors::ServiceError;
use crate::types::UserRole;

/// Represents the authentication context for the current operation.
///
/// Identity is always threaded explicitly through service calls; there is no
/// ambient "current user" anywhere in the crate.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: Uuid,

    /// The role of the authenticated user
    pub role: UserRole,

    /// The ID of the device the request originated from
    pub device_id: Option<String>,
}

impl AuthContext {
    /// Create a new authentication context
    pub fn new(user_id: Uuid, role: UserRole, device_id: Option<String>) -> Self {
        Self {
            user_id,
            role,
            device_id,
        }
    }

    /// Context for internal system operations (retention jobs, workers)
    pub fn internal_system_context() -> Self {
        Self {
            user_id: Uuid::nil(),
            role: UserRole::Admin,
            device_id: Some("system".to_string()),
        }
    }

    /// Verify user is an admin
    pub fn authorize_admin(&self) -> Result<(), ServiceError> {
        if matches!(self.role, UserRole::Admin) {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(
                "This action requires administrator privileges".to_string(),
            ))
        }
    }

    /// Verify user may use operator-facing surfaces
    pub fn authorize_operator(&self) -> Result<(), ServiceError> {
        if self.role.is_operator() {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(
                "This action requires operator privileges".to_string(),
            ))
        }
    }

    /// For operations restricted to the user's own records
    pub fn authorize_self_or_admin(&self, resource_owner_id: &Uuid) -> Result<(), ServiceError> {
        if &self.user_id == resource_owner_id || matches!(self.role, UserRole::Admin) {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(
                "You do not have permission to access this resource".to_string(),
            ))
        }
    }
}

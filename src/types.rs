use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::{DomainError, ValidationError};

/// UserRole enum for authorization in the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    FieldTeamLead,
    FieldOfficer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::FieldTeamLead => "field_team_lead",
            UserRole::FieldOfficer => "field_officer",
        }
    }

    /// Roles allowed to use operator-facing surfaces (queue status, audit log)
    pub fn is_operator(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::FieldTeamLead)
    }
}

impl FromStr for UserRole {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "field_team_lead" => Ok(UserRole::FieldTeamLead),
            "field_officer" => Ok(UserRole::FieldOfficer),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "role",
                &format!("Unknown role: {}", s),
            ))),
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationParams {
    pub limit: u32,
    pub offset: u32,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl PaginationParams {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, 500),
            offset,
        }
    }
}

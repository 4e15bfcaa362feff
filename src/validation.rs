use uuid::Uuid;

use crate::errors::{DomainError, DomainResult, ValidationError};

/// A trait that entities should implement for validation.
pub trait Validate {
    /// Validates the entity and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

/// Struct for configuring validations in a fluent style
pub struct ValidationBuilder<T> {
    field_name: String,
    value: Option<T>,
    errors: Vec<ValidationError>,
}

impl<T> ValidationBuilder<T> {
    pub fn new(field_name: &str, value: Option<T>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value,
            errors: Vec::new(),
        }
    }

    /// Require the value to be present
    pub fn required(mut self) -> Self {
        if self.value.is_none() {
            self.errors.push(ValidationError::required(&self.field_name));
        }
        self
    }

    /// Finish validation, surfacing the first recorded error
    pub fn validate(mut self) -> DomainResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Validation(self.errors.remove(0)))
        }
    }
}

impl ValidationBuilder<String> {
    pub fn min_length(mut self, min: usize) -> Self {
        if let Some(value) = &self.value {
            if value.chars().count() < min {
                self.errors
                    .push(ValidationError::min_length(&self.field_name, min));
            }
        }
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        if let Some(value) = &self.value {
            if value.chars().count() > max {
                self.errors
                    .push(ValidationError::max_length(&self.field_name, max));
            }
        }
        self
    }

    pub fn not_blank(mut self) -> Self {
        if let Some(value) = &self.value {
            if value.trim().is_empty() {
                self.errors.push(ValidationError::invalid_value(
                    &self.field_name,
                    "must not be blank",
                ));
            }
        }
        self
    }
}

impl ValidationBuilder<Uuid> {
    pub fn not_nil(mut self) -> Self {
        if let Some(value) = &self.value {
            if value.is_nil() {
                self.errors.push(ValidationError::invalid_value(
                    &self.field_name,
                    "must not be the nil UUID",
                ));
            }
        }
        self
    }
}

use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::repos::RepoError, cache::CodecError, domain::error::DomainError,
    infra::error::InfraError,
};

/// An error together with its source chain, outermost first.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }

    pub fn render(&self) -> String {
        self.messages.join(": ")
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => 2,
            AppError::NotFound | AppError::Repo(RepoError::NotFound) => 3,
            AppError::Infra(InfraError::Database { .. })
            | AppError::Repo(RepoError::Unavailable(_) | RepoError::Timeout) => 4,
            _ => 1,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }
}

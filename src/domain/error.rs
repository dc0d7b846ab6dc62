use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("malformed saved query for `{entity_type}`: {message}")]
    MalformedQuery {
        entity_type: String,
        message: String,
    },
}

impl DomainError {
    pub fn malformed_query(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedQuery {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }
}

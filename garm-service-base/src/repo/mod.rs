use sqlx::error::ErrorKind;

pub mod controller;
pub mod credentials;
pub mod entity;
pub mod instance;
pub mod job;
pub mod pool;
pub mod scale_set;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Unique,
    #[error("operation conflicts with existing records: {0}")]
    Conflict(String),
    #[error("internal repository error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db_error) => match db_error.kind() {
                ErrorKind::UniqueViolation => RepoError::Unique,
                ErrorKind::ForeignKeyViolation => {
                    RepoError::Conflict(db_error.message().to_string())
                }
                _ => RepoError::Internal(error.to_string()),
            },
            _ => RepoError::Internal(error.to_string()),
        }
    }
}

pub(crate) fn parse_enum<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("invalid {what}: {value}"))
}

pub(crate) fn parse_uuid(value: &str, what: &str) -> Result<uuid::Uuid, String> {
    uuid::Uuid::parse_str(value).map_err(|_| format!("invalid {what}: {value}"))
}

/// Storage and internal faults — the "Error" channel of the applier's
/// three-way outcome (Applied / Conflict / Error). Never constructed for an
/// apply-failed precondition; those are [`crate::apply::ApplyOutcome::Conflict`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("table id already exists: {0}")]
    DuplicateTableId(String),

    #[error("cursor already exists: {0}")]
    DuplicateCursor(String),

    #[error("invalid state: {0}")]
    State(&'static str),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type EngineResult<T> = Result<T, EngineError>;

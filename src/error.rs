use thiserror::Error;

/// Authored course content that cannot be evaluated as configured.
///
/// These are data problems, not transient failures: callers report them and
/// do not retry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrityError {
    #[error("course item {item_id}: unknown kind {kind:?}")]
    UnknownKind { item_id: String, kind: String },
    #[error("course item {item_id}: unknown evaluation policy {policy:?}")]
    UnknownPolicy { item_id: String, policy: String },
    #[error("course item {item_id} is a leaf but has child {child_id}")]
    ChildrenUnderLeaf { item_id: String, child_id: String },
    #[error("course item {item_id} is a leaf but sets group-only field {field}")]
    GroupFieldOnLeaf {
        item_id: String,
        field: &'static str,
    },
    #[error("course item {item_id}: chooseMin {min} exceeds chooseMax {max}")]
    ChooseRange { item_id: String, min: i64, max: i64 },
    #[error("course item {item_id}: negative {field}")]
    NegativeChoose {
        item_id: String,
        field: &'static str,
    },
    #[error("course item {item_id} is part of a parent cycle")]
    Cycle { item_id: String },
}

impl IntegrityError {
    pub fn item_id(&self) -> &str {
        match self {
            IntegrityError::UnknownKind { item_id, .. }
            | IntegrityError::UnknownPolicy { item_id, .. }
            | IntegrityError::ChildrenUnderLeaf { item_id, .. }
            | IntegrityError::GroupFieldOnLeaf { item_id, .. }
            | IntegrityError::ChooseRange { item_id, .. }
            | IntegrityError::NegativeChoose { item_id, .. }
            | IntegrityError::Cycle { item_id } => item_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error("course item tree could not be loaded: {0}")]
    TreeLoad(#[source] rusqlite::Error),
    #[error("course item {item_id} not found in course {course_id}")]
    RootNotFound { course_id: String, item_id: String },
    #[error("results could not be read: {0}")]
    ResultRead(#[source] rusqlite::Error),
    #[error("selection could not be persisted: {0}")]
    Persistence(#[source] rusqlite::Error),
    #[error("configuration integrity: {0}")]
    ConfigurationIntegrity(#[from] IntegrityError),
}

impl RecomputeError {
    pub fn code(&self) -> &'static str {
        match self {
            RecomputeError::TreeLoad(_) | RecomputeError::RootNotFound { .. } => "tree_load_failed",
            RecomputeError::ResultRead(_) => "result_read_failed",
            RecomputeError::Persistence(_) => "persistence_failed",
            RecomputeError::ConfigurationIntegrity(_) => "configuration_integrity",
        }
    }
}

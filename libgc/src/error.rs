use crate::models::ObjectReference;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict on {0}")]
    Conflict(String),
    /// The requested watch revision is no longer available; relist.
    #[error("watch expired: {0}")]
    Expired(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unable to get REST mapping for kind: {kind}, version: {api_version}")]
    UnknownKind { api_version: String, kind: String },
}

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("update retries ({retries}) exhausted for {object}, will retry later")]
    RetriesExhausted {
        object: ObjectReference,
        retries: usize,
    },
    #[error("failed to orphan {failed} dependent(s) of {owner}: {first}")]
    OrphanFailed {
        owner: ObjectReference,
        failed: usize,
        first: Box<GcError>,
    },
}

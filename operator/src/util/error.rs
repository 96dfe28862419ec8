/// Error classification from spec.md §7. Every `Error` is classified
/// before it is surfaced to the reconciler's top-level match; only
/// `InvalidSpec` and `MissingDependency` are terminal without user
/// action (no further scheduling until the Skyhook's generation bumps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// (a) retried with exponential backoff via the work queue.
    Transient,
    /// (b) patch conflict — reconcile retried immediately with refreshed state.
    Conflict,
    /// (c) Skyhook condition `Erroring` set, no further scheduling until
    /// spec edit bumps generation.
    InvalidSpec,
    /// (d) node package state becomes `erroring`, counted in a batch.
    RunnerPodFailure,
    /// (e) Skyhook `erroring`, no dispatch.
    MissingDependency,
    /// (f) reconcile aborted, backoff, state machine does not advance.
    MigrationFailure,
    /// (g) node stays `in_progress`, reconciler requeues, never forced.
    EvictionBlocked,
}

impl ErrorKind {
    /// (c) and (e) are terminal without user action — the Skyhook
    /// condition says so and nothing will change until the spec does.
    pub fn terminal_without_user_action(self) -> bool {
        matches!(self, ErrorKind::InvalidSpec | ErrorKind::MissingDependency)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("invalid Skyhook spec: {0}")]
    InvalidSpec(String),

    #[error("missing dependency: package {0:?} depends on {1:?}, which is not in the spec")]
    MissingDependency(String, String),

    #[error("dependency graph contains a cycle touching {0:?}")]
    CyclicDependency(String),

    #[error("runner pod failed for node {node} package {package}: {reason}")]
    RunnerPodFailure {
        node: String,
        package: String,
        reason: String,
    },

    #[error("eviction blocked by PodDisruptionBudget for node {0:?}")]
    EvictionBlocked(String),

    #[error("migration to version {0:?} failed: {1}")]
    MigrationFailed(String, String),

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("resource is missing a required field: {0}")]
    MissingField(&'static str),

    #[error("finalizer error: {0}")]
    Finalizer(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { source } => classify_kube_error(source),
            Error::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Error::MissingDependency(..) | Error::CyclicDependency(_) => {
                ErrorKind::MissingDependency
            }
            Error::RunnerPodFailure { .. } => ErrorKind::RunnerPodFailure,
            Error::EvictionBlocked(_) => ErrorKind::EvictionBlocked,
            Error::MigrationFailed(..) => ErrorKind::MigrationFailure,
            Error::Json { .. } | Error::MissingField(_) | Error::Finalizer(_) => ErrorKind::Transient,
        }
    }
}

fn classify_kube_error(source: &kube::Error) -> ErrorKind {
    match source {
        kube::Error::Api(resp) if resp.code == 409 => ErrorKind::Conflict,
        kube::Error::Api(resp) if resp.code == 422 => ErrorKind::InvalidSpec,
        _ => ErrorKind::Transient,
    }
}

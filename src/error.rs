use thiserror::Error;

#[derive(Error, Debug)]
pub enum BdmmError {
    #[error("Invalid rate schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    #[error("Invalid likelihood configuration: {0}")]
    InvalidConfig(String),

    #[error("Equilibrium frequencies are invalid: {0}")]
    InvalidFrequencies(String),

    #[error("Sample at node {node} has no type label, but the model has {n_types} types.")]
    MissingTypeLabel { node: usize, n_types: usize },

    #[error("Sample at node {node} has type label '{label}', which is not one of the model types.")]
    UnknownTypeLabel { node: usize, label: String },

    #[error("ODE solver failed while integrating from t={t_start} to t={t_end}: {reason}")]
    Solver {
        t_start: f64,
        t_end: f64,
        reason: String,
    },

    #[error(
        "ODE solver exceeded its budget of {max_evaluations} derivative evaluations between t={t_start} and t={t_end}."
    )]
    EvaluationBudgetExceeded {
        max_evaluations: usize,
        t_start: f64,
        t_end: f64,
    },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, BdmmError>;

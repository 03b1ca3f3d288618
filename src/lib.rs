pub mod config;
pub mod error;
pub mod integrate;
pub mod io;
pub mod likelihood;
pub mod ode;
pub mod parallel;
pub mod progress;
pub mod report;
pub mod schedule;
pub mod single_type;
pub mod small_number;
pub mod solver;
pub mod state;
pub mod tree;
pub mod utils;

pub use config::LikelihoodConfig;
pub use error::{BdmmError, Result};
pub use likelihood::{BdmmLikelihood, Engine, Evaluation, Rejection, TreeLikelihood};
pub use schedule::{RateSchedule, RateScheduleSpec};
pub use small_number::SmallNumber;
pub use tree::Tree;

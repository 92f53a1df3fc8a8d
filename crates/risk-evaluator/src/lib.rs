pub mod manager;
pub mod models;

pub use manager::RiskEvaluator;
pub use models::*;

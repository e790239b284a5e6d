//! Quota tracking and admission decisions.

mod backend;
mod dimension;
mod engine;
mod keys;

pub use backend::AdmissionGate;
pub use dimension::Dimension;
pub use engine::{ConsistencyMode, QuotaDefaults, QuotaEngine, QuotaLimits, QuotaRecord};
pub use keys::{escape_token, QuotaKeys};

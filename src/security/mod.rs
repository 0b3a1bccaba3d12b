pub mod audit;
mod validation;

pub use audit::{AuditEvent, AuditLogger, JsonlAuditLogger, TracingAuditLogger, AUDIT_TARGET};
pub use validation::{
    CommandValidator, DefaultCommandValidator, PathValidator, DEFAULT_MAX_COMMAND_LEN,
};

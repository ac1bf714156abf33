// Module for security functionality
pub mod audit_logger;

pub use audit_logger::{
    events, AuditConfig, AuditStats, SecurityAuditLogger, SecurityEvent, SecurityEventType,
    SecuritySeverity,
};

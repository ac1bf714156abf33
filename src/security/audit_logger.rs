use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Info,
    Warning,
    High,
    Critical,
}

impl fmt::Display for SecuritySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecuritySeverity::Info => write!(f, "INFO"),
            SecuritySeverity::Warning => write!(f, "WARNING"),
            SecuritySeverity::High => write!(f, "HIGH"),
            SecuritySeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl SecuritySeverity {
    fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "INFO" => Some(SecuritySeverity::Info),
            "WARNING" => Some(SecuritySeverity::Warning),
            "HIGH" => Some(SecuritySeverity::High),
            "CRITICAL" => Some(SecuritySeverity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityEventType {
    ConnectionAccepted,
    ConnectionClosed,
    SslNegotiation,
    QueryRewritten,
    QueryRejected,
    PreparedStatementRejected,
    ProtocolViolation,
    ResultSetDiscarded,
    RowsFiltered,
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityEventType::ConnectionAccepted => "CONNECTION_ACCEPTED",
            SecurityEventType::ConnectionClosed => "CONNECTION_CLOSED",
            SecurityEventType::SslNegotiation => "SSL_NEGOTIATION",
            SecurityEventType::QueryRewritten => "QUERY_REWRITTEN",
            SecurityEventType::QueryRejected => "QUERY_REJECTED",
            SecurityEventType::PreparedStatementRejected => "PREPARED_STATEMENT_REJECTED",
            SecurityEventType::ProtocolViolation => "PROTOCOL_VIOLATION",
            SecurityEventType::ResultSetDiscarded => "RESULT_SET_DISCARDED",
            SecurityEventType::RowsFiltered => "ROWS_FILTERED",
        };
        f.write_str(name)
    }
}

/// Structured security audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unix timestamp in microseconds
    pub timestamp: u64,
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub client_addr: Option<SocketAddr>,
    pub session_id: Option<String>,
    /// Query text, truncated
    pub query: Option<String>,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: SecuritySeverity, message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64,
            event_type,
            severity,
            client_addr: None,
            session_id: None,
            query: None,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        const MAX_QUERY_LOG_LENGTH: usize = 1000;
        self.query = Some(if query.len() > MAX_QUERY_LOG_LENGTH {
            let mut end = MAX_QUERY_LOG_LENGTH;
            while !query.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... [TRUNCATED]", &query[..end])
        } else {
            query.to_string()
        });
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Get formatted timestamp as ISO 8601 string
    pub fn formatted_timestamp(&self) -> String {
        let secs = self.timestamp / 1_000_000;
        let micros = self.timestamp % 1_000_000;

        match chrono::DateTime::from_timestamp(secs as i64, (micros * 1000) as u32) {
            Some(datetime) => datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            None => format!("invalid-timestamp-{}", self.timestamp),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub json_format: bool,
    /// Include query text. Rewritten queries carry ciphertext and blind index values only.
    pub log_queries: bool,
    pub min_severity: SecuritySeverity,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            json_format: true,
            log_queries: false,
            min_severity: SecuritySeverity::Info,
        }
    }
}

impl AuditConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PGTDE_AUDIT_ENABLED") {
            config.enabled = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("PGTDE_AUDIT_JSON_FORMAT") {
            config.json_format = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("PGTDE_AUDIT_LOG_QUERIES") {
            config.log_queries = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("PGTDE_AUDIT_MIN_SEVERITY")
            && let Some(severity) = SecuritySeverity::parse(&val)
        {
            config.min_severity = severity;
        }

        config
    }
}

#[derive(Debug, Default, Clone)]
pub struct AuditStats {
    pub total_events: u64,
    pub events_by_severity: HashMap<String, u64>,
    pub events_by_type: HashMap<String, u64>,
    pub errors: u64,
}

/// Writes audit events to the `security_audit` tracing target. One instance is shared by all
/// connections of a proxy.
pub struct SecurityAuditLogger {
    config: AuditConfig,
    stats: RwLock<AuditStats>,
}

impl Default for SecurityAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityAuditLogger {
    pub fn new() -> Self {
        Self::with_config(AuditConfig::default())
    }

    pub fn with_config(config: AuditConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(AuditStats::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::with_config(AuditConfig {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn log_event(&self, mut event: SecurityEvent) {
        if !self.config.enabled || event.severity < self.config.min_severity {
            return;
        }
        if !self.config.log_queries {
            event.query = None;
        }

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_severity.entry(event.severity.to_string()).or_insert(0) += 1;
            *stats.events_by_type.entry(event.event_type.to_string()).or_insert(0) += 1;
        }

        if self.config.json_format {
            self.write_json_event(&event);
        } else {
            self.write_text_event(&event);
        }
    }

    fn write_json_event(&self, event: &SecurityEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "security_audit", "{}", json),
            Err(e) => {
                self.stats.write().errors += 1;
                error!("Failed to serialize security event to JSON: {}", e);
            }
        }
    }

    fn write_text_event(&self, event: &SecurityEvent) {
        let mut line = format!(
            "SECURITY_AUDIT timestamp={} severity={} type={}",
            event.formatted_timestamp(),
            event.severity,
            event.event_type
        );
        if let Some(addr) = event.client_addr {
            line.push_str(&format!(" client={}", addr));
        }
        if let Some(session) = &event.session_id {
            line.push_str(&format!(" session={}", session));
        }
        if let Some(query) = &event.query {
            line.push_str(&format!(" query=\"{}\"", query));
        }
        let mut metadata: Vec<_> = event.metadata.iter().collect();
        metadata.sort();
        for (key, value) in metadata {
            line.push_str(&format!(" {}={}", key, value));
        }
        line.push_str(&format!(" message=\"{}\"", event.message));

        match event.severity {
            SecuritySeverity::Info => info!(target: "security_audit", "{}", line),
            SecuritySeverity::Warning | SecuritySeverity::High => {
                warn!(target: "security_audit", "{}", line)
            }
            SecuritySeverity::Critical => error!(target: "security_audit", "{}", line),
        }
    }

    pub fn get_stats(&self) -> AuditStats {
        self.stats.read().clone()
    }
}

/// Constructors for the events the proxy emits.
pub mod events {
    use super::*;

    pub fn connection_accepted(logger: &SecurityAuditLogger, session_id: &str, addr: SocketAddr) {
        logger.log_event(
            SecurityEvent::new(
                SecurityEventType::ConnectionAccepted,
                SecuritySeverity::Info,
                "client connected",
            )
            .with_session_id(session_id)
            .with_client_addr(addr),
        );
    }

    pub fn connection_closed(logger: &SecurityAuditLogger, session_id: &str, reason: &str) {
        logger.log_event(
            SecurityEvent::new(SecurityEventType::ConnectionClosed, SecuritySeverity::Info, reason)
                .with_session_id(session_id),
        );
    }

    pub fn ssl_negotiation(logger: &SecurityAuditLogger, session_id: &str, direction: &str, outcome: &str) {
        logger.log_event(
            SecurityEvent::new(SecurityEventType::SslNegotiation, SecuritySeverity::Info, outcome)
                .with_session_id(session_id)
                .with_metadata("direction", direction),
        );
    }

    pub fn query_rewritten(logger: &SecurityAuditLogger, session_id: &str, rewritten: &str) {
        logger.log_event(
            SecurityEvent::new(
                SecurityEventType::QueryRewritten,
                SecuritySeverity::Info,
                "query rewritten for protected columns",
            )
            .with_session_id(session_id)
            .with_query(rewritten),
        );
    }

    pub fn query_rejected(logger: &SecurityAuditLogger, session_id: &str, reason: &str) {
        logger.log_event(
            SecurityEvent::new(SecurityEventType::QueryRejected, SecuritySeverity::Warning, reason)
                .with_session_id(session_id),
        );
    }

    pub fn prepared_statement_rejected(logger: &SecurityAuditLogger, session_id: &str) {
        logger.log_event(
            SecurityEvent::new(
                SecurityEventType::PreparedStatementRejected,
                SecuritySeverity::Warning,
                "extended query protocol is not supported",
            )
            .with_session_id(session_id),
        );
    }

    pub fn protocol_violation(logger: &SecurityAuditLogger, session_id: &str, direction: &str, details: &str) {
        logger.log_event(
            SecurityEvent::new(SecurityEventType::ProtocolViolation, SecuritySeverity::High, details)
                .with_session_id(session_id)
                .with_metadata("direction", direction),
        );
    }

    pub fn result_set_discarded(logger: &SecurityAuditLogger, session_id: &str, reason: &str, rows: usize) {
        logger.log_event(
            SecurityEvent::new(SecurityEventType::ResultSetDiscarded, SecuritySeverity::High, reason)
                .with_session_id(session_id)
                .with_metadata("retained_messages", rows),
        );
    }

    pub fn rows_filtered(logger: &SecurityAuditLogger, session_id: &str, dropped: usize) {
        logger.log_event(
            SecurityEvent::new(
                SecurityEventType::RowsFiltered,
                SecuritySeverity::Info,
                "rows failed join verification",
            )
            .with_session_id(session_id)
            .with_metadata("dropped_rows", dropped),
        );
    }
}

// =============================================================================
// models.rs — THE ARCHIVE'S DATA STRUCTURES
// =============================================================================
//
// Proxies, documents, queue items and the typed messages the backend pushes
// over the event stream. The dashboard this engine grew out of shaped every
// object differently per component; here there is exactly one shape each.
//
// Wire names follow the backend (snake_case). Where the backend has been
// seen sending camelCase for the same field, serde aliases accept both.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// PROXIES
// =============================================================================

/// How a proxy is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks5,
    /// A DNS resolver the scraper routes lookups through.
    Dns,
}

impl ProxyType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Some(ProxyType::Http),
            "https" => Some(ProxyType::Https),
            "socks5" | "socks" => Some(ProxyType::Socks5),
            "dns" => Some(ProxyType::Dns),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => write!(f, "http"),
            ProxyType::Https => write!(f, "https"),
            ProxyType::Socks5 => write!(f, "socks5"),
            ProxyType::Dns => write!(f, "dns"),
        }
    }
}

/// Proxy lifecycle: `inactive -> active -> (testing) -> active | inactive`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    #[serde(alias = "offline", alias = "failed")]
    Inactive,
    #[serde(alias = "online", alias = "healthy")]
    Active,
    Testing,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyStatus::Inactive => write!(f, "inactive"),
            ProxyStatus::Active => write!(f, "active"),
            ProxyStatus::Testing => write!(f, "testing"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyRecord {
    /// Stable identifier. Defaults to `host:port` when the source omits it.
    #[serde(default)]
    pub id: String,

    pub host: String,

    pub port: u16,

    #[serde(rename = "type", default)]
    pub proxy_type: ProxyType,

    #[serde(default)]
    pub status: ProxyStatus,

    /// Last measured round trip, milliseconds.
    #[serde(default, alias = "response_time", alias = "responseTime")]
    pub response_time_ms: Option<u64>,

    /// Percentage of probes that succeeded, 0-100.
    #[serde(default, alias = "successRate")]
    pub success_rate: f64,

    #[serde(default, alias = "lastTested")]
    pub last_tested: Option<DateTime<Utc>>,

    #[serde(default)]
    pub tests_run: u32,

    #[serde(default)]
    pub tests_passed: u32,
}

impl ProxyRecord {
    pub fn new(host: impl Into<String>, port: u16, proxy_type: ProxyType) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}", host, port),
            host,
            port,
            proxy_type,
            status: ProxyStatus::Inactive,
            response_time_ms: None,
            success_rate: 0.0,
            last_tested: None,
            tests_run: 0,
            tests_passed: 0,
        }
    }

    /// `host:port`, the form socket APIs want.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// The eight fixed legal categories the classifier knows about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LegalCategory {
    Civil,
    Criminal,
    Commercial,
    Administrative,
    Family,
    Labor,
    Constitutional,
    Tax,
    #[default]
    Unclassified,
}

impl LegalCategory {
    pub const ALL: [LegalCategory; 8] = [
        LegalCategory::Civil,
        LegalCategory::Criminal,
        LegalCategory::Commercial,
        LegalCategory::Administrative,
        LegalCategory::Family,
        LegalCategory::Labor,
        LegalCategory::Constitutional,
        LegalCategory::Tax,
    ];

    /// The label shown to Persian-speaking users.
    pub fn persian_label(&self) -> &'static str {
        match self {
            LegalCategory::Civil => "حقوق مدنی",
            LegalCategory::Criminal => "حقوق کیفری",
            LegalCategory::Commercial => "حقوق تجاری",
            LegalCategory::Administrative => "حقوق اداری",
            LegalCategory::Family => "حقوق خانواده",
            LegalCategory::Labor => "حقوق کار",
            LegalCategory::Constitutional => "حقوق اساسی",
            LegalCategory::Tax => "حقوق مالیاتی",
            LegalCategory::Unclassified => "طبقه‌بندی نشده",
        }
    }
}

impl fmt::Display for LegalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LegalCategory::Civil => "civil",
            LegalCategory::Criminal => "criminal",
            LegalCategory::Commercial => "commercial",
            LegalCategory::Administrative => "administrative",
            LegalCategory::Family => "family",
            LegalCategory::Labor => "labor",
            LegalCategory::Constitutional => "constitutional",
            LegalCategory::Tax => "tax",
            LegalCategory::Unclassified => "unclassified",
        };
        write!(f, "{}", name)
    }
}

/// Display bucket for a document's quality score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualityBucket {
    Excellent,
    Good,
    Average,
    Poor,
}

impl QualityBucket {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            QualityBucket::Excellent
        } else if score >= 0.6 {
            QualityBucket::Good
        } else if score >= 0.4 {
            QualityBucket::Average
        } else {
            QualityBucket::Poor
        }
    }
}

/// A processed legal document, as archived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub content: String,

    /// Where the document was fetched from.
    #[serde(default, alias = "source_url")]
    pub url: String,

    /// Free-form section label the source site filed it under.
    #[serde(default)]
    pub category: String,

    /// What the classifier made of the text.
    #[serde(default)]
    pub classification: LegalCategory,

    /// Classifier confidence for `classification`, 0.0-1.0.
    #[serde(default)]
    pub confidence: f64,

    #[serde(default)]
    pub topics: Vec<String>,

    /// 0.0-1.0. See [`QualityBucket`].
    #[serde(default, alias = "qualityScore")]
    pub quality_score: f64,

    /// Proxy the fetch was routed through, if any.
    #[serde(default)]
    pub proxy_id: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(title: impl Into<String>, url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            content: content.into(),
            url: url.into(),
            category: String::new(),
            classification: LegalCategory::Unclassified,
            confidence: 0.0,
            topics: Vec::new(),
            quality_score: 0.0,
            proxy_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn quality_bucket(&self) -> QualityBucket {
        QualityBucket::from_score(self.quality_score)
    }
}

// =============================================================================
// PROCESSING QUEUE
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl QueueStatus {
    /// Completed, errored and cancelled items never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Error | QueueStatus::Cancelled)
    }
}

/// Declaration order is priority order: `Urgent` sorts highest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub title: String,
    pub url: String,
    pub status: QueueStatus,
    pub priority: Priority,
    /// 0-100.
    pub progress: u8,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(url: impl Into<String>, title: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            url: url.into(),
            status: QueueStatus::Pending,
            priority,
            progress: 0,
            attempts: 0,
            error: None,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// EVENT STREAM MESSAGES
// =============================================================================

/// Every message type the backend is known to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    MetricsUpdate,
    DocumentProcessed,
    ModelLoaded,
    ProxyStatusUpdate,
    ScrapingProgress,
    SystemHealth,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::MetricsUpdate,
        MessageKind::DocumentProcessed,
        MessageKind::ModelLoaded,
        MessageKind::ProxyStatusUpdate,
        MessageKind::ScrapingProgress,
        MessageKind::SystemHealth,
        MessageKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::MetricsUpdate => "metrics_update",
            MessageKind::DocumentProcessed => "document_processed",
            MessageKind::ModelLoaded => "model_loaded",
            MessageKind::ProxyStatusUpdate => "proxy_status_update",
            MessageKind::ScrapingProgress => "scraping_progress",
            MessageKind::SystemHealth => "system_health",
            MessageKind::Error => "error",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        MessageKind::ALL.into_iter().find(|k| k.as_str() == raw)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gauges carried by `metrics_update` and `system_health`. Every field is
/// optional: the backend sends whatever subset it has.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteGauges {
    #[serde(default, alias = "activeProxies")]
    pub active_proxies: Option<u32>,
    #[serde(default, alias = "cpuUsage", alias = "cpu")]
    pub cpu_usage: Option<f64>,
    #[serde(default, alias = "memoryUsage", alias = "memory")]
    pub memory_usage: Option<f64>,
    #[serde(default, alias = "networkLatency")]
    pub network_latency: Option<f64>,
    #[serde(default, alias = "totalRecords")]
    pub total_records: Option<u64>,
}

/// Payload of `document_processed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, alias = "processing_time", alias = "processingTime")]
    pub processing_time_ms: Option<f64>,
}

impl Default for DocumentEvent {
    fn default() -> Self {
        Self {
            id: None,
            title: None,
            success: true,
            processing_time_ms: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Payload of `scraping_progress`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScrapingProgress {
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default, alias = "currentUrl")]
    pub current_url: Option<String>,
}

/// A typed event-stream message. Unknown `type` values never reach this
/// enum: [`ServerMessage::parse`] filters them out first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    MetricsUpdate {
        #[serde(default, alias = "payload")]
        data: RemoteGauges,
    },
    DocumentProcessed {
        #[serde(default, alias = "payload")]
        data: DocumentEvent,
    },
    ModelLoaded {
        #[serde(default)]
        model: Option<String>,
    },
    ProxyStatusUpdate {
        #[serde(default, alias = "data")]
        proxies: Vec<ProxyRecord>,
    },
    ScrapingProgress {
        #[serde(default, alias = "payload")]
        data: ScrapingProgress,
    },
    SystemHealth {
        #[serde(default, alias = "payload")]
        data: RemoteGauges,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::MetricsUpdate { .. } => MessageKind::MetricsUpdate,
            ServerMessage::DocumentProcessed { .. } => MessageKind::DocumentProcessed,
            ServerMessage::ModelLoaded { .. } => MessageKind::ModelLoaded,
            ServerMessage::ProxyStatusUpdate { .. } => MessageKind::ProxyStatusUpdate,
            ServerMessage::ScrapingProgress { .. } => MessageKind::ScrapingProgress,
            ServerMessage::SystemHealth { .. } => MessageKind::SystemHealth,
            ServerMessage::Error { .. } => MessageKind::Error,
        }
    }

    /// Parse a text frame. `Ok(None)` means well-formed JSON with a `type`
    /// we don't know (or no `type` at all).
    pub fn parse(text: &str) -> crate::error::Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let known = value
            .get("type")
            .and_then(|t| t.as_str())
            .and_then(MessageKind::from_wire)
            .is_some();
        if !known {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}

/// First frame we send after the socket opens.
#[derive(Debug, Clone, Serialize)]
pub struct ClientHandshake {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub client: String,
    pub timestamp: DateTime<Utc>,
}

impl ClientHandshake {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            kind: "handshake",
            client: client.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_message() {
        let msg = ServerMessage::parse(
            r#"{"type":"metrics_update","data":{"activeProxies":4,"cpu_usage":12.5}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::MetricsUpdate);
        match msg {
            ServerMessage::MetricsUpdate { data } => {
                assert_eq!(data.active_proxies, Some(4));
                assert_eq!(data.cpu_usage, Some(12.5));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_is_none() {
        assert!(ServerMessage::parse(r#"{"type":"celebration","x":1}"#).unwrap().is_none());
        assert!(ServerMessage::parse(r#"{"no_type":true}"#).unwrap().is_none());
    }

    #[test]
    fn test_parse_malformed_json_is_error() {
        assert!(matches!(
            ServerMessage::parse("{not json"),
            Err(crate::error::ArchiveError::Json(_))
        ));
    }

    #[test]
    fn test_proxy_status_update_accepts_camel_case_fields() {
        let msg = ServerMessage::parse(
            r#"{"type":"proxy_status_update","proxies":[
                {"id":"p1","host":"10.0.0.1","port":8080,"type":"socks5",
                 "status":"online","responseTime":120,"successRate":98.5}
            ]}"#,
        )
        .unwrap()
        .unwrap();
        let ServerMessage::ProxyStatusUpdate { proxies } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(proxies[0].proxy_type, ProxyType::Socks5);
        assert_eq!(proxies[0].status, ProxyStatus::Active);
        assert_eq!(proxies[0].response_time_ms, Some(120));
    }

    #[test]
    fn test_handshake_shape() {
        let json = serde_json::to_value(ClientHandshake::new("tester")).unwrap();
        assert_eq!(json["type"], "handshake");
        assert_eq!(json["client"], "tester");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_quality_buckets() {
        assert_eq!(QualityBucket::from_score(0.95), QualityBucket::Excellent);
        assert_eq!(QualityBucket::from_score(0.6), QualityBucket::Good);
        assert_eq!(QualityBucket::from_score(0.45), QualityBucket::Average);
        assert_eq!(QualityBucket::from_score(0.1), QualityBucket::Poor);
    }
}

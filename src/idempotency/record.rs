use chrono::{DateTime, Duration, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

/// Ordered, multi-valued header snapshot. Header names keep first-seen order.
pub type HeaderEntries = Vec<(String, Vec<String>)>;

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Completed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RecordStatus::Pending),
            "completed" => Some(RecordStatus::Completed),
            _ => None,
        }
    }
}

/// Response captured from the wrapped handler, ready to be persisted or replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: HeaderEntries,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, headers: HeaderEntries, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Snapshots an HTTP response head. Non UTF-8 header values are stored lossily.
    pub fn from_parts(status: StatusCode, headers: &HeaderMap, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status.as_u16(), header_entries(headers), body)
    }

    /// Rebuilds a header map from the snapshot, skipping entries that no longer parse.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Groups a header map into ordered name → values entries.
pub fn header_entries(headers: &HeaderMap) -> HeaderEntries {
    let mut entries: HeaderEntries = Vec::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match entries.iter_mut().find(|(n, _)| n == name.as_str()) {
            Some((_, values)) => values.push(value),
            None => entries.push((name.as_str().to_string(), vec![value])),
        }
    }
    entries
}

/// Durable unit of idempotency state, one per scoped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    pub status: RecordStatus,
    pub response_status: Option<u16>,
    pub response_headers: HeaderEntries,
    pub response_body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Creates a freshly reserved record.
    pub fn pending(
        key: impl Into<String>,
        fingerprint: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            fingerprint: fingerprint.into(),
            status: RecordStatus::Pending,
            response_status: None,
            response_headers: Vec::new(),
            response_body: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// A record whose expiry has been reached is treated as absent.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_completed(&self) -> bool {
        self.status == RecordStatus::Completed
    }

    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }

    /// Stores the response snapshot and moves the record to completed.
    pub fn complete(&mut self, response: &StoredResponse, now: DateTime<Utc>, ttl: Duration) {
        self.status = RecordStatus::Completed;
        self.response_status = Some(response.status);
        self.response_headers = response.headers.clone();
        self.response_body = response.body.clone();
        self.updated_at = now;
        self.expires_at = now + ttl;
    }

    /// The stored response, present only once the record is completed.
    pub fn response(&self) -> Option<StoredResponse> {
        match (self.status, self.response_status) {
            (RecordStatus::Completed, Some(status)) => Some(StoredResponse {
                status,
                headers: self.response_headers.clone(),
                body: self.response_body.clone(),
            }),
            _ => None,
        }
    }
}

/// Outcome of trying to claim a scoped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// The caller won the key and must execute the handler.
    New,
    /// Another request holds the key and has not finished.
    Pending,
    /// A response was stored and can be replayed.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub state: ReservationState,
    pub record: IdempotencyRecord,
}

impl Reservation {
    pub fn new(state: ReservationState, record: IdempotencyRecord) -> Self {
        Self { state, record }
    }

    /// Derives the reservation seen by a caller that found `record` already live.
    pub fn existing(record: IdempotencyRecord) -> Self {
        let state = match record.status {
            RecordStatus::Pending => ReservationState::Pending,
            RecordStatus::Completed => ReservationState::Completed,
        };
        Self { state, record }
    }
}

/// Scopes a client-supplied key to the caller so two callers never collide.
pub fn scoped_key(key: &str, identity: &str) -> String {
    format!("{}|{}", key, identity)
}

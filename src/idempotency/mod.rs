pub mod cleanup;
pub mod clock;
pub mod fingerprint;
pub mod identity;
pub mod memory;
pub mod middleware;
pub mod postgres;
pub mod record;
pub mod store;

pub use cleanup::{CleanupHandle, CleanupJob};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{body_digest, FingerprintInput};
pub use identity::{CallerIdentity, ExtensionIdentity, HeaderIdentity, IdentityExtractor, ANONYMOUS};
pub use memory::InMemoryStore;
pub use middleware::{
    idempotency_middleware, IdempotencyConfig, IdempotencyMetrics, IdempotencyState,
    MetricsSnapshot, REPLAY_HEADER,
};
pub use postgres::{PostgresStore, RetryConfig};
pub use record::{
    scoped_key, HeaderEntries, IdempotencyRecord, RecordStatus, Reservation, ReservationState,
    StoredResponse,
};
pub use store::IdempotencyStore;

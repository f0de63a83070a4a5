//! ID generation helpers.

use uuid::Uuid;

/// Generate a new random v4 UUID.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a worker identity string (`worker-<uuid>`), recorded on active
/// jobs so stalled leases can be traced back to their owner.
pub fn worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

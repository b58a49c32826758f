//! Short labels identifying clients, workers and pools in log records.

use uuid::Uuid;

const ID_LEN: usize = 6;

/// Generate a short opaque id.
pub fn new_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

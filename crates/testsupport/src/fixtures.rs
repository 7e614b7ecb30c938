//! Common request payloads and configuration.

use common::NodeConfig;
use serde_json::{json, Value as Json};
use std::path::Path;
use std::time::Duration;

/// Upper bound for any wait in tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Node configuration tuned for tests: short backoff, no cooldown, and a
/// snapshot loop that never fires on its own.
pub fn test_config(data_dir: &Path) -> NodeConfig {
    NodeConfig::builder()
        .data_dir(data_dir.to_path_buf())
        .snapshot_interval(Duration::ZERO)
        .snapshot_jitter(Duration::ZERO)
        .snapshot_threshold(8)
        .snapshot_cooldown(Duration::ZERO)
        .fault_backoff(Duration::from_millis(20))
        .shutdown_grace(Duration::from_secs(5))
        .build()
}

pub fn users_schema() -> Json {
    json!(["CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)"])
}

/// A parameterized insert into `users`.
pub fn insert_user(name: &str, age: i64) -> Json {
    json!([["INSERT INTO users (name, age) VALUES (?, ?)", name, age]])
}

/// A bulk parameterized insert of several users.
pub fn insert_users(users: &[(&str, i64)]) -> Json {
    Json::Array(
        users
            .iter()
            .map(|(name, age)| json!(["INSERT INTO users (name, age) VALUES (?, ?)", name, age]))
            .collect(),
    )
}

pub fn select(sql: &str) -> Json {
    json!([sql])
}

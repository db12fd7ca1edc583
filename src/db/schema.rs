/// Schema shared by the resource partitions and the application item cache.
pub const SCHEMA: &str = r#"
-- Named, versioned partitions (e.g. "app-shell-v3")
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Request -> response snapshots, keyed by exact request identity
CREATE TABLE IF NOT EXISTS partition_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_key),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);

-- Namespaced application items (serialized JSON)
CREATE TABLE IF NOT EXISTS app_cache (
    namespace TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (namespace, cache_key)
);
"#;

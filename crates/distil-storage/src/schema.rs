/// Conversations table. `token_estimate` is the recomputed running total and
/// `next_seq` the next sequence position to allocate.
pub const CREATE_CONVERSATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    token_estimate INTEGER NOT NULL DEFAULT 0,
    next_seq INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// Turns table. Rolled-up turns stay on disk for audit but leave the live
/// sequence; `segments` holds the content as JSON.
pub const CREATE_TURNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    segments TEXT NOT NULL,
    token_estimate INTEGER NOT NULL DEFAULT 0,
    in_flight INTEGER NOT NULL DEFAULT 0,
    rolled_up INTEGER NOT NULL DEFAULT 0,
    provenance_start INTEGER,
    provenance_end INTEGER,
    created_at INTEGER NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
"#;

/// Rollup records: one append-only row per compaction event.
pub const CREATE_ROLLUP_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rollup_records (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    start_seq INTEGER NOT NULL,
    end_seq INTEGER NOT NULL,
    turns_compacted INTEGER NOT NULL,
    tokens_before INTEGER NOT NULL,
    tokens_after INTEGER NOT NULL,
    reduction_pct REAL NOT NULL,
    strategy TEXT NOT NULL,
    elapsed_ms INTEGER NOT NULL,
    created_at INTEGER NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
"#;

/// Per-conversation compaction settings; global defaults apply when absent.
pub const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_settings (
    conversation_id TEXT PRIMARY KEY,
    threshold REAL,
    emergency_threshold REAL,
    summary_ratio REAL,
    model TEXT,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
"#;

pub const CREATE_TURNS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_turns_conversation_seq
ON turns(conversation_id, seq);
"#;

pub const CREATE_ROLLUP_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_rollup_records_conversation
ON rollup_records(conversation_id);
"#;

pub const ALL_MIGRATIONS: &[&str] = &[
    CREATE_CONVERSATIONS_TABLE,
    CREATE_TURNS_TABLE,
    CREATE_ROLLUP_RECORDS_TABLE,
    CREATE_SETTINGS_TABLE,
    CREATE_TURNS_INDEX,
    CREATE_ROLLUP_INDEX,
];

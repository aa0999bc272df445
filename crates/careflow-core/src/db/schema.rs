//! SQLite schema definition.

/// Complete database schema for careflow.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Items (partition key + sort key, JSON attribute map)
-- ============================================================================

CREATE TABLE IF NOT EXISTS items (
    pk TEXT NOT NULL,                            -- partition key, e.g. patient:<id>
    sk TEXT NOT NULL,                            -- sort key, e.g. profile, timeline:<ts>:<id>
    body TEXT NOT NULL,                          -- JSON object of attributes
    cohort_key TEXT,                             -- projected from body.cohort_key
    PRIMARY KEY (pk, sk)
) WITHOUT ROWID;

-- Cohort index (department x status); only episode rows carry a cohort key
CREATE INDEX IF NOT EXISTS idx_items_cohort
    ON items(cohort_key, pk)
    WHERE cohort_key IS NOT NULL;

-- Attribute maps must be JSON objects
CREATE TRIGGER IF NOT EXISTS items_check_body_insert BEFORE INSERT ON items
BEGIN
    SELECT CASE
        WHEN json_type(new.body) IS NOT 'object' THEN
            RAISE(ABORT, 'Item body must be a JSON object')
    END;
END;

CREATE TRIGGER IF NOT EXISTS items_check_body_update BEFORE UPDATE ON items
BEGIN
    SELECT CASE
        WHEN json_type(new.body) IS NOT 'object' THEN
            RAISE(ABORT, 'Item body must be a JSON object')
    END;
END;
"#;

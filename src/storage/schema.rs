//! Database schema constants and SQL queries.
//!
//! This module contains the SQL schema definitions for the PostgreSQL
//! agendamento store.

/// SQL schema for creating the agendamentos table.
pub const CREATE_AGENDAMENTOS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS agendamentos (
    id UUID PRIMARY KEY,
    due_at TIMESTAMPTZ NOT NULL,
    status VARCHAR(16) NOT NULL DEFAULT 'pending',
    target_platform VARCHAR(32) NOT NULL,
    payload JSONB NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    external_post_id VARCHAR(255),
    published_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT agendamentos_status_check CHECK (
        status IN ('pending', 'queued', 'publishing', 'published', 'failed')
    )
)
"#;

/// SQL for the index the due-listing query scans.
pub const CREATE_STATUS_DUE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_agendamentos_status_due_at ON agendamentos(status, due_at)";

/// SQL for the index used when auditing recent changes.
pub const CREATE_UPDATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_agendamentos_updated_at ON agendamentos(updated_at)";

/// Columns selected when reading an agendamento.
pub const AGENDAMENTO_COLUMNS: &str = "id, due_at, status, target_platform, payload, \
     attempt_count, last_error, external_post_id, published_at, created_at, updated_at";

/// Returns all schema creation statements in the correct order.
///
/// Each entry is a single statement so it can run as a prepared query.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_AGENDAMENTOS_TABLE,
        CREATE_STATUS_DUE_INDEX,
        CREATE_UPDATED_AT_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Agendamentos table name.
    pub const AGENDAMENTOS: &str = "agendamentos";
    /// Applied migrations table name.
    pub const MIGRATIONS: &str = "_migrations";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains(tables::AGENDAMENTOS));
        // Indexes should be last
        assert!(statements[1..].iter().all(|s| s.contains("CREATE INDEX")));
        assert!(statements.iter().all(|s| !s.trim_end().ends_with(';')));
    }

    #[test]
    fn test_status_check_lists_every_status() {
        for status in crate::agendamento::AgendamentoStatus::ALL {
            assert!(CREATE_AGENDAMENTOS_TABLE.contains(&format!("'{}'", status.as_str())));
        }
    }
}

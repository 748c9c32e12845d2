use crate::error::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS analysis_jobs (
            job_id TEXT PRIMARY KEY,
            project_path TEXT NOT NULL,
            status TEXT NOT NULL,
            confidence_score REAL NOT NULL DEFAULT 0,
            files_total INTEGER NOT NULL DEFAULT 0,
            files_completed INTEGER NOT NULL DEFAULT 0,
            files_failed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS analysis_cache (
            signature TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            file_content_hash TEXT NOT NULL,
            analysis_config TEXT NOT NULL,
            analysis_result TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS knowledge_graphs (
            graph_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            project_path TEXT NOT NULL,
            is_promoted INTEGER NOT NULL DEFAULT 0,
            graph_json TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0,
            detected_pattern TEXT,
            detected_stack TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS knowledge_triples (
            response_id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            capability TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cache_file_path
            ON analysis_cache(file_path);
        CREATE INDEX IF NOT EXISTS idx_graphs_project
            ON knowledge_graphs(project_path);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_graphs_promoted
            ON knowledge_graphs(project_path) WHERE is_promoted = 1;
        CREATE INDEX IF NOT EXISTS idx_triples_server
            ON knowledge_triples(server_id);

        INSERT INTO meta(key, value) VALUES('schema_version', '1')
            ON CONFLICT(key) DO NOTHING;
        COMMIT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "1");
    }
}

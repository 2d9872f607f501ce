use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
///
/// This is the single source of truth for the store schema.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    // Create schema_migrations table first (tracks applied migrations)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Entities, monitoring logs and network incidents").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Local ticket desk").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

/// Get current schema version from database
async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

/// Record that a migration was applied
async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: monitored entities, raw probe logs and incidents
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    // Branches and ATMs share one table, keyed by (class, id)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS monitored_entities (
            entity_class TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            location TEXT,
            ip_address TEXT,
            backup_ip_address TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            monitoring_enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (entity_class, entity_id)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS monitoring_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_class TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            address TEXT NOT NULL,
            status TEXT NOT NULL,
            response_time_ms INTEGER,
            packet_loss REAL NOT NULL DEFAULT 0,
            error_message TEXT,
            checked_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS network_incidents (
            id TEXT PRIMARY KEY,
            entity_class TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            incident_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN',
            description TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER,
            ticket_id TEXT,
            metrics TEXT NOT NULL DEFAULT '{}'
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_entities_class_enabled ON monitored_entities(entity_class, is_active, monitoring_enabled)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_monitoring_logs_entity ON monitoring_logs(entity_class, entity_id, checked_at DESC)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_monitoring_logs_checked_at ON monitoring_logs(checked_at)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_incidents_entity ON network_incidents(entity_class, entity_id, detected_at DESC)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_incidents_status ON network_incidents(status)", ()).await?;

    Ok(())
}

/// Migration v2: tables backing the built-in ticket desk
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS service_categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tickets (
            id TEXT PRIMARY KEY,
            ticket_number TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            category_id TEXT NOT NULL,
            priority TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN',
            classification TEXT NOT NULL,
            entity_class TEXT,
            entity_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            resolved_at INTEGER,
            resolution_note TEXT,
            FOREIGN KEY (category_id) REFERENCES service_categories(id)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ticket_comments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id TEXT NOT NULL,
            body TEXT NOT NULL,
            visibility TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (ticket_id) REFERENCES tickets(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_tickets_number ON tickets(ticket_number)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_ticket_comments_ticket ON ticket_comments(ticket_id)", ()).await?;

    tracing::info!("Added ticket desk tables");
    Ok(())
}

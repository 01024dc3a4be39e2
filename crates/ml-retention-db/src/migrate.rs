use sqlx::migrate::{MigrateError, Migrator};
use sqlx::PgPool;
use tracing::info;

/// Cache tier, policy, execution and lease tables, embedded from `migrations/`
static MIGRATOR: Migrator = sqlx::migrate!();

/// Version of the newest embedded schema migration
pub fn latest_version() -> Option<i64> {
    MIGRATOR
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .map(|m| m.version)
        .max()
}

/// Bring the retention schema up to [`latest_version`]. Applied versions are
/// tracked in `_sqlx_migrations`, so rerunning is a no-op.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    let latest = latest_version();
    info!(
        migrations = MIGRATOR.iter().count(),
        latest = ?latest,
        "Applying retention schema"
    );
    MIGRATOR.run(pool).await.map_err(into_sqlx)?;
    info!(version = ?latest, "Retention schema is current");
    Ok(())
}

/// Keep the database's own error when a migration statement fails
fn into_sqlx(e: MigrateError) -> sqlx::Error {
    match e {
        MigrateError::Execute(e) => e,
        other => sqlx::Error::Protocol(format!("retention schema migration failed: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_migrations_are_ordered() {
        let versions: Vec<i64> = MIGRATOR.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![20250301000001, 20250301000002]);
        assert_eq!(latest_version(), Some(20250301000002));
    }

    #[test]
    fn test_statement_errors_pass_through() {
        let err = into_sqlx(MigrateError::Execute(sqlx::Error::RowNotFound));
        assert!(matches!(err, sqlx::Error::RowNotFound));

        let err = into_sqlx(MigrateError::VersionMissing(7));
        assert!(err.to_string().contains("retention schema migration failed"));
    }
}

use anyhow::Result;
use sqlx::PgPool;

/// Run all the pending migrations in `migrations` directory
pub async fn run_migrate(pool: &PgPool) -> Result<()> {
    Ok(sqlx::migrate!().run(pool).await?)
}

/// Connect to the database
pub async fn connect_database(connspec: &str) -> Result<PgPool> {
    Ok(PgPool::connect(connspec).await?)
}

/// One `files` row.
#[derive(Debug, sqlx::FromRow)]
pub struct FileRow {
    pub sha256: String,
    pub size: i64,
    pub name: String,
    pub path: String,
}

/// One `hashes_locations` row, without its hash key.
#[derive(Debug, sqlx::FromRow)]
pub struct LocationRow {
    pub archive_name: String,
    pub suite_name: String,
    pub component_name: String,
    pub timestamp_ranges: serde_json::Value,
}

/// One `binpkg_files` association row.
#[derive(Debug, sqlx::FromRow)]
pub struct BinaryFileRow {
    pub sha256: String,
    pub architecture: String,
}

/// A `binpkg_files` x `hashes_locations` join row, used by the
/// build-reproducibility query.
#[derive(Debug, sqlx::FromRow)]
pub struct BinaryLocationRow {
    pub architecture: String,
    pub archive_name: String,
    pub suite_name: String,
    pub component_name: String,
    pub timestamp_ranges: serde_json::Value,
}

//! Imports establishments into the database from a JSON file or the bundled dataset.
//!
//! Usage: `import-establishments [path/to/establishments.json]`

use rust_prospection_api::db::Database;
use rust_prospection_api::db_storage::ProspectionStorage;
use rust_prospection_api::establishments::{embedded_dataset, import_establishments, parse_dataset};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = env::var("DATABASE_URL")
        .or_else(|_| env::var("DB_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let db = Database::new(&database_url).await?;
    db.migrate().await?;

    let records = match env::args().nth(1) {
        Some(path) => {
            tracing::info!("Reading establishments from {}", path);
            let json = tokio::fs::read_to_string(&path).await?;
            parse_dataset(&json)?
        }
        None => embedded_dataset()?,
    };

    let storage = ProspectionStorage::new(db.pool.clone());
    let result = import_establishments(&storage, &records).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.errors.is_empty() {
        tracing::warn!("{} establishment(s) failed to import", result.errors.len());
    }
    Ok(())
}

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use tracing::info;

/// Opens a connection pool for one service's private database.
///
/// An in-memory sqlite URL is pinned to a single connection: every pooled
/// connection would otherwise see its own empty database.
pub async fn connect(url: &str, max_connections: u32) -> Result<DatabaseConnection, DbErr> {
    let max = if url.starts_with("sqlite::memory:") {
        1
    } else {
        max_connections.max(1)
    };

    let mut opts = ConnectOptions::new(url.to_owned());
    opts.max_connections(max)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(60))
        .sqlx_logging(false);

    let db = Database::connect(opts).await?;
    info!(url = %redact(url), max_connections = max, "database connected");
    Ok(db)
}

/// Strips credentials from a connection URL before it reaches the logs.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

use crate::db::{self, Source};
use crate::settings::SourceConfig;

/// Look up a source by name, creating it on first use. Stored sources are
/// never updated from later configuration.
pub fn resolve_source(conn: &Connection, config: &SourceConfig) -> Result<Source> {
    if let Some(existing) = db::find_source_by_name(conn, &config.name)? {
        return Ok(existing);
    }
    let source = db::insert_source(conn, &config.name, &config.domain, config.base_url.as_str())?;
    info!(source = %source.name, id = source.id, "Registered new source");
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::sample_source;

    #[test]
    fn resolve_is_idempotent() {
        let conn = db::connect_in_memory().unwrap();
        let config = sample_source("Wire", "https://wire.example.com/news");

        let first = resolve_source(&conn, &config).unwrap();
        let second = resolve_source(&conn, &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.base_url, "https://wire.example.com/news");
        assert_eq!(first.domain, "finance");
    }

    #[test]
    fn existing_source_is_not_rewritten() {
        let conn = db::connect_in_memory().unwrap();
        let original = resolve_source(&conn, &sample_source("Wire", "https://a.example.com/")).unwrap();
        let again = resolve_source(&conn, &sample_source("Wire", "https://b.example.com/")).unwrap();
        assert_eq!(again.id, original.id);
        assert_eq!(again.base_url, "https://a.example.com/");

        let other = resolve_source(&conn, &sample_source("Daily", "https://a.example.com/")).unwrap();
        assert_ne!(other.id, original.id);
    }
}

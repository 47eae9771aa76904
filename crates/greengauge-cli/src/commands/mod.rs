pub mod leaderboard;
pub mod probe;
pub mod record;
pub mod serve;
pub mod sessions;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use greengauge_core::{FileStore, MemoryStore, ReferenceData, SessionStore};

/// Print `msg` to stderr and exit with status 1.
pub fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// Open the JSON store at `path`, or an in-memory store when `None`.
pub fn open_store(path: Option<&Path>) -> Arc<dyn SessionStore> {
    match path {
        Some(p) => match FileStore::open(p) {
            Ok(store) => Arc::new(store),
            Err(e) => fail(format!("cannot open store {}: {e}", p.display())),
        },
        None => Arc::new(MemoryStore::new()),
    }
}

/// Load reference data, or an empty table when `None`.
pub fn load_reference(path: Option<&Path>) -> ReferenceData {
    match path {
        Some(p) => ReferenceData::load(p)
            .unwrap_or_else(|e| fail(format!("cannot load reference data {}: {e}", p.display()))),
        None => ReferenceData::default(),
    }
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(format!("cannot start runtime: {e}")))
}

/// Parse "100ms", "30s", "5m", "1h". A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        (s, 1000)
    };

    let value: u64 = numeric
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    if value == 0 {
        return Err(format!("duration must be positive: {s}"));
    }
    Ok(Duration::from_millis(value * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // parse_duration tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_bare_number_is_seconds() {
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert_eq!(parse_duration(" 2s ").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_rejects_garbage_and_zero() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("1.5s").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_open_store_in_memory_when_no_path() {
        let store = open_store(None);
        assert!(store.users().unwrap().is_empty());
    }

    #[test]
    fn test_open_store_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = open_store(Some(path.as_path()));
        store.insert_user("dana").unwrap();
        assert!(path.exists());
    }
}

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Maps a configured level name onto a tracing level.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" | "verbose" => Some(Level::DEBUG),
        "trace" | "silly" => Some(Level::TRACE),
        _ => None,
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) {
    let level = parse_level(level).unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_accepts_aliases() {
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("verbose"), Some(Level::DEBUG));
        assert_eq!(parse_level("silly"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }
}

/// Reported application version. `LAZY_BLACKTEA_VERSION` overrides the crate
/// version so packaged builds can stamp themselves.
pub fn app_version() -> String {
    match std::env::var("LAZY_BLACKTEA_VERSION") {
        Ok(raw) => normalize_version(&raw).unwrap_or_else(default_version),
        Err(_) => default_version(),
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn normalize_version(raw: &str) -> Option<String> {
    let mut cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.starts_with('v') || cleaned.starts_with('V') {
        cleaned = &cleaned[1..];
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_v_prefix() {
        assert_eq!(normalize_version("v1.2.3").as_deref(), Some("1.2.3"));
        assert_eq!(normalize_version("  V0.9  ").as_deref(), Some("0.9"));
    }

    #[test]
    fn rejects_empty_values() {
        assert_eq!(normalize_version(""), None);
        assert_eq!(normalize_version("v"), None);
        assert_eq!(normalize_version("   "), None);
    }
}

/// Allow-list of instance types offered by the provisioning product.
///
/// Patterns are case-insensitive; `*` matches any substring (including empty).
/// No other glob features are supported.
// Families we have images and quotas for. Anything else is listed but flagged unsupported.
pub const DEFAULT_SUPPORTED_INSTANCE_TYPE_PATTERNS: &str =
    "t3.*,t3a.*,t4g.*,m5.*,m6i.*,m6g.*,m7g.*,c5.*,c6i.*,c6g.*,r5.*,r6i.*,e2-*,n2-standard-*,n2d-standard-*,t2a-standard-*";

/// Parse comma-separated patterns.
///
/// - Trims whitespace
/// - Drops empty entries
/// - If input is empty/None, returns the default patterns
pub fn parse_patterns(raw: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = raw
        .unwrap_or("")
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    if out.is_empty() {
        out = DEFAULT_SUPPORTED_INSTANCE_TYPE_PATTERNS
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
    }

    out
}

#[derive(Debug, Clone)]
pub struct SupportedTypes {
    patterns: Vec<String>,
}

impl Default for SupportedTypes {
    fn default() -> Self {
        Self::from_patterns(None)
    }
}

impl SupportedTypes {
    pub fn from_patterns(raw: Option<&str>) -> Self {
        Self {
            patterns: parse_patterns(raw)
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Reads `SUPPORTED_INSTANCE_TYPES`, falling back to the built-in list.
    pub fn from_env() -> Self {
        let raw = std::env::var("SUPPORTED_INSTANCE_TYPES").ok();
        Self::from_patterns(raw.as_deref())
    }

    pub fn is_supported(&self, instance_type: &str) -> bool {
        let name = instance_type.trim().to_ascii_lowercase();
        if name.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| matches_pattern(&name, p))
    }
}

/// Both arguments must already be lowercase.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if !pattern.contains('*') {
        return name == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !name.starts_with(first) {
        return false;
    }
    let mut idx = first.len();

    // Middle parts must appear in order after the prefix.
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match name[idx..].find(part) {
            Some(pos) => idx += pos + part.len(),
            None => return false,
        }
    }

    // Suffix must not overlap what was already consumed.
    name.len() >= idx + last.len() && name.ends_with(last)
}

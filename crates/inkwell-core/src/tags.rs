//! Tag name normalization.
//!
//! Tags are matched case-insensitively: `"Work"`, `" work "` and `"WORK"`
//! are the same tag and are stored once as `"work"`.

/// Maximum stored tag name length (characters).
pub const MAX_TAG_NAME_LEN: usize = 100;

/// Normalize a raw tag suggestion to its canonical form.
///
/// Trims surrounding whitespace, lowercases, and truncates to
/// [`MAX_TAG_NAME_LEN`] characters. Returns `None` when nothing is left.
pub fn normalize_tag_name(raw: &str) -> Option<String> {
    let normalized: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .take(MAX_TAG_NAME_LEN)
        .collect();
    let normalized = normalized.trim_end().to_string();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Normalize a list of suggestions, dropping empties and duplicates.
///
/// First occurrence wins, so the output keeps the model's ordering.
pub fn normalize_tag_names<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for name in raw.iter().filter_map(|r| normalize_tag_name(r.as_ref())) {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_variants_collapse() {
        for raw in ["Work", " work ", "WORK", "\twork\n"] {
            assert_eq!(normalize_tag_name(raw).as_deref(), Some("work"));
        }
    }

    #[test]
    fn test_normalize_preserves_inner_characters() {
        assert_eq!(
            normalize_tag_name("Project-Alpha").as_deref(),
            Some("project-alpha")
        );
        assert_eq!(
            normalize_tag_name("Meeting Notes").as_deref(),
            Some("meeting notes")
        );
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize_tag_name(""), None);
        assert_eq!(normalize_tag_name("   "), None);
    }

    #[test]
    fn test_normalize_truncates() {
        let long = "a".repeat(150);
        assert_eq!(normalize_tag_name(&long).unwrap().chars().count(), 100);
    }

    #[test]
    fn test_normalize_unicode_lowercase() {
        assert_eq!(normalize_tag_name("ÉTÉ").as_deref(), Some("été"));
    }

    #[test]
    fn test_normalize_list_dedupes_in_order() {
        let tags = normalize_tag_names(&["Work", "errands", " work ", "", "WORK", "Errands"]);
        assert_eq!(tags, vec!["work", "errands"]);
    }
}

//! Name normalization and near-match detection.

/// Canonical form of a name: lowercased, trimmed, inner whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Display form of a name: trimmed with inner whitespace collapsed, case kept.
pub fn display_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Edit distance between two normalized names if they count as a near match.
///
/// Identical names are not near matches. The distance may be at most
/// `max_distance` and at most a third of the longer name.
pub fn near_match(a: &str, b: &str, max_distance: usize) -> Option<usize> {
    if a == b || max_distance == 0 {
        return None;
    }
    let longer = a.chars().count().max(b.chars().count());
    // Cheap length pre-check before the quadratic distance.
    let shorter = a.chars().count().min(b.chars().count());
    if longer - shorter > max_distance {
        return None;
    }
    let distance = strsim::levenshtein(a, b);
    (distance <= max_distance && distance * 3 <= longer).then_some(distance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Kira "), "kira");
        assert_eq!(normalize_name("Eldoria\t  Village"), "eldoria village");
        assert_eq!(normalize_name("ÉLODIE"), "élodie");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn test_display_name_keeps_case() {
        assert_eq!(display_name("  Eldorian   Council "), "Eldorian Council");
    }

    #[test]
    fn test_near_match() {
        assert_eq!(near_match("kira", "kyra", 2), Some(1));
        assert_eq!(near_match("kira", "kira", 2), None);
        // Too far for short names.
        assert_eq!(near_match("kai", "kira", 2), None);
        assert_eq!(near_match("eldorian council", "eldorian councel", 2), Some(1));
        assert_eq!(near_match("kira", "kyra", 0), None);
    }
}

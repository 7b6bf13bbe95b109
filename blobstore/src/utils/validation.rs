use std::sync::LazyLock;

use regex::Regex;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$")
        .expect("repository name pattern is valid")
});

pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Upload ids become a single path component.
pub fn is_valid_upload_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && id != "." && id != ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_names() {
        assert!(is_valid_name("test-repo"));
        assert!(is_valid_name("library/test-repo"));
        assert!(is_valid_name("a.b__c/d-e"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Upper"));
        assert!(!is_valid_name("foo/_uploads"));
        assert!(!is_valid_name("foo//bar"));
        assert!(!is_valid_name("/foo"));
    }

    #[test]
    fn test_upload_ids() {
        assert!(is_valid_upload_id("1f0c8a9e-3c53-4a3b-a0e1-8c3f4d5e6a7b"));
        assert!(!is_valid_upload_id("a/b"));
        assert!(!is_valid_upload_id(""));
    }
}

//! Inventory path helpers shared by the control planes

/// Resolve a lookup path against the root folder for its kind
pub(crate) fn absolute(root: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", root, path)
    }
}

/// Match `text` against `pattern`, where `*` matches any run of characters
/// other than `/`
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(p: &[u8], t: &[u8]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some((b'*', rest)) => {
                (0..=t.len())
                    .take_while(|&i| i == 0 || t[i - 1] != b'/')
                    .any(|i| matches(rest, &t[i..]))
            }
            Some((c, rest)) => t.first() == Some(c) && matches(rest, &t[1..]),
        }
    }
    matches(pattern.as_bytes(), text.as_bytes())
}

/// Split an absolute inventory path into its parent and last segment
pub(crate) fn split_leaf(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("/dc1/network/*VM Network", "/dc1/network/VM Network"));
        assert!(glob_match("/dc1/network/*VM Network", "/dc1/network/Lab VM Network"));
        assert!(!glob_match("/dc1/network/*VM Network", "/dc1/network/VM Network 2"));
        assert!(!glob_match("/dc1/*", "/dc1/network/VM Network"));
        assert!(glob_match("/dc1/*/VM Network", "/dc1/network/VM Network"));
        assert!(glob_match("/dc1/datastore/images", "/dc1/datastore/images"));
    }

    #[test]
    fn test_absolute_and_split() {
        assert_eq!(absolute("/dc1/host", "macOS"), "/dc1/host/macOS");
        assert_eq!(absolute("/dc1/host", "/dc2/host/linux"), "/dc2/host/linux");
        assert_eq!(split_leaf("/dc1/network/*VM Network"), ("/dc1/network", "*VM Network"));
        assert_eq!(split_leaf("dc1"), ("", "dc1"));
    }
}

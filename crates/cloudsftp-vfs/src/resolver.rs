//! Path to space resolution.
//!
//! The SFTP root is synthetic: its entries are the user's storage spaces.
//! `/Name/rest` addresses `rest` inside the space called `Name`.

use cloudsftp_backend::StorageSpace;

/// Lexically clean an SFTP path into absolute `/a/b` form.
///
/// Resolves `.` and `..` without consulting the backend; `..` never climbs
/// above the root.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Split `/space/rest` into the space name and the in-space path.
///
/// The in-space path always starts with `/` and is `/` for a bare space name.
/// The root yields an empty space name.
pub fn split_path(path: &str) -> (&str, String) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.split_once('/') {
        Some((name, rest)) => (name, format!("/{rest}")),
        None => (trimmed, "/".to_string()),
    }
}

/// Find the space owning `path` and the path relative to it.
///
/// `None` means no space matched. That is a normal outcome, not an error;
/// callers translate it into not-found. The root `/` never matches a space.
pub fn resolve<'a>(path: &str, spaces: &'a [StorageSpace]) -> Option<(&'a StorageSpace, String)> {
    let (name, rest) = split_path(path);
    if name.is_empty() {
        return None;
    }
    spaces
        .iter()
        .find(|space| space.name == name)
        .map(|space| (space, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(name: &str) -> StorageSpace {
        StorageSpace {
            id: format!("storage${name}-id"),
            name: name.to_string(),
            owner: "owner".to_string(),
            mtime: None,
            space_type: "project".to_string(),
        }
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/Admin/a/b"), ("Admin", "/a/b".to_string()));
        assert_eq!(split_path("/Admin"), ("Admin", "/".to_string()));
        assert_eq!(split_path("/Admin/"), ("Admin", "/".to_string()));
        assert_eq!(split_path("/"), ("", "/".to_string()));
        assert_eq!(split_path(""), ("", "/".to_string()));
    }

    #[test]
    fn test_resolve_nested() {
        let spaces = vec![space("Admin"), space("Shares")];
        let (found, rel) = resolve("/Shares/docs/report.pdf", &spaces).unwrap();
        assert_eq!(found.name, "Shares");
        assert_eq!(rel, "/docs/report.pdf");
    }

    #[test]
    fn test_resolve_bare_space() {
        let spaces = vec![space("Admin")];
        let (found, rel) = resolve("/Admin", &spaces).unwrap();
        assert_eq!(found.name, "Admin");
        assert_eq!(rel, "/");
    }

    #[test]
    fn test_resolve_root_and_unknown() {
        let spaces = vec![space("Admin")];
        assert!(resolve("/", &spaces).is_none());
        assert!(resolve("/Nope/x", &spaces).is_none());
    }

    #[test]
    fn test_resolve_is_case_sensitive() {
        let spaces = vec![space("Admin")];
        assert!(resolve("/admin", &spaces).is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let mut second = space("Admin");
        second.id = "other$id".to_string();
        let spaces = vec![space("Admin"), second];
        let (found, _) = resolve("/Admin/x", &spaces).unwrap();
        assert_eq!(found.id, "storage$Admin-id");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("."), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("Admin/./x/../y/"), "/Admin/y");
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path("//Admin//f"), "/Admin/f");
    }
}

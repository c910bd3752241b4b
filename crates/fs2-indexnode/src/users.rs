//! The two questions the indexnode asks of the user database.

use std::collections::HashSet;

/// Read-only view of the user database.
pub trait UserDirectory: Send + Sync {
    /// Returns true if `alias` belongs to an administrator.
    fn is_admin(&self, alias: &str) -> bool;

    /// Returns true if `alias` may only be taken by clients on this machine.
    fn is_local_only(&self, alias: &str) -> bool;
}

/// [`UserDirectory`] backed by fixed lists, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    admins: HashSet<String>,
    local_only: HashSet<String>,
}

impl StaticUserDirectory {
    /// Creates a directory from admin and local-only alias lists.
    pub fn new<A, L>(admins: A, local_only: L) -> Self
    where
        A: IntoIterator<Item = String>,
        L: IntoIterator<Item = String>,
    {
        Self {
            admins: admins.into_iter().collect(),
            local_only: local_only.into_iter().collect(),
        }
    }
}

impl UserDirectory for StaticUserDirectory {
    fn is_admin(&self, alias: &str) -> bool {
        self.admins.contains(alias)
    }

    fn is_local_only(&self, alias: &str) -> bool {
        self.local_only.contains(alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_directory() {
        let users = StaticUserDirectory::new(vec!["root".to_string()], vec!["console".to_string()]);
        assert!(users.is_admin("root"));
        assert!(!users.is_admin("alice"));
        assert!(users.is_local_only("console"));
        assert!(!users.is_local_only("root"));
    }

    #[test]
    fn test_default_is_empty() {
        let users = StaticUserDirectory::default();
        assert!(!users.is_admin("root"));
        assert!(!users.is_local_only("root"));
    }
}

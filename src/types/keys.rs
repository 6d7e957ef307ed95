use super::EntityId;

/// Key naming for the fast store.
///
/// Counter keys, lock keys and the dirty set live under one prefix but in
/// distinct namespaces: `<prefix>:<id>`, `<prefix>:lock:<id>`, `<prefix>:dirty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn counter(&self, id: EntityId) -> String {
        format!("{}:{}", self.prefix, id)
    }

    pub fn lock(&self, id: EntityId) -> String {
        format!("{}:lock:{}", self.prefix, id)
    }

    pub fn dirty(&self) -> String {
        format!("{}:dirty", self.prefix)
    }

    /// Parse a dirty-set member back into an entity id.
    /// Members that are not decimal ids are skipped by callers.
    pub fn parse_member(member: &str) -> Option<EntityId> {
        member.parse().ok()
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("thread:like")
    }
}

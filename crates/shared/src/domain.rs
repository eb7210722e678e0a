use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);

/// User-chosen ids are restricted to a conservative charset so they can be
/// embedded into chat keys without an escaping scheme.
pub fn is_valid_user_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Person,
    Group,
}

/// A sidebar entry. Unique per `(id, kind)`: a person and a group may share
/// an id without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub kind: ContactKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: GroupId,
    pub name: String,
    pub members: Vec<UserId>,
    pub creator_id: UserId,
}

/// The local user's identity. `secret` is the opaque credential presented at
/// every introduction; the server uses it to arbitrate id ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub name: String,
    pub secret: String,
}

/// Canonical conversation identifier.
///
/// Direct keys are symmetric in the two participants; group keys depend on
/// the group id alone. The same pair always derives the same key no matter
/// which side computes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatKey(pub String);

impl ChatKey {
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (x, y) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        Self(format!("chat:{}__{}", x.0, y.0))
    }

    pub fn group(group_id: &GroupId) -> Self {
        Self(format!("group:{}", group_id.0))
    }

    pub fn is_group(&self) -> bool {
        self.0.starts_with("group:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_chat_key_is_symmetric() {
        let a = UserId::from("alice");
        let b = UserId::from("bob42");
        assert_eq!(ChatKey::direct(&a, &b), ChatKey::direct(&b, &a));
        assert_eq!(ChatKey::direct(&a, &b).as_str(), "chat:alice__bob42");
    }

    #[test]
    fn group_key_depends_on_group_id_alone() {
        let key = ChatKey::group(&GroupId::from("friends2025"));
        assert_eq!(key.as_str(), "group:friends2025");
        assert!(key.is_group());
        assert!(!ChatKey::direct(&UserId::from("a"), &UserId::from("b")).is_group());
    }

    #[test]
    fn user_id_charset() {
        assert!(is_valid_user_id("bob_123-x"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("bob!"));
        assert!(!is_valid_user_id("with space"));
    }
}

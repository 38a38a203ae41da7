use serde::{Deserialize, Serialize};

const UNNAMED_LABEL: &str = "İsimsiz";

/// Read-only identity snapshot owned by the identity provider.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
}

impl Profile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: Some(display_name.into()),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Display name, or the placeholder used for members without one.
    pub fn label(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => UNNAMED_LABEL,
        }
    }
}

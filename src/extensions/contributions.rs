//! Built-in contribution kinds the shell's registries hold.

use serde::{Deserialize, Serialize};

use super::registration::Contribution;

/// An entry in the command palette.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub title: String,
    /// Id of a [`Category`], possibly contributed by another extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Command {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            category: None,
        }
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub title: String,
}

impl Category {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// A page the view can navigate to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub path: String,
    pub title: String,
}

impl Route {
    pub fn new(id: impl Into<String>, path: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            title: title.into(),
        }
    }
}

impl Contribution for Command {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Contribution for Category {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Contribution for Route {
    fn id(&self) -> &str {
        &self.id
    }
}

//! Cascade actions and styles
//!
//! A [`CascadeStyle`] is attached to every association in the mapping model
//! and says which session operations ([`CascadeAction`]) propagate across that
//! association. Styles parse from the usual comma-separated notation:
//!
//! ```
//! use dormant_core::{CascadeAction, CascadeStyle};
//!
//! let style: CascadeStyle = "persist, merge".parse().unwrap();
//! assert!(style.does_cascade(CascadeAction::Persist));
//! assert!(!style.does_cascade(CascadeAction::Remove));
//!
//! let all: CascadeStyle = "all-delete-orphan".parse().unwrap();
//! assert!(all.has_orphan_delete());
//! ```

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// Session operation that may cascade across associations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    /// Make transient instances persistent
    Persist,
    /// Copy detached state onto managed instances
    Merge,
    /// Schedule deletion
    Remove,
    /// Reload state from the store
    Refresh,
    /// Evict from the persistence context
    Detach,
}

impl CascadeAction {
    /// Every cascade action
    pub const ALL: [CascadeAction; 5] = [
        CascadeAction::Persist,
        CascadeAction::Merge,
        CascadeAction::Remove,
        CascadeAction::Refresh,
        CascadeAction::Detach,
    ];

    fn bit(self) -> u8 {
        match self {
            CascadeAction::Persist => 1,
            CascadeAction::Merge => 1 << 1,
            CascadeAction::Remove => 1 << 2,
            CascadeAction::Refresh => 1 << 3,
            CascadeAction::Detach => 1 << 4,
        }
    }

    /// Lower-case name used in cascade notation
    pub fn name(self) -> &'static str {
        match self {
            CascadeAction::Persist => "persist",
            CascadeAction::Merge => "merge",
            CascadeAction::Remove => "remove",
            CascadeAction::Refresh => "refresh",
            CascadeAction::Detach => "detach",
        }
    }
}

impl fmt::Display for CascadeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of cascade actions plus the delete-orphan flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CascadeStyle {
    actions: u8,
    delete_orphan: bool,
}

impl CascadeStyle {
    /// Cascade nothing
    pub const NONE: CascadeStyle = CascadeStyle {
        actions: 0,
        delete_orphan: false,
    };

    /// Cascade every action
    pub const ALL: CascadeStyle = CascadeStyle {
        actions: 0b1_1111,
        delete_orphan: false,
    };

    /// Cascade every action and delete orphaned collection elements
    pub const ALL_DELETE_ORPHAN: CascadeStyle = CascadeStyle {
        actions: 0b1_1111,
        delete_orphan: true,
    };

    /// Style cascading exactly `actions`
    pub fn of(actions: &[CascadeAction]) -> Self {
        actions
            .iter()
            .fold(CascadeStyle::NONE, |style, action| style.with(*action))
    }

    /// This style plus `action`
    pub fn with(self, action: CascadeAction) -> Self {
        CascadeStyle {
            actions: self.actions | action.bit(),
            ..self
        }
    }

    /// This style with orphan removal enabled
    pub fn with_delete_orphan(self) -> Self {
        CascadeStyle {
            delete_orphan: true,
            ..self
        }
    }

    /// Whether `action` propagates across the association
    pub fn does_cascade(&self, action: CascadeAction) -> bool {
        self.actions & action.bit() != 0
    }

    /// Whether elements removed from the collection are deleted
    pub fn has_orphan_delete(&self) -> bool {
        self.delete_orphan
    }

    /// Whether nothing cascades at all
    pub fn is_none(&self) -> bool {
        self.actions == 0 && !self.delete_orphan
    }
}

impl FromStr for CascadeStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut style = CascadeStyle::NONE;
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            style = match token.to_ascii_lowercase().as_str() {
                "none" => style,
                "all" => CascadeStyle {
                    actions: CascadeStyle::ALL.actions,
                    ..style
                },
                "all-delete-orphan" => CascadeStyle::ALL_DELETE_ORPHAN,
                "delete-orphan" => style.with_delete_orphan(),
                "persist" | "save-update" => style.with(CascadeAction::Persist),
                "merge" => style.with(CascadeAction::Merge),
                "remove" | "delete" => style.with(CascadeAction::Remove),
                "refresh" => style.with(CascadeAction::Refresh),
                "detach" | "evict" => style.with(CascadeAction::Detach),
                other => {
                    return Err(Error::Mapping(format!("unknown cascade style '{}'", other)))
                }
            };
        }
        Ok(style)
    }
}

impl fmt::Display for CascadeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let mut parts: Vec<&str> = if self.actions == CascadeStyle::ALL.actions {
            vec!["all"]
        } else {
            CascadeAction::ALL
                .iter()
                .filter(|a| self.does_cascade(**a))
                .map(|a| a.name())
                .collect()
        };
        if self.delete_orphan {
            parts.push("delete-orphan");
        }
        f.write_str(&parts.join(","))
    }
}

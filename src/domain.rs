use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Domain data structures shared across modules.

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    pub login: String,
    pub name: String,
    pub teams: Vec<Team>,
}

impl Organisation {
    pub fn team(&self, slug: &str) -> Option<&Team> {
        self.teams.iter().find(|team| team.slug == slug)
    }

    /// Team selection an organisation starts out with: its first team, or the
    /// organisation-wide view when it has none.
    pub fn default_team_selection(&self) -> TeamSelection {
        match self.teams.first() {
            Some(team) => TeamSelection::Team(team.slug.clone()),
            None => TeamSelection::NoTeam,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub slug: String,
    pub name: String,
}

/// Which team's pull requests are shown for the selected organisation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TeamSelection {
    /// Nothing chosen yet; pull requests are not loaded in this state.
    #[default]
    Undecided,
    /// Organisation-wide results.
    NoTeam,
    Team(String),
}

impl TeamSelection {
    pub fn slug(&self) -> Option<&str> {
        match self {
            TeamSelection::Team(slug) => Some(slug),
            TeamSelection::Undecided | TeamSelection::NoTeam => None,
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, TeamSelection::Undecided)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PullRequestRecord {
    pub repository: String,
    pub url: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub is_draft: bool,
    pub author: Option<User>,
    pub reviewers: Vec<User>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub login: String,
    pub name: Option<String>,
    pub is_member: bool,
    pub kind: Option<UserKind>,
}

impl User {
    /// Name shown in the table; `short` prefers the login over the full name.
    pub fn display_name(&self, short: bool) -> &str {
        match (&self.name, short) {
            (Some(name), false) if !name.is_empty() => name,
            _ => &self.login,
        }
    }

    pub fn is_bot(&self) -> bool {
        matches!(self.kind, Some(UserKind::Bot))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserKind {
    Bot,
    User,
}

impl UserKind {
    /// Maps a GraphQL `__typename`; other actor types stay unclassified.
    pub fn from_typename(typename: &str) -> Option<Self> {
        match typename {
            "Bot" => Some(UserKind::Bot),
            "User" => Some(UserKind::User),
            _ => None,
        }
    }
}

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier as it may appear on the wire: some endpoints send numbers,
/// others strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl RawId {
    fn into_canonical(self) -> String {
        match self {
            RawId::Text(text) => text.trim().to_string(),
            RawId::Signed(value) => value.to_string(),
            RawId::Unsigned(value) => value.to_string(),
        }
    }
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into().trim().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into_canonical()))
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChildId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// The four specialist personas a conversation can be routed to.
///
/// Variant order is the canonical sort order used when comparing selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ParentingStyle,
    ChildDevelopment,
    CrisisIntervention,
    CommunityConnector,
}

static AGENT_TABLE: [(AgentKind, &str, &str); 4] = [
    (
        AgentKind::ParentingStyle,
        "parenting-style",
        "Parenting Style Analyst",
    ),
    (
        AgentKind::ChildDevelopment,
        "child-development",
        "Child Development Advisor",
    ),
    (
        AgentKind::CrisisIntervention,
        "crisis-intervention",
        "Crisis Intervention Specialist",
    ),
    (
        AgentKind::CommunityConnector,
        "community-connector",
        "Community Connector",
    ),
];

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [
        AgentKind::ParentingStyle,
        AgentKind::ChildDevelopment,
        AgentKind::CrisisIntervention,
        AgentKind::CommunityConnector,
    ];

    fn entry(self) -> &'static (AgentKind, &'static str, &'static str) {
        &AGENT_TABLE[self as usize]
    }

    pub fn id(self) -> &'static str {
        self.entry().1
    }

    pub fn display_name(self) -> &'static str {
        self.entry().2
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim();
        AGENT_TABLE
            .iter()
            .find(|(_, known, _)| *known == id)
            .map(|(kind, _, _)| *kind)
    }

    pub fn from_display_name(name: &str) -> Option<Self> {
        let name = name.trim();
        AGENT_TABLE
            .iter()
            .find(|(_, _, known)| known.eq_ignore_ascii_case(name))
            .map(|(kind, _, _)| *kind)
    }

    /// Accepts either an identifier or a display name.
    pub fn lookup(value: &str) -> Option<Self> {
        Self::from_id(value).or_else(|| Self::from_display_name(value))
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown agent '{0}'")]
pub struct UnknownAgent(pub String);

impl FromStr for AgentKind {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| UnknownAgent(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationType {
    #[default]
    General,
    AgentSpecific,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    #[serde(alias = "assistant")]
    Ai,
}

const LOCAL_CONVERSATION_PREFIX: &str = "local-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalConversationId(String);

impl LocalConversationId {
    pub fn generate() -> Self {
        Self(format!("{LOCAL_CONVERSATION_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("conversation {current} is already bound; refusing rebind to {requested}")]
pub struct RebindError {
    pub current: ConversationId,
    pub requested: ConversationId,
}

/// Identity of a conversation that may not exist on the server yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
    Pending(LocalConversationId),
    Confirmed(ConversationId),
}

impl ConversationRef {
    pub fn pending() -> Self {
        Self::Pending(LocalConversationId::generate())
    }

    pub fn server_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Pending(_) => None,
            Self::Confirmed(id) => Some(id),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Binds a pending reference to the id the server assigned.
    ///
    /// Returns the local id that was replaced, or `None` when the reference
    /// was already confirmed with the same id.
    pub fn rebind(
        &mut self,
        server_id: ConversationId,
    ) -> Result<Option<LocalConversationId>, RebindError> {
        match self {
            Self::Pending(local) => {
                let local = local.clone();
                *self = Self::Confirmed(server_id);
                Ok(Some(local))
            }
            Self::Confirmed(current) if *current == server_id => Ok(None),
            Self::Confirmed(current) => Err(RebindError {
                current: current.clone(),
                requested: server_id,
            }),
        }
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(local) => local.fmt(f),
            Self::Confirmed(id) => id.fmt(f),
        }
    }
}

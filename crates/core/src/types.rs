use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Internal primary key of an organization.
    OrganizationId
);
id_type!(
    /// Internal primary key of a user.
    UserId
);
id_type!(
    /// User identifier assigned by the upstream identity provider.
    ExternalUserId
);
id_type!(
    /// Primary key of a queued job.
    JobId
);

/// Organization synced from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    /// Identity provider organization id.
    pub org_id: String,
    /// Stable public identifier, generated once on insert.
    pub uuid: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// User belonging to exactly one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub organization_id: OrganizationId,
    pub external_id: ExternalUserId,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The two independent notification-policy chains every user owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainKind {
    Default,
    Important,
}

impl ChainKind {
    pub const ALL: [ChainKind; 2] = [ChainKind::Default, ChainKind::Important];

    pub fn from_important(important: bool) -> Self {
        if important {
            Self::Important
        } else {
            Self::Default
        }
    }

    /// Value of the `important` flag stored on every step of the chain.
    pub fn is_important(self) -> bool {
        matches!(self, Self::Important)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Important => "important",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChainKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChainKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "default" => Ok(Self::Default),
            "important" => Ok(Self::Important),
            _ => Err(D::Error::custom("unknown chain kind")),
        }
    }
}

/// Channel used by a notify step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    SlackMention,
    Sms,
    PhoneCall,
    Email,
    MobilePush,
}

impl NotificationChannel {
    /// Returns the canonical database representation for the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SlackMention => "slack_mention",
            Self::Sms => "sms",
            Self::PhoneCall => "phone_call",
            Self::Email => "email",
            Self::MobilePush => "mobile_push",
        }
    }
}

impl FromStr for NotificationChannel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "slack_mention" => Ok(Self::SlackMention),
            "sms" => Ok(Self::Sms),
            "phone_call" => Ok(Self::PhoneCall),
            "email" => Ok(Self::Email),
            "mobile_push" => Ok(Self::MobilePush),
            other => Err(other.to_string()),
        }
    }
}

/// A single escalation step inside a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PolicyStep {
    Notify { channel: NotificationChannel },
    Wait {
        #[serde(with = "duration_secs")]
        delay: Duration,
    },
}

impl PolicyStep {
    pub fn notify(channel: NotificationChannel) -> Self {
        Self::Notify { channel }
    }

    pub fn wait_minutes(minutes: u64) -> Self {
        Self::Wait {
            delay: Duration::from_secs(minutes * 60),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Notify { .. } => "notify",
            Self::Wait { .. } => "wait",
        }
    }
}

/// Persisted notification-policy step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPolicy {
    pub id: i64,
    pub user_id: UserId,
    pub important: bool,
    pub position: u32,
    #[serde(flatten)]
    pub step: PolicyStep,
}

impl NotificationPolicy {
    pub fn chain(&self) -> ChainKind {
        ChainKind::from_important(self.important)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

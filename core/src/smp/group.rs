/// SMP command groups
///
/// The group id selects a command family on the device (OS, image, logs...).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known SMP group identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum McuMgrGroup {
    Os,
    Image,
    Stats,
    Config,
    Logs,
    Crash,
    Split,
    Run,
    Fs,
    Shell,
    /// Application-defined group, see [`McuMgrGroup::per_user`]
    PerUser(UserGroupId),
}

/// First group id available to applications
pub const PER_USER_GROUP_BASE: u16 = 64;

/// Group id in the application range, at or above [`PER_USER_GROUP_BASE`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct UserGroupId(u16);

impl UserGroupId {
    pub fn new(id: u16) -> Option<Self> {
        (id >= PER_USER_GROUP_BASE).then_some(Self(id))
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for UserGroupId {
    type Error = String;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::new(id).ok_or_else(|| format!("group {} is below the application range", id))
    }
}

impl From<UserGroupId> for u16 {
    fn from(id: UserGroupId) -> Self {
        id.0
    }
}

impl McuMgrGroup {
    /// Application-defined group `id`; `None` if `id` falls in the range
    /// reserved for the built-in groups
    pub fn per_user(id: u16) -> Option<Self> {
        UserGroupId::new(id).map(Self::PerUser)
    }

    /// Numeric group id as carried in the header
    pub fn id(&self) -> u16 {
        match self {
            Self::Os => 0,
            Self::Image => 1,
            Self::Stats => 2,
            Self::Config => 3,
            Self::Logs => 4,
            Self::Crash => 5,
            Self::Split => 6,
            Self::Run => 7,
            Self::Fs => 8,
            Self::Shell => 9,
            Self::PerUser(id) => id.get(),
        }
    }

    /// Map a header group id back to a known group
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Self::Os),
            1 => Some(Self::Image),
            2 => Some(Self::Stats),
            3 => Some(Self::Config),
            4 => Some(Self::Logs),
            5 => Some(Self::Crash),
            6 => Some(Self::Split),
            7 => Some(Self::Run),
            8 => Some(Self::Fs),
            9 => Some(Self::Shell),
            id => Self::per_user(id),
        }
    }
}

impl fmt::Display for McuMgrGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os => write!(f, "os"),
            Self::Image => write!(f, "image"),
            Self::Stats => write!(f, "stats"),
            Self::Config => write!(f, "config"),
            Self::Logs => write!(f, "logs"),
            Self::Crash => write!(f, "crash"),
            Self::Split => write!(f, "split"),
            Self::Run => write!(f, "run"),
            Self::Fs => write!(f, "fs"),
            Self::Shell => write!(f, "shell"),
            Self::PerUser(id) => write!(f, "user({})", id.get()),
        }
    }
}

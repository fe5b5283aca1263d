#[cfg(test)]
mod state_test;

use std::fmt;

/// The connectivity state of a single component.
///
/// Transitions are monotone (`Disconnected` → `Gathering` → `Connecting` →
/// `Connected` → `Ready`) except through a restart, which moves the component
/// back to `Connecting`. `Failed` is terminal until restart.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentState {
    Unspecified,

    /// No activity has happened on the component yet.
    Disconnected,

    /// Local candidates are being gathered.
    Gathering,

    /// Connectivity checks are running against the remote candidates.
    Connecting,

    /// At least one candidate pair succeeded, nomination is pending.
    Connected,

    /// A pair has been nominated; the component is usable.
    Ready,

    /// Every candidate pair failed and the check timer stopped.
    Failed,
}

impl Default for ComponentState {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Unspecified => "Unspecified",
            Self::Disconnected => "Disconnected",
            Self::Gathering => "Gathering",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for ComponentState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Disconnected,
            2 => Self::Gathering,
            3 => Self::Connecting,
            4 => Self::Connected,
            5 => Self::Ready,
            6 => Self::Failed,
            _ => Self::Unspecified,
        }
    }
}

/// Describes the state of the candidate gathering process.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum GatheringState {
    Unspecified,

    /// Indicates candidate gathering is not yet started.
    New,

    /// Indicates candidate gathering is ongoing.
    Gathering,

    /// Indicates candidate gathering has been completed.
    Complete,
}

impl From<u8> for GatheringState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::New,
            2 => Self::Gathering,
            3 => Self::Complete,
            _ => Self::Unspecified,
        }
    }
}

impl Default for GatheringState {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::New => "new",
            Self::Gathering => "gathering",
            Self::Complete => "complete",
            Self::Unspecified => "unspecified",
        };
        write!(f, "{s}")
    }
}

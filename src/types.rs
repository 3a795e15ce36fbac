// =============================================================================
// Shared types used across the tradewind engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Operating mode of the engine.
///
/// `Demo` and `Data` are development modes and require an explicit opt-in
/// flag; `Paper` is the safe default; `Live` places real orders and requires
/// `LIVE_CONFIRM=1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    Demo,
    Data,
    Paper,
    Live,
}

impl Default for BotMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for BotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "demo"),
            Self::Data => write!(f, "data"),
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

impl BotMode {
    /// Parse a `BOT_MODE` value. Unknown values are a configuration error.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "demo" => Some(Self::Demo),
            "data" => Some(Self::Data),
            "paper" => Some(Self::Paper),
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

/// Trade direction. Serialized as "LONG" / "SHORT" in every persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Direction {
    /// Action type used by datasets and decisions: 0=SHORT, 1=LONG.
    pub fn action_type(self) -> u8 {
        match self {
            Self::Short => 0,
            Self::Long => 1,
        }
    }

    pub fn from_action_type(action_type: u8) -> Option<Self> {
        match action_type {
            0 => Some(Self::Short),
            1 => Some(Self::Long),
            _ => None,
        }
    }

    /// +1.0 for longs, -1.0 for shorts.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Exchange order side for the entry leg.
    pub fn entry_side(self) -> &'static str {
        match self {
            Self::Long => "buy",
            Self::Short => "sell",
        }
    }

    /// Exchange order side for the TP/SL exit legs.
    pub fn exit_side(self) -> &'static str {
        match self {
            Self::Long => "sell",
            Self::Short => "buy",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// How a closed position exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitType {
    #[serde(rename = "TP")]
    Tp,
    #[serde(rename = "SL")]
    Sl,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tp => write!(f, "TP"),
            Self::Sl => write!(f, "SL"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Trading session bucket derived from the UTC hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Session {
    Asia,
    London,
    Ny,
}

impl Session {
    /// Rough session bucket: 00-08 UTC asia, 08-16 london, 16-24 ny.
    pub fn from_utc_ts(ts_utc: i64) -> Self {
        let h = ts_utc.rem_euclid(86_400) / 3_600;
        if h < 8 {
            Self::Asia
        } else if h < 16 {
            Self::London
        } else {
            Self::Ny
        }
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asia => write!(f, "asia"),
            Self::London => write!(f, "london"),
            Self::Ny => write!(f, "ny"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_rejects_unknown() {
        assert_eq!(BotMode::parse("paper"), Some(BotMode::Paper));
        assert_eq!(BotMode::parse(" LIVE "), Some(BotMode::Live));
        assert_eq!(BotMode::parse("backtest"), None);
    }

    #[test]
    fn direction_action_type_roundtrip() {
        assert_eq!(Direction::Long.action_type(), 1);
        assert_eq!(Direction::Short.action_type(), 0);
        assert_eq!(Direction::from_action_type(1), Some(Direction::Long));
        assert_eq!(Direction::from_action_type(0), Some(Direction::Short));
        assert_eq!(Direction::from_action_type(7), None);
    }

    #[test]
    fn direction_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Direction::Long).unwrap(), "\"LONG\"");
        assert_eq!(serde_json::to_string(&ExitType::Sl).unwrap(), "\"SL\"");
    }

    #[test]
    fn session_buckets() {
        // 2023-11-14 22:15:00 UTC falls in the ny bucket.
        assert_eq!(Session::from_utc_ts(1_700_000_100), Session::Ny);
        assert_eq!(Session::from_utc_ts(0), Session::Asia);
        assert_eq!(Session::from_utc_ts(9 * 3600), Session::London);
    }
}

use serde::{Deserialize, Serialize};

/// Lifecycle status of a voice/video call.
///
/// `Pending` and `Ringing` both mean "awaiting the callee". Terminal
/// statuses never change again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Ringing,
    Accepted,
    Declined,
    Ended,
    Missed,
    Failed,
}

impl CallStatus {
    /// Statuses from which the callee may still answer.
    pub const AWAITING_RESPONSE: &'static [CallStatus] = &[CallStatus::Pending, CallStatus::Ringing];

    /// Statuses that occupy both participants.
    pub const NON_TERMINAL: &'static [CallStatus] =
        &[CallStatus::Pending, CallStatus::Ringing, CallStatus::Accepted];

    pub fn is_terminal(self) -> bool {
        !Self::NON_TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ringing" => Ok(Self::Ringing),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            "ended" => Ok(Self::Ended),
            "missed" => Ok(Self::Missed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    #[default]
    Voice,
    Video,
}

impl CallType {
    /// Lenient parse used for client input: anything unrecognized is a voice call.
    pub fn from_request(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown call type: {other}")),
        }
    }
}

/// Human-readable call length, e.g. "1 hours 2 minutes 5 seconds".
pub fn format_call_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        return format!("{seconds} seconds");
    }

    let minutes = seconds / 60;
    let rem_seconds = seconds % 60;
    if minutes < 60 {
        if rem_seconds == 0 {
            return format!("{minutes} minutes");
        }
        return format!("{minutes} minutes {rem_seconds} seconds");
    }

    let hours = minutes / 60;
    let rem_minutes = minutes % 60;
    match (rem_minutes, rem_seconds) {
        (0, 0) => format!("{hours} hours"),
        (m, 0) => format!("{hours} hours {m} minutes"),
        (m, s) => format!("{hours} hours {m} minutes {s} seconds"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        for s in [CallStatus::Declined, CallStatus::Ended, CallStatus::Missed, CallStatus::Failed] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        for s in [CallStatus::Pending, CallStatus::Ringing, CallStatus::Accepted] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
    }

    #[test]
    fn status_display_matches_from_str() {
        for s in [
            CallStatus::Pending,
            CallStatus::Ringing,
            CallStatus::Accepted,
            CallStatus::Declined,
            CallStatus::Ended,
            CallStatus::Missed,
            CallStatus::Failed,
        ] {
            assert_eq!(s.to_string().parse::<CallStatus>().unwrap(), s);
        }
        assert!("hung_up".parse::<CallStatus>().is_err());
    }

    #[test]
    fn call_type_defaults_to_voice() {
        assert_eq!(CallType::from_request(None), CallType::Voice);
        assert_eq!(CallType::from_request(Some("hologram")), CallType::Voice);
        assert_eq!(CallType::from_request(Some("video")), CallType::Video);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_call_duration(0), "0 seconds");
        assert_eq!(format_call_duration(59), "59 seconds");
        assert_eq!(format_call_duration(60), "1 minutes");
        assert_eq!(format_call_duration(125), "2 minutes 5 seconds");
        assert_eq!(format_call_duration(3600), "1 hours");
        assert_eq!(format_call_duration(3720), "1 hours 2 minutes");
        assert_eq!(format_call_duration(3725), "1 hours 2 minutes 5 seconds");
        assert_eq!(format_call_duration(-4), "0 seconds");
    }
}

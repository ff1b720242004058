use chrono::{DateTime, Utc};

/// Why a message is stale for the current session, if it is.
///
/// Mail timestamped before the session started was addressed to a predecessor
/// process; the current agent should not act on it a second time.
pub fn stale_reason(
    message_time: DateTime<Utc>,
    session_created: Option<DateTime<Utc>>,
) -> Option<String> {
    let created = session_created?;
    (message_time < created).then(|| {
        format!(
            "message sent {} before session start {}",
            message_time.format("%Y-%m-%dT%H:%M:%SZ"),
            created.format("%Y-%m-%dT%H:%M:%SZ")
        )
    })
}

pub fn is_stale(message_time: DateTime<Utc>, session_created: Option<DateTime<Utc>>) -> bool {
    stale_reason(message_time, session_created).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn older_than_session_is_stale() {
        let created = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let reason = stale_reason(created - Duration::minutes(5), Some(created)).unwrap();
        assert!(reason.contains("before session start"));
        assert!(!is_stale(created, Some(created)));
        assert!(!is_stale(created + Duration::seconds(1), Some(created)));
    }

    #[test]
    fn unknown_session_start_is_never_stale() {
        assert_eq!(stale_reason(Utc::now(), None), None);
    }
}

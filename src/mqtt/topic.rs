//! Topic naming for lock traffic

/// Optional presence topic carrying the client's online/offline notices
pub const APP_STATUS_TOPIC: &str = "app/status";

const CONTROL_PREFIX: &str = "lock/control/";
const RESPONSE_PREFIX: &str = "lock/response/";
const STATUS_PREFIX: &str = "lock/status/";

/// Command channel, client → device
pub fn control_topic(device_id: &str) -> String {
    format!("{CONTROL_PREFIX}{device_id}")
}

/// Correlated responses, device → client
pub fn response_topic(device_id: &str) -> String {
    format!("{RESPONSE_PREFIX}{device_id}")
}

/// Authoritative status broadcasts, device → client
pub fn status_topic(device_id: &str) -> String {
    format!("{STATUS_PREFIX}{device_id}")
}

/// Kind of lock topic and the device it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTopic<'a> {
    Control(&'a str),
    Response(&'a str),
    Status(&'a str),
}

/// Classifies a concrete topic; `None` for anything outside the lock namespace
pub fn parse_lock_topic(topic: &str) -> Option<LockTopic<'_>> {
    let valid = |device: &str| !device.is_empty() && !device.contains('/');

    if let Some(device) = topic.strip_prefix(CONTROL_PREFIX) {
        valid(device).then_some(LockTopic::Control(device))
    } else if let Some(device) = topic.strip_prefix(RESPONSE_PREFIX) {
        valid(device).then_some(LockTopic::Response(device))
    } else if let Some(device) = topic.strip_prefix(STATUS_PREFIX) {
        valid(device).then_some(LockTopic::Status(device))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_per_device_topics() {
        assert_eq!(control_topic("D1"), "lock/control/D1");
        assert_eq!(response_topic("D1"), "lock/response/D1");
        assert_eq!(status_topic("D1"), "lock/status/D1");
    }

    #[test]
    fn parses_lock_topics() {
        assert_eq!(
            parse_lock_topic("lock/status/D1"),
            Some(LockTopic::Status("D1"))
        );
        assert_eq!(
            parse_lock_topic("lock/response/front-door"),
            Some(LockTopic::Response("front-door"))
        );
        assert_eq!(parse_lock_topic("lock/status/"), None);
        assert_eq!(parse_lock_topic("lock/status/D1/extra"), None);
        assert_eq!(parse_lock_topic("app/status"), None);
    }
}

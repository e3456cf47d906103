//! Topic constants and helpers for the bus hierarchy.
//!
//! Topics are lower-case and slash-separated under the `alicia/` prefix,
//! except capability-addressed calls which use the flat `capability:<name>`
//! form and are subscribed per capability (MQTT wildcards cannot span a
//! partial level).

// ── System topics ─────────────────────────────────────────────────────────

/// Service announces presence (registration payload).
pub const DISCOVERY_REGISTER: &str = "alicia/system/discovery/register";

/// Service announces departure; also the last-will topic.
pub const DISCOVERY_UNREGISTER: &str = "alicia/system/discovery/unregister";

/// Solicits an immediate heartbeat from every service.
pub const HEALTH_CHECK: &str = "alicia/system/health/check";

/// Wildcard filter over all per-service heartbeats.
pub const HEALTH_FILTER: &str = "alicia/system/health/+";

/// Per-service periodic heartbeat topic.
pub fn health(service: &str) -> String {
    format!("alicia/system/health/{service}")
}

// ── Security topics ───────────────────────────────────────────────────────

pub const SECURITY_AUTH: &str = "alicia/system/security/auth";
pub const SECURITY_AUTH_RESPONSE: &str = "alicia/system/security/auth_response";
pub const SECURITY_ENCRYPT: &str = "alicia/system/security/encrypt";
pub const SECURITY_ENCRYPT_RESPONSE: &str = "alicia/system/security/encrypt_response";
pub const SECURITY_VALIDATE: &str = "alicia/system/security/validate";
pub const SECURITY_VALIDATE_RESPONSE: &str = "alicia/system/security/validate_response";

// ── Config topics ─────────────────────────────────────────────────────────

pub const CONFIG_REQUEST: &str = "alicia/config/request";
pub const CONFIG_GLOBAL_REQUEST: &str = "alicia/config/global/request";
pub const CONFIG_GLOBAL_UPDATE: &str = "alicia/config/global/update";

pub fn config_update(service: &str) -> String {
    format!("alicia/config/{service}/update")
}

pub fn config_response(requester: &str) -> String {
    format!("alicia/config/{requester}/response")
}

pub fn config_global_response(requester: &str) -> String {
    format!("alicia/config/{requester}/global/response")
}

// ── Device topics ─────────────────────────────────────────────────────────

pub const DEVICE_STATUS_FILTER: &str = "alicia/devices/+/status";
pub const DEVICE_RESPONSE_FILTER: &str = "alicia/devices/+/response";

pub fn device_command(device_id: &str) -> String {
    format!("alicia/devices/{device_id}/command")
}

pub fn device_status(device_id: &str) -> String {
    format!("alicia/devices/{device_id}/status")
}

pub fn device_response(device_id: &str) -> String {
    format!("alicia/devices/{device_id}/response")
}

/// Extract the device id from an `alicia/devices/{id}/...` topic.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix("alicia/devices/")?;
    let (id, _) = rest.split_once('/')?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

// ── Capability topics ─────────────────────────────────────────────────────

pub fn capability(name: &str) -> String {
    format!("capability:{name}")
}

/// Extract the capability name from a `capability:<name>` topic.
pub fn capability_from_topic(topic: &str) -> Option<&str> {
    let name = topic.strip_prefix("capability:")?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

// ── Voice pipeline topics ─────────────────────────────────────────────────

pub const STT_REQUEST: &str = "alicia/voice/stt/request";
pub const STT_RESPONSE: &str = "alicia/voice/stt/response";
pub const STT_ERROR: &str = "alicia/voice/stt/error";

pub const AI_REQUEST: &str = "alicia/voice/ai/request";
pub const AI_RESPONSE: &str = "alicia/voice/ai/response";
pub const AI_ERROR: &str = "alicia/voice/ai/error";

pub const TTS_REQUEST: &str = "alicia/voice/tts/request";
pub const TTS_RESPONSE: &str = "alicia/voice/tts/response";
pub const TTS_ERROR: &str = "alicia/voice/tts/error";

// ── Load balancer topics ──────────────────────────────────────────────────

pub const LB_STATUS: &str = "alicia/loadbalancer/status";
pub const LB_COMMAND: &str = "alicia/loadbalancer/command";

pub fn lb_route(service: &str) -> String {
    format!("alicia/loadbalancer/route/{service}")
}

// ── Filter matching ───────────────────────────────────────────────────────

/// Match a topic against an MQTT-style filter.
///
/// `+` matches exactly one level, a trailing `#` matches the remainder.
/// Levels are split on `/`; flat topics (e.g. `capability:light.on`) only
/// match exactly.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_topic_per_service() {
        assert_eq!(health("tts_service"), "alicia/system/health/tts_service");
    }

    #[test]
    fn device_id_extraction() {
        assert_eq!(
            device_id_from_topic("alicia/devices/speaker_1/status"),
            Some("speaker_1")
        );
        assert_eq!(device_id_from_topic("alicia/devices//status"), None);
        assert_eq!(device_id_from_topic("alicia/system/health/x"), None);
    }

    #[test]
    fn capability_extraction() {
        assert_eq!(capability_from_topic("capability:light.on"), Some("light.on"));
        assert_eq!(capability_from_topic("capability:"), None);
        assert_eq!(capability_from_topic("alicia/devices/x/status"), None);
    }

    #[test]
    fn plus_matches_one_level() {
        assert!(topic_matches(HEALTH_FILTER, "alicia/system/health/stt_service"));
        assert!(!topic_matches(HEALTH_FILTER, "alicia/system/health/a/b"));
        assert!(!topic_matches(HEALTH_FILTER, "alicia/system/health"));
    }

    #[test]
    fn hash_matches_remainder() {
        assert!(topic_matches("alicia/devices/#", "alicia/devices/d1/response"));
        assert!(topic_matches("alicia/devices/#", "alicia/devices"));
        assert!(!topic_matches("alicia/devices/#", "alicia/voice/tts/request"));
    }

    #[test]
    fn flat_topics_match_exactly() {
        assert!(topic_matches("capability:light.on", "capability:light.on"));
        assert!(!topic_matches("capability:light.on", "capability:light.off"));
    }

    #[test]
    fn mid_filter_plus() {
        assert!(topic_matches(DEVICE_STATUS_FILTER, "alicia/devices/d1/status"));
        assert!(!topic_matches(DEVICE_STATUS_FILTER, "alicia/devices/d1/response"));
    }
}

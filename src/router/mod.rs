// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Message router - classifies inbound traffic by topic and decodes typed events
//!
//! Payloads are decoded exactly once here. Everything past the router works
//! with [`InboundEvent`] and never touches raw JSON.

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::TopicConfig;
use crate::core::AlertReason;
use crate::error::RouterError;
use crate::geo::GeoPoint;

/// Source id used when a payload does not identify its sender
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Threshold above which the echo path answers `ON`
pub const TEST_ON_THRESHOLD: f64 = 50.0;

/// Typed inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Diagnostic(DiagnosticEvent),
    Command(CommandEvent),
    Test(TestEvent),
}

/// Periodic report from the lock unit
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticEvent {
    pub source_id: String,
    pub point: Option<GeoPoint>,
    pub battery: Option<String>,
    pub reason_hint: Option<AlertReason>,
}

/// Lock/unlock request from the mobile app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedState {
    Lock,
    Unlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub requested: RequestedState,
    pub source_id: String,
}

/// Echo path used for bench testing the device relay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestEvent {
    pub value: f64,
}

impl TestEvent {
    /// Plain-text command the device expects for this value
    pub fn command(&self) -> &'static str {
        if self.value > TEST_ON_THRESHOLD {
            "ON"
        } else {
            "OFF"
        }
    }
}

const SOURCE_KEYS: &[&str] = &["client_id", "source_id", "sourceId"];
const LAT_KEYS: &[&str] = &["lat", "latitude"];
const LON_KEYS: &[&str] = &["lon", "lng", "longitude"];
const BATTERY_KEYS: &[&str] = &["battery_level", "battery"];
const REASON_KEYS: &[&str] = &["reason", "reason_hint", "reasonHint"];

/// Topic classifier and payload decoder
#[derive(Debug, Clone)]
pub struct MessageRouter {
    topics: TopicConfig,
}

impl MessageRouter {
    pub fn new(topics: TopicConfig) -> Self {
        Self { topics }
    }

    /// Topics the transport must subscribe to
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.topics.diagnostics.clone(),
            self.topics.command_request.clone(),
            self.topics.test.clone(),
        ]
    }

    /// Decode a message. Unrecognized topics yield `Ok(None)`.
    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<Option<InboundEvent>, RouterError> {
        if topic == self.topics.diagnostics {
            self.decode_diagnostic(topic, payload)
                .map(|e| Some(InboundEvent::Diagnostic(e)))
        } else if topic == self.topics.command_request {
            self.decode_command(topic, payload)
                .map(|e| Some(InboundEvent::Command(e)))
        } else if topic == self.topics.test {
            self.decode_test(topic, payload)
                .map(|e| Some(InboundEvent::Test(e)))
        } else {
            debug!("Ignoring message on unrecognized topic {}", topic);
            Ok(None)
        }
    }

    /// Decode a diagnostic report; also used by the HTTP ingress
    pub fn decode_diagnostic(&self, origin: &str, payload: &[u8]) -> Result<DiagnosticEvent, RouterError> {
        let fields = decode_object(origin, payload)?;

        // Fix may be nested under "gps" or sit at the top level
        let point = match fields.get("gps").and_then(Value::as_object) {
            Some(gps) => point_from_map(gps),
            None => point_from_map(&fields),
        };

        let reason_hint = first(&fields, REASON_KEYS)
            .and_then(Value::as_str)
            .and_then(AlertReason::parse)
            .filter(|r| *r != AlertReason::None);

        Ok(DiagnosticEvent {
            source_id: source_of(&fields),
            point,
            battery: first(&fields, BATTERY_KEYS).and_then(battery_label),
            reason_hint,
        })
    }

    fn decode_command(&self, origin: &str, payload: &[u8]) -> Result<CommandEvent, RouterError> {
        let fields = decode_object(origin, payload)?;
        let source_id = source_of(&fields);

        let requested = match fields.get("state") {
            None | Some(Value::Null) => "unknown".to_string(),
            Some(Value::String(s)) => s.trim().to_lowercase(),
            Some(other) => {
                return Err(RouterError::MalformedPayload {
                    topic: origin.to_string(),
                    reason: format!("state must be a string, got {}", other),
                })
            }
        };

        let requested = match requested.as_str() {
            "lock" => RequestedState::Lock,
            "unlock" => RequestedState::Unlock,
            _ => return Err(RouterError::InvalidCommand { requested, source_id }),
        };

        Ok(CommandEvent { requested, source_id })
    }

    fn decode_test(&self, origin: &str, payload: &[u8]) -> Result<TestEvent, RouterError> {
        let fields = decode_object(origin, payload)?;
        let value = match fields.get("value") {
            None | Some(Value::Null) => 0.0,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(other) => {
                return Err(RouterError::MalformedPayload {
                    topic: origin.to_string(),
                    reason: format!("value must be a number, got {}", other),
                })
            }
        };
        Ok(TestEvent { value })
    }
}

fn decode_object(origin: &str, payload: &[u8]) -> Result<Map<String, Value>, RouterError> {
    let malformed = |reason: String| RouterError::MalformedPayload {
        topic: origin.to_string(),
        reason,
    };

    let text = std::str::from_utf8(payload).map_err(|e| malformed(e.to_string()))?;
    match serde_json::from_str::<Value>(text).map_err(|e| malformed(e.to_string()))? {
        Value::Object(fields) => Ok(fields),
        _ => Err(malformed("expected a JSON object".to_string())),
    }
}

/// First non-null value among `keys`
fn first<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .find(|v| !v.is_null())
}

/// Sender id; numeric ids are kept as their decimal text
fn source_of(fields: &Map<String, Value>) -> String {
    SOURCE_KEYS
        .iter()
        .filter_map(|k| fields.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
}

fn point_from_map(fields: &Map<String, Value>) -> Option<GeoPoint> {
    GeoPoint::from_json(first(fields, LAT_KEYS), first(fields, LON_KEYS))
}

fn battery_label(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> MessageRouter {
        MessageRouter::new(TopicConfig::default())
    }

    #[test]
    fn test_diagnostic_nested_gps() {
        let r = router();
        let payload = br#"{"client_id":"esp32-01","gps":{"lat":14.6,"lon":121.0},"battery_level":80}"#;
        let event = r.route(&r.topics.diagnostics, payload).unwrap().unwrap();

        match event {
            InboundEvent::Diagnostic(d) => {
                assert_eq!(d.source_id, "esp32-01");
                assert_eq!(d.point, GeoPoint::new(14.6, 121.0));
                assert_eq!(d.battery.as_deref(), Some("80"));
                assert_eq!(d.reason_hint, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_diagnostic_invalid_coordinates_are_absent() {
        let r = router();
        let payload = br#"{"gps":{"lat":"n/a","lon":121.0},"reason":"wire"}"#;
        let d = r.decode_diagnostic("http", payload).unwrap();

        assert_eq!(d.point, None);
        assert_eq!(d.source_id, UNKNOWN_SOURCE);
        assert_eq!(d.battery, None);
        assert_eq!(d.reason_hint, Some(AlertReason::Tamper));
    }

    #[test]
    fn test_diagnostic_top_level_coordinates() {
        let d = router()
            .decode_diagnostic("http", br#"{"lat":"14.6","lon":"121.0","battery":"55%"}"#)
            .unwrap();
        assert_eq!(d.point, GeoPoint::new(14.6, 121.0));
        assert_eq!(d.battery.as_deref(), Some("55%"));
    }

    #[test]
    fn test_diagnostic_source_aliases() {
        let r = router();

        // Both spellings present: first key wins instead of a duplicate-field error
        let d = r
            .decode_diagnostic("http", br#"{"client_id":"esp32-01","source_id":"esp32-02","lat":14.6,"latitude":99.0,"lon":121.0}"#)
            .unwrap();
        assert_eq!(d.source_id, "esp32-01");
        assert_eq!(d.point.map(|p| p.lat), Some(14.6));

        let d = r.decode_diagnostic("http", br#"{"client_id":1042}"#).unwrap();
        assert_eq!(d.source_id, "1042");

        let d = r.decode_diagnostic("http", br#"{"client_id":{"id":1},"sourceId":"unit-7"}"#).unwrap();
        assert_eq!(d.source_id, "unit-7");

        let d = r.decode_diagnostic("http", br#"{"client_id":[1]}"#).unwrap();
        assert_eq!(d.source_id, UNKNOWN_SOURCE);
    }

    #[test]
    fn test_command_numeric_source() {
        let r = router();
        let event = r
            .route(&r.topics.command_request, br#"{"state":"Lock","client_id":7,"source_id":"phone"}"#)
            .unwrap();
        assert_eq!(
            event,
            Some(InboundEvent::Command(CommandEvent {
                requested: RequestedState::Lock,
                source_id: "7".to_string(),
            }))
        );
    }

    #[test]
    fn test_malformed_payloads() {
        let r = router();
        let topic = r.topics.diagnostics.clone();

        let payloads: [&[u8]; 4] = [b"not json", b"[1,2]", b"42", &[0xff, 0xfe]];
        for payload in payloads {
            match r.route(&topic, payload) {
                Err(RouterError::MalformedPayload { .. }) => {}
                other => panic!("expected malformed for {:?}, got {:?}", payload, other),
            }
        }
    }

    #[test]
    fn test_command_case_insensitive() {
        let r = router();
        let topic = r.topics.command_request.clone();

        let event = r.route(&topic, br#"{"state":"Unlock"}"#).unwrap();
        assert_eq!(
            event,
            Some(InboundEvent::Command(CommandEvent {
                requested: RequestedState::Unlock,
                source_id: UNKNOWN_SOURCE.to_string(),
            }))
        );

        let event = r.route(&topic, br#"{"state":"LOCK","client_id":"phone"}"#).unwrap();
        assert_eq!(
            event,
            Some(InboundEvent::Command(CommandEvent {
                requested: RequestedState::Lock,
                source_id: "phone".to_string(),
            }))
        );
    }

    #[test]
    fn test_invalid_command() {
        let r = router();
        let topic = r.topics.command_request.clone();

        match r.route(&topic, br#"{"state":"explode","client_id":"phone"}"#) {
            Err(RouterError::InvalidCommand { requested, source_id }) => {
                assert_eq!(requested, "explode");
                assert_eq!(source_id, "phone");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            r.route(&topic, br#"{}"#),
            Err(RouterError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_echo_threshold() {
        let r = router();
        let topic = r.topics.test.clone();

        let on = r.route(&topic, br#"{"value":51}"#).unwrap();
        let off = r.route(&topic, br#"{"value":50}"#).unwrap();
        let missing = r.route(&topic, br#"{}"#).unwrap();

        assert!(matches!(on, Some(InboundEvent::Test(t)) if t.command() == "ON"));
        assert!(matches!(off, Some(InboundEvent::Test(t)) if t.command() == "OFF"));
        assert!(matches!(missing, Some(InboundEvent::Test(t)) if t.command() == "OFF"));

        assert!(r.route(&topic, br#"{"value":"high"}"#).is_err());
    }

    #[test]
    fn test_unrecognized_topic_ignored() {
        assert_eq!(router().route("somewhere/else", b"garbage").unwrap(), None);
    }
}

//! Tests for the protocol module
//!
//! These cover pattern splitting and display, pin matching, envelope
//! serialization and the error conversions that cross the wire.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::{json, Value};
    use std::collections::HashSet;

    // ============================================================================
    // Pattern and Message Tests
    // ============================================================================

    #[test]
    fn test_message_splits_scalars_from_args() {
        let message = Message::from_value(json!({
            "cmd": "test",
            "n": 1,
            "entity": {"name": "x"},
            "list": [1, 2],
        }))
        .unwrap();

        assert_eq!(message.pattern.to_string(), "cmd:test,n:1");
        assert_eq!(message.args.get("entity"), Some(&json!({"name": "x"})));
        assert_eq!(message.args.get("list"), Some(&json!([1, 2])));
    }

    #[test]
    fn test_message_directives() {
        let message = Message::parse("foo:1, id$:aaa/AAA, tx$:t1, timeout$:500").unwrap();
        assert_eq!(message.pattern.to_string(), "foo:1");
        assert_eq!(message.directives.id.as_deref(), Some("aaa/AAA"));
        assert_eq!(message.directives.tx.as_deref(), Some("t1"));
        assert_eq!(message.directives.timeout_ms, Some(500));
    }

    #[test]
    fn test_message_rejects_non_object() {
        assert!(matches!(
            Message::from_value(json!([1, 2])),
            Err(MeshError::Decode(_))
        ));
    }

    #[test]
    fn test_pattern_display_is_sorted() {
        let pattern = Pattern::parse("role:transport,cmd:ping").unwrap();
        assert_eq!(pattern.to_string(), "cmd:ping,role:transport");
    }

    #[test]
    fn test_pattern_rejects_nested_values() {
        assert!(Pattern::parse("a:{b:1}").is_err());
        assert!(Pattern::new().with("a", json!([1])).is_err());
    }

    #[test]
    fn test_pattern_subset() {
        let registered = Pattern::parse("c:1").unwrap();
        let call = Pattern::parse("c:1,d:A").unwrap();
        assert!(registered.is_subset_of(&call));
        assert!(!call.is_subset_of(&registered));

        // numbers and their text form compare equal
        let from_query = Pattern::new().with("c", "1").unwrap();
        assert!(registered.is_subset_of(&from_query));
    }

    // ============================================================================
    // Pin Filter Tests
    // ============================================================================

    #[test]
    fn test_pin_wildcard() {
        let pin = PinFilter::parse("foo:*").unwrap();
        assert!(pin.matches(&Pattern::parse("foo:1").unwrap()));
        assert!(pin.matches(&Pattern::parse("foo:bar,x:2").unwrap()));
        assert!(!pin.matches(&Pattern::parse("bar:1").unwrap()));
        assert_eq!(pin.specificity(), 1);
    }

    #[test]
    fn test_pin_literal() {
        let pin = PinFilter::parse("role:entity,cmd:save").unwrap();
        assert!(pin.matches(&Pattern::parse("role:entity,cmd:save,name:x").unwrap()));
        assert!(!pin.matches(&Pattern::parse("role:entity,cmd:load").unwrap()));
        assert_eq!(pin.specificity(), 2);
        assert_eq!(pin.to_string(), "cmd:save,role:entity");
    }

    #[test]
    fn test_pin_errors() {
        assert!(matches!(PinFilter::parse(""), Err(MeshError::Config(_))));
        assert!(matches!(PinFilter::parse("a:{b:1}"), Err(MeshError::Config(_))));
    }

    // ============================================================================
    // Envelope Tests
    // ============================================================================

    fn sample_call() -> Call {
        let message = Message::parse("c:1,d:A,e:{f:2}").unwrap();
        Call::new(message.pattern, message.args)
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::act(Meta::new("m1/a", "t1"), sample_call());
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["meta"]["id"], "m1/a");
        assert_eq!(value["meta"]["tx"], "t1");
        assert_eq!(value["act"]["pattern"], json!({"c": 1, "d": "A"}));
        assert_eq!(value["act"]["args"], json!({"e": {"f": 2}}));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_envelope_serialization_roundtrip() {
        let mut meta = Meta::new("m1/a", "t1");
        meta.origin = Some("node-a".into());
        meta.path = vec!["node-a".into(), "node-b".into()];
        meta.dest = Some("D0".into());

        for envelope in [
            Envelope::act(meta.clone(), sample_call()),
            Envelope::result(meta.reply(), json!({"s": "1-A"})),
            Envelope::result(meta.reply(), Value::Null),
            Envelope::error(meta.reply(), WireError::new("bad-wire").with_code("x")),
        ] {
            let text = serde_json::to_string(&envelope).unwrap();
            let decoded: Envelope = serde_json::from_str(&text).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_meta_reply_and_forward() {
        let mut meta = Meta::new("m1/a", "t1");
        meta.origin = Some("a".into());
        meta.path = vec!["a".into(), "b".into()];
        meta.dest = Some("D0".into());

        let reply = meta.reply();
        assert_eq!((reply.id.as_str(), reply.tx.as_str()), ("m1/a", "t1"));
        assert!(reply.path.is_empty());

        let forward = meta.forward("m2/b");
        assert_eq!(forward.id, "m2/b");
        assert_eq!(forward.tx, "t1");
        assert_eq!(forward.origin.as_deref(), Some("a"));
        assert_eq!(forward.path, meta.path);
        assert!(forward.dest.is_none());
    }

    // ============================================================================
    // Identity Tests
    // ============================================================================

    #[test]
    fn test_message_ids_unique_and_tagged() {
        let identity = NodeIdentity::new(Some("alpha".into()));
        let ids: HashSet<_> = (0..1000).map(|_| identity.message_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.ends_with("/alpha")));
    }

    #[test]
    fn test_identity_tag_defaults_to_id() {
        let identity = NodeIdentity::new(None);
        assert_eq!(identity.tag(), identity.id());
        assert_ne!(NodeIdentity::new(None).id(), identity.id());
    }

    // ============================================================================
    // Error Conversion Tests
    // ============================================================================

    #[test]
    fn test_remote_error_display() {
        let err = MeshError::from_wire(WireError::new("bad-wire"), "a:1", "t1");
        assert_eq!(err.to_string(), "action a:1 failed: bad-wire.");
        assert_eq!(err.tx(), Some("t1"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_not_found_crosses_the_wire() {
        let err = MeshError::NotFound {
            pattern: "x:1".into(),
            tx: "t1".into(),
        };
        let wire = err.to_wire();
        assert_eq!(wire.code.as_deref(), Some(error::CODE_NOT_FOUND));
        assert!(matches!(
            MeshError::from_wire(wire, "x:1", "t1"),
            MeshError::NotFound { .. }
        ));
    }

    #[test]
    fn test_remote_error_relays_without_rewrapping() {
        let err = MeshError::from_wire(WireError::new("bad-wire"), "a:1", "t1");
        assert_eq!(err.to_wire().message, "bad-wire");
    }

    #[test]
    fn test_timeout_is_flagged() {
        let err = MeshError::Timeout {
            pattern: "c:1".into(),
            tx: "t1".into(),
            timeout_ms: 100,
        };
        assert!(err.is_timeout());
        assert_eq!(err.pattern(), Some("c:1"));
    }

    #[test]
    fn test_action_error_from_mesh_error() {
        let err: ActionError = MeshError::Closed.into();
        assert_eq!(err.message, "closed");
        assert_eq!(err.code.as_deref(), Some(error::CODE_CLOSED));
    }
}

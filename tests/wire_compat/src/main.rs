fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use peerdrop_protocol::{ChunkRange, Progress, TransferMessage};
    use peerdrop_session::{SdpType, SessionDescription, Signal};

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Makes `65` and `65.0` compare equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) if n.is_f64() => serde_json::json!(f),
                _ => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON
    /// values (key order independent).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Transfer channel messages ---

    #[test]
    fn fixture_transfer_head() {
        match roundtrip_test::<TransferMessage>("transfer_head.json") {
            TransferMessage::Head(meta) => {
                assert_eq!(meta.file_name, "holiday.mp4");
                assert_eq!(meta.chunk_count(), 2800);
                assert_eq!(meta.mime_type.as_deref(), Some("video/mp4"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fixture_transfer_head_minimal() {
        match roundtrip_test::<TransferMessage>("transfer_head_minimal.json") {
            TransferMessage::Head(meta) => {
                assert_eq!(meta.chunk_count(), 0);
                assert!(meta.mime_type.is_none());
                assert!(meta.last_modified.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fixture_transfer_request_content() {
        match roundtrip_test::<TransferMessage>("transfer_request_content.json") {
            TransferMessage::RequestContent { ranges } => {
                assert_eq!(
                    ranges.ranges(),
                    &[
                        ChunkRange::Span(0, 2),
                        ChunkRange::Single(5),
                        ChunkRange::Span(7, 8)
                    ]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fixture_transfer_unit_messages() {
        assert_eq!(
            roundtrip_test::<TransferMessage>("transfer_request_head.json"),
            TransferMessage::RequestHead
        );
        assert_eq!(
            roundtrip_test::<TransferMessage>("transfer_complete.json"),
            TransferMessage::Complete
        );
        assert_eq!(
            roundtrip_test::<TransferMessage>("transfer_ready.json"),
            TransferMessage::Ready
        );
    }

    #[test]
    fn fixture_progress() {
        let progress = roundtrip_test::<Progress>("progress.json");
        assert_eq!(progress.transferred, 1024);
        assert!((progress.fraction() - 0.4096).abs() < 1e-9);
    }

    // --- Signaling ---

    #[test]
    fn fixture_signal_offer() {
        let signal = roundtrip_test::<Signal>("signal_offer.json");
        assert!(matches!(signal, Signal::Offer(ref sdp) if sdp.starts_with("v=0")));
    }

    #[test]
    fn fixture_signal_answer() {
        let signal = roundtrip_test::<Signal>("signal_answer.json");
        assert!(matches!(signal, Signal::Answer(_)));
    }

    #[test]
    fn fixture_signal_candidate() {
        match roundtrip_test::<Signal>("signal_candidate.json") {
            Signal::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fixture_session_description() {
        let desc = roundtrip_test::<SessionDescription>("session_description.json");
        assert_eq!(desc.kind, SdpType::Rollback);
    }
}

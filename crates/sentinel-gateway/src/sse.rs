//! Minimal parsing for the gateway's SSE-framed POST responses.
//!
//! The gateway answers every JSON-RPC request with a short server-sent-event
//! body: one or more `data: <json>` lines. These are single-shot responses,
//! not long-lived streams, so a line scan is all that is needed.

use serde_json::Value;

/// All parseable JSON payloads from `data:` lines, in order.
pub fn data_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| !data.is_empty())
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}

/// The first `data:` payload, if any.
pub fn first_payload(body: &str) -> Option<Value> {
    data_payloads(body).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_data_lines() {
        let body = "event: message\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n";
        let payloads = data_payloads(body);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["a"], 1);
        assert_eq!(payloads[1]["b"], 2);
    }

    #[test]
    fn test_skips_blank_and_malformed_data() {
        let body = "data: \ndata: not json\ndata: {\"ok\":true}\n";
        let payload = first_payload(body).unwrap();
        assert_eq!(payload["ok"], true);
    }

    #[test]
    fn test_empty_body_yields_nothing() {
        assert!(first_payload("").is_none());
        assert!(first_payload("event: message\n\n").is_none());
    }
}

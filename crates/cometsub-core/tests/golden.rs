//! Golden fixture tests for inbound envelope parsing.
//!
//! Each fixture in `fixtures/tendermint/` is a frame captured from a node's
//! `/websocket` endpoint.

use cometsub_core::InboundEnvelope;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn fixture_path(name: &str) -> std::path::PathBuf {
    let mut p = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    p.push("../../fixtures/tendermint");
    p.push(name);
    p
}

fn load_envelope(name: &str) -> InboundEnvelope {
    let content = std::fs::read_to_string(fixture_path(name)).expect("fixture not found");
    InboundEnvelope::parse(&content).expect("fixture is not a JSON object")
}

// ─── Responses ────────────────────────────────────────────────────────────────

#[test]
fn golden_subscribe_confirmation() {
    let env = load_envelope("subscribe-ok.json");
    assert_eq!(env.id(), Some(7));
    assert!(env.has_result());
    assert!(env.error().is_none());
    assert_eq!(env.query(), None, "a confirmation is not an event");
}

#[test]
fn golden_subscribe_error_prefers_data() {
    let env = load_envelope("subscribe-error.json");
    assert_eq!(env.id(), Some(7));
    assert!(!env.has_result());

    let err = env.error().expect("missing error object");
    assert_eq!(err.code, Some(-32603));
    assert_eq!(err.message, "Internal error");
    assert!(err.detail().starts_with("failed to parse query"), "detail: {}", err.detail());
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[test]
fn golden_new_block_event() {
    let env = load_envelope("new-block-event.json");
    assert_eq!(env.query(), Some("tm.event='NewBlock'"));
    assert_eq!(
        env.value()["result"]["data"]["type"],
        "tendermint/event/NewBlock"
    );
}

#[test]
fn golden_tx_event() {
    let env = load_envelope("tx-event.json");
    assert_eq!(env.query(), Some("tm.event='Tx'"));
    assert_eq!(env.value()["result"]["events"]["tx.height"][0], "19823452");
}

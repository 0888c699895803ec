//! Fuzz target for agent frame handling.
//!
//! Arbitrary bytes must never panic the classifier, the output sanitizer or
//! the command envelope decoder.

#![no_main]

use c3_hub::protocol::{sanitize, AgentMessage, CommandEnvelope};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(event) = AgentMessage::parse(text)
        .ok()
        .and_then(|message| message.into_event("fuzz"))
    {
        let _ = serde_json::to_string(&event);
    }

    let _ = sanitize(text);

    if let Ok(mut envelope) = serde_json::from_str::<CommandEnvelope>(text) {
        let _ = envelope.inject_session_id("fuzz");
        let _ = serde_json::to_string(&envelope);
    }
});

use std::path::PathBuf;

use anyhow::Result;

use super::*;

/// Replies with a fixed text, or fails with a fixed message.
struct ScriptedModel {
    reply: Result<String, String>,
}

impl ScriptedModel {
    fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
        }
    }
}

impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, _request: &ChatRequest) -> Result<String> {
        self.reply.clone().map_err(anyhow::Error::msg)
    }
}

fn context() -> Vec<RetrievalHit> {
    vec![
        RetrievalHit {
            path: "/home/u/Documents".to_string(),
            distance: 0.12,
        },
        RetrievalHit {
            path: "/home/u/Downloads".to_string(),
            distance: 0.5,
        },
    ]
}

const VALID: &str = r#"{
    "operations": [{"op": "create_file", "path": "/home/u/Documents/notes.txt", "content": ""}],
    "explanation": "Create notes.txt in Documents.",
    "capabilities": ["create"]
}"#;

#[test]
fn extracts_first_balanced_object() {
    let text = r#"Sure! Here it is: {"a": {"b": "}"}, "c": "\"{"} and {"second": 1}"#;
    assert_eq!(
        extract_json_object(text),
        Some(r#"{"a": {"b": "}"}, "c": "\"{"}"#)
    );
}

#[test]
fn extraction_handles_missing_or_unbalanced_objects() {
    assert_eq!(extract_json_object("no braces at all"), None);
    assert_eq!(extract_json_object(r#"{"open": "never closed""#), None);
    assert_eq!(
        extract_json_object(r#"{"open": {"inner": "closed"}"#),
        Some(r#"{"inner": "closed"}"#)
    );
    assert_eq!(extract_json_object("émoji ✓ {}"), Some("{}"));
}

#[test]
fn later_object_is_used_when_earlier_braces_are_prose() {
    let reply = format!("Use {{path}} placeholders as needed. {{draft}} Here you go: {VALID}");

    let candidates: Vec<&str> = json_object_candidates(&reply).collect();
    assert_eq!(candidates.first(), Some(&"{path}"));

    let descriptor = parse_descriptor(&reply).expect("the action object should be found");
    assert_eq!(descriptor.explanation, "Create notes.txt in Documents.");
}

#[test]
fn parses_valid_descriptor() {
    let descriptor = parse_descriptor(&format!("```json\n{VALID}\n```")).expect("should parse");

    assert_eq!(
        descriptor.operations,
        vec![Operation::CreateFile {
            path: PathBuf::from("/home/u/Documents/notes.txt"),
            content: String::new(),
            overwrite: false,
        }]
    );
    assert_eq!(descriptor.explanation, "Create notes.txt in Documents.");
    assert_eq!(descriptor.capabilities, BTreeSet::from([Capability::Create]));
}

#[test]
fn prose_without_object_is_invalid_and_keeps_raw_text() {
    let raw = "I'm sorry, I can't help with that.";
    match parse_descriptor(raw) {
        Err(SynthesisError::InvalidResponse { raw: kept, .. }) => assert_eq!(kept, raw),
        other => panic!("expected InvalidResponse, got {other:?}"),
    }
}

#[test]
fn structural_problems_are_invalid() {
    let cases = [
        r#"{"operations": [], "explanation": "x", "capabilities": []}"#,
        r#"{"operations": [{"op": "create_dir", "path": "/a"}], "explanation": "", "capabilities": ["create"]}"#,
        r#"{"operations": [{"op": "create_dir", "path": ""}], "explanation": "x", "capabilities": ["create"]}"#,
        r#"{"operations": [{"op": "chmod", "path": "/a"}], "explanation": "x", "capabilities": ["create"]}"#,
        r#"{"operations": [{"op": "create_dir", "path": "/a"}], "explanation": "x", "capabilities": ["execute"]}"#,
        r#"{"operations": [{"op": "create_dir", "path": "/a"}], "capabilities": ["create"]}"#,
        r#"{"operations": "create /a", "explanation": "x", "capabilities": ["create"]}"#,
    ];

    for case in cases {
        assert!(
            matches!(
                parse_descriptor(case),
                Err(SynthesisError::InvalidResponse { .. })
            ),
            "expected rejection of {case}"
        );
    }
}

#[test]
fn synthesize_sends_grounded_prompt() {
    let model = ScriptedModel::replying(VALID);
    let synthesizer = ActionSynthesizer::new(Box::new(model), 0.1, 1000);

    let descriptor = synthesizer
        .synthesize("create notes.txt in my documents", &context())
        .expect("synthesis should succeed");
    assert_eq!(descriptor.operations.len(), 1);

    let prompt = synthesizer.prompt("create notes.txt in my documents", &context());
    assert!(prompt.user.contains("1. /home/u/Documents (similarity 0.88)"));
    assert!(prompt.user.contains("2. /home/u/Downloads (similarity 0.50)"));
    assert!(prompt.user.ends_with("User request: create notes.txt in my documents"));
    assert!(prompt.system.contains("create_file"));
    assert_eq!(prompt.max_tokens, 1000);
}

#[test]
fn model_failure_is_a_service_failure() {
    let synthesizer =
        ActionSynthesizer::new(Box::new(ScriptedModel::failing("quota exceeded")), 0.1, 100);

    let error = synthesizer
        .synthesize("delete everything", &context())
        .expect_err("failure should propagate");
    assert!(matches!(error, SynthesisError::ServiceFailure(_)));
    assert!(format!("{error}").contains("quota exceeded"));
}

#[test]
fn garbage_reply_is_invalid_response() {
    let synthesizer =
        ActionSynthesizer::new(Box::new(ScriptedModel::replying("Done!")), 0.1, 100);

    assert!(matches!(
        synthesizer.synthesize("make a folder", &context()),
        Err(SynthesisError::InvalidResponse { .. })
    ));
}

//! Fuzz target for the patch engine.
//!
//! Arbitrary documents and directives must never panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use crucible::patch::{ConfigDocument, ConfigPatcher, Delimiter, NotFoundPolicy, PatchDirective};

#[derive(Debug, Arbitrary)]
struct FuzzDirective {
    token: String,
    value: String,
    delimiter: Option<String>,
    policy: u8,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    text: String,
    directives: Vec<FuzzDirective>,
}

fuzz_target!(|input: FuzzInput| {
    let doc = ConfigDocument::from_text("fuzz.conf", &input.text);
    let directives: Vec<PatchDirective> = input
        .directives
        .into_iter()
        .take(16)
        .map(|d| {
            let policy = match d.policy % 3 {
                0 => NotFoundPolicy::Ignore,
                1 => NotFoundPolicy::Append,
                _ => NotFoundPolicy::Fail,
            };
            PatchDirective::new(d.token, d.value)
                .delimiter(Delimiter::parse(d.delimiter.as_deref()))
                .not_found(policy)
        })
        .collect();

    let patcher = ConfigPatcher::new();
    if let Ok((patched, _)) = patcher.apply(&doc, &directives) {
        let _ = patcher.apply(&patched, &directives);
        let _ = doc.unified_diff(&patched);
    }
});

//! Fuzz target for INI parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;

use crucible::ini::IniFile;
use crucible::patch::{Delimiter, NotFoundPolicy};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(ini) = IniFile::parse(text) {
        for section in ini.sections() {
            let _ = section.remote_path();
            let _ = section.directives(&Delimiter::Discovered, NotFoundPolicy::Ignore);
        }
    }
});

//! Languages the assistant is offered in.
//!
//! The wire protocol carries ISO 639-1 codes (`"en"`, `"hi"`, ...). The prompt
//! sent upstream wants a display name, and speech synthesizers want a BCP-47
//! tag, so both are looked up here.

pub const DEFAULT_LANGUAGE: &str = "en";

/// Speech tag used when a code is not in [`SUPPORTED_LANGUAGES`].
pub const FALLBACK_SPEECH_TAG: &str = "en-US";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub code: &'static str,
    pub name: &'static str,
    pub speech_tag: &'static str,
}

pub const SUPPORTED_LANGUAGES: [Language; 10] = [
    Language { code: "en", name: "English", speech_tag: "en-US" },
    Language { code: "hi", name: "Hindi", speech_tag: "hi-IN" },
    Language { code: "mr", name: "Marathi", speech_tag: "mr-IN" },
    Language { code: "gu", name: "Gujarati", speech_tag: "gu-IN" },
    Language { code: "bn", name: "Bengali", speech_tag: "bn-IN" },
    Language { code: "ta", name: "Tamil", speech_tag: "ta-IN" },
    Language { code: "te", name: "Telugu", speech_tag: "te-IN" },
    Language { code: "kn", name: "Kannada", speech_tag: "kn-IN" },
    Language { code: "ml", name: "Malayalam", speech_tag: "ml-IN" },
    Language { code: "pa", name: "Punjabi", speech_tag: "pa-IN" },
];

pub fn lookup(code: &str) -> Option<&'static Language> {
    let code = code.trim();
    SUPPORTED_LANGUAGES
        .iter()
        .find(|language| language.code.eq_ignore_ascii_case(code))
}

/// Human-readable name, or the code itself when unknown.
pub fn display_name(code: &str) -> &str {
    match lookup(code) {
        Some(language) => language.name,
        None => code,
    }
}

pub fn speech_tag(code: &str) -> &'static str {
    lookup(code)
        .map(|language| language.speech_tag)
        .unwrap_or(FALLBACK_SPEECH_TAG)
}

/// Primary subtag of a BCP-47 tag: `"ta-IN"` → `"ta"`.
pub fn primary_subtag(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

//! BCP-47 language tag normalization.
//!
//! The model catalog keys pairs by bare codes (`en`, `de`, …) with Chinese
//! split into `zh-Hans`/`zh-Hant`, while clients send whatever their platform
//! produces (`en-US`, `zh_CN`, `pt-BR`, `jp`, …). All codes are normalized
//! once at the API boundary before they reach the dispatcher.

/// Normalize a language tag to the catalog's internal representation.
///
/// Matching is case-insensitive and treats `_` as `-`. `auto` passes through
/// unchanged. Unknown tags are lowercased and returned as-is so the catalog
/// lookup can reject them with a precise error.
pub fn normalize_language_code(code: &str) -> String {
    if code == "auto" {
        return code.to_string();
    }

    let lower = code.replace('_', "-").to_ascii_lowercase();
    match lower.as_str() {
        // Chinese: simplified vs. traditional is the only regional split the
        // models distinguish.
        "zh" | "zh-cn" | "zh-sg" | "zh-hans" | "cmn" | "chinese" => "zh-Hans".to_string(),
        "zh-tw" | "zh-hk" | "zh-mo" | "zh-hant" | "cht" => "zh-Hant".to_string(),

        // Common mislabels and the Bokmål tag the models file under `no`.
        "jp" => "ja".to_string(),
        "kr" => "ko".to_string(),
        "nb" => "no".to_string(),

        _ => match lower.split_once('-') {
            // Regional variants collapse to the base code.
            Some((base, _)) if base.len() == 2 => base.to_string(),
            _ => lower,
        },
    }
}

//! Language detection and mixed-script segmentation.
//!
//! The detector is restricted to the languages the model catalog can actually
//! serve, so a detection result is (almost) always translatable. Inputs that
//! mix a CJK script with Latin are split into per-language segments; anything
//! else is treated as a single span of the dominant language.

use std::collections::{BTreeSet, HashMap, HashSet};

use lingua::{Language, LanguageDetectorBuilder};
use tracing::{debug, warn};

/// Default confidence floor for segment labelling.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// At most this many distinct languages are kept in one text; minor languages
/// are folded into the largest one.
const MAX_LANGUAGES_IN_ONE_TEXT: usize = 2;

/// A contiguous byte range of the input attributed to one language.
///
/// `start`/`end` are byte offsets into the original UTF-8 text. A segment
/// sequence always tiles the input exactly: the first segment starts at 0,
/// each segment starts where the previous one ended, and the last ends at
/// `text.len()`.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSegment {
    pub text: String,
    pub language: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

/// Language detector with catalog-restricted candidates.
pub struct LanguageDetector {
    detector: lingua::LanguageDetector,
    supported: BTreeSet<String>,
}

impl LanguageDetector {
    /// Build the detector from the catalog's supported language codes. With
    /// fewer than two usable candidates the detector falls back to the full
    /// language set in low-accuracy mode.
    pub fn new(supported: &BTreeSet<String>) -> Self {
        let mut candidates: HashSet<Language> = HashSet::new();
        for code in supported {
            if let Some(lang) = bcp47_to_lingua(code) {
                candidates.insert(lang);
            }
        }

        let detector = if candidates.len() < 2 {
            warn!(
                candidates = candidates.len(),
                "not enough supported languages, detecting over all languages"
            );
            LanguageDetectorBuilder::from_all_languages()
                .with_low_accuracy_mode()
                .with_preloaded_language_models()
                .build()
        } else {
            let langs: Vec<Language> = candidates.into_iter().collect();
            LanguageDetectorBuilder::from_languages(&langs)
                .with_low_accuracy_mode()
                .with_preloaded_language_models()
                .build()
        };

        debug!(languages = supported.len(), "language detector initialized");

        Self {
            detector,
            supported: supported.clone(),
        }
    }

    fn is_supported(&self, code: &str) -> bool {
        self.supported.is_empty() || self.supported.contains(code)
    }

    /// Single-label detection. Empty result for empty input or when no
    /// candidate is returned.
    pub fn detect(&self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        self.detector
            .detect_language_of(text)
            .map(lingua_to_bcp47)
    }

    /// Top candidate with its confidence, or `(None, confidence)` when the
    /// confidence is below the floor.
    pub fn detect_with_confidence(
        &self,
        text: &str,
        min_confidence: f64,
    ) -> (Option<String>, f64) {
        if text.is_empty() {
            return (None, 0.0);
        }

        let values = self.detector.compute_language_confidence_values(text);
        let Some((language, confidence)) = values.first().cloned() else {
            return (None, 0.0);
        };

        if confidence < min_confidence {
            return (None, confidence);
        }

        (Some(lingua_to_bcp47(language)), confidence)
    }

    /// Split the input into per-language segments.
    pub fn detect_segments(&self, text: &str) -> Vec<TextSegment> {
        self.detect_segments_with_threshold(text, DEFAULT_CONFIDENCE_THRESHOLD)
    }

    pub fn detect_segments_with_threshold(
        &self,
        text: &str,
        threshold: f64,
    ) -> Vec<TextSegment> {
        if text.is_empty() {
            return Vec::new();
        }

        let fallback = self
            .detect(text)
            .filter(|lang| self.is_supported(lang))
            .unwrap_or_else(|| "en".to_string());

        if !has_mixed_scripts(text) {
            debug!(language = %fallback, "no mixed scripts, using single segment");
            return vec![TextSegment {
                text: text.to_string(),
                language: fallback,
                start: 0,
                end: text.len(),
                confidence: 1.0,
            }];
        }

        debug!(fallback = %fallback, threshold = threshold, "mixed scripts detected");

        let results = self.detector.detect_multiple_languages_of(text);
        if results.is_empty() {
            debug!("no segments detected");
            return Vec::new();
        }

        let mut segments: Vec<TextSegment> = results
            .iter()
            .map(|r| {
                let detected = lingua_to_bcp47(r.language());
                let language = if self.is_supported(&detected) {
                    detected
                } else {
                    fallback.clone()
                };
                TextSegment {
                    text: text[r.start_index()..r.end_index()].to_string(),
                    language,
                    start: r.start_index(),
                    end: r.end_index(),
                    confidence: 1.0,
                }
            })
            .collect();

        snap_to_tiling(&mut segments, text);
        let segments = merge_adjacent_segments(segments, text);
        limit_languages(segments, text, MAX_LANGUAGES_IN_ONE_TEXT)
    }
}

/// Mixed scripts means at least one CJK character (Han, Hiragana, Katakana,
/// or Hangul) *and* at least one Latin letter.
pub fn has_mixed_scripts(text: &str) -> bool {
    let mut has_cjk = false;
    let mut has_latin = false;

    for c in text.chars() {
        if is_cjk_char(c) {
            has_cjk = true;
        } else if c.is_ascii_alphabetic() {
            has_latin = true;
        }
        if has_cjk && has_latin {
            return true;
        }
    }

    false
}

fn is_cjk_char(c: char) -> bool {
    matches!(
        c,
        '\u{4E00}'..='\u{9FFF}'    // Han
        | '\u{3040}'..='\u{309F}'  // Hiragana
        | '\u{30A0}'..='\u{30FF}'  // Katakana
        | '\u{AC00}'..='\u{D7AF}'  // Hangul
    )
}

/// Extend segments so they cover the input without gaps: the first segment
/// absorbs any leading bytes, every gap joins the preceding segment, and the
/// last segment runs to the end of the text.
fn snap_to_tiling(segments: &mut [TextSegment], text: &str) {
    let Some(first) = segments.first_mut() else {
        return;
    };
    first.start = 0;

    let count = segments.len();
    for i in 0..count {
        let next_start = if i + 1 < count {
            segments[i + 1].start
        } else {
            text.len()
        };
        segments[i].end = next_start;
        segments[i].text = text[segments[i].start..segments[i].end].to_string();
    }
}

/// Merge neighbors that share a language, extending the earlier segment's
/// byte range over the later one. Confidence keeps the maximum.
fn merge_adjacent_segments(segments: Vec<TextSegment>, text: &str) -> Vec<TextSegment> {
    if segments.len() <= 1 {
        return segments;
    }

    let mut merged: Vec<TextSegment> = Vec::with_capacity(segments.len());
    let mut iter = segments.into_iter();
    let mut current = match iter.next() {
        Some(seg) => seg,
        None => return Vec::new(),
    };

    for next in iter {
        if current.language == next.language {
            current.end = next.end;
            current.text = text[current.start..current.end].to_string();
            if next.confidence > current.confidence {
                current.confidence = next.confidence;
            }
        } else {
            merged.push(current);
            current = next;
        }
    }
    merged.push(current);

    merged
}

/// Cap the number of distinct languages. Languages are ranked by total byte
/// mass; segments of losing languages are reassigned to the primary
/// (largest) language and re-merged.
fn limit_languages(
    mut segments: Vec<TextSegment>,
    text: &str,
    max_langs: usize,
) -> Vec<TextSegment> {
    if segments.len() <= 1 {
        return segments;
    }

    let mut lang_bytes: HashMap<String, usize> = HashMap::new();
    for seg in &segments {
        *lang_bytes.entry(seg.language.clone()).or_insert(0) += seg.end - seg.start;
    }

    if lang_bytes.len() <= max_langs {
        return segments;
    }

    let mut ranked: Vec<(String, usize)> = lang_bytes.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let keep: HashSet<&str> = ranked
        .iter()
        .take(max_langs)
        .map(|(lang, _)| lang.as_str())
        .collect();
    let primary = ranked[0].0.clone();

    for seg in &mut segments {
        if !keep.contains(seg.language.as_str()) {
            seg.language = primary.clone();
        }
    }

    let result = merge_adjacent_segments(segments, text);
    debug!(
        languages = max_langs,
        segments = result.len(),
        "reduced language count"
    );
    result
}

fn bcp47_to_lingua(code: &str) -> Option<Language> {
    match code {
        "zh-Hans" | "zh-Hant" | "zh" => Some(Language::Chinese),
        _ => iso_lookup(code),
    }
}

fn iso_lookup(code: &str) -> Option<Language> {
    let lower = code.to_ascii_lowercase();
    Language::all()
        .into_iter()
        .find(|lang| lang.iso_code_639_1().to_string().to_lowercase() == lower)
}

fn lingua_to_bcp47(lang: Language) -> String {
    match lang {
        Language::Chinese => "zh-Hans".to_string(),
        _ => lang.iso_code_639_1().to_string().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(language: &str, start: usize, end: usize) -> TextSegment {
        TextSegment {
            text: String::new(),
            language: language.to_string(),
            start,
            end,
            confidence: 1.0,
        }
    }

    fn assert_tiles(segments: &[TextSegment], text: &str) {
        assert!(!segments.is_empty());
        assert_eq!(segments[0].start, 0);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(segments.last().unwrap().end, text.len());
    }

    #[test]
    fn mixed_script_detection() {
        assert!(has_mixed_scripts("Hello 世界"));
        assert!(has_mixed_scripts("こんにちは world"));
        assert!(has_mixed_scripts("안녕 hi"));
        assert!(!has_mixed_scripts("Hello world"));
        assert!(!has_mixed_scripts("你好世界"));
        assert!(!has_mixed_scripts("123 456"));
    }

    #[test]
    fn merge_joins_same_language_neighbors() {
        let text = "aaa bbb ccc";
        let segments = vec![seg("en", 0, 4), seg("en", 4, 8), seg("de", 8, 11)];
        let merged = merge_adjacent_segments(segments, text);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].language, "en");
        assert_eq!(merged[0].start, 0);
        assert_eq!(merged[0].end, 8);
        assert_eq!(merged[0].text, "aaa bbb ");
        assert_eq!(merged[1].language, "de");
    }

    #[test]
    fn merge_keeps_max_confidence() {
        let text = "aaaabbbb";
        let mut a = seg("en", 0, 4);
        a.confidence = 0.4;
        let mut b = seg("en", 4, 8);
        b.confidence = 0.9;
        let merged = merge_adjacent_segments(vec![a, b], text);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].confidence, 0.9);
    }

    #[test]
    fn limit_caps_to_two_languages() {
        let text = "aaaaaaaabbbbccde";
        let segments = vec![
            seg("en", 0, 8),  // 8 bytes, primary
            seg("de", 8, 12), // 4 bytes, keep
            seg("fr", 12, 14), // folded into primary
            seg("it", 14, 16), // folded into primary
        ];
        let limited = limit_languages(segments, text, 2);
        let langs: HashSet<&str> = limited.iter().map(|s| s.language.as_str()).collect();
        assert!(langs.len() <= 2);
        assert!(langs.contains("en"));
        assert!(langs.contains("de"));
        assert_tiles(&limited, text);
        // The trailing fr/it spans collapsed into one English segment.
        assert_eq!(limited.last().unwrap().language, "en");
        assert_eq!(limited.last().unwrap().start, 12);
    }

    #[test]
    fn snap_extends_over_gaps() {
        let text = "Hello 世界!";
        let mut segments = vec![seg("en", 0, 5), seg("zh-Hans", 6, 12)];
        snap_to_tiling(&mut segments, text);
        assert_tiles(&segments, text);
        assert_eq!(segments[0].text, "Hello ");
        assert_eq!(segments[1].text, "世界!");
    }

    #[test]
    fn code_mapping_round_trip() {
        assert_eq!(lingua_to_bcp47(Language::Chinese), "zh-Hans");
        assert_eq!(lingua_to_bcp47(Language::English), "en");
        assert_eq!(bcp47_to_lingua("zh-Hans"), Some(Language::Chinese));
        assert_eq!(bcp47_to_lingua("en"), Some(Language::English));
        assert_eq!(bcp47_to_lingua("de"), Some(Language::German));
        assert_eq!(bcp47_to_lingua("xx"), None);
    }

    fn test_detector() -> LanguageDetector {
        let supported = BTreeSet::from([
            "en".to_string(),
            "de".to_string(),
            "zh-Hans".to_string(),
        ]);
        LanguageDetector::new(&supported)
    }

    #[test]
    fn detect_plain_english() {
        let detector = test_detector();
        let detected = detector.detect("the quick brown fox jumps over the lazy dog");
        assert_eq!(detected.as_deref(), Some("en"));
    }

    #[test]
    fn detect_empty_is_none() {
        let detector = test_detector();
        assert_eq!(detector.detect(""), None);
        assert!(detector.detect_segments("").is_empty());
    }

    #[test]
    fn detect_chinese_maps_to_zh_hans() {
        let detector = test_detector();
        let detected = detector.detect("今天天气很好我们去公园散步");
        assert_eq!(detected.as_deref(), Some("zh-Hans"));
    }

    #[test]
    fn confidence_below_floor_returns_empty_label() {
        let detector = test_detector();
        let (label, confidence) = detector.detect_with_confidence("hello there", 1.01);
        assert_eq!(label, None);
        assert!(confidence <= 1.0);
    }

    #[test]
    fn single_script_text_yields_one_segment() {
        let detector = test_detector();
        let text = "this is a perfectly ordinary english sentence";
        let segments = detector.detect_segments(text);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].language, "en");
        assert_tiles(&segments, text);
    }

    #[test]
    fn mixed_text_segments_tile_and_cap_languages() {
        let detector = test_detector();
        let text = "Hello my friend how are you today 今天天气很好我们去公园散步吧";
        let segments = detector.detect_segments(text);
        assert!(!segments.is_empty());
        assert_tiles(&segments, text);

        let langs: HashSet<&str> = segments.iter().map(|s| s.language.as_str()).collect();
        assert!(langs.len() <= 2, "too many languages: {langs:?}");

        for pair in segments.windows(2) {
            assert_ne!(pair[0].language, pair[1].language, "adjacent same-language segments");
        }
    }
}

//! Top-level translation dispatch.
//!
//! The dispatcher turns one public translate call into worker requests:
//! identity short-circuits, per-segment routing for mixed-script inputs,
//! pivoting through English for pairs with no direct model, and retry with
//! capped exponential backoff when a worker is lost mid-request.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::catalog::ModelCatalog;
use crate::detect::LanguageDetector;
use crate::error::TranslateError;
use crate::lang::normalize_language_code;
use crate::pool::EnginePool;
use crate::worker::TransRequest;

/// Inputs at or under this byte length skip detection when the source
/// language is explicit.
const SHORT_TEXT_LIMIT: usize = 128;

const MIN_RETRIES: usize = 3;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP: Duration = Duration::from_secs(3);

/// Public entry point consumed by the HTTP layer and the CLI.
pub struct Dispatcher {
    pool: Arc<EnginePool>,
    detector: Arc<LanguageDetector>,
    catalog: Arc<dyn ModelCatalog>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<EnginePool>,
        detector: Arc<LanguageDetector>,
        catalog: Arc<dyn ModelCatalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            detector,
            catalog,
        })
    }

    /// Translate `text` from `from` (or `"auto"`) into `to`.
    pub async fn translate(
        &self,
        token: &CancellationToken,
        from: &str,
        to: &str,
        text: &str,
        html: bool,
    ) -> Result<String, TranslateError> {
        let from = normalize_language_code(from);
        let to = normalize_language_code(to);

        if to.is_empty() || to == "auto" {
            return Err(TranslateError::InvalidRequest(
                "target language is required".to_string(),
            ));
        }
        if text.is_empty() {
            return Ok(String::new());
        }

        debug!(from = %from, to = %to, text_len = text.len(), html, "translate");

        if from != "auto" && text.len() <= SHORT_TEXT_LIMIT {
            if from == to {
                return Ok(text.to_string());
            }
            return self.translate_segment(token, &from, &to, text, html).await;
        }

        let segments = self.detector.detect_segments(text);

        if segments.len() <= 1 {
            let effective = if let Some(seg) = segments.first() {
                seg.language.clone()
            } else if from == "auto" {
                self.detector
                    .detect(text)
                    .ok_or(TranslateError::DetectionFailed)?
            } else {
                from.clone()
            };

            if effective == to {
                return Ok(text.to_string());
            }
            return self
                .translate_segment(token, &effective, &to, text, html)
                .await;
        }

        debug!(segments = segments.len(), "multi-language input");

        let mut result = String::with_capacity(text.len());
        let mut last_end = 0;

        for seg in &segments {
            if seg.start > last_end {
                result.push_str(&text[last_end..seg.start]);
            }

            if seg.language == to {
                result.push_str(&seg.text);
            } else {
                match self
                    .translate_segment(token, &seg.language, &to, &seg.text, html)
                    .await
                {
                    Ok(translated) => result.push_str(&translated),
                    Err(TranslateError::Cancelled) => return Err(TranslateError::Cancelled),
                    Err(e) => {
                        // Partial passthrough beats failing the whole call.
                        error!(language = %seg.language, error = %e, "failed to translate segment");
                        result.push_str(&seg.text);
                    }
                }
            }
            last_end = seg.end;
        }

        if last_end < text.len() {
            result.push_str(&text[last_end..]);
        }

        Ok(result)
    }

    /// Detect the language of a text (single label).
    pub fn detect(&self, text: &str) -> Option<String> {
        self.detector.detect(text)
    }

    /// Languages the catalog can serve.
    pub fn supported_languages(&self) -> BTreeSet<String> {
        self.catalog.supported_languages()
    }

    /// Orderly shutdown of every worker pool.
    pub async fn cleanup_all(&self) {
        self.pool.cleanup_all().await;
    }

    /// A pair translates directly iff either side is English or the catalog
    /// has a direct model; everything else pivots through English.
    fn needs_pivot(&self, from: &str, to: &str) -> bool {
        if from == "en" || to == "en" {
            return false;
        }
        !self.catalog.has_language_pair(from, to)
    }

    async fn translate_segment(
        &self,
        token: &CancellationToken,
        from: &str,
        to: &str,
        text: &str,
        html: bool,
    ) -> Result<String, TranslateError> {
        if from == to {
            return Ok(text.to_string());
        }

        if !self.needs_pivot(from, to) {
            return self
                .translate_single(token, from, to, text, html, true)
                .await;
        }

        debug!(from = %from, to = %to, "pivoting through English");
        let intermediate = self
            .translate_single(token, from, "en", text, html, true)
            .await?;
        self.translate_single(token, "en", to, &intermediate, html, true)
            .await
    }

    /// One direct (non-pivoted) translation with retries.
    ///
    /// Transient failures rotate to the next manager with exponential
    /// backoff; after the retry budget a last-resort segmented translation
    /// is attempted when the input spans more than one language.
    async fn translate_single(
        &self,
        token: &CancellationToken,
        from: &str,
        to: &str,
        text: &str,
        html: bool,
        allow_segmented_fallback: bool,
    ) -> Result<String, TranslateError> {
        let mut manager = self.pool.get_or_create(from, to).await?;

        let entry = self.pool.entry(from, to);
        let workers = entry.as_ref().map(|e| e.managers().len()).unwrap_or(1);
        let max_retries = (workers * 2).max(MIN_RETRIES);

        let mut last_err = None;

        for attempt in 0..max_retries {
            if attempt > 0
                && let Some(entry) = &entry
            {
                manager = entry.next_manager();
            }

            let req = TransRequest {
                text: text.to_string(),
                html,
            };

            match manager.translate(token, req).await {
                Ok(result) => return Ok(result),
                Err(TranslateError::Cancelled) => return Err(TranslateError::Cancelled),
                Err(e) if e.is_retryable() => {
                    debug!(
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "translation attempt failed, retrying on next manager"
                    );
                    last_err = Some(e);

                    let backoff = Duration::from_millis(
                        BACKOFF_BASE_MS << attempt.min(6) as u64,
                    )
                    .min(BACKOFF_CAP);

                    tokio::select! {
                        _ = token.cancelled() => return Err(TranslateError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let last_err =
            last_err.unwrap_or_else(|| TranslateError::WorkerFatal("translation failed".into()));

        if !allow_segmented_fallback {
            return Err(last_err);
        }

        warn!(
            from = %from,
            to = %to,
            error = %last_err,
            "all translation attempts failed, trying segmented translation"
        );

        match self.translate_with_segments(token, to, text, html).await? {
            Some(result) => Ok(result),
            None => Err(last_err),
        }
    }

    /// Last-resort fallback: split the input by detected language and
    /// translate each span on its own. Only applicable when the detector
    /// actually finds more than one span. `Err` is reserved for
    /// cancellation; any other failure reports "not applicable".
    async fn translate_with_segments(
        &self,
        token: &CancellationToken,
        to: &str,
        text: &str,
        html: bool,
    ) -> Result<Option<String>, TranslateError> {
        let segments = self.detector.detect_segments(text);
        if segments.len() <= 1 {
            return Ok(None);
        }

        debug!(segments = segments.len(), "attempting segmented translation");

        let mut result = String::with_capacity(text.len());
        let mut last_end = 0;

        for seg in &segments {
            if seg.start > last_end {
                result.push_str(&text[last_end..seg.start]);
            }

            if seg.language == to {
                result.push_str(&seg.text);
            } else {
                // Boxed to break the async recursion through the retry path;
                // the inner call never falls back to segments again.
                let fut = self.translate_segment_no_fallback(token, &seg.language, to, &seg.text, html);

                match fut.await {
                    Ok(translated) => result.push_str(&translated),
                    Err(TranslateError::Cancelled) => return Err(TranslateError::Cancelled),
                    Err(e) => {
                        debug!(error = %e, "segmented translation failed");
                        return Ok(None);
                    }
                }
            }
            last_end = seg.end;
        }

        if last_end < text.len() {
            result.push_str(&text[last_end..]);
        }

        Ok(Some(result))
    }

    fn translate_segment_no_fallback<'a>(
        &'a self,
        token: &'a CancellationToken,
        from: &'a str,
        to: &'a str,
        text: &'a str,
        html: bool,
    ) -> BoxFuture<'a, Result<String, TranslateError>> {
        async move {
            if from == to {
                return Ok(text.to_string());
            }

            if !self.needs_pivot(from, to) {
                return self
                    .translate_single(token, from, to, text, html, false)
                    .await;
            }

            let intermediate = self
                .translate_single(token, from, "en", text, html, false)
                .await?;
            self.translate_single(token, "en", to, &intermediate, html, false)
                .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::config::Settings;

    fn test_dispatcher(pairs: &[(&str, &str)]) -> Arc<Dispatcher> {
        let dir = std::env::temp_dir().join("transgate-dispatch-tests");
        let catalog: Arc<dyn ModelCatalog> = Arc::new(StaticCatalog::new(pairs, dir));
        let mut settings = Settings::default();
        settings.worker_binary = "/nonexistent/worker".into();
        let detector = Arc::new(LanguageDetector::new(&catalog.supported_languages()));
        let pool = EnginePool::with_memory_probe(
            Arc::new(settings),
            Arc::clone(&catalog),
            Arc::new(|| 100_000),
        );
        Dispatcher::new(pool, detector, catalog)
    }

    #[tokio::test]
    async fn identity_short_circuit() {
        let dispatcher = test_dispatcher(&[("en", "de")]);
        let token = CancellationToken::new();
        let result = dispatcher
            .translate(&token, "en", "en", "hello", false)
            .await
            .expect("identity translate");
        assert_eq!(result, "hello");
    }

    #[tokio::test]
    async fn identity_applies_normalization() {
        let dispatcher = test_dispatcher(&[("en", "de")]);
        let token = CancellationToken::new();
        let result = dispatcher
            .translate(&token, "en-US", "en", "short text", false)
            .await
            .expect("normalized identity translate");
        assert_eq!(result, "short text");
    }

    #[tokio::test]
    async fn empty_text_is_returned_unchanged() {
        let dispatcher = test_dispatcher(&[("en", "de")]);
        let token = CancellationToken::new();
        let result = dispatcher
            .translate(&token, "en", "de", "", false)
            .await
            .expect("empty translate");
        assert_eq!(result, "");
    }

    #[tokio::test]
    async fn missing_target_is_invalid() {
        let dispatcher = test_dispatcher(&[("en", "de")]);
        let token = CancellationToken::new();
        match dispatcher.translate(&token, "en", "auto", "hi", false).await {
            Err(TranslateError::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pivot_surfaces_missing_model_for_first_leg() {
        // No de->en model exists, so the pivot fails before any worker is
        // spawned.
        let dispatcher = test_dispatcher(&[("en", "fr")]);
        let token = CancellationToken::new();
        match dispatcher.translate(&token, "de", "fr", "hallo", false).await {
            Err(TranslateError::ModelMissing { from, to }) => {
                assert_eq!(from, "de");
                assert_eq!(to, "en");
            }
            other => panic!("expected ModelMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn supported_languages_delegate_to_catalog() {
        let dispatcher = test_dispatcher(&[("en", "de"), ("de", "en")]);
        let langs = dispatcher.supported_languages();
        assert!(langs.contains("en"));
        assert!(langs.contains("de"));
        assert_eq!(langs.len(), 2);
    }
}

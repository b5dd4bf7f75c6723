//! Model catalog: which language pairs exist and where their files live.
//!
//! The catalog is the gateway's only knowledge of models. Downloading and
//! decompressing model archives is handled outside this process; the catalog
//! merely reads the records index and verifies the files a worker needs are
//! present on disk.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::TranslateError;

/// The catalog interface the pool and dispatcher depend on.
pub trait ModelCatalog: Send + Sync {
    /// Whether a direct model exists for `from -> to`.
    fn has_language_pair(&self, from: &str, to: &str) -> bool;

    /// All language codes appearing in the catalog (sources and targets).
    fn supported_languages(&self) -> BTreeSet<String>;

    /// Resolve the model directory for a pair, verifying the worker's
    /// required files exist. Returns the per-pair directory.
    fn ensure_model(&self, from: &str, to: &str) -> Result<PathBuf, TranslateError>;
}

/// Mozilla-format records index (`records.json`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordsData {
    #[serde(default)]
    pub data: Vec<RecordItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordItem {
    pub name: String,
    pub version: String,
    pub file_type: String,
    pub source_language: String,
    pub target_language: String,
    pub attachment: Attachment,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub filename: String,
    pub hash: String,
    pub size: i64,
    pub location: String,
}

impl RecordsData {
    pub fn has_language_pair(&self, from: &str, to: &str) -> bool {
        self.data
            .iter()
            .any(|r| r.source_language == from && r.target_language == to)
    }

    pub fn supported_languages(&self) -> BTreeSet<String> {
        let mut langs = BTreeSet::new();
        for record in &self.data {
            langs.insert(record.source_language.clone());
            langs.insert(record.target_language.clone());
        }
        langs
    }
}

/// Catalog backed by a `records.json` file plus on-disk model directories
/// laid out as `<model_dir>/<from>_<to>/`.
pub struct RecordsCatalog {
    records: RecordsData,
    model_dir: PathBuf,
}

impl RecordsCatalog {
    /// Load the records index from `<config_dir>/records.json`.
    pub fn load(config_dir: &Path, model_dir: &Path) -> Result<Self, TranslateError> {
        let records_path = config_dir.join("records.json");
        let raw = std::fs::read_to_string(&records_path).map_err(|e| {
            TranslateError::InvalidRequest(format!(
                "cannot read model records at {}: {e}",
                records_path.display()
            ))
        })?;
        let records: RecordsData = serde_json::from_str(&raw).map_err(|e| {
            TranslateError::InvalidRequest(format!(
                "cannot parse model records at {}: {e}",
                records_path.display()
            ))
        })?;

        debug!(records = records.data.len(), "loaded model records");
        Ok(Self::new(records, model_dir.to_path_buf()))
    }

    pub fn new(records: RecordsData, model_dir: PathBuf) -> Self {
        Self { records, model_dir }
    }

    /// The decompressed on-disk names of the pair's files, keyed by file
    /// type. Attachment filenames end in `.zst`; the decompressed files the
    /// worker loads drop that suffix.
    fn present_files(&self, from: &str, to: &str) -> HashMap<String, PathBuf> {
        let pair_dir = self.pair_dir(from, to);
        let mut found = HashMap::new();

        for record in &self.records.data {
            if record.source_language != from || record.target_language != to {
                continue;
            }
            let filename = record
                .attachment
                .filename
                .trim_end_matches(".zst")
                .to_string();
            let path = pair_dir.join(&filename);
            if path.is_file() {
                found.insert(record.file_type.clone(), path);
            }
        }

        found
    }

    fn pair_dir(&self, from: &str, to: &str) -> PathBuf {
        self.model_dir.join(format!("{from}_{to}"))
    }
}

impl ModelCatalog for RecordsCatalog {
    fn has_language_pair(&self, from: &str, to: &str) -> bool {
        self.records.has_language_pair(from, to)
    }

    fn supported_languages(&self) -> BTreeSet<String> {
        self.records.supported_languages()
    }

    fn ensure_model(&self, from: &str, to: &str) -> Result<PathBuf, TranslateError> {
        let missing = || TranslateError::ModelMissing {
            from: from.to_string(),
            to: to.to_string(),
        };

        if !self.has_language_pair(from, to) {
            return Err(missing());
        }

        let files = self.present_files(from, to);
        let has_model = files.contains_key("model");
        let has_lex = files.contains_key("lex");
        let has_vocab = files.contains_key("vocab")
            || (files.contains_key("srcvocab") && files.contains_key("trgvocab"));

        if has_model && has_lex && has_vocab {
            return Ok(self.pair_dir(from, to));
        }

        warn!(
            from = from,
            to = to,
            dir = %self.pair_dir(from, to).display(),
            "model files incomplete on disk; fetch them before serving this pair"
        );
        Err(missing())
    }
}

/// A fixed catalog with a flat model root. Used by tests and by embedded
/// deployments that ship a known set of models.
pub struct StaticCatalog {
    pairs: HashSet<(String, String)>,
    model_root: PathBuf,
}

impl StaticCatalog {
    pub fn new(pairs: &[(&str, &str)], model_root: PathBuf) -> Self {
        Self {
            pairs: pairs
                .iter()
                .map(|(f, t)| (f.to_string(), t.to_string()))
                .collect(),
            model_root,
        }
    }
}

impl ModelCatalog for StaticCatalog {
    fn has_language_pair(&self, from: &str, to: &str) -> bool {
        self.pairs
            .contains(&(from.to_string(), to.to_string()))
    }

    fn supported_languages(&self) -> BTreeSet<String> {
        let mut langs = BTreeSet::new();
        for (from, to) in &self.pairs {
            langs.insert(from.clone());
            langs.insert(to.clone());
        }
        langs
    }

    fn ensure_model(&self, from: &str, to: &str) -> Result<PathBuf, TranslateError> {
        if !self.has_language_pair(from, to) {
            return Err(TranslateError::ModelMissing {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let dir = self.model_root.join(format!("{from}_{to}"));
        std::fs::create_dir_all(&dir).map_err(|e| {
            TranslateError::InvalidRequest(format!(
                "cannot create model directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RECORDS: &str = r#"{
        "data": [
            {
                "name": "model.ende.intgemm.alphas.bin.zst",
                "version": "1.0",
                "fileType": "model",
                "sourceLanguage": "en",
                "targetLanguage": "de",
                "attachment": {
                    "filename": "model.ende.intgemm.alphas.bin.zst",
                    "hash": "abc",
                    "size": 1,
                    "location": "main/model.ende.bin.zst"
                }
            },
            {
                "name": "lex.50.50.ende.s2t.bin.zst",
                "version": "1.0",
                "fileType": "lex",
                "sourceLanguage": "en",
                "targetLanguage": "de",
                "attachment": { "filename": "lex.50.50.ende.s2t.bin.zst" }
            },
            {
                "name": "vocab.ende.spm.zst",
                "version": "1.0",
                "fileType": "vocab",
                "sourceLanguage": "en",
                "targetLanguage": "de",
                "attachment": { "filename": "vocab.ende.spm.zst" }
            },
            {
                "name": "model.deen",
                "version": "1.0",
                "fileType": "model",
                "sourceLanguage": "de",
                "targetLanguage": "en",
                "attachment": { "filename": "model.deen.bin.zst" }
            }
        ]
    }"#;

    fn sample_records() -> RecordsData {
        serde_json::from_str(SAMPLE_RECORDS).expect("sample records parse")
    }

    #[test]
    fn records_pair_lookup() {
        let records = sample_records();
        assert!(records.has_language_pair("en", "de"));
        assert!(records.has_language_pair("de", "en"));
        assert!(!records.has_language_pair("en", "fr"));
    }

    #[test]
    fn records_supported_languages() {
        let langs = sample_records().supported_languages();
        assert_eq!(langs, BTreeSet::from(["de".to_string(), "en".to_string()]));
    }

    #[test]
    fn ensure_model_rejects_unknown_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = RecordsCatalog::new(sample_records(), dir.path().to_path_buf());
        match catalog.ensure_model("en", "fr") {
            Err(TranslateError::ModelMissing { from, to }) => {
                assert_eq!(from, "en");
                assert_eq!(to, "fr");
            }
            other => panic!("expected ModelMissing, got {other:?}"),
        }
    }

    #[test]
    fn ensure_model_requires_files_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = RecordsCatalog::new(sample_records(), dir.path().to_path_buf());

        // Pair known but nothing on disk.
        assert!(catalog.ensure_model("en", "de").is_err());

        // Materialize the decompressed files.
        let pair_dir = dir.path().join("en_de");
        std::fs::create_dir_all(&pair_dir).unwrap();
        for name in [
            "model.ende.intgemm.alphas.bin",
            "lex.50.50.ende.s2t.bin",
            "vocab.ende.spm",
        ] {
            std::fs::write(pair_dir.join(name), b"stub").unwrap();
        }

        let resolved = catalog.ensure_model("en", "de").expect("model resolved");
        assert_eq!(resolved, pair_dir);
    }

    #[test]
    fn static_catalog_behaviour() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = StaticCatalog::new(&[("en", "de"), ("de", "en")], dir.path().to_path_buf());

        assert!(catalog.has_language_pair("en", "de"));
        assert!(!catalog.has_language_pair("en", "ja"));
        assert_eq!(
            catalog.supported_languages(),
            BTreeSet::from(["de".to_string(), "en".to_string()])
        );

        let resolved = catalog.ensure_model("en", "de").expect("dir created");
        assert!(resolved.ends_with("en_de"));
        assert!(resolved.is_dir());
        assert!(catalog.ensure_model("ja", "en").is_err());
    }
}

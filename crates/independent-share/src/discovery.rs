//! Engine-side discovery recorder.
//!
//! An engine implementing [`COLLECT_SHARE_ENTRY_PLUGIN`] feeds every module
//! it creates into [`DiscoveryRecorder::record`]; the recorder matches the
//! raw request against the provided specifiers and emits the discovery
//! artifact once assets are processed.
//!
//! [`COLLECT_SHARE_ENTRY_PLUGIN`]: crate::collector::COLLECT_SHARE_ENTRY_PLUGIN

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{LazyLock, Mutex};

use regex::Regex;
use tracing::debug;

use crate::collector::{CollectShareEntryOptions, ProvideOption};
use crate::engine::{AssetStage, Compilation, ProcessAssetsHook};
use crate::error::ShareResult;
use crate::model::{ShareRequests, ShareRequestsMap};

static RELATIVE_REQUEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\.\.?(?:/|$))").expect("invalid relative request regex"));
static ABSOLUTE_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/|[A-Za-z]:\\|\\\\)").expect("invalid absolute request regex")
});

fn is_path_request(request: &str) -> bool {
    RELATIVE_REQUEST.is_match(request) || ABSOLUTE_REQUEST.is_match(request)
}

#[derive(Debug, Default)]
struct Record {
    share_scope: String,
    requests: BTreeSet<(String, String)>,
}

/// Records which resolved resources satisfy each provided share key.
#[derive(Debug)]
pub struct DiscoveryRecorder {
    filename: String,
    exact: HashMap<String, ProvideOption>,
    /// Prefix provides, longest prefix first.
    prefixes: Vec<ProvideOption>,
    paths: Vec<ProvideOption>,
    records: Mutex<BTreeMap<String, Record>>,
}

impl DiscoveryRecorder {
    pub fn new(options: CollectShareEntryOptions) -> Self {
        let mut exact = HashMap::new();
        let mut prefixes = Vec::new();
        let mut paths = Vec::new();
        for provide in options.provides {
            if provide.key.ends_with('/') {
                prefixes.push(provide);
            } else if is_path_request(&provide.key) {
                paths.push(provide);
            } else {
                exact.insert(provide.key.clone(), provide);
            }
        }
        prefixes.sort_by(|a, b| b.key.len().cmp(&a.key.len()));

        Self {
            filename: options.filename,
            exact,
            prefixes,
            paths,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Offer one created module.
    ///
    /// `description_version` is the `version` field of the package
    /// description file the resource was resolved from. Returns whether the
    /// module was recorded; requests whose version cannot be determined are
    /// skipped.
    pub fn record(
        &self,
        raw_request: &str,
        resource: &str,
        description_version: Option<&str>,
    ) -> bool {
        if resource.is_empty() {
            return false;
        }

        let matched = if let Some(provide) = self.exact.get(raw_request) {
            Some((provide, provide.share_key.clone()))
        } else if let Some(provide) = self
            .prefixes
            .iter()
            .find(|provide| raw_request.starts_with(provide.key.as_str()))
        {
            let remainder = &raw_request[provide.key.len()..];
            Some((provide, format!("{}{}", provide.share_key, remainder)))
        } else if is_path_request(raw_request) {
            self.paths
                .iter()
                .find(|provide| provide.key == raw_request)
                .map(|provide| (provide, provide.share_key.clone()))
        } else {
            None
        };

        let Some((provide, share_key)) = matched else {
            return false;
        };
        let Some(version) = infer_version(provide, description_version) else {
            debug!(
                request = raw_request,
                share_key = %share_key,
                "skipping request without version"
            );
            return false;
        };

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(share_key).or_default();
        record.share_scope = provide.share_scope.clone();
        record.requests.insert((resource.to_string(), version));
        true
    }

    /// Snapshot of recorded requests, sorted by `(path, version)`.
    ///
    /// A resource recorded under two versions keeps the lowest-sorting one
    /// so paths stay unique per key.
    pub fn requests_map(&self) -> ShareRequestsMap {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|(_, record)| !record.requests.is_empty())
            .map(|(share_key, record)| {
                let mut requests = ShareRequests::new(record.share_scope.clone());
                for (path, version) in &record.requests {
                    requests.push_request(path.clone(), version.clone());
                }
                (share_key.clone(), requests)
            })
            .collect()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl ProcessAssetsHook for DiscoveryRecorder {
    fn name(&self) -> &str {
        "emit share entries"
    }

    fn stage(&self) -> AssetStage {
        AssetStage::Additional
    }

    fn process_assets(&self, compilation: &mut Compilation) -> ShareResult<()> {
        let json = serde_json::to_string_pretty(&self.requests_map())?;
        compilation.emit_asset(self.filename.clone(), json);
        Ok(())
    }
}

fn infer_version(provide: &ProvideOption, description_version: Option<&str>) -> Option<String> {
    if let Some(version) = provide.version.as_ref().filter(|v| !v.is_empty()) {
        return Some(version.clone());
    }
    description_version
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

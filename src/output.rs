//! Classification and output artifacts
//!
//! Accepted candidates are ranked (tier desc, success streak desc, latency
//! asc, raw URI), labelled with a `<prefix> <flag> <CC>-<n>` remark and
//! written into per-scheme and per-country files plus a few curated subsets.
//! Every file is written to a sibling temp file and renamed into place.

use crate::error::OutputError;
use crate::proxy::models::{country_flag, ProxyCandidate, Scheme, Tier, UNKNOWN_COUNTRY};
use crate::proxy::parser::ProxyParser;
use crate::proxy::xray;
use crate::stability::{StabilityConfig, StabilityRecord};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default remark prefix
pub const DEFAULT_REMARK_PREFIX: &str = "[Sieve]";

/// Default number of candidates embedded in the aggregate Xray config
pub const DEFAULT_XRAY_TOP_N: usize = 50;

/// Default SOCKS port of exported Xray configs
pub const DEFAULT_XRAY_SOCKS_PORT: u16 = 10808;

pub const ALL_VALID_FILE: &str = "all_valid_proxies.txt";
pub const FULLY_VALIDATED_FILE: &str = "fully_validated.txt";
pub const STABLE_FILE: &str = "stable.txt";
pub const RECENT_FILE: &str = "proxies_last24h.txt";
pub const XRAY_CONFIG_FILE: &str = "xray_config.json";
pub const KIND_DIR: &str = "kind";
pub const COUNTRY_DIR: &str = "country";
pub const CORE_CONFIG_DIR: &str = "core_configs";

/// Output configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub remark_prefix: String,
    pub write_xray_config: bool,
    pub xray_top_n: usize,
    pub xray_socks_port: u16,
    pub export_core_configs: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            remark_prefix: DEFAULT_REMARK_PREFIX.to_string(),
            write_xray_config: false,
            xray_top_n: DEFAULT_XRAY_TOP_N,
            xray_socks_port: DEFAULT_XRAY_SOCKS_PORT,
            export_core_configs: false,
        }
    }
}

impl OutputConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_remark_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remark_prefix = prefix.into();
        self
    }

    pub fn with_xray_config(mut self, top_n: usize) -> Self {
        self.write_xray_config = true;
        self.xray_top_n = top_n;
        self
    }

    pub fn with_core_configs(mut self, enabled: bool) -> Self {
        self.export_core_configs = enabled;
        self
    }
}

/// Candidate accepted for output together with its history
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: ProxyCandidate,
    pub record: Option<StabilityRecord>,
}

impl RankedCandidate {
    pub fn success_streak(&self) -> u32 {
        self.record.as_ref().map_or(0, |r| r.success_streak)
    }
}

/// Bucket ordering: tier desc, success streak desc, latency asc, raw URI
pub fn rank_cmp(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.candidate
        .tier()
        .cmp(&a.candidate.tier())
        .then_with(|| b.success_streak().cmp(&a.success_streak()))
        .then_with(|| {
            let la = a.candidate.test_result.latency_ms.unwrap_or(u64::MAX);
            let lb = b.candidate.test_result.latency_ms.unwrap_or(u64::MAX);
            la.cmp(&lb)
        })
        .then_with(|| a.candidate.raw_uri.cmp(&b.candidate.raw_uri))
}

/// Largest sequence number taken over from an existing remark
pub const MAX_REMARK_NUMBER: u32 = 999_999;

/// Remark tail after the prefix: `<flag> <CC>-<n>`
static REMARK_TAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s+.+\s+([A-Z]{2})-(\d+)$").expect("Invalid remark regex")
});

/// Parses and formats remarks of the form `<prefix> <flag> <CC>-<n>`
pub struct RemarkFormat {
    prefix: String,
}

impl RemarkFormat {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Country code and sequence number of one of our remarks.
    ///
    /// Numbers above [`MAX_REMARK_NUMBER`] are not ours and are ignored.
    pub fn parse(&self, remark: &str) -> Option<(String, u32)> {
        let tail = remark.trim().strip_prefix(self.prefix.as_str())?;
        let caps = REMARK_TAIL_REGEX.captures(tail)?;
        let number = caps[2]
            .parse::<u32>()
            .ok()
            .filter(|n| *n <= MAX_REMARK_NUMBER)?;
        Some((caps[1].to_string(), number))
    }

    pub fn format(&self, country: &str, number: u32) -> String {
        format!("{} {} {}-{}", self.prefix, country_flag(country), country, number)
    }
}

/// Ranked, labelled candidates grouped by scheme and country
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// All accepted candidates in rank order
    pub ranked: Vec<RankedCandidate>,
    /// Remark per ranked entry
    pub remarks: Vec<String>,
    pub by_scheme: BTreeMap<Scheme, Vec<usize>>,
    pub by_country: BTreeMap<String, Vec<usize>>,
}

impl Classification {
    pub fn build(mut accepted: Vec<RankedCandidate>, format: &RemarkFormat) -> Self {
        accepted.sort_by(rank_cmp);

        // keep numbers already carried by input remarks for the same country
        let mut used: HashMap<String, HashSet<u32>> = HashMap::new();
        let mut highest: HashMap<String, u32> = HashMap::new();
        let mut numbers: Vec<Option<u32>> = vec![None; accepted.len()];
        for (index, entry) in accepted.iter().enumerate() {
            let country = entry.candidate.country().to_string();
            let parsed = entry.candidate.remark.as_deref().and_then(|r| format.parse(r));
            if let Some((code, number)) = parsed {
                if code == country && used.entry(country.clone()).or_default().insert(number) {
                    numbers[index] = Some(number);
                    let max = highest.entry(country).or_insert(0);
                    *max = (*max).max(number);
                }
            }
        }

        let mut remarks = Vec::with_capacity(accepted.len());
        let mut by_scheme: BTreeMap<Scheme, Vec<usize>> = BTreeMap::new();
        let mut by_country: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, entry) in accepted.iter().enumerate() {
            let country = entry.candidate.country().to_string();
            let number = match numbers[index] {
                Some(number) => number,
                None => {
                    let max = highest.entry(country.clone()).or_insert(0);
                    *max += 1;
                    *max
                }
            };
            remarks.push(format.format(&country, number));
            by_scheme.entry(entry.candidate.scheme).or_default().push(index);
            by_country.entry(country).or_default().push(index);
        }

        Self {
            ranked: accepted,
            remarks,
            by_scheme,
            by_country,
        }
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    /// Rendered URI of a ranked entry carrying its new remark
    pub fn render(&self, index: usize) -> String {
        ProxyParser::render(&self.ranked[index].candidate, Some(&self.remarks[index]))
    }

    fn render_all<I: IntoIterator<Item = usize>>(&self, indices: I) -> Vec<String> {
        indices.into_iter().map(|i| self.render(i)).collect()
    }
}

/// What a write pass did
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<OutputError>,
}

/// Writes a [`Classification`] to the output directory
#[derive(Debug, Clone)]
pub struct OutputWriter {
    config: OutputConfig,
}

impl OutputWriter {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    pub fn remark_format(&self) -> RemarkFormat {
        RemarkFormat::new(&self.config.remark_prefix)
    }

    pub fn write(
        &self,
        classification: &Classification,
        stability: &StabilityConfig,
        now: DateTime<Utc>,
    ) -> WriteReport {
        let mut report = WriteReport::default();
        let root = &self.config.output_dir;

        // all valid, grouped by country
        let grouped: Vec<usize> = classification
            .by_country
            .values()
            .flat_map(|indices| indices.iter().copied())
            .collect();
        self.write_lines(&mut report, root.join(ALL_VALID_FILE), classification.render_all(grouped));

        let mut kind_files = HashSet::new();
        for (scheme, indices) in &classification.by_scheme {
            let name = format!("{}.txt", scheme);
            let lines = classification.render_all(indices.iter().copied());
            self.write_lines(&mut report, root.join(KIND_DIR).join(&name), lines);
            kind_files.insert(name);
        }
        remove_stale(&mut report, &root.join(KIND_DIR), &kind_files);

        let mut country_files = HashSet::new();
        for (country, indices) in &classification.by_country {
            let name = format!("{}.txt", country);
            let lines = classification.render_all(indices.iter().copied());
            self.write_lines(&mut report, root.join(COUNTRY_DIR).join(&name), lines);
            country_files.insert(name);
        }
        remove_stale(&mut report, &root.join(COUNTRY_DIR), &country_files);

        let ranked = &classification.ranked;
        let fully: Vec<usize> = (0..ranked.len())
            .filter(|&i| ranked[i].candidate.tier() == Tier::FullyValidated)
            .collect();
        self.write_lines(&mut report, root.join(FULLY_VALIDATED_FILE), classification.render_all(fully));

        let stable: Vec<usize> = (0..ranked.len())
            .filter(|&i| stability.is_stable(ranked[i].record.as_ref()))
            .take(stability.stable_limit)
            .collect();
        self.write_lines(&mut report, root.join(STABLE_FILE), classification.render_all(stable));

        let recent: Vec<usize> = (0..ranked.len())
            .filter(|&i| stability.is_recent(ranked[i].record.as_ref(), now))
            .collect();
        self.write_lines(&mut report, root.join(RECENT_FILE), classification.render_all(recent));

        if self.config.write_xray_config {
            let top = ranked
                .iter()
                .map(|r| &r.candidate)
                .filter(|c| xray::supports(c.scheme))
                .take(self.config.xray_top_n);
            let config = xray::aggregate_config(top, self.config.xray_socks_port);
            self.write_json(&mut report, root.join(XRAY_CONFIG_FILE), config.to_json_pretty());
        }

        if self.config.export_core_configs {
            let mut exported = HashSet::new();
            for (index, entry) in ranked.iter().enumerate() {
                let Some(config) =
                    xray::validation_config(&entry.candidate, self.config.xray_socks_port)
                else {
                    continue;
                };
                let name = format!("{}.json", core_config_tag(classification, index));
                let path = root.join(CORE_CONFIG_DIR).join(&name);
                self.write_json(&mut report, path, config.to_json_pretty());
                exported.insert(name);
            }
            remove_stale(&mut report, &root.join(CORE_CONFIG_DIR), &exported);
        }

        info!(
            "Wrote {} artifacts to {} ({} failed, {} stale removed)",
            report.written.len(),
            root.display(),
            report.failed.len(),
            report.removed.len()
        );
        report
    }

    fn write_lines(&self, report: &mut WriteReport, path: PathBuf, lines: Vec<String>) {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        self.finish(report, path, content.as_bytes());
    }

    fn write_json(&self, report: &mut WriteReport, path: PathBuf, json: serde_json::Result<String>) {
        match json {
            Ok(json) => self.finish(report, path, json.as_bytes()),
            Err(e) => report.failed.push(OutputError {
                path,
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            }),
        }
    }

    fn finish(&self, report: &mut WriteReport, path: PathBuf, content: &[u8]) {
        match write_atomic(&path, content) {
            Ok(()) => report.written.push(path),
            Err(source) => {
                warn!("Failed to write {}: {}", path.display(), source);
                report.failed.push(OutputError { path, source });
            }
        }
    }
}

/// `<scheme>-<CC>-<n>` taken from the entry's remark
fn core_config_tag(classification: &Classification, index: usize) -> String {
    let entry = &classification.ranked[index];
    let suffix = classification.remarks[index]
        .rsplit(' ')
        .next()
        .unwrap_or(UNKNOWN_COUNTRY);
    format!("{}-{}", entry.candidate.scheme, suffix)
}

/// Write to `<name>.tmp` next to `path`, then rename over it
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Remove regular files in `dir` that this run did not write
fn remove_stale(report: &mut WriteReport, dir: &Path, keep: &HashSet<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_file() || keep.contains(&name) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => report.removed.push(path),
            Err(e) => warn!("Failed to remove stale {}: {}", path.display(), e),
        }
    }
}

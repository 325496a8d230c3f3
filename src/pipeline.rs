//! Pipeline orchestration
//!
//! One [`Pipeline::run`] parses the inputs, walks the candidates through the
//! probe stages, merges the results into the stability store and writes the
//! output artifacts. Per-run state lives in a [`RunContext`]; the store is
//! only written after every stage has finished.

use crate::database::{RunRecord, StabilityStore};
use crate::error::{FailureKind, PipelineError};
use crate::output::{Classification, OutputWriter, RankedCandidate, RemarkFormat};
use crate::probe::reachability::connectivity_check;
use crate::probe::{CoreStats, CoreValidator, ProtocolProber, ReachabilityProber};
use crate::proxy::geo::{
    CountryLookup, CountryResolver, GeoLocator, IpApiResolver, NullResolver,
    DEFAULT_LOOKUP_TIMEOUT_SECS,
};
use crate::proxy::models::{ProxyCandidate, Tier, UNKNOWN_COUNTRY};
use crate::proxy::parser::{ParseOutcome, ProxyParser};
use crate::stability::{self, Observation};
use crate::Config;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    /// Unique candidates after parsing
    pub candidates: usize,
    pub malformed: usize,
    pub unsupported: usize,
    pub duplicates: usize,
    pub tiers: BTreeMap<Tier, usize>,
    pub failures: BTreeMap<FailureKind, usize>,
    /// Stage 3 counters; `None` when Stage 3 did not run
    pub core: Option<CoreStats>,
    /// Candidates written to the outputs
    pub accepted: usize,
    pub committed: bool,
    /// Zero successes with connectivity lost; nothing was committed or written
    pub outage: bool,
    pub written: usize,
    pub failed_artifacts: Vec<PathBuf>,
}

impl RunSummary {
    pub fn tier_count(&self, tier: Tier) -> usize {
        self.tiers.get(&tier).copied().unwrap_or(0)
    }

    pub fn failure_count(&self, kind: FailureKind) -> usize {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    fn record_parse(&mut self, outcome: &ParseOutcome) {
        self.candidates = outcome.candidates.len();
        self.malformed = outcome.malformed;
        self.unsupported = outcome.unsupported;
        self.duplicates = outcome.duplicates;
        if outcome.malformed > 0 {
            self.failures.insert(FailureKind::MalformedUri, outcome.malformed);
        }
        if outcome.unsupported > 0 {
            self.failures
                .insert(FailureKind::UnsupportedScheme, outcome.unsupported);
        }
    }

    fn record_results(&mut self, candidates: &[ProxyCandidate]) {
        for candidate in candidates {
            *self.tiers.entry(candidate.tier()).or_insert(0) += 1;
            if let Some(kind) = candidate.test_result.failure {
                *self.failures.entry(kind).or_insert(0) += 1;
            }
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        writeln!(
            f,
            "  parsed: {} candidates ({} malformed, {} unsupported, {} duplicates)",
            self.candidates, self.malformed, self.unsupported, self.duplicates
        )?;
        for tier in [
            Tier::FullyValidated,
            Tier::ProtocolOk,
            Tier::ReachableOnly,
            Tier::Unreached,
        ] {
            writeln!(f, "  {:<15} {}", tier, self.tier_count(tier))?;
        }
        for (kind, count) in &self.failures {
            writeln!(f, "  {:<25} {}", kind, count)?;
        }
        match &self.core {
            Some(core) => writeln!(
                f,
                "  core: {}/{} passed, {} unsupported",
                core.passed, core.attempted, core.unsupported
            )?,
            None => writeln!(f, "  core: skipped")?,
        }
        if self.outage {
            writeln!(f, "  outage detected: state and outputs left untouched")?;
        }
        write!(
            f,
            "  accepted: {}, artifacts written: {}, failed: {}",
            self.accepted,
            self.written,
            self.failed_artifacts.len()
        )?;
        for path in &self.failed_artifacts {
            write!(f, "\n    {}", path.display())?;
        }
        Ok(())
    }
}

/// Per-run state threaded through the stages
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<Instant>,
    pub summary: RunSummary,
}

impl RunContext {
    pub fn new(run_deadline: Option<Duration>) -> Self {
        let run_id = Uuid::new_v4().to_string();
        Self {
            summary: RunSummary {
                run_id: run_id.clone(),
                ..RunSummary::default()
            },
            run_id,
            started_at: Utc::now(),
            deadline: run_deadline.map(|d| Instant::now() + d),
        }
    }
}

/// Country resolver chosen by the configuration
pub fn default_resolver(config: &Config) -> crate::Result<Arc<dyn CountryResolver>> {
    if let Some(path) = &config.geoip_database {
        return Ok(Arc::new(GeoLocator::from_path(path)?));
    }
    if config.ip_api_lookup {
        let timeout = Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS);
        return Ok(Arc::new(IpApiResolver::new(timeout)?));
    }
    Ok(Arc::new(NullResolver))
}

/// Sequences the stages over one batch of inputs
pub struct Pipeline {
    config: Config,
    store: StabilityStore,
    resolver: Arc<dyn CountryResolver>,
}

impl Pipeline {
    pub fn new(config: Config, store: StabilityStore, resolver: Arc<dyn CountryResolver>) -> Self {
        Self {
            config,
            store,
            resolver,
        }
    }

    /// Open the configured store and resolver
    pub async fn open(config: Config) -> crate::Result<Self> {
        let store = StabilityStore::open(&config.database_path).await?;
        let resolver = default_resolver(&config)?;
        Ok(Self::new(config, store, resolver))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StabilityStore {
        &self.store
    }

    /// Run the full pipeline over raw inputs (URIs, lists or subscription blobs)
    pub async fn run<S: AsRef<str>>(&mut self, inputs: &[S]) -> Result<RunSummary, PipelineError> {
        let mut ctx = RunContext::new(self.config.run_deadline);
        info!("Starting run {}", ctx.run_id);

        if self.config.connectivity_check
            && !connectivity_check(self.config.connectivity_timeout).await
        {
            return Err(PipelineError::NoConnectivity);
        }

        let parsed = ProxyParser::parse_inputs(inputs);
        ctx.summary.record_parse(&parsed);
        info!(
            "Parsed {} candidates ({} malformed, {} unsupported, {} duplicates)",
            parsed.candidates.len(),
            parsed.malformed,
            parsed.unsupported,
            parsed.duplicates
        );
        let mut candidates = parsed.candidates;

        self.validate(&mut candidates, &mut ctx).await;
        ctx.summary.record_results(&candidates);

        let now = Utc::now();
        let policy = &self.config.stability;
        let observations: Vec<Observation> = candidates
            .iter()
            .map(|c| Observation::from_candidate(c, policy.fingerprint_mode))
            .collect();
        let previous = self.store.load_all().await?;
        let updates = stability::merge(&previous, &observations, policy.success_tier, now);

        let successes = candidates
            .iter()
            .filter(|c| policy.is_success(c.tier()))
            .count();
        if successes == 0
            && !candidates.is_empty()
            && self.config.connectivity_check
            && !connectivity_check(self.config.connectivity_timeout).await
        {
            warn!("No candidate succeeded and connectivity is gone; leaving state and outputs untouched");
            ctx.summary.outage = true;
            return Ok(ctx.summary);
        }

        let mut accepted: Vec<RankedCandidate> = candidates
            .into_iter()
            .filter(|c| c.tier() > Tier::Unreached)
            .filter_map(|candidate| {
                let record = updates
                    .get(&candidate.fingerprint(policy.fingerprint_mode))
                    .cloned();
                policy
                    .is_eligible(record.as_ref())
                    .then_some(RankedCandidate { candidate, record })
            })
            .collect();
        ctx.summary.accepted = accepted.len();

        let run = RunRecord {
            run_id: ctx.run_id.clone(),
            started_at: ctx.started_at,
            finished_at: now,
            candidates: ctx.summary.candidates as u64,
            accepted: accepted.len() as u64,
        };
        self.store.commit_run(&run, &updates).await?;
        ctx.summary.committed = true;
        debug!("Committed {} stability records", updates.len());

        self.resolve_countries(&mut accepted, ctx.deadline).await;

        let writer = OutputWriter::new(self.config.output.clone());
        let classification = Classification::build(accepted, &writer.remark_format());
        let report = writer.write(&classification, policy, now);
        ctx.summary.written = report.written.len();
        if !report.failed.is_empty() {
            ctx.summary
                .failures
                .insert(FailureKind::OutputWriteFailure, report.failed.len());
        }
        ctx.summary.failed_artifacts = report.failed.into_iter().map(|e| e.path).collect();

        info!(
            "Run {} finished: {} accepted, {} artifacts written",
            ctx.run_id, ctx.summary.accepted, ctx.summary.written
        );
        Ok(ctx.summary)
    }

    async fn validate(&self, candidates: &mut [ProxyCandidate], ctx: &mut RunContext) {
        ReachabilityProber::new(self.config.reachability.clone())
            .probe_all(candidates, ctx.deadline)
            .await;

        if self.config.protocol_probe {
            ProtocolProber::new(self.config.protocol.clone())
                .probe_all(candidates, ctx.deadline)
                .await;
        } else {
            debug!("Stage 2 disabled");
        }

        if !self.config.core_validation {
            debug!("Stage 3 disabled");
            return;
        }
        match CoreValidator::detect(self.config.core.clone()) {
            Some(validator) => {
                let min_tier = if self.config.protocol_probe {
                    Tier::ProtocolOk
                } else {
                    Tier::ReachableOnly
                };
                let stats = validator.validate_all(candidates, min_tier, ctx.deadline).await;
                ctx.summary.core = Some(stats);
            }
            None => warn!("No xray/v2ray binary found, skipping Stage 3 for this run"),
        }
    }

    /// Resolve countries, falling back to the code of an earlier remark
    async fn resolve_countries(&self, accepted: &mut [RankedCandidate], deadline: Option<Instant>) {
        let mut lookup = CountryLookup::new(Arc::clone(&self.resolver));
        lookup
            .resolve_hosts(accepted.iter().map(|e| e.candidate.host.as_str()), deadline)
            .await;
        let format = RemarkFormat::new(&self.config.output.remark_prefix);

        for entry in accepted.iter_mut() {
            let mut code = lookup.cached_country(&entry.candidate.host);
            if code == UNKNOWN_COUNTRY {
                let previous = entry
                    .candidate
                    .remark
                    .as_deref()
                    .and_then(|remark| format.parse(remark));
                if let Some((previous, _)) = previous {
                    code = previous;
                }
            }
            entry.candidate.country_code = Some(code);
        }
        debug!("Resolved countries for {} hosts", lookup.cached());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{ALL_VALID_FILE, FULLY_VALIDATED_FILE, KIND_DIR};
    use crate::output::OutputConfig;
    use crate::probe::{ProtocolConfig, ReachabilityConfig};
    use crate::stability::StabilityRecord;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(output_dir: &Path) -> Config {
        Config {
            reachability: ReachabilityConfig::new()
                .with_icmp(false)
                .with_connect_timeout(Duration::from_millis(500)),
            protocol: ProtocolConfig::new()
                .with_timeout(Duration::from_millis(200))
                .with_banner_wait(Duration::from_millis(50)),
            core_validation: false,
            connectivity_check: false,
            output: OutputConfig::new(output_dir),
            ..Config::default()
        }
    }

    async fn pipeline(output_dir: &Path) -> Pipeline {
        let store = StabilityStore::in_memory().await.unwrap();
        Pipeline::new(test_config(output_dir), store, Arc::new(NullResolver))
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Accepts connections and never writes a byte back
    async fn silent_listener() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn vmess_uri(port: u16) -> String {
        let payload = serde_json::json!({
            "v": "2",
            "ps": "unreachable",
            "add": "127.0.0.1",
            "port": port.to_string(),
            "id": "b831381d-6324-4d53-ad4f-8cda48b30811",
            "aid": "0",
            "net": "tcp",
            "tls": ""
        });
        format!("vmess://{}", STANDARD.encode(payload.to_string()))
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_unreachable_candidate_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path()).await;

        let summary = pipeline.run(&[vmess_uri(closed_port())]).await.unwrap();

        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.tier_count(Tier::Unreached), 1);
        assert_eq!(summary.accepted, 0);
        assert!(summary.committed);
        assert!(lines(&dir.path().join(ALL_VALID_FILE)).is_empty());
        assert!(!dir.path().join(KIND_DIR).join("vmess.txt").exists());

        let records = pipeline.store().list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_streak, 1);
        assert_eq!(records[0].last_status, Tier::Unreached);
    }

    #[tokio::test]
    async fn test_silent_server_reaches_protocol_ok_without_core() {
        let dir = tempfile::tempdir().unwrap();
        let port = silent_listener().await;
        let mut pipeline = pipeline(dir.path()).await;

        let uri = format!("ss://aes-128-gcm:secret@127.0.0.1:{}#node", port);
        let summary = pipeline.run(&[uri]).await.unwrap();

        assert_eq!(summary.tier_count(Tier::ProtocolOk), 1);
        assert_eq!(summary.accepted, 1);
        assert!(summary.core.is_none());

        let kind = lines(&dir.path().join(KIND_DIR).join("ss.txt"));
        assert_eq!(kind.len(), 1);
        let written = ProxyParser::parse_uri(&kind[0]).unwrap();
        assert_eq!(written.port, port);
        assert_eq!(written.remark.as_deref(), Some("[Sieve] \u{1F310} XX-1"));
        assert!(lines(&dir.path().join(FULLY_VALIDATED_FILE)).is_empty());
    }

    #[tokio::test]
    async fn test_absent_fingerprint_keeps_its_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path()).await;

        let seen = Utc::now() - chrono::Duration::days(1);
        let kept = StabilityRecord {
            fingerprint: "absent".to_string(),
            success_streak: 3,
            failure_streak: 0,
            first_seen: seen,
            last_seen: seen,
            last_status: Tier::ReachableOnly,
            last_success: Some(seen),
            last_latency_ms: Some(40),
        };
        let run = RunRecord {
            run_id: "seed".to_string(),
            started_at: seen,
            finished_at: seen,
            candidates: 1,
            accepted: 1,
        };
        let seed = HashMap::from([(kept.fingerprint.clone(), kept.clone())]);
        pipeline.store().commit_run(&run, &seed).await.unwrap();

        pipeline.run(&[vmess_uri(closed_port())]).await.unwrap();

        assert_eq!(pipeline.store().get("absent").await.unwrap(), Some(kept));
        assert_eq!(pipeline.store().runs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_parse_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path()).await;

        let input = format!(
            "{}\nfoo://1.2.3.4:80\nvless://@:443\n{}",
            vmess_uri(closed_port()),
            vmess_uri(closed_port())
        );
        let summary = pipeline.run(&[input]).await.unwrap();

        assert_eq!(summary.failure_count(FailureKind::UnsupportedScheme), 1);
        assert_eq!(summary.failure_count(FailureKind::MalformedUri), 1);
        assert!(summary.candidates >= 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_marks_candidates_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let port = silent_listener().await;
        let mut config = test_config(dir.path());
        config.run_deadline = Some(Duration::ZERO);
        let store = StabilityStore::in_memory().await.unwrap();
        let mut pipeline = Pipeline::new(config, store, Arc::new(NullResolver));

        let inputs: Vec<String> = (1..=3)
            .map(|i| format!("trojan://pw{}@127.0.0.1:{}", i, port))
            .collect();
        let summary = pipeline.run(&inputs).await.unwrap();

        assert_eq!(summary.tier_count(Tier::Unreached), 3);
        assert_eq!(summary.failure_count(FailureKind::ProbeTimeout), 3);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_before_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut pipeline = pipeline(&out).await;
        pipeline.store().close().await;

        let result = pipeline.run(&[vmess_uri(closed_port())]).await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::StoreWriteFailure));
        assert!(!out.exists());
    }

    #[test]
    fn test_summary_display_lists_failed_artifacts() {
        let mut summary = RunSummary {
            run_id: "r1".to_string(),
            ..RunSummary::default()
        };
        summary.tiers.insert(Tier::ProtocolOk, 2);
        summary.failed_artifacts.push(PathBuf::from("out/stable.txt"));

        let text = summary.to_string();
        assert!(text.contains("Run r1"));
        assert!(text.contains("ProtocolOk"));
        assert!(text.contains("core: skipped"));
        assert!(text.contains("out/stable.txt"));
    }
}

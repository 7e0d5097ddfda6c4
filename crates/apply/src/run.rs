//! Run coordination: feed manifests through the decomposer and collect a report.

use anyhow::{Context, Result};
use serde_json::Value as Json;
use settle_core::{Action, ApplyResult, ResourceClient};
use tracing::{error, info};

use crate::source::{parse_manifest, ManifestRef, ManifestSource};
use crate::{decompose, Applier};

/// Result of one top-level manifest.
#[derive(Debug)]
pub struct ReportEntry {
    pub label: String,
    pub result: ApplyResult,
}

/// Per-run accumulator of top-level outcomes. The run succeeded iff no entry failed.
#[derive(Debug, Default)]
pub struct RunReport {
    entries: Vec<ReportEntry>,
}

impl RunReport {
    pub fn new() -> Self { Self::default() }

    pub fn record(&mut self, label: impl Into<String>, result: ApplyResult) {
        let label = label.into();
        match &result {
            Ok(o) if o.action == Action::Skipped => info!(manifest = %label, uri = %o.uri, code = o.status_code, "skipped"),
            Ok(o) => info!(manifest = %label, uri = %o.uri, action = ?o.action, code = o.status_code, "applied"),
            Err(e) => error!(manifest = %label, code = ?e.status_code(), body = %e.body(), error = %e, "apply failed"),
        }
        self.entries.push(ReportEntry { label, result });
    }

    pub fn entries(&self) -> &[ReportEntry] { &self.entries }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.result.is_err())
    }

    pub fn success(&self) -> bool { self.failures().next().is_none() }
}

/// Fetch and parse every family first, then apply them in order.
///
/// A fetch or parse failure aborts the run before anything is applied. Apply
/// failures are recorded and the remaining families still run.
pub async fn run_update<S, C>(source: &S, applier: &Applier<C>, families: &[ManifestRef]) -> Result<RunReport>
where
    S: ManifestSource + ?Sized,
    C: ResourceClient,
{
    let mut documents = Vec::with_capacity(families.len());
    for family in families {
        let text = source.fetch(&family.family, &family.version).await?;
        let doc = parse_manifest(&text).with_context(|| format!("parsing manifest for {}", family))?;
        documents.push((family.to_string(), doc));
    }
    Ok(run_documents(applier, documents).await)
}

/// Apply already-parsed documents one after another.
pub async fn run_documents<C, I>(applier: &Applier<C>, documents: I) -> RunReport
where
    C: ResourceClient,
    I: IntoIterator<Item = (String, Json)>,
{
    let mut report = RunReport::new();
    for (label, doc) in documents {
        let result = decompose(applier, doc).await;
        report.record(label, result);
    }
    report
}

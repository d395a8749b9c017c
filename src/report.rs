use crate::{
    analysis::ListingFailure,
    classifier::{Classification, ConflictCategory, ConflictEntry},
    config::AppConfig,
    content_tree::SourceArchive,
    error::RunAbort,
    executor::{TaskFailure, TaskOutcome},
    processor::{RunReport, SkipReason},
};
use anyhow::Result;
use serde::Serialize;
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct LegendItem {
    category: ConflictCategory,
    label: &'static str,
    count: usize,
}

#[derive(Serialize)]
struct AnalysisOutput<'a> {
    legend: Vec<LegendItem>,
    total: usize,
    entries: &'a [ConflictEntry],
    listing_failures: &'a [ListingFailure],
}

fn legend(classification: &Classification) -> Vec<LegendItem> {
    ConflictCategory::ALL
        .into_iter()
        .map(|category| LegendItem {
            category,
            label: category.label(),
            count: classification.counts.get(category),
        })
        .collect()
}

pub fn render_analysis(
    classification: &Classification,
    listing_failures: &[ListingFailure],
    format: OutputFormat,
) -> Result<String> {
    if format == OutputFormat::Json {
        let output = AnalysisOutput {
            legend: legend(classification),
            total: classification.counts.total(),
            entries: &classification.entries,
            listing_failures,
        };
        return Ok(serde_json::to_string_pretty(&output)?);
    }

    let mut out = String::new();
    writeln!(out, "Legend:")?;
    for item in legend(classification) {
        writeln!(out, "  {:<14} {:>5}  {}", item.category.tag(), item.count, item.label)?;
    }
    writeln!(out, "  {:<14} {:>5}", "total", classification.counts.total())?;

    if !classification.entries.is_empty() {
        writeln!(out)?;
    }
    for entry in &classification.entries {
        writeln!(
            out,
            "[{}] {} ({})",
            entry.category.tag(),
            entry.logical_path,
            entry.source_names.join(", ")
        )?;
    }

    if !listing_failures.is_empty() {
        writeln!(out)?;
    }
    write_listing_failures(&mut out, listing_failures)?;
    Ok(out)
}

fn write_listing_failures(out: &mut String, failures: &[ListingFailure]) -> std::fmt::Result {
    if failures.is_empty() {
        return Ok(());
    }
    writeln!(out, "Could not list {} archive(s):", failures.len())?;
    for failure in failures {
        writeln!(out, "  {}: {}", failure.archive, failure.reason)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct RunOutput<'a> {
    status: &'static str,
    output: &'a Path,
    processed_count: usize,
    skipped_count: usize,
    processed: Vec<&'a str>,
    skipped: Vec<SkippedItem<'a>>,
    listing_failures: &'a [ListingFailure],
}

#[derive(Serialize)]
struct SkippedItem<'a> {
    name: &'a str,
    reason: &'a SkipReason,
    message: String,
}

pub fn render_run(report: &RunReport, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        let output = RunOutput {
            status: "completed",
            output: &report.output,
            processed_count: report.processed_count(),
            skipped_count: report.skipped_count(),
            processed: report.processed().collect(),
            skipped: report
                .skipped()
                .map(|(name, reason)| SkippedItem {
                    name,
                    reason,
                    message: reason.to_string(),
                })
                .collect(),
            listing_failures: &report.listing_failures,
        };
        return Ok(serde_json::to_string_pretty(&output)?);
    }

    let mut out = String::new();
    writeln!(
        out,
        "{} processed, {} skipped",
        report.processed_count(),
        report.skipped_count()
    )?;
    for name in report.processed() {
        writeln!(out, "  merged  {name}")?;
    }
    for (name, reason) in report.skipped() {
        writeln!(out, "  skipped {name}: {reason}")?;
    }
    write_listing_failures(&mut out, &report.listing_failures)?;
    writeln!(out, "Wrote {}", report.output.display())?;
    Ok(out)
}

#[derive(Serialize)]
struct AbortOutput {
    status: &'static str,
    code: &'static str,
    message: String,
}

pub fn render_abort(abort: &RunAbort, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let output = AbortOutput {
                status: if abort.is_error() { "aborted" } else { "cancelled" },
                code: abort.code(),
                message: abort.to_string(),
            };
            Ok(serde_json::to_string_pretty(&output)?)
        }
        OutputFormat::Text => Ok(format!("{abort}\n")),
    }
}

#[derive(Serialize)]
struct ExtractionOutput<'a> {
    reference_root: &'a Path,
    extracted: Vec<&'a SourceArchive>,
    failed: Vec<ExtractionFailure<'a>>,
}

#[derive(Serialize)]
struct ExtractionFailure<'a> {
    archive: &'a SourceArchive,
    failure: &'a TaskFailure,
}

pub fn render_extraction(
    outcome: &TaskOutcome<SourceArchive, PathBuf>,
    reference_root: &Path,
    format: OutputFormat,
) -> Result<String> {
    let mut extracted: Vec<&SourceArchive> = outcome.succeeded.keys().collect();
    extracted.sort();
    let mut failed: Vec<(&SourceArchive, &TaskFailure)> = outcome.failed.iter().collect();
    failed.sort_by(|a, b| a.0.cmp(b.0));

    if format == OutputFormat::Json {
        let output = ExtractionOutput {
            reference_root,
            extracted,
            failed: failed
                .into_iter()
                .map(|(archive, failure)| ExtractionFailure { archive, failure })
                .collect(),
        };
        return Ok(serde_json::to_string_pretty(&output)?);
    }

    let mut out = String::new();
    writeln!(
        out,
        "Extracted {} of {} archive(s) into {}",
        extracted.len(),
        outcome.len(),
        reference_root.display()
    )?;
    for (archive, failure) in failed {
        writeln!(out, "  failed {archive}: {failure}")?;
    }
    Ok(out)
}

#[derive(Serialize)]
struct ConfigOutput<'a> {
    path: &'a Path,
    config: &'a AppConfig,
}

pub fn render_config(config: &AppConfig, path: &Path, format: OutputFormat) -> Result<String> {
    let output = ConfigOutput { path, config };
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => Ok(format!(
            "Config: {}\n{}\n",
            path.display(),
            serde_json::to_string_pretty(config)?
        )),
    }
}

//! Report generation for rejection evaluations.
//!
//! Each report carries its run metadata and renders either as a plain text
//! table or as pretty JSON. Rates include a 95% Clopper-Pearson interval;
//! undefined rates stay undefined in both renderings.

use crate::adversarial::AdversarialOutcome;
use crate::calibrate::Thresholds;
use crate::config::RunConfig;
use crate::corruption::SeverityResult;
use crate::metrics::{mean_defined, RateWithCI, RejectionCounts};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as FmtWrite;
use tabled::{Table, Tabled};

/// Confidence level of every reported interval
pub const CONFIDENCE: f64 = 0.95;

const RULE_HEAVY: &str = "═══════════════════════════════════════════════════════════════";
const RULE_LIGHT: &str = "───────────────────────────────────────────────────────────────";

/// Report metadata
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub title: String,
    pub problem: String,
    pub classifier: String,
    pub batch_size: usize,
    pub seed: u64,
    pub generated_at: DateTime<Utc>,
    pub framework_version: String,
    pub confidence: f64,
}

impl ReportMetadata {
    #[must_use]
    pub fn new(title: &str, config: &RunConfig) -> Self {
        Self {
            title: title.to_string(),
            problem: config.problem.to_string(),
            classifier: config.classifier.to_string(),
            batch_size: config.batch_size,
            seed: config.seed,
            generated_at: Utc::now(),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
            confidence: CONFIDENCE,
        }
    }

    fn write_header(&self, output: &mut String) {
        writeln!(output, "{RULE_HEAVY}").ok();
        writeln!(output, "  {}", self.title).ok();
        writeln!(output, "{RULE_HEAVY}").ok();
        writeln!(
            output,
            "  {} / {}  (batch {}, seed {})",
            self.problem, self.classifier, self.batch_size, self.seed
        )
        .ok();
        writeln!(
            output,
            "  Generated {} by v{}",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.framework_version
        )
        .ok();
        writeln!(output).ok();
    }
}

fn fmt_rate(rate: &RateWithCI) -> String {
    match (rate.value, rate.ci_lower, rate.ci_upper) {
        (Some(v), Some(lo), Some(hi)) => format!(
            "{:.2}% [{:.2}-{:.2}]",
            v * 100.0,
            lo * 100.0,
            hi * 100.0
        ),
        _ => rate.percent(),
    }
}

fn fmt_mean(value: Option<f64>) -> String {
    value.map_or_else(|| "undefined".to_string(), |v| format!("{:.2}%", v * 100.0))
}

/// Per-class thresholds of one calibration
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdReport {
    pub metadata: ReportMetadata,
    /// One vector per percentile; classes without a threshold serialize as null
    pub thresholds: Vec<Thresholds>,
}

#[derive(Tabled)]
struct ThresholdRow {
    #[tabled(rename = "Class")]
    class: usize,
    #[tabled(rename = "Thresholds")]
    values: String,
}

impl ThresholdReport {
    #[must_use]
    pub const fn new(metadata: ReportMetadata, thresholds: Vec<Thresholds>) -> Self {
        Self {
            metadata,
            thresholds,
        }
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        self.metadata.write_header(&mut output);

        let percentiles: Vec<String> = self
            .thresholds
            .iter()
            .map(|t| format!("p={}", t.percentile()))
            .collect();
        writeln!(output, "THRESHOLDS ({})", percentiles.join(", ")).ok();
        writeln!(output, "{RULE_LIGHT}").ok();

        let n_classes = self.thresholds.iter().map(Thresholds::len).max().unwrap_or(0);
        let rows: Vec<ThresholdRow> = (0..n_classes)
            .map(|class| ThresholdRow {
                class,
                values: self
                    .thresholds
                    .iter()
                    .map(|t| t.get(class).map_or_else(|| "-".to_string(), |v| format!("{v:.4}")))
                    .collect::<Vec<_>>()
                    .join(" / "),
            })
            .collect();
        writeln!(output, "{}", Table::new(rows)).ok();
        output
    }
}

/// Rejection rate under one threshold vector
#[derive(Debug, Clone, Serialize)]
pub struct RejectionAtPercentile {
    pub percentile: f64,
    /// Rejected among successful adversarial examples
    pub reject_rate: RateWithCI,
}

/// Adversarial rejection results
#[derive(Debug, Clone, Serialize)]
pub struct AdversarialReport {
    pub metadata: ReportMetadata,
    pub attack: String,
    pub batches: usize,
    pub n_eval: usize,
    pub n_successful: usize,
    pub success_rate: RateWithCI,
    pub rejections: Vec<RejectionAtPercentile>,
}

impl AdversarialReport {
    #[must_use]
    pub fn from_outcome(metadata: ReportMetadata, outcome: &AdversarialOutcome) -> Self {
        let counts = outcome.counts;
        Self {
            metadata,
            attack: outcome.attack.clone(),
            batches: outcome.batches,
            n_eval: counts.n_eval,
            n_successful: counts.n_successful,
            success_rate: RateWithCI::from_rate(counts.success_rate(), CONFIDENCE),
            rejections: outcome
                .percentiles
                .iter()
                .zip(counts.reject_rates())
                .map(|(&percentile, rate)| RejectionAtPercentile {
                    percentile,
                    reject_rate: RateWithCI::from_rate(rate, CONFIDENCE),
                })
                .collect(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        self.metadata.write_header(&mut output);

        writeln!(output, "ATTACK: {}", self.attack).ok();
        writeln!(output, "{RULE_LIGHT}").ok();
        writeln!(output, "  Batches:          {}", self.batches).ok();
        writeln!(output, "  Attacked:         {}", self.n_eval).ok();
        writeln!(output, "  Successful:       {}", self.n_successful).ok();
        writeln!(output, "  Success rate:     {}", fmt_rate(&self.success_rate)).ok();
        writeln!(output).ok();

        writeln!(output, "REJECTION OF SUCCESSFUL ATTACKS").ok();
        writeln!(output, "{RULE_LIGHT}").ok();
        for r in &self.rejections {
            writeln!(
                output,
                "  p={:<6} {} ({}/{})",
                r.percentile,
                fmt_rate(&r.reject_rate),
                r.reject_rate.count,
                r.reject_rate.total
            )
            .ok();
        }
        output
    }
}

/// One corruption/severity row
#[derive(Debug, Clone, Serialize)]
pub struct CorruptionRow {
    pub corruption: String,
    pub severity: usize,
    pub counts: RejectionCounts,
    pub acc: RateWithCI,
    pub false_rate: RateWithCI,
    pub reject_rate: RateWithCI,
    pub acc_remain: RateWithCI,
}

impl From<&SeverityResult> for CorruptionRow {
    fn from(result: &SeverityResult) -> Self {
        let c = result.counts;
        Self {
            corruption: result.corruption.clone(),
            severity: result.severity,
            counts: c,
            acc: RateWithCI::from_rate(c.accuracy(), CONFIDENCE),
            false_rate: RateWithCI::from_rate(c.false_rate(), CONFIDENCE),
            reject_rate: RateWithCI::from_rate(c.reject_rate(), CONFIDENCE),
            acc_remain: RateWithCI::from_rate(c.accuracy_remaining(), CONFIDENCE),
        }
    }
}

/// Mean over a corruption's severities, ignoring undefined values
#[derive(Debug, Clone, Serialize)]
pub struct CorruptionSummary {
    pub corruption: String,
    pub severities: usize,
    pub mean_acc: Option<f64>,
    pub mean_false_rate: Option<f64>,
    pub mean_reject_rate: Option<f64>,
    pub mean_acc_remain: Option<f64>,
}

/// Corruption rejection results
#[derive(Debug, Clone, Serialize)]
pub struct CorruptionReport {
    pub metadata: ReportMetadata,
    pub percentile: f64,
    pub results: Vec<CorruptionRow>,
    pub summaries: Vec<CorruptionSummary>,
}

#[derive(Tabled)]
struct CorruptionTableRow {
    #[tabled(rename = "Corruption")]
    corruption: String,
    #[tabled(rename = "Sev")]
    severity: String,
    #[tabled(rename = "N")]
    n: usize,
    #[tabled(rename = "Acc")]
    acc: String,
    #[tabled(rename = "False")]
    false_rate: String,
    #[tabled(rename = "Reject")]
    reject_rate: String,
    #[tabled(rename = "Acc (kept)")]
    acc_remain: String,
}

impl CorruptionReport {
    #[must_use]
    pub fn from_results(
        metadata: ReportMetadata,
        percentile: f64,
        results: &[SeverityResult],
    ) -> Self {
        let rows: Vec<CorruptionRow> = results.iter().map(CorruptionRow::from).collect();

        let mut names: Vec<&str> = Vec::new();
        for r in &rows {
            if !names.contains(&r.corruption.as_str()) {
                names.push(&r.corruption);
            }
        }
        let summaries = names
            .iter()
            .map(|&name| {
                let group: Vec<&CorruptionRow> =
                    rows.iter().filter(|r| r.corruption == name).collect();
                CorruptionSummary {
                    corruption: name.to_string(),
                    severities: group.len(),
                    mean_acc: mean_defined(group.iter().map(|r| r.acc.value)),
                    mean_false_rate: mean_defined(group.iter().map(|r| r.false_rate.value)),
                    mean_reject_rate: mean_defined(group.iter().map(|r| r.reject_rate.value)),
                    mean_acc_remain: mean_defined(group.iter().map(|r| r.acc_remain.value)),
                }
            })
            .collect();

        Self {
            metadata,
            percentile,
            results: rows,
            summaries,
        }
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        self.metadata.write_header(&mut output);

        writeln!(output, "CORRUPTIONS (threshold percentile {})", self.percentile).ok();
        writeln!(output, "{RULE_LIGHT}").ok();
        let rows: Vec<CorruptionTableRow> = self
            .results
            .iter()
            .map(|r| CorruptionTableRow {
                corruption: r.corruption.clone(),
                severity: r.severity.to_string(),
                n: r.counts.n_total,
                acc: fmt_rate(&r.acc),
                false_rate: fmt_rate(&r.false_rate),
                reject_rate: fmt_rate(&r.reject_rate),
                acc_remain: fmt_rate(&r.acc_remain),
            })
            .collect();
        writeln!(output, "{}", Table::new(rows)).ok();
        writeln!(output).ok();

        writeln!(output, "MEAN OVER SEVERITIES").ok();
        writeln!(output, "{RULE_LIGHT}").ok();
        let means: Vec<CorruptionTableRow> = self
            .summaries
            .iter()
            .map(|s| CorruptionTableRow {
                corruption: s.corruption.clone(),
                severity: "all".to_string(),
                n: self
                    .results
                    .iter()
                    .filter(|r| r.corruption == s.corruption)
                    .map(|r| r.counts.n_total)
                    .sum(),
                acc: fmt_mean(s.mean_acc),
                false_rate: fmt_mean(s.mean_false_rate),
                reject_rate: fmt_mean(s.mean_reject_rate),
                acc_remain: fmt_mean(s.mean_acc_remain),
            })
            .collect();
        writeln!(output, "{}", Table::new(means)).ok();
        output
    }
}

//! Markdown and JSON statistics reports.
//!
//! This module renders a [`CorpusSummary`] for humans (Markdown) or for
//! downstream tooling (JSON).

use crate::analysis::top_risk_tags;
use crate::models::{CorpusSummary, Metrics, Severity};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(summary: &CorpusSummary, root: &Path) -> String {
    let mut output = String::new();

    // Title
    output.push_str("# GovSynth Evaluation Report\n\n");

    output.push_str(&generate_metadata_section(summary, root));
    output.push_str(&generate_table_of_contents(summary));
    output.push_str(&generate_class_section(summary));
    output.push_str(&generate_metrics_section(summary));
    output.push_str(&generate_class_metrics_section(summary));
    output.push_str(&generate_violations_section(summary));
    output.push_str(&generate_risks_section(summary));
    output.push_str(&generate_scenario_section(summary));
    output.push_str(&generate_excluded_section(summary));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(summary: &CorpusSummary, root: &Path) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Data Root:** `{}`\n", root.display()));
    if let Some(generated_at) = summary.generated_at {
        section.push_str(&format!(
            "- **Generated:** {}\n",
            generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    section.push_str(&format!("- **Runs Evaluated:** {}\n", summary.total_runs));
    if !summary.excluded_runs.is_empty() {
        section.push_str(&format!("- **Runs Excluded:** {}\n", summary.excluded_runs.len()));
    }
    section.push_str(&format!("- **Scenario Classes:** {}\n", summary.by_class.len()));
    if !summary.stage_counts.is_empty() {
        let progress: Vec<String> = summary
            .stage_counts
            .iter()
            .map(|(stage, count)| format!("{} {}", stage, count))
            .collect();
        section.push_str(&format!("- **Artifacts:** {}\n", progress.join(" | ")));
    }
    section.push('\n');

    section
}

/// Generate the table of contents.
fn generate_table_of_contents(summary: &CorpusSummary) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Scenario Classes](#scenario-classes)\n");
    toc.push_str("- [Metrics](#metrics)\n");
    if !summary.class_macro_avgs.is_empty() {
        toc.push_str("- [Metrics by Class](#metrics-by-class)\n");
    }
    toc.push_str("- [Violations](#violations)\n");
    toc.push_str("- [Emergent Risks](#emergent-risks)\n");
    if has_scenario_attributes(summary) {
        toc.push_str("- [Scenario Attributes](#scenario-attributes)\n");
    }
    if !summary.excluded_runs.is_empty() {
        toc.push_str("- [Excluded Runs](#excluded-runs)\n");
    }
    toc.push('\n');

    toc
}

fn generate_class_section(summary: &CorpusSummary) -> String {
    let mut section = String::new();

    section.push_str("## Scenario Classes\n\n");
    if summary.by_class.is_empty() {
        section.push_str("No evaluated runs were found.\n\n");
        return section;
    }

    section.push_str("| Class | Runs | Share |\n");
    section.push_str("|:---|:---:|:---:|\n");

    let mut classes: Vec<_> = summary.by_class.iter().collect();
    classes.sort_by_key(|(_, count)| std::cmp::Reverse(**count));

    for (class_tag, count) in classes {
        let share = *count as f64 / summary.total_runs.max(1) as f64 * 100.0;
        section.push_str(&format!("| {} | {} | {:.1}% |\n", class_tag, count, share));
    }
    section.push('\n');

    section
}

fn generate_metrics_section(summary: &CorpusSummary) -> String {
    let mut section = String::new();

    section.push_str("## Metrics\n\n");
    if summary.macro_avgs.is_empty() {
        section.push_str("No metrics available.\n\n");
        return section;
    }

    section.push_str("| Metric | Mean | Std Dev |\n");
    section.push_str("|:---|:---:|:---:|\n");
    for name in Metrics::NAMES {
        let mean = summary.macro_avgs.get(name).copied().unwrap_or_default();
        let std_dev = summary.std_devs.get(name).copied().unwrap_or_default();
        section.push_str(&format!("| `{}` | {:.3} | {:.3} |\n", name, mean, std_dev));
    }
    section.push('\n');

    section
}

/// One row per class, one column per metric.
fn generate_class_metrics_section(summary: &CorpusSummary) -> String {
    if summary.class_macro_avgs.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Metrics by Class\n\n");
    section.push_str("| Class |");
    for name in Metrics::NAMES {
        section.push_str(&format!(" `{}` |", name));
    }
    section.push('\n');
    section.push_str("|:---|");
    section.push_str(&":---:|".repeat(Metrics::NAMES.len()));
    section.push('\n');

    for (class_tag, avgs) in &summary.class_macro_avgs {
        section.push_str(&format!("| {} |", class_tag));
        for name in Metrics::NAMES {
            let mean = avgs.get(name).copied().unwrap_or_default();
            section.push_str(&format!(" {:.3} |", mean));
        }
        section.push('\n');
    }
    section.push('\n');

    section
}

fn generate_violations_section(summary: &CorpusSummary) -> String {
    let mut section = String::new();

    section.push_str("## Violations\n\n");

    let count = |s: Severity| summary.severity_counts.get(s.as_str()).copied().unwrap_or(0);
    let total: usize = summary.severity_counts.values().sum();

    section.push_str(&format!(
        "| {} Critical | {} High | {} Medium | {} Low | **Total** |\n",
        Severity::Critical.emoji(),
        Severity::High.emoji(),
        Severity::Medium.emoji(),
        Severity::Low.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | **{}** |\n\n",
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low),
        total
    ));

    section
}

fn generate_risks_section(summary: &CorpusSummary) -> String {
    let mut section = String::new();

    section.push_str("## Emergent Risks\n\n");

    let tags = top_risk_tags(summary, summary.emergent_risk_counts.len());
    if tags.is_empty() {
        section.push_str("No emergent risks were reported.\n\n");
        return section;
    }

    section.push_str("| Risk Tag | Runs |\n");
    section.push_str("|:---|:---:|\n");
    for (tag, count) in tags {
        section.push_str(&format!("| {} | {} |\n", tag, count));
    }
    section.push('\n');

    section
}

fn has_scenario_attributes(summary: &CorpusSummary) -> bool {
    summary.scenario_breakdown.values().any(|counts| !counts.is_empty())
}

/// One table per scenario attribute that any evaluated run sets.
fn generate_scenario_section(summary: &CorpusSummary) -> String {
    if !has_scenario_attributes(summary) {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Scenario Attributes\n\n");
    for (attribute, counts) in &summary.scenario_breakdown {
        if counts.is_empty() {
            continue;
        }

        section.push_str(&format!("### `{}`\n\n", attribute));
        section.push_str("| Value | Runs |\n");
        section.push_str("|:---|:---:|\n");

        let mut values: Vec<_> = counts.iter().collect();
        values.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (value, count) in values {
            section.push_str(&format!("| {} | {} |\n", value, count));
        }
        section.push('\n');
    }

    section
}

fn generate_excluded_section(summary: &CorpusSummary) -> String {
    if summary.excluded_runs.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Excluded Runs\n\n");
    section.push_str("These runs have an evaluation that failed validation and are not counted above:\n\n");
    for run_id in &summary.excluded_runs {
        section.push_str(&format!("- `{}`\n", run_id));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    "---\n\n*Report generated by GovSynth*\n".to_string()
}

/// Generate a JSON report.
pub fn generate_json_report(summary: &CorpusSummary) -> Result<String> {
    serde_json::to_string_pretty(summary).map_err(Into::into)
}

/// Write a rendered report to a file.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write report file: {}", path.display()))?;

    Ok(())
}

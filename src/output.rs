//! Report formatting.
//!
//! Plain lines keep the shape of classic micro-benchmark output
//! (`avg ..., max ..., stddev^2 ...`) so logs stay greppable; the terminal
//! variant adds colour and warning markers. JSON is the machine-readable form.

use colored::Colorize;

use crate::error::Result;
use crate::harness::{CoreOutcome, Measurement, RunReport};
use crate::sampler::{SamplerReport, Warning};
use crate::tick::DiagnosticSink;

/// One-line summary of a loop, without colour.
pub fn summary_line(report: &SamplerReport) -> String {
    match &report.summary {
        Some(s) => format!(
            "{}: avg {:.0}, max {}, stddev^2 {:.0} ({} samples, baseline {})",
            report.name, s.mean, s.max, s.variance, s.count, s.baseline
        ),
        None => format!("{}: no accepted samples in {} attempts", report.name, report.attempts),
    }
}

/// Rejection counters of a loop, without colour.
pub fn rejection_line(report: &SamplerReport) -> String {
    let r = &report.rejected;
    format!(
        "{}: {} attempts, {} rejected (tick {}, failed {}, clock {}, outlier {}), {} failures counted",
        report.name,
        report.attempts,
        r.total(),
        r.tick_changed,
        r.failed,
        r.clock_anomaly,
        r.outlier,
        report.failed
    )
}

fn warning_line(report: &SamplerReport, warning: &Warning) -> String {
    format!("{}: warning: {}", report.name, warning)
}

/// Every plain line describing `report`, in emission order.
pub fn report_lines(report: &RunReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{} cores, clock {} ({:.3} cycles/ns), {} ticks",
        report.cores.len(),
        report.clock,
        report.cycles_per_ns,
        report.ticks_fired
    )];

    for core in &report.cores {
        match &core.outcome {
            CoreOutcome::Measured { measurement } => {
                for r in loops(measurement) {
                    lines.push(summary_line(r));
                    lines.push(rejection_line(r));
                    lines.extend(r.warnings.iter().map(|w| warning_line(r, w)));
                }
                if let Measurement::Single {
                    report,
                    unfiltered: Some(avg),
                } = measurement
                {
                    lines.push(format!("{}: unfiltered avg {:.0}", report.name, avg));
                }
            }
            CoreOutcome::Served { requests } => {
                lines.push(format!("core {}: answered {} round trips", core.core, requests));
            }
            CoreOutcome::Flushed { flushes } => {
                lines.push(format!("core {}: {} flushes", core.core, flushes));
            }
            CoreOutcome::Interfered { stats } => {
                lines.push(format!(
                    "core {}: {} interference rounds, {} failed",
                    core.core, stats.rounds, stats.failures
                ));
            }
            CoreOutcome::Idle => {}
        }
    }
    lines
}

/// Emit every plain line to `sink`.
pub fn emit_report<S: DiagnosticSink + ?Sized>(sink: &S, report: &RunReport) {
    for line in report_lines(report) {
        sink.emit(&line);
    }
}

fn loops(measurement: &Measurement) -> Vec<&SamplerReport> {
    match measurement {
        Measurement::Single { report, .. } => vec![report],
        Measurement::Paired { report } => vec![&report.forward, &report.reverse],
    }
}

/// Coloured rendering for an interactive terminal.
pub fn format_terminal(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} cores, {} at {:.3} cycles/ns\n",
        "tickgate".bold(),
        report.cores.len(),
        report.clock,
        report.cycles_per_ns
    ));

    for (_, measurement) in report.measurements() {
        for r in loops(measurement) {
            out.push('\n');
            out.push_str(&format!("{}\n", r.name.bold()));
            match &r.summary {
                Some(s) => {
                    let ns = s.mean / report.cycles_per_ns;
                    out.push_str(&format!(
                        "  mean     {} cycles ({:.1} ns)\n",
                        format!("{:.0}", s.mean).green(),
                        ns
                    ));
                    out.push_str(&format!("  max      {} cycles\n", s.max));
                    out.push_str(&format!("  stddev   {:.1} cycles from baseline {}\n", s.std_dev(), s.baseline));
                    out.push_str(&format!("  samples  {}\n", s.count));
                }
                None => out.push_str(&format!("  {}\n", "no accepted samples".red().bold())),
            }
            let rejected = r.rejected.total();
            if rejected > 0 {
                out.push_str(&format!(
                    "  rejected {} of {} attempts\n",
                    rejected.to_string().yellow(),
                    r.attempts
                ));
            }
            for w in &r.warnings {
                out.push_str(&format!("  {} {}\n", "\u{26A0}".yellow().bold(), w.to_string().yellow()));
            }
        }
        if let Measurement::Single {
            unfiltered: Some(avg),
            ..
        } = measurement
        {
            out.push_str(&format!("  unfiltered {:.0} cycles\n", avg).dimmed().to_string());
        }
    }
    out
}

/// Pretty-printed JSON.
pub fn to_json(report: &RunReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

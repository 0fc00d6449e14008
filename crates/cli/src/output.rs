//! Human-readable rendering of scan results.

use model::{CounterTracker, Severity, SeveritySummary, Vulnerability};

/// Severity colored with plain ANSI codes; adds no dependencies.
fn color_severity(sev: Severity) -> String {
    let (code, text) = match sev {
        Severity::Info => ("\x1b[32m", "INFO"),
        Severity::Low => ("\x1b[32m", "LOW"),
        Severity::Medium => ("\x1b[33m", "MEDIUM"),
        Severity::High => ("\x1b[31m", "HIGH"),
    };
    format!("{code}{text}\x1b[0m")
}

pub fn print_findings(
    vulnerabilities: &[Vulnerability],
    summary: Option<&SeveritySummary>,
    tracker: &CounterTracker,
) {
    for v in vulnerabilities {
        println!(
            "[{}] {} at {}:{}",
            color_severity(v.severity),
            v.query_name,
            v.file_name.display(),
            v.line
        );
        println!("    {}", v.key_actual_value);
        println!("    expected: {}", v.key_expected_value);
        for line in &v.vuln_lines {
            println!("    {:>4} | {}", line.position, line.line);
        }
        println!();
    }

    println!(
        "Files found: {}, parsed: {}, evaluated: {}",
        tracker.found(),
        tracker.parsed(),
        tracker.evaluated()
    );
    if let Some(summary) = summary {
        let count = |s: Severity| summary.severity_counters.get(&s).copied().unwrap_or(0);
        println!(
            "Results: {} total (HIGH: {}, MEDIUM: {}, LOW: {}, INFO: {})",
            summary.total_counter,
            count(Severity::High),
            count(Severity::Medium),
            count(Severity::Low),
            count(Severity::Info)
        );
    }
}

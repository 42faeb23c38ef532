use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{
    Baseline, BaselineState, IntegrityScore, StyleDimension, Trend, TrendReport, WritingSample,
};

pub struct ReportInput<'a> {
    pub student_id: &'a str,
    pub generated_at: DateTime<Utc>,
    pub state: BaselineState,
    pub baseline: Option<&'a Baseline>,
    pub trends: &'a [(StyleDimension, TrendReport)],
    pub history: &'a [WritingSample],
    /// Score of the most recent submission against the current profile.
    pub latest: Option<&'a IntegrityScore>,
}

fn describe_state(state: &BaselineState) -> String {
    match state {
        BaselineState::Uninitialized => "no samples yet".to_string(),
        BaselineState::Building { samples, required } => {
            format!("building ({samples} of {required} samples)")
        }
        BaselineState::Established => "established".to_string(),
        BaselineState::Stale => "stale, rebuild recommended".to_string(),
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= limit {
        return flat;
    }
    let cut: String = flat.chars().take(limit).collect();
    format!("{}…", cut.trim_end())
}

pub fn build_report(input: &ReportInput<'_>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Writing Integrity Report");
    let _ = writeln!(
        output,
        "Generated for {} on {}",
        input.student_id,
        input.generated_at.format("%Y-%m-%d")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Baseline");
    let _ = writeln!(output, "- State: {}", describe_state(&input.state));

    match input.baseline {
        Some(baseline) => {
            let v = &baseline.aggregate_metrics.vocabulary;
            let s = &baseline.aggregate_metrics.style;
            let _ = writeln!(
                output,
                "- {} samples, confidence {:.2}, last updated {}",
                baseline.sample_count,
                baseline.confidence,
                baseline.last_updated.format("%Y-%m-%d")
            );
            let _ = writeln!(
                output,
                "- Reading grade {:.1}, {:.1} words per sentence, {:.0}% complex words",
                s.grade_level,
                s.average_sentence_length,
                v.complex_word_ratio * 100.0
            );
            if !v.common_words.is_empty() {
                let _ = writeln!(output, "- Characteristic words: {}", v.common_words.join(", "));
            }
        }
        None => {
            let _ = writeln!(output, "- No baseline established yet.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Latest Submission");
    match input.latest {
        Some(score) => {
            let _ = writeln!(
                output,
                "- Integrity risk {} (score {:.2})",
                score.analysis.risk_level, score.score
            );
            let _ = writeln!(
                output,
                "- Compared with earlier submissions; the baseline already includes this one."
            );
            let _ = writeln!(output, "- {}", score.analysis.explanation);
            if score.analysis.style_changes.is_empty() {
                let _ = writeln!(output, "- No style changes beyond the normal range.");
            }
            for change in &score.analysis.style_changes {
                let _ = writeln!(output, "- [{}] {}", change.severity, change.description);
            }
            for recommendation in &score.analysis.recommendations {
                let _ = writeln!(
                    output,
                    "- Action ({}): {}",
                    recommendation.priority, recommendation.action
                );
            }
        }
        None => {
            let _ = writeln!(output, "No submission long enough to score.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Trends");
    let moving: Vec<&(StyleDimension, TrendReport)> = input
        .trends
        .iter()
        .filter(|(_, report)| report.trend != Trend::Steady)
        .collect();
    if input.trends.iter().all(|(_, r)| r.confidence == 0.0) {
        let _ = writeln!(output, "Not enough submissions to estimate trends.");
    } else if moving.is_empty() {
        let _ = writeln!(output, "All tracked measures are steady.");
    } else {
        for (dimension, report) in moving {
            let _ = writeln!(
                output,
                "- {} is {} ({:+.3} per day, confidence {:.2}, {} segments)",
                dimension.label(),
                report.trend,
                report.rate,
                report.confidence,
                report.segments.len()
            );
        }
    }

    let mut recent = input.history.to_vec();
    recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Submissions");

    if recent.is_empty() {
        let _ = writeln!(output, "No submissions recorded.");
    } else {
        for sample in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {}: {}",
                sample.timestamp.format("%Y-%m-%d"),
                excerpt(&sample.text, 80)
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::integrity::{IntegrityInputs, IntegrityScorer};
    use crate::models::TrendPoint;
    use crate::trend::TrendAnalyzer;

    fn at(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap() + Duration::days(day)
    }

    #[test]
    fn empty_student_report_has_every_section() {
        let report = build_report(&ReportInput {
            student_id: "stu-9",
            generated_at: at(0),
            state: BaselineState::Uninitialized,
            baseline: None,
            trends: &[],
            history: &[],
            latest: None,
        });
        assert!(report
            .starts_with("# Writing Integrity Report\nGenerated for stu-9 on 2026-02-01"));
        assert!(report.contains("- State: no samples yet"));
        assert!(report.contains("No baseline established yet."));
        assert!(report.contains("Not enough submissions to estimate trends."));
        assert!(report.contains("No submissions recorded."));
    }

    #[test]
    fn latest_submission_notes_what_it_was_compared_with() {
        let score = IntegrityScorer::default().score(IntegrityInputs::default());
        let report = build_report(&ReportInput {
            student_id: "stu-2",
            generated_at: at(0),
            state: BaselineState::Established,
            baseline: None,
            trends: &[],
            history: &[],
            latest: Some(&score),
        });
        assert!(report.contains("- Integrity risk low (score 0.00)"));
        assert!(report.contains("the baseline already includes this one"));
        assert!(report.contains("- Action (low): No action needed."));
    }

    #[test]
    fn lists_moving_trends_and_newest_submissions_first() {
        let series: Vec<TrendPoint> = [6.0, 7.0, 8.5, 10.0]
            .iter()
            .enumerate()
            .map(|(i, &value)| TrendPoint {
                timestamp: at(i as i64 * 7),
                value,
            })
            .collect();
        let trends = vec![(StyleDimension::GradeLevel, TrendAnalyzer::default().analyze(&series))];
        let history = vec![
            WritingSample::new("stu-1", "An older essay about dogs.", at(0)),
            WritingSample::new("stu-1", "A newer essay about cats.", at(14)),
        ];
        let report = build_report(&ReportInput {
            student_id: "stu-1",
            generated_at: at(21),
            state: BaselineState::Building {
                samples: 2,
                required: 3,
            },
            baseline: None,
            trends: &trends,
            history: &history,
            latest: None,
        });
        assert!(report.contains("- State: building (2 of 3 samples)"));
        assert!(report.contains("- reading grade level is improving"));
        let newer = report.find("cats").unwrap();
        let older = report.find("dogs").unwrap();
        assert!(newer < older);
    }

    #[test]
    fn long_text_is_excerpted() {
        let text = "word ".repeat(40);
        let short = excerpt(&text, 20);
        assert!(short.ends_with('…'));
        assert!(short.chars().count() <= 21);
    }
}

//! Rendering of command results for the terminal.

use clap::ValueEnum;
use review_etl_core::{
    BuildReport, WindowAggregate,
    query::{EntityData, EntitySummary, HealthStatus, Page, SentimentSummary},
};
use serde::Serialize;
use snafu::ResultExt;
use tabled::{builder::Builder, settings::Style};

use crate::error::{CliResult, RenderJsonSnafu};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Print `value` in `format`; `render` produces the table form.
pub fn emit<T, F>(format: OutputFormat, value: &T, render: F) -> CliResult<()>
where
    T: Serialize + ?Sized,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Json => {
            let text = serde_json::to_string_pretty(value).context(RenderJsonSnafu)?;
            println!("{text}");
        }
        OutputFormat::Table => println!("{}", render(value)),
    }
    Ok(())
}

fn render_table(columns: &[&str], rows: &[Vec<String>]) -> String {
    if columns.is_empty() {
        return String::new();
    }

    let mut builder = Builder::default();
    builder.push_record(columns.iter().map(|c| c.to_string()));
    for row in rows {
        builder.push_record(row);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    table.to_string()
}

fn fields(pairs: Vec<(&str, String)>) -> String {
    let rows: Vec<Vec<String>> = pairs
        .into_iter()
        .map(|(k, v)| vec![k.to_string(), v])
        .collect();
    render_table(&["field", "value"], &rows)
}

fn num(v: f64) -> String {
    format!("{v:.3}")
}

fn opt_num(v: Option<f64>) -> String {
    v.map(num).unwrap_or_else(|| "-".to_string())
}

pub fn build_report(report: &BuildReport) -> String {
    let r = &report.rejections;
    let mut out = format!(
        "Published snapshot {}: {} of {} rows cleaned, {} rejected, {} duplicates, {} imputed; \
         {} entities, {} windows (elapsed_ms: {})\n",
        report.snapshot_version,
        r.cleaned,
        r.total_rows,
        r.rejected,
        r.duplicates,
        r.imputed,
        report.entity_count,
        report.aggregate_count,
        report.total_ms
    );
    if !report.pruned.is_empty() {
        out.push_str(&format!("Pruned snapshots: {:?}\n", report.pruned));
    }

    let steps: Vec<Vec<String>> = report
        .steps
        .iter()
        .map(|s| {
            let detail = s
                .fields
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            vec![s.name.clone(), s.elapsed_ms.to_string(), detail]
        })
        .collect();
    out.push_str(&render_table(&["step", "elapsed_ms", "detail"], &steps));

    if !r.rejected_by_reason.is_empty() {
        let reasons: Vec<Vec<String>> = r
            .rejected_by_reason
            .iter()
            .map(|(reason, n)| vec![reason.to_string(), n.to_string()])
            .collect();
        out.push('\n');
        out.push_str(&render_table(&["rejected", "rows"], &reasons));
    }
    out
}

fn summary_row(s: &EntitySummary) -> Vec<String> {
    vec![
        s.entity.clone(),
        s.name.clone(),
        s.record_count.to_string(),
        num(s.mean_rating),
        s.first_ts.to_string(),
        s.last_ts.to_string(),
    ]
}

const SUMMARY_COLUMNS: &[&str] = &["entity", "name", "records", "mean_rating", "first", "last"];

pub fn entity_page(page: &Page<EntitySummary>) -> String {
    let rows: Vec<_> = page.items.iter().map(summary_row).collect();
    let mut out = render_table(SUMMARY_COLUMNS, &rows);
    match &page.next_page {
        Some(token) => out.push_str(&format!("\nnext page: {token}")),
        None => out.push_str("\n(last page)"),
    }
    out
}

pub fn entity(data: &EntityData) -> String {
    let s = &data.summary;
    let mut out = fields(vec![
        ("entity", s.entity.clone()),
        ("name", s.name.clone()),
        ("records", s.record_count.to_string()),
        ("mean_rating", num(s.mean_rating)),
        ("first", s.first_ts.to_string()),
        ("last", s.last_ts.to_string()),
        ("latest_rating", num(s.latest_rating)),
        ("latest_rolling_mean", opt_num(s.latest_rolling_mean)),
    ]);

    let records: Vec<Vec<String>> = data
        .records
        .iter()
        .map(|r| {
            vec![
                r.ts.to_string(),
                num(r.rating),
                if r.rating_imputed { "yes" } else { "" }.to_string(),
                num(r.sentiment),
                r.text.clone(),
            ]
        })
        .collect();
    out.push('\n');
    out.push_str(&render_table(
        &["ts", "rating", "imputed", "sentiment", "text"],
        &records,
    ));
    out
}

pub fn aggregates(aggs: &[WindowAggregate]) -> String {
    if aggs.is_empty() {
        return "(no aggregates)".to_string();
    }
    let rows: Vec<Vec<String>> = aggs
        .iter()
        .map(|a| {
            vec![
                a.anchor.to_string(),
                a.window_start.to_string(),
                a.window_end.to_string(),
                num(a.mean),
                num(a.sentiment_mean),
                a.count.to_string(),
                a.partial.to_string(),
            ]
        })
        .collect();
    render_table(
        &["anchor", "start", "end", "mean", "sentiment", "count", "partial"],
        &rows,
    )
}

pub fn sentiment(s: &SentimentSummary) -> String {
    fields(vec![
        ("product_id", s.product_id.clone()),
        ("product_name", s.product_name.clone()),
        ("latest_sentiment_score", num(s.latest_sentiment_score)),
        ("rolling_average_sentiment", opt_num(s.rolling_average_sentiment)),
        ("latest_text_sentiment", num(s.latest_text_sentiment)),
        ("as_of", s.as_of.to_string()),
    ])
}

pub fn health(h: &HealthStatus) -> String {
    fields(vec![
        ("status", h.status.to_string()),
        ("snapshot_version", h.snapshot_version.to_string()),
        ("built_at", h.built_at.to_rfc3339()),
        ("entities", h.entity_count.to_string()),
        ("records", h.record_count.to_string()),
        ("aggregates", h.aggregate_count.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_columns_render_nothing() {
        assert_eq!(render_table(&[], &[]), "");
    }

    #[test]
    fn table_contains_every_cell() {
        let out = render_table(
            &["a", "b"],
            &[vec!["1".to_string(), "two".to_string()]],
        );
        for cell in ["a", "b", "1", "two"] {
            assert!(out.contains(cell), "{out}");
        }
    }

    #[test]
    fn last_page_is_marked() {
        let page: Page<EntitySummary> = Page {
            items: Vec::new(),
            next_page: None,
        };
        assert!(entity_page(&page).ends_with("(last page)"));

        let page: Page<EntitySummary> = Page {
            items: Vec::new(),
            next_page: Some("5031".to_string()),
        };
        assert!(entity_page(&page).contains("next page: 5031"));
    }

    #[test]
    fn missing_rolling_mean_is_a_dash() {
        assert_eq!(opt_num(None), "-");
        assert_eq!(opt_num(Some(4.5)), "4.500");
    }
}

//! Prompt builders for the advisory functions.
//!
//! Each prompt receives only finished numeric documents. Contexts are kept
//! compact: the totals block, threshold list and period count say enough
//! for commentary without shipping the full table.

use serde_json::json;

use crate::concentration::ConcentrationDoc;
use crate::schema::SchemaDoc;

fn concentration_context(doc: &ConcentrationDoc) -> String {
    let context = json!({
        "group_by": doc.group_by,
        "value_column": doc.value_column,
        "period_grain": doc.period_grain,
        "thresholds": doc.thresholds,
        "period_count": doc.by_period.len(),
        "totals": doc.totals,
        "warnings": doc.warnings,
    });
    serde_json::to_string(&context).unwrap_or_default()
}

fn schema_context(schema: &SchemaDoc) -> String {
    let columns: Vec<_> = schema
        .columns
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "role": c.role,
                "dtype": c.dtype,
                "null_rate": c.null_rate,
                "cardinality": c.cardinality,
            })
        })
        .collect();
    let context = json!({
        "columns": columns,
        "period_grain": schema.period_grain,
        "row_count": schema.metadata.row_count,
        "warnings": schema.warnings,
    });
    serde_json::to_string(&context).unwrap_or_default()
}

pub fn narrative_insights(doc: &ConcentrationDoc) -> String {
    format!(
        r#"You are a financial analyst. Given this concentration analysis, return JSON:
{{"executive_summary":"...","key_findings":["..."],"risk_indicators":["..."],"opportunities":["..."],"recommendations":["..."]}}

ANALYSIS: {}"#,
        concentration_context(doc)
    )
}

pub fn risk_flags(doc: &ConcentrationDoc) -> String {
    format!(
        r#"Assess concentration risk from this analysis. Return JSON:
{{"level":"low|medium|high","reasons":["..."],"score":0-100}}

ANALYSIS: {}"#,
        concentration_context(doc)
    )
}

pub fn data_quality_report(schema: &SchemaDoc) -> String {
    format!(
        r#"Review this dataset schema for data quality issues. Return JSON:
{{"issues":["..."],"recommendations":["..."],"severity_score":1-10}}

SCHEMA: {}"#,
        schema_context(schema)
    )
}

pub fn threshold_recommendations(doc: &ConcentrationDoc) -> String {
    format!(
        r#"Given this concentration analysis, suggest better thresholds. Return JSON:
{{"suggested":[ints 1-100],"rationale":"..."}}

ANALYSIS: {}"#,
        concentration_context(doc)
    )
}

pub fn schema_description(schema: &SchemaDoc) -> String {
    format!(
        r#"Describe this dataset for business users. Return JSON:
{{"column_descriptions":{{"col":"..."}},"business_context":"...","data_quality_notes":["..."],"recommended_analyses":["..."]}}

SCHEMA: {}"#,
        schema_context(schema)
    )
}

use anyhow::{bail, Result};
use std::str::FromStr;

use super::backend::StateBackend;

/// Output format for `stagehand query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFormat {
    Table,
    Json,
    Csv,
}

impl FromStr for QueryFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(QueryFormat::Table),
            "json" => Ok(QueryFormat::Json),
            "csv" => Ok(QueryFormat::Csv),
            other => bail!("unknown query format '{}' (expected table, json or csv)", other),
        }
    }
}

/// Rows of a read-only query with a stable column order.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Run a read-only statement against the state database.
pub async fn run_query(backend: &dyn StateBackend, sql: &str) -> Result<QueryResult> {
    let head = sql.trim_start().to_ascii_uppercase();
    if !(head.starts_with("SELECT") || head.starts_with("WITH")) {
        bail!("Only read-only SELECT queries are allowed against the state database.");
    }

    let mut rows = Vec::new();
    for value in backend.query_raw(sql).await? {
        if let serde_json::Value::Object(map) = value {
            rows.push(map);
        }
    }
    let columns = rows
        .first()
        .map(|row| row.keys().cloned().collect())
        .unwrap_or_default();
    Ok(QueryResult { columns, rows })
}

impl QueryResult {
    pub fn render(&self, format: QueryFormat) -> Result<String> {
        if self.rows.is_empty() {
            return Ok("No rows.".to_string());
        }
        match format {
            QueryFormat::Table => Ok(self.render_table()),
            QueryFormat::Json => Ok(serde_json::to_string_pretty(&self.rows)?),
            QueryFormat::Csv => Ok(self.render_csv()),
        }
    }

    fn cell(&self, row: &serde_json::Map<String, serde_json::Value>, column: &str) -> String {
        row.get(column).map(display_value).unwrap_or_default()
    }

    fn render_table(&self) -> String {
        let mut widths: Vec<usize> = self.columns.iter().map(String::len).collect();
        for row in &self.rows {
            for (i, column) in self.columns.iter().enumerate() {
                widths[i] = widths[i].max(self.cell(row, column).len());
            }
        }

        let mut out = String::new();
        let header: Vec<String> = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:w$}", c.to_uppercase(), w = *w))
            .collect();
        out.push_str(&header.join(" | "));
        out.push('\n');
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&rule.join("-+-"));
        out.push('\n');

        for row in &self.rows {
            let cells: Vec<String> = self
                .columns
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:w$}", self.cell(row, c), w = *w))
                .collect();
            out.push_str(cells.join(" | ").trim_end());
            out.push('\n');
        }
        out.push_str(&format!("\n({} rows)", self.rows.len()));
        out
    }

    fn render_csv(&self) -> String {
        let mut out = self.columns.join(",");
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|c| {
                    let val = self.cell(row, c);
                    if val.contains([',', '"', '\n']) {
                        format!("\"{}\"", val.replace('"', "\"\""))
                    } else {
                        val
                    }
                })
                .collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }
        out
    }
}

fn display_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result() -> QueryResult {
        let mut row = serde_json::Map::new();
        row.insert("id".into(), json!("a,b"));
        row.insert("n".into(), json!(3));
        QueryResult {
            columns: vec!["id".into(), "n".into()],
            rows: vec![row],
        }
    }

    #[test]
    fn csv_quotes_commas() {
        let out = result().render(QueryFormat::Csv).unwrap();
        assert_eq!(out, "id,n\n\"a,b\",3\n");
    }

    #[test]
    fn table_counts_rows() {
        let out = result().render(QueryFormat::Table).unwrap();
        assert!(out.starts_with("ID  | N"));
        assert!(out.ends_with("(1 rows)"));
    }

    #[test]
    fn parses_formats() {
        assert_eq!("JSON".parse::<QueryFormat>().unwrap(), QueryFormat::Json);
        assert!("xml".parse::<QueryFormat>().is_err());
    }
}

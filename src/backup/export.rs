use super::snapshot::SnapshotArtifact;
use super::{BackupError, BackupMetadata, BackupType, Result};
use serde_json::Value;
use tracing::debug;

/// Maximum rendered export size in bytes (50MB).
const MAX_EXPORT_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Sql,
    Csv,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "sql" => Ok(ExportFormat::Sql),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(BackupError::Validation(format!(
                "unsupported export format: {other} (expected json, sql, or csv)"
            ))),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Sql => "application/sql",
            ExportFormat::Csv => "text/csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Sql => "sql",
            ExportFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportPayload {
    pub content_type: &'static str,
    pub file_name: String,
    pub body: Vec<u8>,
}

/// Render a decoded artifact in the requested format.
pub fn render_export(
    metadata: &BackupMetadata,
    artifact: &SnapshotArtifact,
    format: ExportFormat,
) -> Result<ExportPayload> {
    debug!(backup_id = %metadata.id, format = ?format, "Rendering backup export");

    let body = match format {
        ExportFormat::Json => serde_json::to_vec_pretty(artifact)?,
        ExportFormat::Sql => render_sql(artifact).into_bytes(),
        ExportFormat::Csv => render_csv(artifact).into_bytes(),
    };
    if body.len() > MAX_EXPORT_SIZE {
        return Err(BackupError::Validation(format!(
            "export exceeds the {MAX_EXPORT_SIZE} byte limit"
        )));
    }

    Ok(ExportPayload {
        content_type: format.content_type(),
        file_name: format!("backup_{}.{}", metadata.id, format.extension()),
        body,
    })
}

fn render_sql(artifact: &SnapshotArtifact) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "-- taskvault backup export\n-- backup: {} ({})\n-- captured: {}\n\n",
        artifact.backup_id,
        artifact.backup_type.as_str(),
        artifact.created_at.to_rfc3339()
    ));

    for table in &artifact.tables {
        out.push_str(&format!("DROP TABLE IF EXISTS {};\n", ident(&table.name)));
        out.push_str(&table.create_sql);
        out.push_str(";\n");
        for row in &table.rows {
            out.push_str(&insert_statement(&table.name, &table.columns, row));
        }
        out.push('\n');
    }

    if artifact.backup_type == BackupType::Incremental {
        out.push_str("-- incremental delta, replay in order\n");
        for change in &artifact.changes {
            match change.op {
                super::snapshot::ChangeOp::Insert | super::snapshot::ChangeOp::Update => {
                    if let Some(Value::Object(row)) = &change.row {
                        let columns: Vec<String> = row.keys().cloned().collect();
                        out.push_str(&replace_statement(&change.table, &columns, row));
                    }
                }
                super::snapshot::ChangeOp::Delete => {
                    if let Some(pk) = change.pk.as_object() {
                        let conditions = pk
                            .iter()
                            .map(|(k, v)| format!("{} = {}", ident(k), sql_literal(v)))
                            .collect::<Vec<_>>()
                            .join(" AND ");
                        out.push_str(&format!(
                            "DELETE FROM {} WHERE {};\n",
                            ident(&change.table),
                            conditions
                        ));
                    }
                }
            }
        }
    }
    out
}

fn render_csv(artifact: &SnapshotArtifact) -> String {
    let mut out = String::new();
    for table in &artifact.tables {
        out.push_str(&format!("# table: {}\n", table.name));
        out.push_str(&table.columns.join(","));
        out.push('\n');
        for row in &table.rows {
            let cells = table
                .columns
                .iter()
                .map(|c| csv_cell(row.get(c).unwrap_or(&Value::Null)))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&cells);
            out.push('\n');
        }
        out.push('\n');
    }

    if !artifact.changes.is_empty() {
        out.push_str("# changes\nseq,table,op,pk,row\n");
        for change in &artifact.changes {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                change.seq,
                csv_escape(&change.table),
                change.op.as_str(),
                csv_escape(&change.pk.to_string()),
                csv_escape(
                    &change
                        .row
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_default()
                ),
            ));
        }
    }
    out
}

fn insert_statement(table: &str, columns: &[String], row: &Value) -> String {
    let values = columns
        .iter()
        .map(|c| sql_literal(row.get(c).unwrap_or(&Value::Null)))
        .collect::<Vec<_>>()
        .join(", ");
    let column_list = columns.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({});\n",
        ident(table),
        column_list,
        values
    )
}

fn replace_statement(
    table: &str,
    columns: &[String],
    row: &serde_json::Map<String, Value>,
) -> String {
    let values = columns
        .iter()
        .map(|c| sql_literal(row.get(c).unwrap_or(&Value::Null)))
        .collect::<Vec<_>>()
        .join(", ");
    let column_list = columns.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", ");
    format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({});\n",
        ident(table),
        column_list,
        values
    )
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Object(map) => {
            if let Some(Value::String(encoded)) = map.get("$blob") {
                format!("X'{encoded}'")
            } else {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => csv_escape(s),
        other => csv_escape(&other.to_string()),
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::snapshot::{TableSnapshot, ARTIFACT_FORMAT_VERSION};
    use crate::backup::TRIGGER_MANUAL;
    use chrono::Utc;

    fn sample_artifact() -> (BackupMetadata, SnapshotArtifact) {
        let meta = BackupMetadata::new_pending(
            BackupType::Full,
            "export-me".to_string(),
            None,
            None,
            false,
            TRIGGER_MANUAL.to_string(),
        );
        let artifact = SnapshotArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            backup_id: meta.id.clone(),
            backup_type: BackupType::Full,
            created_at: Utc::now(),
            snapshot_seq: 7,
            delta_start_seq: None,
            tables: vec![TableSnapshot {
                name: "tasks".to_string(),
                create_sql: "CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT)".to_string(),
                columns: vec!["id".to_string(), "title".to_string()],
                rows: vec![serde_json::json!({"id": "t1", "title": "it's done, really"})],
            }],
            changes: Vec::new(),
        };
        (meta, artifact)
    }

    #[test]
    fn test_unknown_format_is_validation_error() {
        assert!(matches!(
            ExportFormat::parse("xml"),
            Err(BackupError::Validation(_))
        ));
        assert_eq!(ExportFormat::parse("SQL").unwrap(), ExportFormat::Sql);
    }

    #[test]
    fn test_json_export_round_trips() {
        let (meta, artifact) = sample_artifact();
        let payload = render_export(&meta, &artifact, ExportFormat::Json).unwrap();
        assert_eq!(payload.content_type, "application/json");
        let parsed: SnapshotArtifact = serde_json::from_slice(&payload.body).unwrap();
        assert_eq!(parsed.backup_id, meta.id);
    }

    #[test]
    fn test_sql_export_escapes_quotes() {
        let (meta, artifact) = sample_artifact();
        let payload = render_export(&meta, &artifact, ExportFormat::Sql).unwrap();
        let sql = String::from_utf8(payload.body).unwrap();
        assert!(sql.contains("CREATE TABLE tasks"));
        assert!(sql.contains("'it''s done, really'"));
        assert!(sql.starts_with("-- taskvault backup export"));
    }

    #[test]
    fn test_csv_export_has_header_and_rows() {
        let (meta, artifact) = sample_artifact();
        let payload = render_export(&meta, &artifact, ExportFormat::Csv).unwrap();
        let csv = String::from_utf8(payload.body).unwrap();
        assert!(csv.contains("# table: tasks"));
        assert!(csv.contains("id,title"));
        assert!(csv.contains("\"it's done, really\""));
    }

    #[test]
    fn test_sql_literals() {
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&serde_json::json!(5)), "5");
        assert_eq!(sql_literal(&serde_json::json!(true)), "1");
        assert_eq!(sql_literal(&serde_json::json!("a'b")), "'a''b'");
        assert_eq!(
            sql_literal(&serde_json::json!({"$blob": "deadbeef"})),
            "X'deadbeef'"
        );
    }
}

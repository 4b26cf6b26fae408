use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;
use tollgate_core::readiness::{self, parse_date};

pub fn run(root: &Path, date: Option<&str>, json: bool) -> anyhow::Result<i32> {
    let date = match date {
        Some(raw) => parse_date(raw)?,
        None => chrono::Utc::now().date_naive(),
    };
    let (snapshot, rows) = readiness::reconcile(root, date)
        .with_context(|| format!("failed to reconcile {}", root.display()))?;

    if json {
        print_json(&serde_json::json!({
            "snapshot": snapshot,
            "summary": readiness::status_counts(&rows),
            "tickets": rows,
        }))?;
        return Ok(0);
    }

    if !rows.is_empty() {
        let table = rows
            .iter()
            .map(|row| {
                vec![
                    row.ticket_id.clone(),
                    row.effective_status.to_string(),
                    row.declared_status.clone(),
                    row.critical_path.clone(),
                    row.owner_agent.clone(),
                    row.conflicts.len().to_string(),
                ]
            })
            .collect();
        print_table(
            &["TICKET", "EFFECTIVE", "DECLARED", "CRITICAL", "OWNER", "CONFLICTS"],
            table,
        );
        println!();
    }
    println!("{}", readiness::summary_line(&rows, &snapshot));
    Ok(0)
}

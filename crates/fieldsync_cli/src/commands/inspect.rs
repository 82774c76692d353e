//! Inspect command implementation.

use fieldsync_server::{open_pool, tenant_summaries, ServerConfig, TenantSummary};
use serde::Serialize;

/// Row counts for one tenant.
#[derive(Debug, Serialize)]
pub struct TenantReport {
    /// Tenant ID.
    pub location_id: String,
    /// Live tickets.
    pub tickets: i64,
    /// Soft-deleted tickets.
    pub deleted_tickets: i64,
    /// Live comments.
    pub comments: i64,
    /// Live attachments.
    pub attachments: i64,
    /// Payments.
    pub payments: i64,
    /// Highest ticket number handed out.
    pub last_sequence: i64,
}

impl From<TenantSummary> for TenantReport {
    fn from(summary: TenantSummary) -> Self {
        Self {
            location_id: summary.location_id,
            tickets: summary.tickets,
            deleted_tickets: summary.deleted_tickets,
            comments: summary.comments,
            attachments: summary.attachments,
            payments: summary.payments,
            last_sequence: summary.last_sequence,
        }
    }
}

/// Runs the inspect command.
pub async fn run(config: &ServerConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let pool = open_pool(config).await?;
    let reports: Vec<TenantReport> = tenant_summaries(&pool)
        .await?
        .into_iter()
        .map(TenantReport::from)
        .collect();
    pool.close().await;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        _ => print_text_output(&config.database_url, &reports),
    }
    Ok(())
}

fn print_text_output(database: &str, reports: &[TenantReport]) {
    println!("FieldSync Database: {database}");
    println!("==================");
    if reports.is_empty() {
        println!("  No tenants.");
        return;
    }
    println!(
        "  {:<24} {:>8} {:>8} {:>9} {:>12} {:>9} {:>9}",
        "location", "tickets", "deleted", "comments", "attachments", "payments", "last #"
    );
    for r in reports {
        println!(
            "  {:<24} {:>8} {:>8} {:>9} {:>12} {:>9} {:>9}",
            r.location_id,
            r.tickets,
            r.deleted_tickets,
            r.comments,
            r.attachments,
            r.payments,
            r.last_sequence
        );
    }
}

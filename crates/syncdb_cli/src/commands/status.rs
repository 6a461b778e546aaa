//! Status command implementation.

use serde::Serialize;
use std::path::Path;
use syncdb_core::{ClientId, MAX_CLIENTS};
use syncdb_protocol::{ClientStatus, ResultCode};
use syncdb_server::SyncDbClient;

/// One registered client.
#[derive(Debug, Serialize)]
pub struct ClientReport {
    /// Client id.
    pub id: u16,
    /// Process id.
    pub pid: u32,
    /// Description given at registration.
    pub description: String,
    /// Commands processed.
    pub commands: u64,
    /// Change notifications sent.
    pub notifications: u64,
    /// Purge notifications sent.
    pub purges: u64,
    /// True for the client issuing this query.
    pub this_query: bool,
}

impl ClientReport {
    fn new(status: ClientStatus, own: ClientId) -> Self {
        Self {
            id: status.client_id.as_u16(),
            pid: status.pid,
            description: status.description,
            commands: status.commands,
            notifications: status.notifications,
            purges: status.purges,
            this_query: status.client_id == own,
        }
    }
}

/// Runs the status command.
pub fn run(run_dir: &Path, target: Option<u16>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = super::connect(run_dir)?;
    let reports = match target {
        Some(id) => vec![ClientReport::new(
            client.client_status(ClientId::new(id))?,
            client.id(),
        )],
        None => collect(&client)?,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&reports)?),
        _ => print_text_output(&reports),
    }
    Ok(())
}

/// Probes every client slot; unused slots answer NotFound.
fn collect(client: &SyncDbClient) -> Result<Vec<ClientReport>, Box<dyn std::error::Error>> {
    let mut reports = Vec::new();
    for id in 0..MAX_CLIENTS as u16 {
        match client.client_status(ClientId::new(id)) {
            Ok(status) => reports.push(ClientReport::new(status, client.id())),
            Err(err) if err.result_code() == Some(ResultCode::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(reports)
}

fn print_text_output(reports: &[ClientReport]) {
    println!("SyncDB Clients");
    println!("==============");
    println!();
    for report in reports {
        println!(
            "  [{}] pid {} \"{}\"{}",
            report.id,
            report.pid,
            report.description,
            if report.this_query { " (this query)" } else { "" }
        );
        println!(
            "      commands {}, notifications {}, purges {}",
            report.commands, report.notifications, report.purges
        );
    }
    println!();
    println!("{} registered", reports.len());
}

//! Table status command implementation.

use serde::Serialize;
use std::path::Path;
use syncdb_core::{TableFlags, TableName, TableStatus};

/// Table description as printed.
#[derive(Debug, Serialize)]
pub struct TableReport {
    /// Table name.
    pub name: String,
    /// Kind and geometry, plus this client's pending events.
    #[serde(flatten)]
    pub status: TableStatus,
    /// Creation flags by name.
    pub flag_names: Vec<&'static str>,
}

const FLAG_NAMES: [(TableFlags, &str); 5] = [
    (TableFlags::STORABLE, "storable"),
    (TableFlags::NVRAM, "nvram"),
    (TableFlags::NSF, "nsf"),
    (TableFlags::LOAD_FROM_FILE, "load-from-file"),
    (TableFlags::REJECT_IF_EXISTS, "reject-if-exists"),
];

fn flag_names(flags: TableFlags) -> Vec<&'static str> {
    FLAG_NAMES
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| *name)
        .collect()
}

/// Runs the table-status command.
pub fn run(run_dir: &Path, table: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let name = TableName::new(table)?;
    let client = super::connect(run_dir)?;
    let status = client.table_status(name)?;
    let report = TableReport {
        name: name.to_string(),
        flag_names: flag_names(status.flags),
        status,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &TableReport) {
    let status = &report.status;
    println!("SyncDB Table {}", report.name);
    println!("==========================");
    println!();
    println!("Kind:    {}", status.kind.as_str());
    println!("Flags:   {}", report.flag_names.join(", "));
    println!();
    println!("Geometry:");
    println!("  Record size:  {} bytes", status.record_size);
    println!("  Key size:     {} bytes", status.key_size);
    println!("  Capacity:     {}", status.max_records);
    println!("  Live cap:     {}", status.max_non_deleted_records);
    println!();
    println!("Records:");
    println!("  Nodes:        {}", status.num_records);
    println!("  Live:         {}", status.num_non_deleted_records);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_named_in_order() {
        let flags = TableFlags::NSF | TableFlags::STORABLE;
        assert_eq!(flag_names(flags), vec!["storable", "nsf"]);
        assert!(flag_names(TableFlags::NONE).is_empty());
    }
}

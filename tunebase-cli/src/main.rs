use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tunebase_core::{
    AuditFilter, AuthDecision, BulkSelector, CatalogCore, CatalogSnapshot, Collection, DataType,
    EntityStore, FindOptions, MemoryStore, PercentOp, ScopeLevel, UpdatePolicy,
};

#[derive(Parser)]
#[command(name = "tunebase")]
#[command(about = "TuneBase CLI - catalog administration over a JSON-backed catalog")]
#[command(version)]
struct Cli {
    /// Catalog file (the whole dataset as one JSON document)
    #[arg(long, global = true, default_value = "catalog.json")]
    db: PathBuf,

    /// Actor stamped into the audit trail
    #[arg(long, global = true, default_value = "cli-admin")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a catalog snapshot into the catalog file
    Import {
        /// JSON file to import
        file: PathBuf,
        /// Renumber all ids dense before writing
        #[arg(long)]
        renumber: bool,
    },
    /// Export the catalog to a JSON file
    Export {
        /// Output JSON file
        file: PathBuf,
    },
    /// Cascade-delete a document and its whole subtree
    Delete {
        /// Collection (brand, group, model, type, engine, stage)
        collection: String,
        id: i64,
    },
    /// Move a model, type or engine under a new parent
    Move {
        /// Collection of the moved item
        collection: String,
        id: i64,
        /// Collection of the new parent
        parent: String,
        parent_id: i64,
    },
    /// Bulk-update stage prices, power or torque over a subtree
    Bulk {
        /// Scope level: all, brand, model, generation, engine
        level: String,
        /// Target id (omit for level=all)
        #[arg(long)]
        target: Option<i64>,
        /// Optional group filter (brand level only)
        #[arg(long)]
        group: Option<i64>,
        /// Field: price, power, torque
        #[arg(long, default_value = "price")]
        data: String,
        /// Policy: fixed, percentage, absolute, stage-plus
        #[arg(long, default_value = "fixed")]
        mode: String,
        /// Value (fixed), percentage (percentage/stage-plus), unused for absolute
        #[arg(long)]
        value: Option<f64>,
        /// Percentage operation: increase, decrease, set
        #[arg(long, default_value = "increase")]
        op: String,
        /// Absolute mode: JSON map of normalized stage name to value,
        /// e.g. '{"stage1plus": 700}'
        #[arg(long)]
        values: Option<String>,
    },
    /// Show the audit history of one document
    History {
        collection: String,
        id: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the newest audit entries across the catalog
    Recent {
        #[arg(long)]
        collection: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Roll a document back to the state before a given audit version
    Rollback {
        collection: String,
        id: i64,
        version: u64,
    },
    /// Renumber all ids dense and rewrite every foreign key
    Renumber,
    /// Print the ancestor path of a document
    Path {
        collection: String,
        id: i64,
    },
}

fn main() -> Result<()> {
    tunebase_core::init_from_env();
    let cli = Cli::parse();
    let auth = AuthDecision::allow(&cli.actor);

    match cli.command {
        Commands::Import { file, renumber } => import_catalog(&file, &cli.db, renumber),
        Commands::Export { file } => export_catalog(&cli.db, &file),
        Commands::Delete { collection, id } => {
            let catalog = open_catalog(&cli.db)?;
            let report = catalog
                .delete_cascade(parse_collection(&collection)?, id, &auth)
                .context("cascade delete failed")?;
            save_catalog(&catalog, &cli.db)?;
            println!("Deleted {} documents ({})", report.total(), report);
            Ok(())
        }
        Commands::Move { collection, id, parent, parent_id } => {
            let catalog = open_catalog(&cli.db)?;
            let moved = catalog
                .move_item(
                    parse_collection(&collection)?,
                    id,
                    parse_collection(&parent)?,
                    parent_id,
                    &auth,
                )
                .context("move failed")?;
            save_catalog(&catalog, &cli.db)?;
            println!("{}", serde_json::to_string_pretty(&moved)?);
            Ok(())
        }
        Commands::Bulk { level, target, group, data, mode, value, op, values } => {
            let catalog = open_catalog(&cli.db)?;
            let selector = BulkSelector {
                level: ScopeLevel::parse(&level)
                    .with_context(|| format!("unknown level '{}'", level))?,
                target_id: target,
                group_id: group,
            };
            let data_type = DataType::parse(&data)
                .with_context(|| format!("unknown data type '{}'", data))?;
            let policy = build_policy(&mode, value, &op, values.as_deref())?;

            let result = catalog
                .bulk_update(selector, data_type, &policy, &auth)
                .context("bulk update failed")?;
            save_catalog(&catalog, &cli.db)?;
            println!(
                "Updated {}/{} stages across {} engines",
                result.updated_count, result.total_stages, result.engine_count
            );
            Ok(())
        }
        Commands::History { collection, id, limit } => {
            let catalog = open_catalog(&cli.db)?;
            let entries = catalog.history(parse_collection(&collection)?, id, limit)?;
            if entries.is_empty() {
                println!("No audit entries");
            }
            for entry in entries {
                println!(
                    "v{} {} {:?} by {} at {}",
                    entry.version,
                    entry.collection,
                    entry.action,
                    entry.changed_by,
                    entry.changed_at
                );
                if let Some(changes) = &entry.changes {
                    for (field, change) in changes {
                        println!("    {}: {} -> {}", field, change.from, change.to);
                    }
                }
            }
            Ok(())
        }
        Commands::Recent { collection, limit } => {
            let catalog = open_catalog(&cli.db)?;
            let filter = AuditFilter {
                collection: collection.as_deref().map(parse_collection).transpose()?,
                ..Default::default()
            };
            for entry in catalog.recent_logs(&filter, limit)? {
                println!(
                    "{} v{} {} {} {:?} by {}",
                    entry.changed_at,
                    entry.version,
                    entry.collection,
                    entry.document_id,
                    entry.action,
                    entry.changed_by
                );
            }
            Ok(())
        }
        Commands::Rollback { collection, id, version } => {
            let catalog = open_catalog(&cli.db)?;
            let entry = catalog
                .rollback(parse_collection(&collection)?, id, version, &auth)
                .context("rollback failed")?;
            save_catalog(&catalog, &cli.db)?;
            println!("Rolled back to v{}; recorded as v{}", version, entry.version);
            Ok(())
        }
        Commands::Renumber => {
            let mut snapshot = CatalogSnapshot::load(&cli.db)
                .with_context(|| format!("Failed to read catalog: {}", cli.db.display()))?;
            let report = snapshot.renumber();
            snapshot.save(&cli.db)?;
            println!("Renumbered {} documents, pruned {}", report.remapped, report.pruned);
            Ok(())
        }
        Commands::Path { collection, id } => {
            let catalog = open_catalog(&cli.db)?;
            println!("{}", catalog.resolve_display_path(parse_collection(&collection)?, id)?);
            Ok(())
        }
    }
}

fn parse_collection(name: &str) -> Result<Collection> {
    Collection::parse(name).with_context(|| format!("unknown collection '{}'", name))
}

fn build_policy(mode: &str, value: Option<f64>, op: &str, values: Option<&str>) -> Result<UpdatePolicy> {
    match mode {
        "fixed" => Ok(UpdatePolicy::Fixed {
            value: value.context("--value is required for fixed mode")?,
        }),
        "percentage" => {
            let operation = match op {
                "increase" => PercentOp::Increase,
                "decrease" => PercentOp::Decrease,
                "set" => PercentOp::Set,
                other => bail!("unknown percentage operation '{}'", other),
            };
            Ok(UpdatePolicy::Percentage {
                operation,
                percentage: value.context("--value is required for percentage mode")?,
            })
        }
        "absolute" => {
            let raw = values.context("--values is required for absolute mode")?;
            let map: HashMap<String, f64> =
                serde_json::from_str(raw).context("--values must be a JSON object of numbers")?;
            Ok(UpdatePolicy::Absolute { values: map })
        }
        "stage-plus" => Ok(UpdatePolicy::StagePlus {
            percentage: value.context("--value is required for stage-plus mode")?,
        }),
        other => bail!("unknown bulk mode '{}'", other),
    }
}

// ========== CATALOG FILE HANDLING ==========
// The catalog file holds the five collections; the audit trail lives next
// to it in <catalog>.audit.json so history survives between invocations.

fn audit_path(db: &Path) -> PathBuf {
    let mut name = db.file_stem().unwrap_or_default().to_os_string();
    name.push(".audit.json");
    db.with_file_name(name)
}

fn open_catalog(db: &Path) -> Result<CatalogCore<MemoryStore>> {
    let snapshot = CatalogSnapshot::load(db)
        .with_context(|| format!("Failed to read catalog: {}", db.display()))?;

    let mut store = MemoryStore::new();
    snapshot
        .import_into(&mut store)
        .context("catalog file is not internally consistent")?;

    // Reload the persisted audit trail, if any
    let audit_file = audit_path(db);
    if audit_file.exists() {
        let raw = fs::read_to_string(&audit_file)
            .with_context(|| format!("Failed to read audit trail: {}", audit_file.display()))?;
        let entries: Vec<Value> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid audit trail: {}", audit_file.display()))?;
        for entry in entries {
            store.insert(Collection::AuditLogs, entry)?;
        }
    }

    Ok(CatalogCore::new(store))
}

fn save_catalog(catalog: &CatalogCore<MemoryStore>, db: &Path) -> Result<()> {
    let snapshot = catalog.export_snapshot()?;
    snapshot
        .save(db)
        .with_context(|| format!("Failed to write catalog: {}", db.display()))?;

    let store = catalog.store();
    let store = store.read();
    let mut entries = store.find_by(
        Collection::AuditLogs,
        &serde_json::json!({}),
        &FindOptions::default(),
    )?;
    // the synthetic store id is not part of the audit contract
    for entry in &mut entries {
        if let Some(obj) = entry.as_object_mut() {
            obj.remove("id");
        }
    }
    let audit_file = audit_path(db);
    fs::write(&audit_file, serde_json::to_string_pretty(&entries)?)
        .with_context(|| format!("Failed to write audit trail: {}", audit_file.display()))?;
    Ok(())
}

fn import_catalog(file: &Path, db: &Path, renumber: bool) -> Result<()> {
    let mut snapshot = CatalogSnapshot::load(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;

    // validate referential consistency by loading into a store
    let mut probe = MemoryStore::new();
    snapshot
        .import_into(&mut probe)
        .with_context(|| format!("Snapshot is not importable: {}", file.display()))?;

    if renumber {
        let report = snapshot.renumber();
        println!("Renumbered {} documents, pruned {}", report.remapped, report.pruned);
    }
    snapshot.save(db)?;
    let total = snapshot.brands.len()
        + snapshot.groups.len()
        + snapshot.models.len()
        + snapshot.types.len()
        + snapshot.engines.len()
        + snapshot.stages.len();
    println!("Imported {} documents into {}", total, db.display());
    Ok(())
}

fn export_catalog(db: &Path, file: &Path) -> Result<()> {
    let snapshot = CatalogSnapshot::load(db)
        .with_context(|| format!("Failed to read catalog: {}", db.display()))?;
    snapshot
        .save(file)
        .with_context(|| format!("Failed to write file: {}", file.display()))?;
    println!("Exported catalog to {}", file.display());
    Ok(())
}

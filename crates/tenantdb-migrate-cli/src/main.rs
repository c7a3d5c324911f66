//! tenantdb-migrate CLI - schema and tenant management for a multi-tenant
//! clinical data store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use tenantdb_migrate::{
    admin_model, data_model, Config, EngineOptions, MemoryAdapter, MigrateError, MigrationEngine,
    PgAdapter, SchemaExecutor, TenantManager,
};

#[derive(Parser)]
#[command(name = "tenantdb-migrate")]
#[command(about = "Schema migration and tenant management for a multi-tenant clinical data store")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the admin and data schemas to the current version
    Apply {
        /// Allow destructive steps against tables that hold rows
        #[arg(long)]
        force: bool,

        /// Print the SQL that would run, without touching the database
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the recorded version of the admin and data schemas
    Status,

    /// Drop every managed object from the data schema
    Teardown {
        /// Allow dropping tables that hold rows
        #[arg(long)]
        force: bool,
    },

    /// Provision a new tenant and print its one-time key
    ProvisionTenant {
        /// Tenant name, unique across the deployment
        #[arg(long)]
        name: String,
    },

    /// Issue an additional key for a tenant (rotation step one)
    IssueKey {
        #[arg(long)]
        tenant_id: i64,
    },

    /// Revoke a tenant key (rotation step two)
    RevokeKey {
        #[arg(long)]
        tenant_id: i64,

        #[arg(long)]
        key_id: i64,
    },

    /// Block writes for a tenant
    FreezeTenant {
        #[arg(long)]
        tenant_id: i64,
    },

    /// Resume a frozen tenant
    UnfreezeTenant {
        #[arg(long)]
        tenant_id: i64,
    },

    /// Remove a frozen tenant's partitions
    DropTenant {
        #[arg(long)]
        tenant_id: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let admin_schema = config.schema.admin_schema.clone();
    let data_schema = config.schema.data_schema.clone();

    match cli.command {
        Commands::Apply { force, dry_run } => {
            // Dry runs execute against the in-memory adapter, which records
            // the SQL a live run would apply.
            let mut memory = None;
            let executor: Arc<dyn SchemaExecutor> = if dry_run {
                let adapter = Arc::new(MemoryAdapter::new());
                memory = Some(Arc::clone(&adapter));
                adapter
            } else {
                Arc::new(PgAdapter::connect(&config.database)?)
            };
            let engine = engine(&config, executor, force);

            let admin_result = engine.apply(&admin_model(&admin_schema)?, &admin_schema).await?;
            let data_result = engine.apply(&data_model(&data_schema)?, &data_schema).await?;

            if let Some(memory) = memory {
                for sql in memory.executed_sql() {
                    println!("{sql};");
                }
                return Ok(());
            }

            if cli.output_json {
                println!("{}", admin_result.to_json()?);
                println!("{}", data_result.to_json()?);
            } else {
                println!("Apply completed!");
                for result in [&admin_result, &data_result] {
                    println!(
                        "  {}: version {} (created: {}, migrated: {}, unchanged: {}) in {}ms",
                        result.schema,
                        result.new_version,
                        result.objects_created,
                        result.objects_migrated,
                        result.objects_unchanged,
                        result.elapsed_ms
                    );
                }
            }
        }

        Commands::Status => {
            let executor: Arc<dyn SchemaExecutor> =
                Arc::new(PgAdapter::connect(&config.database)?);
            executor.ensure_control_table(&admin_schema).await?;
            executor.ensure_version_table(&admin_schema).await?;
            executor.ensure_version_table(&data_schema).await?;
            let admin_version = executor.read_version(&admin_schema).await?;
            let data_version = executor.read_version(&data_schema).await?;
            let lease = executor.read_lease(&admin_schema, &data_schema).await?;

            if cli.output_json {
                let status = serde_json::json!({
                    "admin_schema": { "name": admin_schema, "version": admin_version },
                    "data_schema": { "name": data_schema, "version": data_version },
                    "lease_holder": lease.as_ref().map(|l| l.owner_host.clone()),
                    "config_hash": config.hash(),
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Schema status:");
                println!("  {}: {}", admin_schema, version_str(admin_version));
                println!("  {}: {}", data_schema, version_str(data_version));
                match lease {
                    Some(l) => println!("  Lease: held by {} until {}", l.owner_host, l.lease_until),
                    None => println!("  Lease: free"),
                }
            }
        }

        Commands::Teardown { force } => {
            let executor: Arc<dyn SchemaExecutor> =
                Arc::new(PgAdapter::connect(&config.database)?);
            let engine = engine(&config, executor, force);
            let result = engine.drop_all(&data_model(&data_schema)?, &data_schema).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!(
                    "Teardown completed: dropped {} objects from {} in {}ms",
                    result.objects_dropped, result.schema, result.elapsed_ms
                );
            }
        }

        Commands::ProvisionTenant { name } => {
            let manager = tenant_manager(&config)?;
            let provisioned = manager.provision(&data_model(&data_schema)?, &name).await?;

            if cli.output_json {
                let out = serde_json::json!({
                    "tenant_id": provisioned.record.tenant_id,
                    "tenant_name": provisioned.record.tenant_name,
                    "key_id": provisioned.key_id,
                    "secret": provisioned.secret,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Tenant provisioned!");
                println!("  Id: {}", provisioned.record.tenant_id);
                println!("  Name: {}", provisioned.record.tenant_name);
                println!("  Key id: {}", provisioned.key_id);
                println!("  Secret (shown once, store it now): {}", provisioned.secret);
            }
        }

        Commands::IssueKey { tenant_id } => {
            let manager = tenant_manager(&config)?;
            let (key_id, secret) = manager.issue_key(tenant_id).await?;

            if cli.output_json {
                let out = serde_json::json!({ "key_id": key_id, "secret": secret });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Key issued!");
                println!("  Key id: {}", key_id);
                println!("  Secret (shown once, store it now): {}", secret);
            }
        }

        Commands::RevokeKey { tenant_id, key_id } => {
            let manager = tenant_manager(&config)?;
            if manager.revoke_key(tenant_id, key_id).await? {
                println!("Key {} revoked", key_id);
            } else {
                println!("Key {} was not found", key_id);
            }
        }

        Commands::FreezeTenant { tenant_id } => {
            tenant_manager(&config)?.freeze(tenant_id).await?;
            println!("Tenant {} frozen", tenant_id);
        }

        Commands::UnfreezeTenant { tenant_id } => {
            tenant_manager(&config)?.unfreeze(tenant_id).await?;
            println!("Tenant {} unfrozen", tenant_id);
        }

        Commands::DropTenant { tenant_id } => {
            let manager = tenant_manager(&config)?;
            manager.drop_tenant(&data_model(&data_schema)?, tenant_id).await?;
            println!("Tenant {} dropped", tenant_id);
        }
    }

    Ok(())
}

fn engine(config: &Config, executor: Arc<dyn SchemaExecutor>, force: bool) -> MigrationEngine {
    MigrationEngine::new(
        executor,
        config.schema.admin_schema.clone(),
        EngineOptions {
            force,
            lease_ttl: config.lease.ttl(),
            retry: config.lease.retry_policy(),
        },
    )
}

fn tenant_manager(config: &Config) -> Result<TenantManager, MigrateError> {
    let executor: Arc<dyn SchemaExecutor> = Arc::new(PgAdapter::connect(&config.database)?);
    Ok(TenantManager::new(
        executor,
        config.schema.admin_schema.clone(),
    ))
}

fn version_str(version: Option<i32>) -> String {
    match version {
        Some(v) => format!("version {v}"),
        None => "not installed".to_string(),
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

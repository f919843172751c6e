use ocsyncd::config::SyncConfig;
use ocsyncd::sync::index::{FileRecord, IndexStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Offline(String),
    Conflicts(String),
    /// Old storage directory whose stored paths move under the configured root.
    MoveStorage(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Help);
    };
    let mode = match command.as_str() {
        "--help" | "-h" => CliMode::Help,
        "offline" | "conflicts" => {
            let account = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("{command} requires an account name"))?;
            if command == "offline" {
                CliMode::Offline(account)
            } else {
                CliMode::Conflicts(account)
            }
        }
        "move-storage" => {
            let old_dir = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("move-storage requires the old storage directory"))?;
            CliMode::MoveStorage(old_dir)
        }
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn print_records(records: &[FileRecord]) -> anyhow::Result<()> {
    for record in records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ocsyncd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: ocsyncd <command> <argument>");
        println!("  offline <account>        List files marked available offline");
        println!("  conflicts <account>      List files with a conflict marker");
        println!("  move-storage <old_dir>   Point stored paths at OCSYNC_STORAGE_DIR");
        return Ok(());
    }

    let config = SyncConfig::from_env()?;
    info!(database = %config.database_path.display(), "opening index");
    let index = IndexStore::open(&config.database_path).await?;
    match mode {
        CliMode::Offline(account) => print_records(&index.list_available_offline(&account).await?),
        CliMode::Conflicts(account) => print_records(&index.list_in_conflict(&account).await?),
        CliMode::MoveStorage(old_dir) => {
            let new_dir = config.storage_root.to_string_lossy();
            let updated = index.replace_storage_root(&old_dir, &new_dir).await?;
            info!(from = %old_dir, to = %new_dir, updated, "storage paths rewritten");
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use draftsync::cache::{CacheStorage, SqliteStorage};
use draftsync::config::Config;

#[derive(Parser, Debug)]
#[command(name = "draftsync")]
#[command(about = "Inspect and manage the local draft cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/draftsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Local cache maintenance
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Print the effective configuration
  Config,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Count cached entities and lists
  Stats,
  /// Print a cached entity as JSON
  Show { entity_type: String, id: String },
  /// Delete cached entities
  Forget {
    entity_type: String,
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Wipe the whole cache
  Clear,
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = draftsync::logging::init(&config.logging)?;

  match args.command {
    Command::Config => {
      let yaml =
        serde_yaml::to_string(&config).map_err(|e| eyre!("Failed to render config: {}", e))?;
      print!("{}", yaml);
    }
    Command::Cache { action } => run_cache(&config, action)?,
  }

  Ok(())
}

fn run_cache(config: &Config, action: CacheAction) -> Result<()> {
  if !config.cache.enabled {
    println!("Local cache is disabled; nothing is kept between sessions.");
    return Ok(());
  }

  let storage = SqliteStorage::open(config.cache.path.as_deref())?;

  match action {
    CacheAction::Stats => {
      let stats = storage.stats()?;
      if stats.entities.is_empty() {
        println!("entities: none");
      }
      for (entity_type, count) in &stats.entities {
        println!("{:<12} {}", entity_type, count);
      }
      println!("{:<12} {}", "lists", stats.lists);
    }
    CacheAction::Show { entity_type, id } => match storage.get_raw(&entity_type, &id)? {
      Some(value) => {
        let json = serde_json::to_string_pretty(&value)
          .map_err(|e| eyre!("Failed to render entity: {}", e))?;
        println!("{}", json);
      }
      None => return Err(eyre!("No cached {} with id {}", entity_type, id)),
    },
    CacheAction::Forget { entity_type, ids } => {
      let removed = storage.delete_entities(&entity_type, &ids)?;
      println!("Removed {} of {} cached {} entries", removed, ids.len(), entity_type);
    }
    CacheAction::Clear => {
      storage.clear()?;
      println!("Local cache cleared");
    }
  }

  Ok(())
}

#![cfg_attr(test, allow(clippy::expect_used))]
use std::process::ExitCode;

use pagetree::btree::{BTreeError, Tree};
use pagetree::config::CliConfig;
use pagetree::storage::FilePageStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: pagetree <command>

commands:
  insert <key> <value>   add an entry (duplicates are kept)
  get <key>              print the first value for key
  get-all <key>          print every value for key
  update <key> <value>   replace every value for key
  delete <key>           remove every entry for key
  scan [from]            print entries in key order, starting at from
  scan-rev               print entries in reverse key order
  stats                  print the shape of the tree";

/// A parsed command line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Insert { key: String, value: String },
    Get { key: String },
    GetAll { key: String },
    Update { key: String, value: String },
    Delete { key: String },
    Scan { from: Option<String> },
    ScanRev,
    Stats,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self, String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["insert", key, value] => Ok(Self::Insert {
                key: (*key).to_string(),
                value: (*value).to_string(),
            }),
            ["get", key] => Ok(Self::Get {
                key: (*key).to_string(),
            }),
            ["get-all", key] => Ok(Self::GetAll {
                key: (*key).to_string(),
            }),
            ["update", key, value] => Ok(Self::Update {
                key: (*key).to_string(),
                value: (*value).to_string(),
            }),
            ["delete", key] => Ok(Self::Delete {
                key: (*key).to_string(),
            }),
            ["scan"] => Ok(Self::Scan { from: None }),
            ["scan", from] => Ok(Self::Scan {
                from: Some((*from).to_string()),
            }),
            ["scan-rev"] => Ok(Self::ScanRev),
            ["stats"] => Ok(Self::Stats),
            [] => Err("missing command".to_string()),
            [command, ..] => Err(format!("unknown command or wrong arguments: {command}")),
        }
    }

    const fn mutates(&self) -> bool {
        matches!(
            self,
            Self::Insert { .. } | Self::Update { .. } | Self::Delete { .. }
        )
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagetree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    // Load configuration from environment variables
    let config = match CliConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::from(2);
        }
    };

    tracing::debug!(
        "Loaded configuration: path={}, tree_name={}, sync={}",
        config.path.display(),
        config.tree_name,
        config.sync
    );

    match run(&config, &command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(1)
        }
    }
}

fn run(config: &CliConfig, command: &Command) -> Result<(), BTreeError> {
    let store = FilePageStore::open_or_create(&config.path)?;
    let mut tree = Tree::open_or_create(store, &config.tree_name)?;

    match command {
        Command::Insert { key, value } => tree.insert(key.as_bytes(), value.as_bytes())?,
        Command::Update { key, value } => tree.update(key.as_bytes(), value.as_bytes())?,
        Command::Delete { key } => {
            let removed = tree.delete(key.as_bytes())?;
            println!("{removed}");
        }
        Command::Get { key } => match tree.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => tracing::info!("{key} not found"),
        },
        Command::GetAll { key } => {
            for value in tree.get_all(key.as_bytes())? {
                println!("{}", String::from_utf8_lossy(&value));
            }
        }
        Command::Scan { from } => {
            let mut crawler = match from {
                Some(from) => tree.crawl_from(from.as_bytes())?,
                None => tree.crawl_first()?,
            };
            while let Some((key, value)) = crawler.key_value()? {
                print_entry(&key, &value);
                if !crawler.next()? {
                    break;
                }
            }
        }
        Command::ScanRev => {
            let mut crawler = tree.crawl_last()?;
            while let Some((key, value)) = crawler.key_value()? {
                print_entry(&key, &value);
                if !crawler.previous()? {
                    break;
                }
            }
        }
        Command::Stats => {
            let stats = tree.stats()?;
            println!("name: {}", tree.name());
            println!("depth: {}", stats.depth);
            println!("entries: {}", stats.entries);
            println!("leaves: {}", stats.leaves);
            println!("overflow leaves: {}", stats.overflow_leaves);
            println!("internal nodes: {}", stats.internal_nodes);
            println!("pages: {}", stats.total_pages);
        }
    }

    if command.mutates() && config.sync {
        tree.sync()?;
    }
    Ok(())
}

fn print_entry(key: &[u8], value: &[u8]) {
    println!(
        "{}\t{}",
        String::from_utf8_lossy(key),
        String::from_utf8_lossy(value)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(&args(&["insert", "k", "v"])),
            Ok(Command::Insert {
                key: "k".to_string(),
                value: "v".to_string()
            })
        );
        assert_eq!(
            Command::parse(&args(&["scan", "m"])),
            Ok(Command::Scan {
                from: Some("m".to_string())
            })
        );
        assert_eq!(Command::parse(&args(&["scan"])), Ok(Command::Scan { from: None }));
        assert_eq!(Command::parse(&args(&["stats"])), Ok(Command::Stats));
    }

    #[test]
    fn test_parse_usage_errors() {
        assert!(Command::parse(&args(&[])).is_err());
        assert!(Command::parse(&args(&["insert", "only-key"])).is_err());
        assert!(Command::parse(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn test_mutating_commands() {
        assert!(Command::parse(&args(&["delete", "k"])).expect("parse").mutates());
        assert!(!Command::parse(&args(&["get", "k"])).expect("parse").mutates());
    }
}

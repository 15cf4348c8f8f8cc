//! Stagemem CLI
//!
//! Operator commands for classification rules, memory snapshots and the
//! knowledge table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagemem::error::{Result, StageMemError};
use stagemem::events::NullSink;
use stagemem::knowledge::KnowledgeBase;
use stagemem::orchestrator::Classifier;
use stagemem::persist;
use stagemem::{CoreConfig, MemoryEntry, MemoryStore, Stage, StageScheduler};

#[derive(Parser)]
#[command(name = "stagemem")]
#[command(about = "Multi-stage agent memory CLI")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, env = "STAGEMEM_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "STAGEMEM_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which task kind a request is classified as
    Classify {
        /// Request text
        text: String,
    },
    /// List the entries of a snapshot, per stage
    Inspect {
        /// Snapshot file
        #[arg(env = "STAGEMEM_SNAPSHOT")]
        snapshot: String,
        /// Only this stage (working, short_term, long_term)
        #[arg(short, long)]
        stage: Option<Stage>,
    },
    /// Run one scheduler pass over a snapshot
    Sweep {
        /// Snapshot file
        #[arg(env = "STAGEMEM_SNAPSHOT")]
        snapshot: String,
        /// Save the result back to the snapshot
        #[arg(short, long)]
        write: bool,
        /// Pass clock (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Print the effective configuration
    Config,
    /// Look up a topic in the knowledge table
    Lookup {
        /// Topic or question
        topic: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };

    match cli.command {
        Commands::Classify { text } => {
            let classifier = match &config.orchestrator.rules {
                Some(rules) => Classifier::from_config(rules)?,
                None => Classifier::default(),
            };
            match classifier.classify(&text) {
                Ok(kind) => println!("{}", kind),
                Err(StageMemError::UnclassifiableRequest(_)) => {
                    println!("unclassifiable");
                    std::process::exit(2);
                }
                Err(e) => return Err(e),
            }
        }

        Commands::Inspect { snapshot, stage } => {
            let store = MemoryStore::new();
            store.restore(persist::read(&snapshot)?)?;

            let stats = store.stats();
            println!(
                "{} entries (working: {}, short_term: {}, long_term: {})",
                stats.total(),
                stats.working,
                stats.short_term,
                stats.long_term
            );
            let stages: Vec<Stage> = match stage {
                Some(stage) => vec![stage],
                None => Stage::all().to_vec(),
            };
            for stage in stages {
                println!("\n[{}]", stage);
                for entry in store.list_by_stage(stage) {
                    print_entry(&entry);
                }
            }
        }

        Commands::Sweep {
            snapshot,
            write,
            at,
        } => {
            let store = Arc::new(MemoryStore::new());
            store.restore(persist::read(&snapshot)?)?;

            let scheduler =
                StageScheduler::new(store.clone(), config.scheduler.clone(), Arc::new(NullSink));
            let report = scheduler.run_pass_at(at.unwrap_or_else(Utc::now));

            for (id, stage) in &report.promoted {
                println!("promoted {} -> {}", id, stage);
            }
            for (id, stage) in &report.demoted {
                println!("demoted  {} -> {}", id, stage);
            }
            for id in &report.evicted {
                println!("evicted  {}", id);
            }
            println!(
                "{} examined, {} changed",
                report.examined,
                report.changed()
            );

            if write {
                persist::save(&store, &snapshot)?;
                println!("Snapshot written to {}", snapshot);
            }
        }

        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }

        Commands::Lookup { topic } => {
            let kb = match &config.knowledge_path {
                Some(path) => Arc::new(KnowledgeBase::load(path)?),
                None => KnowledgeBase::builtin(),
            };
            match kb.resolve(&topic) {
                Some((name, facts)) => {
                    println!("{}", name);
                    for fact in facts {
                        println!("  - {}", fact);
                    }
                }
                None => {
                    println!("No knowledge about '{}'", topic);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn print_entry(entry: &MemoryEntry) {
    let last = entry
        .last_accessed_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "  {} (importance: {:.2}, reads: {}, last read: {}) - {}",
        entry.id,
        entry.importance,
        entry.access_count,
        last,
        truncate(&entry.content.to_string(), 60)
    );
}

fn init_logging(json: bool) {
    let plain = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
    });
    let structured = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    tracing_subscriber::registry()
        .with(plain)
        .with(structured)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_json_flag() {
        let cli = Cli::try_parse_from(["stagemem", "--log-json", "config"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Commands::Config));

        let cli = Cli::try_parse_from(["stagemem", "lookup", "agent"]).unwrap();
        assert!(!cli.log_json);
    }
}

use clap::{Parser, Subcommand};
use tokensim::graph::loader::load_definition_from_yaml;
use tokensim::runtime::engine::Simulator;
use tokensim::runtime::log::LogStore;
use tokensim::runtime::redis_log::RedisLogStore;
use tokensim::runtime::token::{DecisionInput, SuspendKind};
use tokensim::runtime::{RunState, SimConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process definition to completion
    Run {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial context variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Start node id; defaults to the process's single blank start event
        #[arg(long)]
        start: Option<String>,

        /// Auto-step delay in milliseconds
        #[arg(long, default_value_t = 500)]
        delay: u64,

        /// Resolve pending decisions automatically with the first satisfied edge
        #[arg(long)]
        auto_choose: bool,

        /// Persist the run log to Redis instead of memory
        #[arg(long)]
        redis: Option<String>,
    },

    /// Load a process definition and report its shape
    Check {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str)
        .unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => {
            let definition = load_definition_from_yaml(&file)?;
            let name = definition.name.clone();
            let graph = definition.into_graph()?;
            info!(
                name = %name.unwrap_or_else(|| "unnamed".to_string()),
                elements = graph.element_count(),
                flows = graph.flow_count(),
                "process definition loaded"
            );
        }

        Commands::Run {
            file,
            vars,
            start,
            delay,
            auto_choose,
            redis,
        } => {
            let definition = load_definition_from_yaml(&file)?;
            let graph = Arc::new(definition.into_graph()?);

            let config = SimConfig {
                delay: Duration::from_millis(delay),
                seed_context: vars.into_iter().collect::<HashMap<_, _>>(),
                ..SimConfig::default()
            };

            let mut builder = Simulator::builder(graph).config(config);
            if let Some(url) = redis {
                let store: Arc<dyn LogStore> = Arc::new(RedisLogStore::connect(&url)?);
                builder = builder.log_store(store);
            }
            let sim = builder.build();

            let mut decisions = sim.subscribe_decision();
            sim.start(start.as_deref())?;

            loop {
                if sim.state() == RunState::Idle {
                    break;
                }
                tokio::select! {
                    changed = decisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let pending = decisions.borrow_and_update().clone();
                        let Some(decision) = pending else { continue };
                        info!(
                            token_id = decision.token_id,
                            element = %decision.element_id,
                            "pending decision"
                        );
                        if !auto_choose {
                            continue;
                        }
                        let input = match decision.kind {
                            SuspendKind::Handler { .. } => DecisionInput::Resume,
                            _ => {
                                let edge = decision
                                    .candidates
                                    .iter()
                                    .find(|c| c.satisfied)
                                    .or_else(|| decision.candidates.first())
                                    .map(|c| c.flow_id.clone());
                                match edge {
                                    Some(edge) => DecisionInput::Edges(vec![edge]),
                                    None => DecisionInput::Resume,
                                }
                            }
                        };
                        sim.step(Some(input));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }

            for entry in sim.run_log() {
                info!(
                    token_id = entry.token_id,
                    element = %entry.element_id,
                    edge = entry.edge_id.as_deref().unwrap_or("-"),
                    "visited"
                );
            }
            info!("simulation finished");
        }
    }

    Ok(())
}

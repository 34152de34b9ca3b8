//! The `zr` binary: argument parsing, alias expansion, tracing setup,
//! and exit-code mapping. All real work happens in `zr-lib`.

use std::time::Instant;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::debug;
use zr_lib::{
    alias::AliasStore,
    config::RawConfig,
    opts::{CacheOpts, Opts, RunOpts},
    run::Run,
};

#[derive(Debug, Parser)]
#[command(name = "zr", version, about = "Task runner for polyglot monorepos")]
struct Args {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "zr.toml")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a task or workflow plus its transitive dependencies.
    /// Workflow names take precedence over task names.
    Run {
        target: String,
        /// Extra arguments appended to the entry task's command,
        /// separated by `--`
        #[arg(last = true)]
        args: Vec<String>,
        /// Profile overlay to apply before scheduling
        #[arg(long)]
        profile: Option<String>,
        /// Worker pool size (defaults to the host CPU count)
        #[arg(long)]
        workers: Option<usize>,
        /// Disable cache reads and writes for this run
        #[arg(long)]
        no_cache: bool,
        /// Skip the end-of-run summary
        #[arg(long)]
        quiet: bool,
    },
    /// Enumerate tasks and their dependencies
    List {
        /// Render the dependency tree under each task
        #[arg(long)]
        tree: bool,
    },
    /// Manage CLI aliases stored in ~/.zr/aliases.toml
    Alias {
        #[command(subcommand)]
        command: AliasCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AliasCommand {
    /// Print all aliases
    List,
    /// Create or replace an alias
    Set { name: String, command: Vec<String> },
    /// Remove an alias
    Rm { name: String },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("ZR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

const BUILTIN_COMMANDS: [&str; 4] = ["run", "list", "alias", "help"];

/// Replaces a leading alias token with its stored expansion, so
/// `zr b` can stand for `zr run build`. Builtin command names are
/// never treated as aliases.
fn expand_alias_args(mut args: Vec<String>) -> Vec<String> {
    let Some(first) = args.get(1) else {
        return args;
    };
    if first.starts_with('-') || BUILTIN_COMMANDS.contains(&first.as_str()) {
        return args;
    }
    let Ok(store) = AliasStore::default_location() else {
        return args;
    };
    let Ok(aliases) = store.load() else {
        return args;
    };
    if let Some(expansion) = aliases.expand(first) {
        debug!("expanding alias {first} to {expansion:?}");
        args.splice(1..2, expansion);
    }
    args
}

async fn execute(args: Args) -> Result<i32, Box<dyn std::error::Error>> {
    match args.command {
        Command::Run {
            target,
            args: task_args,
            profile,
            workers,
            no_cache,
            quiet,
        } => {
            let config = RawConfig::load(&args.config)?;
            let opts = Opts {
                run: RunOpts {
                    concurrency: workers,
                    profile,
                },
                cache: CacheOpts {
                    enabled: !no_cache,
                    override_dir: None,
                },
            };
            let run = Run::new(&config, &opts)?;
            let started = Instant::now();
            let outcome = run.run_target_with_args(&target, &task_args).await?;
            if !quiet {
                eprintln!("{}", run.summary(started.elapsed()));
            }
            Ok(outcome.exit_code())
        }
        Command::List { tree } => {
            let config = RawConfig::load(&args.config)?;
            let opts = Opts {
                cache: CacheOpts {
                    enabled: false,
                    override_dir: None,
                },
                ..Opts::default()
            };
            let run = Run::new(&config, &opts)?;
            print_task_list(run.table(), tree);
            Ok(0)
        }
        Command::Alias { command } => {
            let store = AliasStore::default_location()?;
            match command {
                AliasCommand::List => {
                    for (name, command) in store.load()?.iter() {
                        println!("{name} = {command}");
                    }
                }
                AliasCommand::Set { name, command } => {
                    let mut aliases = store.load()?;
                    aliases.set(name, command.join(" "));
                    store.save(&aliases)?;
                }
                AliasCommand::Rm { name } => {
                    let mut aliases = store.load()?;
                    if aliases.remove(&name) {
                        store.save(&aliases)?;
                    } else {
                        eprintln!("no alias named {name}");
                        return Ok(1);
                    }
                }
            }
            Ok(0)
        }
    }
}

fn print_task_list(table: &zr_lib::engine::TaskTable, tree: bool) {
    for (name, task) in table.iter() {
        let mut line = name.to_string();
        if !task.tags.is_empty() {
            line.push_str(&format!(" [{}]", task.tags.join(", ")));
        }
        if let Some(description) = &task.description {
            line.push_str(&format!("  # {description}"));
        }
        println!("{line}");
        if tree {
            let mut path = vec![name.to_string()];
            print_dependency_tree(table, task, &mut path);
        }
    }
}

fn print_dependency_tree(
    table: &zr_lib::engine::TaskTable,
    task: &zr_lib::task_graph::TaskDefinition,
    path: &mut Vec<String>,
) {
    let indent = "  ".repeat(path.len());
    for (dep, serial) in task
        .deps
        .iter()
        .map(|dep| (dep, false))
        .chain(task.deps_serial.iter().map(|dep| (dep, true)))
    {
        match serial {
            true => println!("{indent}└─ {dep} (serial)"),
            false => println!("{indent}└─ {dep}"),
        }
        // The recursion set keeps a cyclic (and therefore invalid, but
        // still listable) config from looping forever
        if path.iter().any(|seen| seen == dep) {
            continue;
        }
        if let Some(child) = table.get(dep) {
            path.push(dep.clone());
            print_dependency_tree(table, child, path);
            path.pop();
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let argv = expand_alias_args(std::env::args().collect());
    let args = Args::parse_from(argv);

    let code = match execute(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("zr: {err}");
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_args_parse_run() {
        let args = Args::parse_from(["zr", "run", "build", "--workers", "4", "--no-cache"]);
        match args.command {
            Command::Run {
                target,
                workers,
                no_cache,
                ..
            } => {
                assert_eq!(target, "build");
                assert_eq!(workers, Some(4));
                assert!(no_cache);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_args_parse_list_tree() {
        let args = Args::parse_from(["zr", "list", "--tree"]);
        assert!(matches!(args.command, Command::List { tree: true }));
    }

    #[test]
    fn test_flags_are_not_alias_expanded() {
        let argv = vec!["zr".to_string(), "--help".to_string()];
        assert_eq!(expand_alias_args(argv.clone()), argv);
    }
}

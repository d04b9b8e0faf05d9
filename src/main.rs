use std::error::Error;
use std::io;

use clap::{Parser as ClapParser, Subcommand};
use shadowheap::{
    ShadowHeap, ShadowOptions,
    dump::HeapDump,
    trace::{self, Replayer},
};

#[derive(ClapParser, Debug, Clone)]
#[command(version, about = "Shadow heap for symbolic execution", long_about = None)]
#[command(name = "shadowheap")]
#[command(bin_name = "shadowheap")]
pub struct CommandLineArguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Replay a recorded event trace against a fresh shadow heap
    Replay {
        trace: String,
        /// Seed for treap priorities; falls back to SHADOWHEAP_SEED
        #[clap(long)]
        seed: Option<u64>,
        /// Check the no-overlap invariant after every GC event
        #[clap(long, default_value = "false")]
        validate: bool,
        /// Write a JSON dump of the final heap
        #[clap(long)]
        dump: Option<String>,
    },
    /// Explore a JSON heap dump interactively
    Explore { dump: String },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CommandLineArguments::parse();
    match args.command {
        Command::Replay {
            trace,
            seed,
            validate,
            dump,
        } => replay(&trace, seed, validate, dump.as_deref()),
        Command::Explore { dump } => {
            let dump = HeapDump::load(&dump)?;
            dump.explore(io::stdin().lock(), &mut io::stdout().lock())?;
            Ok(())
        }
    }
}

fn replay(
    path: &str,
    seed: Option<u64>,
    validate: bool,
    dump: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let source = std::fs::read_to_string(path)?;
    let events = trace::parse(&source)?;

    let from_env = ShadowOptions::from_env();
    let options = ShadowOptions {
        seed: seed.or(from_env.seed),
        validate: validate || from_env.validate,
    };
    let heap = ShadowHeap::new(options);
    heap.enter_main();

    let mut replayer = Replayer::new(&heap, io::stdout().lock());
    let stats = replayer.run(&events)?;
    log::info!(
        "Replayed {} events, {} swept, {} live",
        stats.events,
        stats.swept,
        stats.live
    );

    if let Some(dump_path) = dump {
        heap.lock().dump(path).save(dump_path)?;
    }
    Ok(())
}

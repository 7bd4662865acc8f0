use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

mod error;
mod vm;

use vm::io::Io;
use vm::Machine;

/// A story-file interpreter for Infocom-era interactive fiction (versions 1-3).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the story file to load
    story: PathBuf,

    /// Path `save`/`restore` read and write
    #[arg(long, value_name = "PATH")]
    save: Option<PathBuf>,

    /// Enable verbose (debug-level) logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    log::info!("loading {}", args.story.display());
    let bytes = std::fs::read(&args.story)?;

    let (input_tx, input_rx) = mpsc::channel::<String>();
    let (output_tx, output_rx) = mpsc::channel::<String>();

    let mut machine = Machine::load_story(bytes, Io::new(input_rx, output_tx))?;
    if let Some(path) = args.save {
        machine.set_save_path(path);
    }
    machine.complete_setup()?;

    let printer = thread::spawn(move || {
        while let Ok(fragment) = output_rx.recv() {
            print!("{fragment}");
        }
    });

    let reader = thread::spawn(move || {
        let mut line = String::new();
        loop {
            line.clear();
            if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            if input_tx.send(line.trim_end_matches('\n').to_string()).is_err() {
                break;
            }
        }
    });

    while machine.is_running() {
        if let Err(err) = machine.execute_cycle() {
            log::error!("fatal error: {err}");
            break;
        }
    }

    drop(machine);
    let _ = reader.join();
    let _ = printer.join();
    Ok(())
}

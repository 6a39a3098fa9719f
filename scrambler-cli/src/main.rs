use clap::Parser;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use scrambler_core::{run, ScrambleSettings};

#[derive(Debug, Parser)]
#[command(name = "scramble", version, about = "Cave Story dialogue scrambler")]
struct Args {
    /// Top-level game folder to process. Output is a copy of this folder
    /// with a "~" appended unless --output is given.
    game_folder: Option<PathBuf>,

    /// Chance for each word to be scrambled.
    #[arg(long, default_value_t = 0.1)]
    scramble_rate: f64,

    /// Do not force at least one change per TSC event.
    #[arg(long)]
    no_force: bool,

    /// Write plain additive-cipher output instead of files that are both
    /// TSC and TXT compliant.
    #[arg(long)]
    no_text_compatible: bool,

    /// Immediately run the game after patching.
    #[arg(long)]
    run: bool,

    /// RNG seed; derived from the clock when absent.
    #[arg(long)]
    seed: Option<u64>,

    /// Write a replacement log into the output folder.
    #[arg(long)]
    debug: bool,

    /// Output folder.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Load settings from a JSON preset. The game folder, --output and
    /// --seed still win when given explicitly.
    #[arg(long)]
    preset: Option<PathBuf>,
}

fn build_settings(args: &Args) -> Result<ScrambleSettings, String> {
    let mut settings = match &args.preset {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read preset {}: {e}", path.display()))?;
            serde_json::from_str::<ScrambleSettings>(&text)
                .map_err(|e| format!("cannot parse preset {}: {e}", path.display()))?
        }
        None => {
            let game_folder = args
                .game_folder
                .clone()
                .ok_or_else(|| "a game folder is required unless --preset is given".to_string())?;
            ScrambleSettings {
                seed: 0,
                scramble_rate: args.scramble_rate,
                force: !args.no_force,
                text_compatible: !args.no_text_compatible,
                run_game: args.run,
                debug: args.debug,
                input_path: game_folder,
                output_path: args.output.clone(),
            }
        }
    };

    if let Some(folder) = &args.game_folder {
        settings.input_path = folder.clone();
    }
    if let Some(output) = &args.output {
        settings.output_path = Some(output.clone());
    }
    match args.seed {
        Some(seed) => settings.seed = seed,
        // A preset carries its own seed; otherwise take one off the clock.
        None if args.preset.is_none() => settings.seed = seed_from_clock(),
        None => {}
    }

    Ok(settings)
}

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn main() {
    let args = Args::parse();

    let settings = match build_settings(&args) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(settings) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use walkdir::WalkDir;

pub mod exe;
pub mod scramble;
pub mod script;
pub mod tsc;
pub mod words;

/// Settings for one scramble run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrambleSettings {
    pub seed: u64,
    pub scramble_rate: f64,
    pub force: bool,
    pub text_compatible: bool,
    pub run_game: bool,
    pub debug: bool,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ScrambleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Tsc(#[from] tsc::TscError),
    #[error(transparent)]
    Script(#[from] script::ScriptError),
    #[error(transparent)]
    Exe(#[from] exe::ExeError),
}

pub type Result<T> = std::result::Result<T, ScrambleError>;

// Directories that never hold game data.
const PRUNED_DIRS: &[&str] = &["_internal", "Manual"];

// Optional user dictionary next to the working directory; when present it
// replaces the harvest pass entirely.
const DICTIONARY_FILE: &str = "dictionary.txt";

// Display-mode byte in the engine's Config.dat.
const CONFIG_DISPLAY_MODE_OFFSET: usize = 108;

// FNV-1a, so every file gets its own deterministic RNG stream derived from
// the run seed and its relative path.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001B3);
    }
    h
}

fn file_rng(settings: &ScrambleSettings, rel: &Path) -> StdRng {
    StdRng::seed_from_u64(settings.seed ^ fnv1a(rel.to_string_lossy().as_bytes()))
}

fn default_output_root(input: &Path) -> PathBuf {
    let mut os = input.as_os_str().to_os_string();
    os.push("~");
    PathBuf::from(os)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn walk_game_files(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| PRUNED_DIRS.contains(&n)))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
}

// Phase one: gather the replacement dictionary, either from a user file or
// by harvesting every script (and the exe's map names) under the input
// tree. The result is immutable for the whole transform phase.
fn build_dictionary(settings: &ScrambleSettings) -> Result<Vec<String>> {
    let mut set = BTreeSet::new();

    let custom = Path::new(DICTIONARY_FILE);
    if custom.exists() {
        words::load_dictionary_file(&fs::read_to_string(custom)?, &mut set);
        return Ok(words::finalize_dictionary(set));
    }

    for entry in walk_game_files(&settings.input_path) {
        let path = entry.path();
        if has_extension(path, "tsc") {
            let raw = fs::read(path)?;
            let text = match tsc::decode_tsc(&raw) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("Skipping {}: {}", path.display(), err);
                    continue;
                }
            };
            match script::split_script(text.as_bytes()) {
                Ok(events) => words::collect_words(text.as_bytes(), &events, &mut set),
                Err(err) => eprintln!("Skipping {}: {}", path.display(), err),
            }
        } else if settings.text_compatible && has_extension(path, "exe") {
            let raw = fs::read(path)?;
            let segs = exe::SectionMap::parse(&raw);
            if let Err(err) = exe::harvest_map_names(&raw, &segs, &mut set) {
                eprintln!("Skipping map names in {}: {}", path.display(), err);
            }
        }
    }

    Ok(words::finalize_dictionary(set))
}

fn scramble_tsc_file(
    src: &Path,
    dest: &Path,
    dictionary: &[String],
    settings: &ScrambleSettings,
    rng: &mut StdRng,
    log: &mut String,
    rel: &Path,
) -> Result<()> {
    let raw = fs::read(src)?;
    let text = tsc::decode_tsc(&raw)?;
    let label = rel.display().to_string();
    let scrambled = scramble::scramble_script(&text, dictionary, settings, rng, log, &label)?;
    // The whole transform happens in memory; only a finished buffer is
    // ever written.
    fs::write(dest, tsc::encode_tsc(&scrambled, settings.text_compatible))?;
    Ok(())
}

fn patch_executable(
    b: &mut [u8],
    segs: &exe::SectionMap,
    dictionary: &[String],
    settings: &ScrambleSettings,
    rel: &Path,
) -> std::result::Result<bool, exe::ExeError> {
    if !exe::is_known_engine(b, segs)? {
        return Ok(false);
    }
    let mut rng = file_rng(settings, rel);
    exe::scramble_map_names(b, segs, dictionary, settings.scramble_rate, &mut rng)?;
    exe::apply_speed_patches(b, segs)?;
    Ok(true)
}

// Patch a file at a literal offset when the existing bytes match. Returns
// how many patches were applied (0 or 1).
fn apply_file_patch(
    path: &Path,
    offset: usize,
    expected: &[u8],
    replacement: &[u8],
) -> Result<usize> {
    let mut data = fs::read(path)?;
    if data.get(offset..offset + expected.len()) == Some(expected) {
        if let Some(slot) = data.get_mut(offset..offset + replacement.len()) {
            slot.copy_from_slice(replacement);
            fs::write(path, &data)?;
            println!("Patched external: {}", path.display());
            return Ok(1);
        }
    }
    Ok(0)
}

pub fn run(settings: ScrambleSettings) -> Result<()> {
    if !settings.input_path.exists() {
        return Err(ScrambleError::Config(format!(
            "Input path does not exist: {}",
            settings.input_path.display()
        )));
    }

    let out_root = settings
        .output_path
        .clone()
        .unwrap_or_else(|| default_output_root(&settings.input_path));

    let dictionary = build_dictionary(&settings)?;

    let mut log = format!("scramble seed: {}\n", settings.seed);
    log.push_str(&format!("dictionary words: {}\n", dictionary.len()));

    let mut patched = 0usize;
    let mut exe_path: Option<PathBuf> = None;

    for entry in walk_game_files(&settings.input_path) {
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(&settings.input_path) else {
            continue;
        };
        let dest = out_root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if has_extension(path, "tsc") {
            let mut rng = file_rng(&settings, rel);
            match scramble_tsc_file(path, &dest, &dictionary, &settings, &mut rng, &mut log, rel)
            {
                Ok(()) => patched += 1,
                Err(err) => eprintln!("Skipping {}: {}", path.display(), err),
            }
            continue;
        }

        if settings.text_compatible && has_extension(path, "exe") {
            let raw = fs::read(path)?;
            let mut patched_bytes = raw.clone();
            let segs = exe::SectionMap::parse(&raw);
            match patch_executable(&mut patched_bytes, &segs, &dictionary, &settings, rel) {
                Ok(true) => {
                    println!("Patched exe: {}", path.display());
                    patched += 1;
                    exe_path = Some(dest.clone());
                    fs::write(&dest, &patched_bytes)?;
                }
                Ok(false) => {
                    fs::write(&dest, &raw)?;
                }
                Err(err) => {
                    // A half-patched image must never reach the output.
                    eprintln!("Skipping patches in {}: {}", path.display(), err);
                    fs::write(&dest, &raw)?;
                }
            }
            continue;
        }

        fs::copy(path, &dest)?;
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.eq_ignore_ascii_case("config.dat"))
        {
            patched += apply_file_patch(&dest, CONFIG_DISPLAY_MODE_OFFSET, &[0x00], &[0x02])?;
        }
    }

    if patched > 0 {
        println!("Total patched files: {patched}");
    }

    if settings.debug {
        fs::write(out_root.join("scramble_log.txt"), log)?;
    }

    if settings.run_game {
        match exe_path {
            Some(path) => {
                println!("Running: {}", path.display());
                let mut cmd = Command::new(&path);
                if let Some(dir) = path.parent() {
                    cmd.current_dir(dir);
                }
                cmd.status()?;
            }
            None => println!("No game executable detected, skipping launch"),
        }
    }

    Ok(())
}

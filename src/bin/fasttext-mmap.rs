//! Convert a fastText binary model to the memory-mapped directory layout.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use fasttext_predict::FastText;

#[derive(Parser)]
#[command(about = "Convert a fastText binary model to the memory-mapped layout", long_about = None)]
struct Options {
    /// Path to the fastText binary model (.bin or .ftz)
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Directory for model.bin|model.ftz, dict.mmap and in.mmap
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,
}

fn run(options: Options) -> Result<()> {
    let model = FastText::load_model(&options.input)
        .with_context(|| format!("failed to load model from {:?}", options.input))?;
    model
        .save_as_memory_mapped_model(&options.output)
        .with_context(|| format!("failed to write mmap model under {:?}", options.output))?;
    Ok(())
}

fn main() {
    env_logger::init();
    let options = Options::parse();

    if let Err(err) = run(options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}

//! Recovers the functions and basic blocks of a XEX's code section.
//!
//! Prints one line per function, optionally followed by its basic blocks, and
//! the diagnostics collected on the way. With `--map`, the public symbols of a
//! linker map are checked against the recovered functions.

extern crate env_logger;
extern crate xex;

#[allow(unused_imports)]
#[macro_use]
extern crate structopt;

use structopt::StructOpt;
use xex::function::Function;
use xex::map::MapFile;
use xex::{analyze, AnalysisOptions, KeySource, Xex};

use std::error::Error;
use std::fs::{read, read_to_string};
use std::path::PathBuf;

#[derive(Debug, StructOpt)]
#[structopt(name = "xex-cfa", about = "List the functions found in a XEX.")]
struct Opts {
    /// Path to the XEX file.
    #[structopt(parse(from_os_str))]
    xex: PathBuf,
    /// Key used to decrypt the file key: `devkit` or 32 hex digits.
    #[structopt(long = "key", default_value = "devkit")]
    key: KeySource,
    /// Linker map file to verify the results against.
    #[structopt(long = "map", parse(from_os_str))]
    map: Option<PathBuf>,
    /// Create functions for code not covered by any function.
    #[structopt(long = "fill-gaps")]
    fill_gaps: bool,
    /// Treat every `mflr r12` as a function start.
    #[structopt(long = "seed-prologues")]
    seed_prologues: bool,
    /// Don't treat the entry point as a function start.
    #[structopt(long = "no-entry-point")]
    no_entry_point: bool,
    /// Print the basic blocks of every function.
    #[structopt(long = "blocks")]
    blocks: bool,
}

fn print_function(function: &Function, blocks: bool) {
    let mut flags = String::new();
    if function.has_exception_handler() {
        flags.push_str(" eh");
    }
    if function.possible_jump_table() {
        flags.push_str(" jumptable");
    }
    println!(
        "{:08X}..{:08X} {:<24} {:?}{}",
        function.start(),
        function.end(),
        function.name(),
        function.source(),
        flags
    );

    if blocks {
        for block in function.blocks() {
            println!("    {}", block);
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opts = Opts::from_args();

    let data = read(&opts.xex)?;
    let xex = Xex::parse_with_key(&data, &opts.key)?;
    let pe = xex.reconstruct()?;

    let options = AnalysisOptions {
        seed_entry_point: !opts.no_entry_point,
        seed_prologues: opts.seed_prologues,
        fill_gaps: opts.fill_gaps,
        ..AnalysisOptions::default()
    };
    let analysis = analyze(&pe, &options)?;

    for function in analysis.functions() {
        print_function(function, opts.blocks);
    }

    let mut diagnostics = analysis.diagnostics().to_vec();
    if let Some(path) = &opts.map {
        let map = MapFile::parse(&read_to_string(path)?)?;
        diagnostics.extend(map.verify(&analysis));
    }

    println!();
    println!(
        "{} functions, {} diagnostics",
        analysis.registry().len(),
        diagnostics.len()
    );
    for diagnostic in &diagnostics {
        println!("{}", diagnostic);
    }

    Ok(())
}

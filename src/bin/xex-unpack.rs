//! Extracts the PE image from a XEX.
//!
//! The image is decrypted, decompressed and its sections are moved back to
//! their raw file offsets, so the output can be loaded by regular PE tools.

extern crate env_logger;
extern crate xex;

#[allow(unused_imports)]
#[macro_use]
extern crate structopt;

use structopt::StructOpt;
use xex::{KeySource, Xex};

use std::error::Error;
use std::fs::{read, write};
use std::path::PathBuf;

const DEFAULT_OUTPUT_EXTENSION: &str = "exe";

#[derive(Debug, StructOpt)]
#[structopt(
    name = "xex-unpack",
    about = "Converts a XEX file to the PE file it contains."
)]
struct Opts {
    /// Path to the XEX file.
    #[structopt(parse(from_os_str))]
    xex: PathBuf,
    /// The output file. If not specified, output goes to a file next to the
    /// XEX, with the extension changed to `.exe`.
    #[structopt(parse(from_os_str))]
    output: Option<PathBuf>,
    /// Key used to decrypt the file key: `devkit` or 32 hex digits.
    #[structopt(long = "key", default_value = "devkit")]
    key: KeySource,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opt = Opts::from_args();

    eprintln!("Reading from {}", opt.xex.display());
    let data = read(&opt.xex)?;
    let xex = Xex::parse_with_key(&data, &opt.key)?;
    let pe = xex.reconstruct()?;

    let out = opt
        .output
        .unwrap_or(opt.xex.with_extension(DEFAULT_OUTPUT_EXTENSION));
    eprintln!("  Writing to {}", out.display());
    write(&out, pe.data())?;

    Ok(())
}

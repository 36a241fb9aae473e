//! Dumps information about a XEX stored in its headers.

extern crate env_logger;
extern crate xex;

#[allow(unused_imports)]
#[macro_use]
extern crate structopt;

use structopt::StructOpt;
use xex::{KeySource, Xex};

use std::error::Error;
use std::fs::read;
use std::path::PathBuf;

#[derive(Debug, StructOpt)]
#[structopt(name = "xex-dump", about = "Dump info from XEX headers to stdout.")]
struct Opts {
    /// Path to the XEX file.
    #[structopt(parse(from_os_str))]
    xex: PathBuf,
    /// Key used to decrypt the file key: `devkit` or 32 hex digits.
    #[structopt(long = "key", default_value = "devkit")]
    key: KeySource,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opts = Opts::from_args();

    let data = read(&opts.xex)?;
    let xex = Xex::parse_with_key(&data, &opts.key)?;
    println!("{:#?}", xex);

    if xex.image().is_some() {
        let pe = xex.reconstruct()?;
        println!("{:#?}", pe.sections());
        for library in xex.import_libraries() {
            println!("imports from {}:", library.name());
            for import in library.resolve(&pe)? {
                match import.thunk {
                    Some(thunk) => println!(
                        "  #{:<4} slot {:08X} thunk {:08X}",
                        import.ordinal, import.address, thunk
                    ),
                    None => println!("  #{:<4} slot {:08X}", import.ordinal, import.address),
                }
            }
        }
    }
    Ok(())
}

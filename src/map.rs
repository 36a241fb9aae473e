//! Linker map files.
//!
//! A map file produced alongside an executable lists its public symbols. It
//! is used to cross-check the recovered functions.

use crate::analysis::{Analysis, Diagnostic};
use crate::Error;

/// Header of the symbol list.
const PUBLICS_MARKER: &str = "Publics by Value";

/// A public symbol of a map file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSymbol {
    pub name: String,
    pub address: u32,
    /// The library and object file defining the symbol (`lib:object`).
    pub object: String,
}

/// The public symbols of a map file, in file order.
#[derive(Debug, Clone)]
pub struct MapFile {
    symbols: Vec<MapSymbol>,
}

impl MapFile {
    /// Parses the `Publics by Value` list of a map file.
    ///
    /// The line after the list header is skipped, the list ends at the first
    /// empty line. Each entry is `section:offset name address [flags] object`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut lines = text.lines().enumerate();
        lines
            .by_ref()
            .find(|(_, line)| line.contains(PUBLICS_MARKER))
            .ok_or_else(|| Error::Malformed(format!("map file has no `{}` section", PUBLICS_MARKER)))?;
        lines.next();

        let mut symbols = Vec::new();
        for (number, line) in lines {
            if line.trim().is_empty() {
                break;
            }
            symbols.push(parse_entry(line).ok_or_else(|| {
                Error::Malformed(format!("map file line {}: invalid entry `{}`", number + 1, line))
            })?);
        }

        info!("map file: {} public symbols", symbols.len());
        Ok(Self { symbols })
    }

    pub fn symbols(&self) -> &[MapSymbol] {
        &self.symbols
    }

    /// Finds a symbol at `address`.
    pub fn symbol_at(&self, address: u32) -> Option<&MapSymbol> {
        self.symbols.iter().find(|s| s.address == address)
    }

    /// Reports every symbol inside `.text` for which no function starting at
    /// its address was found.
    pub fn verify(&self, analysis: &Analysis) -> Vec<Diagnostic> {
        let code = analysis.code_range();
        let registry = analysis.registry();
        let diagnostics: Vec<_> = self
            .symbols
            .iter()
            .filter(|s| code.contains(&s.address) && registry.find_by_start(s.address).is_none())
            .map(|s| Diagnostic::UnmatchedSymbol {
                name: s.name.clone(),
                address: s.address,
            })
            .collect();

        for diagnostic in &diagnostics {
            warn!("{}", diagnostic);
        }
        info!(
            "map file: {} of {} symbols unmatched",
            diagnostics.len(),
            self.symbols.len()
        );
        diagnostics
    }
}

fn parse_entry(line: &str) -> Option<MapSymbol> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }
    let name = tokens.get(1)?;
    let address = u32::from_str_radix(tokens.get(2)?, 16).ok()?;
    let object = tokens.last()?;
    Some(MapSymbol {
        name: name.to_string(),
        address,
        object: object.to_string(),
    })
}

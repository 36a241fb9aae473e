//! Speculative discovery of function starts.
//!
//! Without symbols, the most reliable evidence of a function start is a call
//! to it. The whole code section is swept once, and the target of every `bl`
//! that isn't already part of a known function becomes a candidate. The
//! entry point and, optionally, `mflr r12` prologues are added as well.
//!
//! Candidates get a provisional end at the next known start. The control-flow
//! analysis later shrinks it to the real end.

use crate::analysis::AnalysisOptions;
use crate::function::{Function, FunctionRegistry, FunctionSource};
use crate::pe::{PeImage, SectionView};
use crate::ppc;
use crate::Error;

use std::collections::BTreeMap;

/// Registers all speculative function starts. Returns the number of new
/// functions.
pub fn seed(
    image: &PeImage,
    registry: &mut FunctionRegistry,
    options: &AnalysisOptions,
) -> Result<usize, Error> {
    let text = image.code_view()?;
    let mut candidates = BTreeMap::new();

    if options.seed_entry_point {
        let entry = image.entry_point();
        if is_new(&text, registry, entry) {
            debug!("entry point at {:08X}", entry);
            candidates.insert(entry, FunctionSource::EntryPoint);
        }
    }

    for (addr, word) in text.words() {
        if ppc::is_bl(word) {
            let target = ppc::branch_target(addr, word);
            if is_new(&text, registry, target) {
                candidates.entry(target).or_insert(FunctionSource::CallTarget);
            }
        } else if options.seed_prologues && word == ppc::MFLR_R12 && is_new(&text, registry, addr) {
            candidates.entry(addr).or_insert(FunctionSource::Prologue);
        }
    }

    let mut added = 0;
    let mut iter = candidates.iter().peekable();
    while let Some((&start, &source)) = iter.next() {
        let next_candidate = iter.peek().map(|(&addr, _)| addr);
        let end = match (registry.next_start_after(start), next_candidate) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => text.end(),
        };
        trace!("{:?} candidate {:08X}..{:08X}", source, start, end);
        if registry.insert(Function::new(start, end, source)).is_some() {
            added += 1;
        }
    }

    info!("speculative discovery: {} new functions", added);
    Ok(added)
}

/// Whether `addr` is in `.text` and not part of a known function.
fn is_new(text: &SectionView, registry: &FunctionRegistry, addr: u32) -> bool {
    text.contains(addr) && registry.find_by_start(addr).is_none() && registry.containing(addr).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, at, bl, BLR, FOREIGN, MFLR_R12, NOP};

    fn starts(registry: &FunctionRegistry) -> Vec<(u32, u32, FunctionSource)> {
        registry
            .iter()
            .filter(|f| !f.is_intrinsic())
            .map(|f| (f.start(), f.end(), f.source()))
            .collect()
    }

    #[test]
    fn call_targets() {
        let code = [
            bl(at(0), at(4)),
            bl(at(1), at(6)),
            // duplicate target
            bl(at(2), at(4)),
            BLR,
            NOP,
            BLR,
            NOP,
            BLR,
            // call outside .text
            bl(at(8), FOREIGN),
            BLR,
        ];
        let image = fixtures::image_with_code(&code);
        let mut registry = FunctionRegistry::new();
        let options = AnalysisOptions::default();
        assert_eq!(seed(&image, &mut registry, &options).unwrap(), 2);

        let text_end = at(code.len());
        assert_eq!(
            starts(&registry),
            vec![
                (at(4), at(6), FunctionSource::CallTarget),
                (at(6), text_end, FunctionSource::CallTarget),
            ]
        );
    }

    #[test]
    fn known_functions_bound_candidates() {
        let code = [bl(at(0), at(2)), BLR, NOP, BLR, NOP, BLR];
        let image = fixtures::image_with_code(&code);
        let mut registry = FunctionRegistry::new();
        registry.insert(Function::new(at(4), at(6), FunctionSource::ExceptionTable));
        // covered by a known function
        registry.insert(Function::new(at(1), at(3), FunctionSource::ExceptionTable));

        seed(&image, &mut registry, &AnalysisOptions::default()).unwrap();
        assert_eq!(registry.len(), 2);

        let mut registry = FunctionRegistry::new();
        registry.insert(Function::new(at(4), at(6), FunctionSource::ExceptionTable));
        seed(&image, &mut registry, &AnalysisOptions::default()).unwrap();
        let id = registry.find_by_start(at(2)).unwrap();
        assert_eq!(registry.get(id).end(), at(4));
    }

    #[test]
    fn entry_point_and_prologues() {
        let code = [NOP, BLR, MFLR_R12, BLR];
        let image = fixtures::text_builder().code(&code).entry(at(0)).build();

        let mut registry = FunctionRegistry::new();
        seed(&image, &mut registry, &AnalysisOptions::default()).unwrap();
        assert_eq!(starts(&registry), vec![(at(0), at(4), FunctionSource::EntryPoint)]);

        let options = AnalysisOptions {
            seed_entry_point: false,
            seed_prologues: true,
            ..AnalysisOptions::default()
        };
        let mut registry = FunctionRegistry::new();
        seed(&image, &mut registry, &options).unwrap();
        assert_eq!(starts(&registry), vec![(at(2), at(4), FunctionSource::Prologue)]);
    }

    #[test]
    fn entry_point_outside_text() {
        // the default fixture entry point is 0
        let image = fixtures::image_with_code(&[BLR]);
        let mut registry = FunctionRegistry::new();
        assert_eq!(seed(&image, &mut registry, &AnalysisOptions::default()).unwrap(), 0);
    }
}

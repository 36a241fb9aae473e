//! Whole-image control-flow analysis.
//!
//! The phases run in a fixed order, each adding functions to a shared
//! `FunctionRegistry`:
//!
//! 1. compiler intrinsics and platform stubs (`intrinsics`);
//! 2. the exception table (`pdata`);
//! 3. speculative starts: call targets, the entry point, prologues
//!    (`discover`);
//! 4. basic blocks and ends of every function (`cfa`);
//! 5. optionally, functions for code no other function covers.

use crate::cfa;
use crate::function::{Function, FunctionRegistry, FunctionSource, IntrinsicRanges};
use crate::pdata::{self, ExceptionEntry};
use crate::pe::{PeImage, SectionView};
use crate::{discover, intrinsics, Error};

use std::fmt;
use std::ops::Range;

/// Tunables of `analyze`.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Treat the image entry point as a function start.
    pub seed_entry_point: bool,
    /// Treat every `mflr r12` as a function start.
    pub seed_prologues: bool,
    /// Create functions for code not covered by any function, until no new
    /// function appears.
    pub fill_gaps: bool,
    /// Report code not covered by any function.
    pub report_uncovered: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            seed_entry_point: true,
            seed_prologues: false,
            fill_gaps: false,
            report_uncovered: true,
        }
    }
}

/// A finding that doesn't stop the analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The exception table and the heuristics disagree on where a function
    /// ends. The table wins.
    ExtentMismatch {
        start: u32,
        table_end: u32,
        heuristic_end: u32,
    },
    /// Non-zero words in `.text` that are not part of any function.
    UncoveredCode { start: u32, end: u32 },
    /// A symbol from a map file with no function starting at its address.
    UnmatchedSymbol { name: String, address: u32 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Diagnostic::ExtentMismatch { start, table_end, heuristic_end } => write!(
                f,
                "function {:08X} ends at {:08X} according to the exception table, but at {:08X} according to its code",
                start, table_end, heuristic_end
            ),
            Diagnostic::UncoveredCode { start, end } => {
                write!(f, "code at {:08X}..{:08X} is not part of any function", start, end)
            }
            Diagnostic::UnmatchedSymbol { name, address } => {
                write!(f, "no function found for symbol `{}` at {:08X}", name, address)
            }
        }
    }
}

/// The result of `analyze`.
#[derive(Debug)]
pub struct Analysis {
    registry: FunctionRegistry,
    intrinsics: IntrinsicRanges,
    exception_table: Vec<ExceptionEntry>,
    diagnostics: Vec<Diagnostic>,
    code_range: Range<u32>,
}

impl Analysis {
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// All functions, ordered by start address.
    pub fn functions(&self) -> impl Iterator<Item = &Function> + '_ {
        self.registry.iter()
    }

    pub fn intrinsics(&self) -> &IntrinsicRanges {
        &self.intrinsics
    }

    pub fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Virtual address range of `.text`.
    pub fn code_range(&self) -> Range<u32> {
        self.code_range.clone()
    }
}

/// Recovers the functions of `image` and their basic blocks.
pub fn analyze(image: &PeImage, options: &AnalysisOptions) -> Result<Analysis, Error> {
    let text = image.code_view()?;
    let mut registry = FunctionRegistry::new();
    let mut diagnostics = Vec::new();

    let intrinsics = intrinsics::scan(image, &mut registry)?;

    let exception_table = pdata::read(image)?;
    pdata::register(&exception_table, &mut registry, &intrinsics, &mut diagnostics);

    discover::seed(image, &mut registry, options)?;
    analyze_pending(&text, &mut registry, &intrinsics, &mut diagnostics);

    if options.fill_gaps {
        fill_gaps(&text, &mut registry, &intrinsics, &mut diagnostics);
    }

    if options.report_uncovered {
        for span in uncovered(&text, &registry) {
            let diagnostic = Diagnostic::UncoveredCode {
                start: span.start,
                end: span.end,
            };
            warn!("{}", diagnostic);
            diagnostics.push(diagnostic);
        }
    }

    info!(
        "analysis: {} functions, {} with jump tables, {} diagnostics",
        registry.len(),
        registry.iter().filter(|f| f.possible_jump_table()).count(),
        diagnostics.len()
    );

    Ok(Analysis {
        registry,
        intrinsics,
        exception_table,
        diagnostics,
        code_range: text.base()..text.end(),
    })
}

/// Runs the control-flow analysis on every function that hasn't been
/// analyzed yet.
fn analyze_pending(
    text: &SectionView,
    registry: &mut FunctionRegistry,
    intrinsics: &IntrinsicRanges,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for id in registry.ids() {
        if registry.get(id).analyzed() {
            continue;
        }

        let function = registry.get(id);
        let limit = registry
            .next_start_after(function.start())
            .unwrap_or_else(|| text.end());
        let graph = cfa::build(text, function, limit, intrinsics);
        let function = registry.get_mut(id);
        if !function.is_exact() {
            function.set_end(graph.end);
        } else if let Some(heuristic_end) = graph.heuristic_end {
            if heuristic_end != function.end() && !function.is_intrinsic() {
                let diagnostic = Diagnostic::ExtentMismatch {
                    start: function.start(),
                    table_end: function.end(),
                    heuristic_end,
                };
                warn!("{}", diagnostic);
                diagnostics.push(diagnostic);
            }
        }
        function.finish(graph.blocks, graph.possible_jump_table);
    }
}

/// Seeds a function at the start of every uncovered span and analyzes it,
/// until everything is covered or no new function can be added.
fn fill_gaps(
    text: &SectionView,
    registry: &mut FunctionRegistry,
    intrinsics: &IntrinsicRanges,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let mut total = 0;
    loop {
        let mut added = 0;
        for span in uncovered(text, registry) {
            let end = registry.next_start_after(span.start).unwrap_or_else(|| text.end());
            if registry
                .insert(Function::new(span.start, end, FunctionSource::Gap))
                .is_some()
            {
                added += 1;
            }
        }
        if added == 0 {
            break;
        }
        total += added;
        analyze_pending(text, registry, intrinsics, diagnostics);
    }
    info!("gap filling: {} new functions", total);
}

/// Returns the spans of non-zero words in `.text` not covered by any
/// function.
fn uncovered(text: &SectionView, registry: &FunctionRegistry) -> Vec<Range<u32>> {
    let mut spans = Vec::new();
    let mut current: Option<Range<u32>> = None;

    for (addr, word) in text.words() {
        if word != 0 && registry.containing(addr).is_none() {
            match current.as_mut() {
                Some(span) => span.end = addr + 4,
                None => current = Some(addr..addr + 4),
            }
        } else if let Some(span) = current.take() {
            spans.push(span);
        }
    }
    spans.extend(current);
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use crate::function::Terminator;
    use crate::pe::SectionFlags;

    fn user_functions(analysis: &Analysis) -> Vec<(u32, u32, FunctionSource)> {
        analysis
            .functions()
            .filter(|f| !f.is_intrinsic())
            .map(|f| (f.start(), f.end(), f.source()))
            .collect()
    }

    #[test]
    fn pipeline() {
        let code = [
            /* 0 */ MFLR_R12,
            /* 1 */ bl(at(1), TEXT_BASE),
            /* 2 */ bl(at(2), at(6)),
            /* 3 */ b(at(3), TEXT_BASE + 0x94),
            /* 4 */ 0,
            /* 5 */ 0,
            /* 6 */ cmplwi(1),
            /* 7 */ beq(at(7), at(9)),
            /* 8 */ LI_R3_0,
            /* 9 */ BLR,
        ];
        let image = text_builder()
            .code(&code)
            .entry(at(0))
            .pdata(&[(at(0), pdata_word(2, 4, false))])
            .build();
        let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();

        assert_eq!(
            user_functions(&analysis),
            vec![
                (at(0), at(4), FunctionSource::ExceptionTable),
                (at(6), at(10), FunctionSource::CallTarget),
            ]
        );
        assert!(analysis.diagnostics().is_empty(), "{:?}", analysis.diagnostics());
        assert_eq!(analysis.exception_table().len(), 1);
        assert_eq!(analysis.code_range(), TEXT_BASE..at(10));
        assert!(analysis.intrinsics().gpr().is_some());

        let registry = analysis.registry();
        let main = registry.get(registry.find_by_start(at(0)).unwrap());
        assert_eq!(main.blocks().len(), 3);
        assert_eq!(main.blocks()[2].terminator, Terminator::IntrinsicReturn);

        let callee = registry.get(registry.find_by_start(at(6)).unwrap());
        assert!(callee.analyzed());
        assert_eq!(callee.blocks().len(), 3);

        // every function is analyzed, and its blocks partition it
        for f in analysis.functions() {
            assert!(f.analyzed(), "{}", f.name());
            let covered: u32 = f.blocks().iter().map(|b| b.end - b.start).sum();
            assert_eq!(covered, f.len(), "{}", f.name());
        }
    }

    #[test]
    fn extent_mismatch_is_reported() {
        let code = [NOP, BLR, NOP, BLR];
        let image = text_builder()
            .code(&code)
            .pdata(&[(at(0), pdata_word(0, 4, false))])
            .build();
        let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();

        assert_eq!(
            user_functions(&analysis),
            vec![(at(0), at(4), FunctionSource::ExceptionTable)]
        );
        assert_eq!(
            analysis.diagnostics(),
            &[Diagnostic::ExtentMismatch {
                start: at(0),
                table_end: at(4),
                heuristic_end: at(2),
            }]
        );
    }

    #[test]
    fn code_running_past_the_table_extent() {
        let code = [NOP, NOP, NOP, BLR];
        let image = text_builder()
            .code(&code)
            .pdata(&[(at(0), pdata_word(0, 2, false))])
            .build();
        let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();

        // the table wins, its extent is not corrected
        assert_eq!(
            user_functions(&analysis),
            vec![(at(0), at(2), FunctionSource::ExceptionTable)]
        );
        assert_eq!(
            analysis.diagnostics(),
            &[
                Diagnostic::ExtentMismatch {
                    start: at(0),
                    table_end: at(2),
                    heuristic_end: at(4),
                },
                Diagnostic::UncoveredCode { start: at(2), end: at(4) },
            ]
        );
    }

    #[test]
    fn uncovered_code_and_gap_filling() {
        let code = [
            /* 0 */ bl(at(0), at(2)),
            /* 1 */ BLR,
            /* 2 */ BLR,
            /* 3 */ 0,
            /* 4 */ NOP,
            /* 5 */ bl(at(5), at(8)),
            /* 6 */ BLR,
            /* 7 */ 0,
            /* 8 */ BLR,
        ];
        let image = text_builder().code(&code).entry(at(0)).build();

        let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();
        assert_eq!(
            analysis.diagnostics(),
            &[Diagnostic::UncoveredCode { start: at(4), end: at(7) }]
        );

        let options = AnalysisOptions {
            fill_gaps: true,
            ..AnalysisOptions::default()
        };
        let analysis = analyze(&image, &options).unwrap();
        assert!(analysis.diagnostics().is_empty(), "{:?}", analysis.diagnostics());
        assert_eq!(
            user_functions(&analysis),
            vec![
                (at(0), at(2), FunctionSource::EntryPoint),
                (at(2), at(3), FunctionSource::CallTarget),
                (at(4), at(7), FunctionSource::Gap),
                (at(8), at(9), FunctionSource::CallTarget),
            ]
        );
    }

    #[test]
    fn text_away_from_its_raw_offset() {
        // .rdata comes first, so .text lands at raw offset 0x1200 but RVA 0x2000
        let text_base = IMAGE_BASE + 0x2000;
        let code_base = text_base + INTRINSICS_SIZE;
        let mut text = intrinsic_words();
        text.extend(&[NOP, BLR, MFLR_R12, BLR]);
        let pdata = [
            code_base,
            pdata_word(0, 2, false),
            code_base + 8,
            pdata_word(1, 2, true),
            0,
            0,
        ];
        let image = PeBuilder::new()
            .section(".rdata", 0x1000, &[0x5A; 0x200], SectionFlags::CNT_INITIALIZED_DATA)
            .section(".text", 0x2000, &words_to_bytes(&text), SectionFlags::CNT_CODE)
            .section(".pdata", 0x3000, &words_to_bytes(&pdata), SectionFlags::CNT_INITIALIZED_DATA)
            .build();
        assert_eq!(image.section(".text").unwrap().raw_offset(), 0x1200);
        assert_eq!(image.addr_to_offset(text_base), Some(0x1200));
        assert_eq!(image.read_u32_at(code_base + 4).unwrap(), BLR);

        let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();
        assert_eq!(analysis.code_range(), text_base..code_base + 16);

        let registry = analysis.registry();
        let save = registry.get(registry.find_by_start(text_base).unwrap());
        assert_eq!(save.name(), "__savegprlr_14");
        assert_eq!(analysis.intrinsics().gpr(), Some(&(text_base..text_base + 0xA4)));
        assert_eq!(
            analysis.intrinsics().vmx(),
            Some(&(text_base + VMX_OFFSET..code_base))
        );

        let starts: Vec<_> = analysis.exception_table().iter().map(|e| e.begin()).collect();
        assert_eq!(starts, vec![code_base, code_base + 8]);
        assert_eq!(
            user_functions(&analysis),
            vec![
                (code_base, code_base + 8, FunctionSource::ExceptionTable),
                (code_base + 8, code_base + 16, FunctionSource::ExceptionTable),
            ]
        );
        assert!(analysis.diagnostics().is_empty(), "{:?}", analysis.diagnostics());
    }

    #[test]
    fn missing_intrinsics() {
        let image = PeBuilder::new()
            .section(".text", 0x1000, &[0x60, 0, 0, 0], SectionFlags::CNT_CODE)
            .build();
        match analyze(&image, &AnalysisOptions::default()) {
            Err(Error::MissingIntrinsic(name)) => assert_eq!(name, "__savegprlr_14"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}

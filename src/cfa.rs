//! Per-function control-flow analysis.
//!
//! A function is swept linearly from its start. Every branch splits the code
//! into basic blocks: the instruction after a branch and every branch target
//! inside the function start a new block. The sweep also decides where a
//! function whose extent is only speculative really ends:
//!
//! * a zero word is padding between functions;
//! * a return or unrecognized `bctr` ends the function, unless an earlier
//!   branch targets code beyond it;
//! * a `b` leaving the function is a tail call. Whether code after it still
//!   belongs to the function is decided by looking ahead: the sweep continues
//!   tentatively and only keeps the continuation if a later branch jumps back
//!   to before the tail call.
//!
//! Jump tables are detected by their dispatch sequence (compare immediate,
//! indexed load, `mtctr`, `bctr`) but their targets are not resolved.

use crate::function::{BasicBlock, Function, IntrinsicRanges, Terminator};
use crate::pe::SectionView;
use crate::ppc::{self, Control};

use std::collections::{BTreeMap, BTreeSet};

bitflags! {
    /// Progress through a jump-table dispatch sequence.
    struct DispatchPattern: u8 {
        const COMPARE       = 0b001;
        const INDEXED_LOAD  = 0b010;
        const MOVE_TO_CTR   = 0b100;
    }
}

impl DispatchPattern {
    /// Advances the pattern with a non-branch instruction. Each step only
    /// counts once the previous one was seen.
    fn step(&mut self, word: u32) {
        if ppc::is_cmpli(word) {
            self.insert(DispatchPattern::COMPARE);
        } else if ppc::is_load_indexed(word) && self.contains(DispatchPattern::COMPARE) {
            self.insert(DispatchPattern::INDEXED_LOAD);
        } else if ppc::is_mtctr(word) && self.contains(DispatchPattern::INDEXED_LOAD) {
            self.insert(DispatchPattern::MOVE_TO_CTR);
        }
    }

    fn is_complete(self) -> bool {
        self.is_all()
    }
}

/// The result of analyzing a function.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    /// The blocks, ordered by address. They partition `start..end`.
    pub blocks: Vec<BasicBlock>,
    /// Where the function ends. Equal to the known end for exact functions.
    pub end: u32,
    /// For exact functions: where the heuristics alone would have ended it.
    /// Never beyond the limit passed to `build`.
    pub heuristic_end: Option<u32>,
    pub possible_jump_table: bool,
}

/// Builds the basic blocks of `function`.
///
/// Exact functions keep their end. Their heuristic sweep may run past it, up
/// to `heuristic_limit` (usually the next function start or the end of
/// `.text`). Other functions are analyzed up to their provisional end and may
/// end earlier.
pub fn build(
    text: &SectionView,
    function: &Function,
    heuristic_limit: u32,
    intrinsics: &IntrinsicRanges,
) -> FlowGraph {
    let (start, end) = (function.start(), function.end());

    if function.is_intrinsic() {
        let blocks = if start < end {
            vec![BasicBlock {
                start,
                end,
                successors: Vec::new(),
                terminator: Terminator::Intrinsic,
            }]
        } else {
            Vec::new()
        };
        return FlowGraph {
            blocks,
            end,
            heuristic_end: None,
            possible_jump_table: false,
        };
    }

    let graph = if function.is_exact() {
        let limit = heuristic_limit.max(end);
        let heuristic = Sweep::new(text, intrinsics, start, limit, false).run();
        let mut graph = Sweep::new(text, intrinsics, start, end, true).run().materialize(start, end);
        graph.heuristic_end = Some(heuristic.end);
        graph
    } else {
        let sweep = Sweep::new(text, intrinsics, start, end, false).run();
        let end = sweep.end;
        sweep.materialize(start, end)
    };

    debug!(
        "{} {:08X}..{:08X}: {} blocks{}",
        function.name(),
        start,
        graph.end,
        graph.blocks.len(),
        if graph.possible_jump_table { ", jump table" } else { "" }
    );
    graph
}

/// How the last instruction of a block leaves it.
#[derive(Debug, Clone)]
struct Exit {
    terminator: Terminator,
    successors: Vec<u32>,
}

/// Everything the sweep has learned so far. Cloned to roll back a tentative
/// continuation after a tail call.
#[derive(Debug, Clone, Default)]
struct State {
    boundaries: BTreeSet<u32>,
    /// Branch targets inside the function.
    targets: BTreeSet<u32>,
    /// Exits, keyed by the address of the instruction.
    exits: BTreeMap<u32, Exit>,
    pattern: DispatchPattern,
    jump_table: bool,
}

impl Default for DispatchPattern {
    fn default() -> Self {
        DispatchPattern::empty()
    }
}

/// A tail call whose continuation is not yet known to belong to the function.
#[derive(Debug)]
struct Deferred {
    addr: u32,
    state: State,
}

struct Sweep<'a> {
    text: &'a SectionView<'a>,
    intrinsics: &'a IntrinsicRanges,
    start: u32,
    limit: u32,
    /// Sweep the whole extent, never stopping early.
    exact: bool,
    state: State,
    deferred: Option<Deferred>,
    /// Where the function ends, once the sweep is done.
    end: u32,
}

/// What to do after an instruction.
enum Step {
    Continue,
    /// The function ends after this instruction.
    Stop,
}

impl<'a> Sweep<'a> {
    fn new(
        text: &'a SectionView<'a>,
        intrinsics: &'a IntrinsicRanges,
        start: u32,
        limit: u32,
        exact: bool,
    ) -> Self {
        let mut state = State::default();
        state.boundaries.insert(start);
        Self {
            text,
            intrinsics,
            start,
            limit,
            exact,
            state,
            deferred: None,
            end: limit,
        }
    }

    fn in_bounds(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.limit
    }

    /// Whether some branch seen so far targets code after `addr`.
    fn target_beyond(&self, addr: u32) -> bool {
        self.state.targets.range(addr.saturating_add(1)..).next().is_some()
    }

    fn run(mut self) -> Self {
        let mut addr = self.start;
        while addr < self.limit {
            let word = match self.text.word_at(addr) {
                Some(word) => word,
                None => {
                    trace!("{:08X}: not backed by data", addr);
                    return self.stop(addr);
                }
            };

            if word == 0 {
                if !self.exact {
                    trace!("{:08X}: padding", addr);
                    return self.stop(addr);
                }
                addr += 4;
                continue;
            }

            match self.step(addr, word) {
                Step::Continue => addr += 4,
                Step::Stop => return self.stop(addr + 4),
            }
        }
        let limit = self.limit;
        self.stop(limit)
    }

    /// Ends the sweep at `end`, unless a tail call before it is still
    /// unconfirmed, in which case the function ends after that tail call.
    fn stop(mut self, end: u32) -> Self {
        match self.deferred.take() {
            Some(deferred) => {
                trace!("{:08X}: dropping continuation after tail call", deferred.addr);
                self.state = deferred.state;
                self.end = deferred.addr + 4;
            }
            None => self.end = end,
        }
        self
    }

    fn exit(&mut self, addr: u32, terminator: Terminator, successors: Vec<u32>) {
        self.state.boundaries.insert(addr + 4);
        self.state.exits.insert(addr, Exit { terminator, successors });
    }

    /// Records an in-bounds branch target.
    fn target(&mut self, target: u32) {
        self.state.boundaries.insert(target);
        self.state.targets.insert(target);
        if let Some(deferred) = &self.deferred {
            if target >= self.start && target <= deferred.addr {
                trace!("{:08X}: tail call confirmed by branch back to {:08X}", deferred.addr, target);
                self.deferred = None;
            }
        }
    }

    /// The current path ended at `addr`. The function ends here unless code
    /// further down is known to be reachable.
    fn path_end(&self, addr: u32) -> Step {
        if self.exact || self.target_beyond(addr) {
            Step::Continue
        } else {
            Step::Stop
        }
    }

    fn step(&mut self, addr: u32, word: u32) -> Step {
        let next = addr + 4;
        match ppc::classify(addr, word) {
            Control::None => {
                self.state.pattern.step(word);
                Step::Continue
            }
            Control::ConditionalBranch(target) => {
                let mut successors = Vec::with_capacity(2);
                if self.in_bounds(target) {
                    self.target(target);
                    successors.push(target);
                }
                successors.push(next);
                self.exit(addr, Terminator::ConditionalBranch, successors);
                Step::Continue
            }
            Control::Call(_) => {
                self.state.pattern = DispatchPattern::empty();
                self.exit(addr, Terminator::Call, vec![next]);
                Step::Continue
            }
            Control::IndirectCall => {
                self.state.pattern = DispatchPattern::empty();
                self.exit(addr, Terminator::IndirectCall, vec![next]);
                Step::Continue
            }
            Control::ConditionalReturn => {
                self.exit(addr, Terminator::ConditionalReturn, vec![next]);
                Step::Continue
            }
            Control::ConditionalIndirect => {
                self.exit(addr, Terminator::ConditionalIndirect, vec![next]);
                Step::Continue
            }
            Control::Return | Control::ReturnAndLink => {
                self.state.pattern = DispatchPattern::empty();
                self.exit(addr, Terminator::Return, Vec::new());
                self.path_end(addr)
            }
            Control::IndirectBranch => {
                let pattern = self.state.pattern;
                self.state.pattern = DispatchPattern::empty();
                if pattern.is_complete() {
                    trace!("{:08X}: jump table dispatch", addr);
                    self.state.jump_table = true;
                    self.exit(addr, Terminator::JumpTable, Vec::new());
                    Step::Continue
                } else {
                    self.exit(addr, Terminator::IndirectTailCall, Vec::new());
                    self.path_end(addr)
                }
            }
            Control::Branch(target) => {
                self.state.pattern = DispatchPattern::empty();
                if self.in_bounds(target) {
                    self.target(target);
                    self.exit(addr, Terminator::Branch, vec![target]);
                    Step::Continue
                } else if self.intrinsics.contains(target) {
                    self.exit(addr, Terminator::IntrinsicReturn, Vec::new());
                    self.path_end(addr)
                } else {
                    self.exit(addr, Terminator::TailCall, Vec::new());
                    self.tail_call(addr)
                }
            }
        }
    }

    fn tail_call(&mut self, addr: u32) -> Step {
        if self.exact {
            return Step::Continue;
        }

        let next = addr + 4;
        let next_word = if next < self.limit { self.text.word_at(next) } else { None };
        match next_word {
            None | Some(0) => {
                trace!("{:08X}: tail call at end of code", addr);
                Step::Stop
            }
            Some(_) if self.target_beyond(addr) => Step::Continue,
            Some(_) => {
                if self.deferred.is_none() {
                    trace!("{:08X}: possible tail call, looking ahead", addr);
                    self.deferred = Some(Deferred {
                        addr,
                        state: self.state.clone(),
                    });
                }
                Step::Continue
            }
        }
    }

    /// Turns the collected boundaries and exits into blocks covering
    /// `start..end`.
    fn materialize(self, start: u32, end: u32) -> FlowGraph {
        let State {
            boundaries,
            exits,
            jump_table,
            ..
        } = self.state;

        let mut starts: Vec<u32> = boundaries.range(start..end).cloned().collect();
        if start < end && starts.first() != Some(&start) {
            starts.insert(0, start);
        }

        let mut blocks = Vec::with_capacity(starts.len());
        for (i, &block_start) in starts.iter().enumerate() {
            let block_end = starts.get(i + 1).cloned().unwrap_or(end);
            let last = block_end.wrapping_sub(4);

            let (mut terminator, successors) = match exits.get(&last) {
                Some(exit) => {
                    let successors = exit
                        .successors
                        .iter()
                        .cloned()
                        .filter(|s| *s >= start && *s < end)
                        .collect::<Vec<_>>();
                    (exit.terminator, successors)
                }
                _ if block_end < end => (Terminator::Fallthrough, vec![block_end]),
                _ => (Terminator::Truncated, Vec::new()),
            };
            if terminator.flows() && successors.is_empty() {
                terminator = Terminator::Truncated;
            }

            blocks.push(BasicBlock {
                start: block_start,
                end: block_end,
                successors,
                terminator,
            });
        }

        FlowGraph {
            blocks,
            end,
            heuristic_end: None,
            possible_jump_table: jump_table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use crate::function::{FunctionSource, IntrinsicKind};

    fn analyze(code: &[u32], start: usize, end: usize, source: FunctionSource) -> FlowGraph {
        let image = image_with_code(code);
        let text = image.code_view().unwrap();
        let mut intrinsics = IntrinsicRanges::new();
        intrinsics.record(IntrinsicKind::Gpr, "__savegprlr", TEXT_BASE..TEXT_BASE + 0xA4);
        let function = Function::new(at(start), at(end), source);
        build(&text, &function, text.end(), &intrinsics)
    }

    fn speculative(code: &[u32]) -> FlowGraph {
        analyze(code, 0, code.len(), FunctionSource::CallTarget)
    }

    /// `(start index, end index, terminator, successor indices)`
    fn blocks(graph: &FlowGraph) -> Vec<(usize, usize, Terminator, Vec<usize>)> {
        let index = |addr: u32| ((addr - CODE_BASE) / 4) as usize;
        graph
            .blocks
            .iter()
            .map(|b| {
                (
                    index(b.start),
                    index(b.end),
                    b.terminator,
                    b.successors.iter().map(|s| index(*s)).collect(),
                )
            })
            .collect()
    }

    fn assert_partition(graph: &FlowGraph, start: u32) {
        let mut pos = start;
        for block in &graph.blocks {
            assert_eq!(block.start, pos);
            assert!(block.end > block.start);
            pos = block.end;
        }
        assert_eq!(pos, graph.end);
    }

    #[test]
    fn straight_line() {
        let graph = speculative(&[MFLR_R12, NOP, BLR, 0, NOP]);
        assert_eq!(graph.end, at(3));
        assert_eq!(blocks(&graph), vec![(0, 3, Terminator::Return, vec![])]);
        assert!(!graph.possible_jump_table);
    }

    #[test]
    fn if_else() {
        let code = [
            /* 0 */ cmplwi(3),
            /* 1 */ beq(at(1), at(4)),
            /* 2 */ LI_R3_0,
            /* 3 */ b(at(3), at(5)),
            /* 4 */ NOP,
            /* 5 */ BLR,
            /* 6 */ 0,
        ];
        let graph = speculative(&code);
        assert_eq!(graph.end, at(6));
        assert_partition(&graph, at(0));
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 2, Terminator::ConditionalBranch, vec![4, 2]),
                (2, 4, Terminator::Branch, vec![5]),
                (4, 5, Terminator::Fallthrough, vec![5]),
                (5, 6, Terminator::Return, vec![]),
            ]
        );
    }

    #[test]
    fn early_return_continues_to_branch_target() {
        let code = [
            /* 0 */ bne(at(0), at(2)),
            /* 1 */ BLR,
            /* 2 */ bl(at(2), FOREIGN),
            /* 3 */ BLR,
            /* 4 */ NOP,
        ];
        let graph = speculative(&code);
        assert_eq!(graph.end, at(4));
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 1, Terminator::ConditionalBranch, vec![2, 1]),
                (1, 2, Terminator::Return, vec![]),
                (2, 3, Terminator::Call, vec![3]),
                (3, 4, Terminator::Return, vec![]),
            ]
        );
    }

    #[test]
    fn loops() {
        let code = [
            /* 0 */ LI_R3_0,
            /* 1 */ NOP,
            /* 2 */ bc(16, 0, at(2), at(1)),
            /* 3 */ BLR,
        ];
        let graph = speculative(&code);
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 1, Terminator::Fallthrough, vec![1]),
                (1, 3, Terminator::ConditionalBranch, vec![1, 3]),
                (3, 4, Terminator::Return, vec![]),
            ]
        );
    }

    #[test]
    fn tail_call_before_padding() {
        let code = [NOP, b(at(1), FOREIGN), 0, NOP, BLR];
        let graph = speculative(&code);
        assert_eq!(graph.end, at(2));
        assert_eq!(blocks(&graph), vec![(0, 2, Terminator::TailCall, vec![])]);
    }

    #[test]
    fn tail_call_continuation_dropped() {
        // the code after the tail call never jumps back: it's the next function
        let code = [
            /* 0 */ NOP,
            /* 1 */ b(at(1), FOREIGN),
            /* 2 */ MFLR_R12,
            /* 3 */ NOP,
            /* 4 */ BLR,
        ];
        let graph = speculative(&code);
        assert_eq!(graph.end, at(2));
        assert_eq!(blocks(&graph), vec![(0, 2, Terminator::TailCall, vec![])]);
    }

    #[test]
    fn tail_call_continuation_confirmed() {
        // a branch back to before the tail call proves the code belongs here
        let code = [
            /* 0 */ NOP,
            /* 1 */ b(at(1), FOREIGN),
            /* 2 */ NOP,
            /* 3 */ b(at(3), at(0)),
            /* 4 */ 0,
        ];
        let graph = speculative(&code);
        assert_eq!(graph.end, at(4));
        assert_partition(&graph, at(0));
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 2, Terminator::TailCall, vec![]),
                (2, 4, Terminator::Branch, vec![0]),
            ]
        );
    }

    #[test]
    fn tail_call_inside_conditional() {
        // a forward target beyond the tail call keeps the sweep going
        let code = [
            /* 0 */ beq(at(0), at(2)),
            /* 1 */ b(at(1), FOREIGN),
            /* 2 */ BLR,
            /* 3 */ NOP,
        ];
        let graph = speculative(&code);
        assert_eq!(graph.end, at(3));
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 1, Terminator::ConditionalBranch, vec![2, 1]),
                (1, 2, Terminator::TailCall, vec![]),
                (2, 3, Terminator::Return, vec![]),
            ]
        );
    }

    #[test]
    fn branch_to_restore_intrinsic() {
        let code = [NOP, b(at(1), TEXT_BASE + 0x94), NOP, BLR];
        let graph = speculative(&code);
        assert_eq!(graph.end, at(2));
        assert_eq!(blocks(&graph), vec![(0, 2, Terminator::IntrinsicReturn, vec![])]);
    }

    #[test]
    fn jump_table() {
        let code = [
            /* 0 */ cmplwi(4),
            /* 1 */ bc(12, 1, at(1), at(7)),
            /* 2 */ LWZX,
            /* 3 */ MTCTR_R12,
            /* 4 */ BCTR,
            /* 5 */ NOP,
            /* 6 */ BLR,
            /* 7 */ BLR,
        ];
        let graph = speculative(&code);
        assert!(graph.possible_jump_table);
        assert_eq!(graph.end, at(8));
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 2, Terminator::ConditionalBranch, vec![7, 2]),
                (2, 5, Terminator::JumpTable, vec![]),
                (5, 7, Terminator::Return, vec![]),
                (7, 8, Terminator::Return, vec![]),
            ]
        );
    }

    #[test]
    fn dispatch_pattern_order() {
        // mtctr before the load: not a jump table
        let code = [cmplwi(4), MTCTR_R12, LWZX, BCTR, NOP];
        let graph = speculative(&code);
        assert!(!graph.possible_jump_table);
        assert_eq!(graph.end, at(4));
        assert_eq!(blocks(&graph), vec![(0, 4, Terminator::IndirectTailCall, vec![])]);

        // a call in between resets the pattern
        let code = [cmplwi(4), LWZX, bl(at(2), FOREIGN), MTCTR_R12, BCTR];
        assert!(!speculative(&code).possible_jump_table);
    }

    #[test]
    fn register_branches() {
        let code = [BEQLR, MTCTR_R12, BCTRL, BEQCTR, BLRL];
        let graph = speculative(&code);
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 1, Terminator::ConditionalReturn, vec![1]),
                (1, 3, Terminator::IndirectCall, vec![3]),
                (3, 4, Terminator::ConditionalIndirect, vec![4]),
                (4, 5, Terminator::Return, vec![]),
            ]
        );
    }

    #[test]
    fn zero_word_at_start() {
        let graph = speculative(&[0, NOP, BLR]);
        assert_eq!(graph.end, at(0));
        assert!(graph.blocks.is_empty());
    }

    #[test]
    fn truncated_at_limit() {
        let code = [NOP, bl(at(1), FOREIGN), NOP, NOP];
        let graph = analyze(&code, 0, 2, FunctionSource::CallTarget);
        assert_eq!(graph.end, at(2));
        assert_eq!(blocks(&graph), vec![(0, 2, Terminator::Truncated, vec![])]);
    }

    #[test]
    fn exact_functions_keep_their_extent() {
        let code = [
            /* 0 */ NOP,
            /* 1 */ BLR,
            /* 2 */ 0,
            /* 3 */ NOP,
            /* 4 */ b(at(4), FOREIGN),
            /* 5 */ NOP,
        ];
        let graph = analyze(&code, 0, 6, FunctionSource::ExceptionTable);
        assert_eq!(graph.end, at(6));
        assert_eq!(graph.heuristic_end, Some(at(2)));
        assert_partition(&graph, at(0));
        assert_eq!(
            blocks(&graph),
            vec![
                (0, 2, Terminator::Return, vec![]),
                (2, 5, Terminator::TailCall, vec![]),
                (5, 6, Terminator::Truncated, vec![]),
            ]
        );
    }

    #[test]
    fn heuristic_sweep_runs_past_the_known_end() {
        let code = [NOP, NOP, NOP, BLR];
        let graph = analyze(&code, 0, 2, FunctionSource::ExceptionTable);
        assert_eq!(graph.end, at(2));
        assert_eq!(graph.heuristic_end, Some(at(4)));
        assert_eq!(blocks(&graph), vec![(0, 2, Terminator::Truncated, vec![])]);

        // but not past the limit
        let image = image_with_code(&code);
        let text = image.code_view().unwrap();
        let function = Function::new(at(0), at(1), FunctionSource::ExceptionTable);
        let graph = build(&text, &function, at(2), &IntrinsicRanges::new());
        assert_eq!(graph.end, at(1));
        assert_eq!(graph.heuristic_end, Some(at(2)));
    }

    #[test]
    fn intrinsics_are_not_swept() {
        let image = image_with_code(&[]);
        let text = image.code_view().unwrap();
        let function = Function::new(TEXT_BASE, TEXT_BASE + 4, FunctionSource::Intrinsic(IntrinsicKind::Gpr));
        let graph = build(&text, &function, text.end(), &IntrinsicRanges::new());
        assert_eq!(graph.end, TEXT_BASE + 4);
        assert_eq!(graph.blocks.len(), 1);
        assert_eq!(graph.blocks[0].terminator, Terminator::Intrinsic);
    }
}

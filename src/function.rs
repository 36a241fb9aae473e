//! Functions, basic blocks and the registry holding them.

use std::fmt;
use std::ops::Range;

/// Handle of a function in a `FunctionRegistry`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(usize);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Family of a compiler intrinsic or platform stub.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IntrinsicKind {
    /// `__savegprlr_N` / `__restgprlr_N`.
    Gpr,
    /// `__savefpr_N` / `__restfpr_N`.
    Fpr,
    /// `__savevmx_N` / `__restvmx_N`.
    Vmx,
    /// A platform API import stub.
    PlatformApi,
}

/// How a function's start was found.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FunctionSource {
    Intrinsic(IntrinsicKind),
    /// Listed in `.pdata`.
    ExceptionTable,
    /// Target of a `bl`.
    CallTarget,
    /// The image entry point.
    EntryPoint,
    /// An `mflr r12` prologue.
    Prologue,
    /// First instruction of a span no other function covered.
    Gap,
}

/// How a basic block ends.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Terminator {
    /// Runs into the next block without a branch.
    Fallthrough,
    /// Unconditional branch inside the function.
    Branch,
    /// Conditional branch: taken target and fallthrough.
    ConditionalBranch,
    /// Call, continues after it.
    Call,
    /// `bctrl`, continues after it.
    IndirectCall,
    /// Conditional return, continues after it.
    ConditionalReturn,
    /// Conditional branch through CTR, continues after it.
    ConditionalIndirect,
    /// `blr` or `blrl`.
    Return,
    /// Branch into a register restore intrinsic, which returns to the caller.
    IntrinsicReturn,
    /// Branch to code outside the function.
    TailCall,
    /// `bctr` that is not a recognized jump table.
    IndirectTailCall,
    /// `bctr` dispatching through a jump table. Targets are not resolved.
    JumpTable,
    /// Control would continue past the end of the function.
    Truncated,
    /// The single block of an intrinsic.
    Intrinsic,
}

impl Terminator {
    /// Whether control may continue to a successor within the function.
    pub fn flows(self) -> bool {
        match self {
            Terminator::Fallthrough
            | Terminator::Branch
            | Terminator::ConditionalBranch
            | Terminator::Call
            | Terminator::IndirectCall
            | Terminator::ConditionalReturn
            | Terminator::ConditionalIndirect => true,
            Terminator::Return
            | Terminator::IntrinsicReturn
            | Terminator::TailCall
            | Terminator::IndirectTailCall
            | Terminator::JumpTable
            | Terminator::Truncated
            | Terminator::Intrinsic => false,
        }
    }
}

/// A maximal run of instructions entered only at its first instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Address of the first instruction.
    pub start: u32,
    /// One past the last instruction.
    pub end: u32,
    /// Start addresses of the successor blocks inside the same function.
    pub successors: Vec<u32>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08X}..{:08X} {:?}", self.start, self.end, self.terminator)?;
        if !self.successors.is_empty() {
            write!(f, " ->")?;
            for succ in &self.successors {
                write!(f, " {:08X}", succ)?;
            }
        }
        Ok(())
    }
}

/// A recovered function.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    address_start: u32,
    address_end: u32,
    source: FunctionSource,
    has_exception_handler: bool,
    known_from_exception_table: bool,
    possible_jump_table: bool,
    analyzed: bool,
    blocks: Vec<BasicBlock>,
}

impl Function {
    /// Creates a function spanning `start..end`, named after its address.
    pub fn new(start: u32, end: u32, source: FunctionSource) -> Self {
        Self {
            name: format!("fn_{:08X}", start),
            address_start: start,
            address_end: end,
            source,
            has_exception_handler: false,
            known_from_exception_table: source == FunctionSource::ExceptionTable,
            possible_jump_table: false,
            analyzed: false,
            blocks: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> u32 {
        self.address_start
    }

    /// One past the last instruction.
    pub fn end(&self) -> u32 {
        self.address_end
    }

    pub fn range(&self) -> Range<u32> {
        self.address_start..self.address_end
    }

    pub fn len(&self) -> u32 {
        self.address_end.saturating_sub(self.address_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.address_start && addr < self.address_end
    }

    pub fn source(&self) -> FunctionSource {
        self.source
    }

    pub fn has_exception_handler(&self) -> bool {
        self.has_exception_handler
    }

    pub fn known_from_exception_table(&self) -> bool {
        self.known_from_exception_table
    }

    pub fn possible_jump_table(&self) -> bool {
        self.possible_jump_table
    }

    pub fn analyzed(&self) -> bool {
        self.analyzed
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// Whether this function's extent is authoritative and must not be
    /// changed by heuristics.
    pub fn is_exact(&self) -> bool {
        self.is_intrinsic() || self.known_from_exception_table
    }

    pub fn is_intrinsic(&self) -> bool {
        match self.source {
            FunctionSource::Intrinsic(_) => true,
            _ => false,
        }
    }

    pub(crate) fn set_end(&mut self, end: u32) {
        self.address_end = end;
    }

    /// Marks the function as described by the exception table.
    pub(crate) fn mark_exception_table(&mut self, end: u32, has_handler: bool) {
        self.address_end = end;
        self.known_from_exception_table = true;
        self.has_exception_handler = has_handler;
        self.source = FunctionSource::ExceptionTable;
    }

    pub(crate) fn set_exception_handler(&mut self, has_handler: bool) {
        self.has_exception_handler = has_handler;
    }

    pub(crate) fn finish(&mut self, blocks: Vec<BasicBlock>, possible_jump_table: bool) {
        self.blocks = blocks;
        self.possible_jump_table = possible_jump_table;
        self.analyzed = true;
    }
}

/// All known functions, addressable by id and by start address.
///
/// Functions are never removed. At most one function exists per start
/// address; the first one inserted wins.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: Vec<Function>,
    /// Ids sorted by start address.
    by_start: Vec<FunctionId>,
}

// Ids are only handed out by `insert` and index `functions` directly.
#[cfg_attr(feature = "cargo-clippy", allow(indexing_slicing))]
impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Adds a function. Returns `None` if a function with the same start
    /// already exists.
    pub fn insert(&mut self, function: Function) -> Option<FunctionId> {
        let start = function.start();
        let pos = match self.search(start) {
            Ok(_) => {
                trace!("function at {:08X} already known", start);
                return None;
            }
            Err(pos) => pos,
        };

        let id = FunctionId(self.functions.len());
        self.functions.push(function);
        self.by_start.insert(pos, id);
        Some(id)
    }

    fn search(&self, start: u32) -> Result<usize, usize> {
        let functions = &self.functions;
        self.by_start
            .binary_search_by_key(&start, |id| functions[id.0].start())
    }

    pub fn get(&self, id: FunctionId) -> &Function {
        &self.functions[id.0]
    }

    pub fn get_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0]
    }

    /// Finds the function starting at `addr`.
    pub fn find_by_start(&self, addr: u32) -> Option<FunctionId> {
        self.search(addr).ok().map(|pos| self.by_start[pos])
    }

    /// Finds a function whose extent includes `addr`.
    ///
    /// Functions may overlap (an exception table entry can reach into the
    /// next function), so all functions starting at or below `addr` are
    /// candidates. The one with the highest start wins.
    pub fn containing(&self, addr: u32) -> Option<FunctionId> {
        let functions = &self.functions;
        let pos = self
            .by_start
            .partition_point(|id| functions[id.0].start() <= addr);
        self.by_start[..pos]
            .iter()
            .rev()
            .find(|id| functions[id.0].contains(addr))
            .cloned()
    }

    /// Returns the lowest function start strictly above `addr`.
    pub fn next_start_after(&self, addr: u32) -> Option<u32> {
        let functions = &self.functions;
        let pos = self
            .by_start
            .partition_point(|id| functions[id.0].start() <= addr);
        self.by_start.get(pos).map(|id| functions[id.0].start())
    }

    /// Iterates over the functions in order of their start address.
    pub fn iter(&self) -> impl Iterator<Item = &Function> + '_ {
        self.by_start.iter().map(move |id| &self.functions[id.0])
    }

    /// Returns the function ids in order of their start address.
    pub fn ids(&self) -> Vec<FunctionId> {
        self.by_start.clone()
    }
}

/// Address spans of the register save/restore intrinsics and platform stubs.
///
/// Branches into these spans are returns through a restore routine, not tail
/// calls.
#[derive(Debug, Clone, Default)]
pub struct IntrinsicRanges {
    gpr: Option<Range<u32>>,
    fpr: Option<Range<u32>>,
    vmx: Option<Range<u32>>,
    stubs: Vec<(&'static str, Range<u32>)>,
}

impl IntrinsicRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the span of an intrinsic family. `name` is only kept for
    /// platform stubs, of which there can be several.
    pub(crate) fn record(&mut self, kind: IntrinsicKind, name: &'static str, range: Range<u32>) {
        match kind {
            IntrinsicKind::Gpr => self.gpr = Some(range),
            IntrinsicKind::Fpr => self.fpr = Some(range),
            IntrinsicKind::Vmx => self.vmx = Some(range),
            IntrinsicKind::PlatformApi => self.stubs.push((name, range)),
        }
    }

    pub fn gpr(&self) -> Option<&Range<u32>> {
        self.gpr.as_ref()
    }

    pub fn fpr(&self) -> Option<&Range<u32>> {
        self.fpr.as_ref()
    }

    pub fn vmx(&self) -> Option<&Range<u32>> {
        self.vmx.as_ref()
    }

    /// The platform stubs found, with their names.
    pub fn stubs(&self) -> &[(&'static str, Range<u32>)] {
        &self.stubs
    }

    /// Returns the family of the intrinsic span containing `addr`.
    pub fn kind_of(&self, addr: u32) -> Option<IntrinsicKind> {
        let hit = |r: &Option<Range<u32>>| r.as_ref().map_or(false, |r| r.contains(&addr));
        if hit(&self.gpr) {
            Some(IntrinsicKind::Gpr)
        } else if hit(&self.fpr) {
            Some(IntrinsicKind::Fpr)
        } else if hit(&self.vmx) {
            Some(IntrinsicKind::Vmx)
        } else if self.stubs.iter().any(|(_, r)| r.contains(&addr)) {
            Some(IntrinsicKind::PlatformApi)
        } else {
            None
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.kind_of(addr).is_some()
    }
}

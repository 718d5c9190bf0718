//! Source positions attached to IR nodes.
//!
//! Every node records the bytecode offset it came from and, when the
//! instruction sits inside a guarded region, the entry offset of its
//! exception handler. Deoptimization and exception-table generation read
//! this after optimization, so **every rewrite must preserve it**: replacing
//! a node transfers its position onto the replacement unless the replacement
//! already has one.

/// Sentinel meaning "no exception handler covers this position".
const NO_HANDLER: u32 = u32::MAX;

/// Bytecode position plus optional exception-handler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourcePos {
    bci: u32,
    handler: u32,
}

impl SourcePos {
    /// Position for nodes synthesized by the compiler itself.
    pub const UNKNOWN: SourcePos = SourcePos {
        bci: u32::MAX,
        handler: NO_HANDLER,
    };

    pub const fn new(bci: u32) -> Self {
        SourcePos {
            bci,
            handler: NO_HANDLER,
        }
    }

    /// Position inside a try region; `handler` is the handler-entry offset.
    pub const fn with_handler(bci: u32, handler: u32) -> Self {
        SourcePos { bci, handler }
    }

    pub const fn bci(self) -> u32 {
        self.bci
    }

    pub const fn handler(self) -> Option<u32> {
        if self.handler == NO_HANDLER {
            None
        } else {
            Some(self.handler)
        }
    }

    /// False for compiler-synthesized nodes that have not inherited a
    /// position yet.
    pub const fn is_known(self) -> bool {
        self.bci != u32::MAX
    }
}

impl Default for SourcePos {
    fn default() -> Self {
        SourcePos::UNKNOWN
    }
}

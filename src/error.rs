use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The closed set of failure modes the patch engine can report.
#[derive(Debug, Error)]
pub enum NcpError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("could not read file: {0}")]
    FileUnreadable(PathBuf),
    #[error("could not write file: {0}")]
    FileUnwritable(PathBuf),
    #[error("corrupt ROM file: {0}")]
    CorruptRomFile(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid directive: {0}")]
    InvalidDirective(String),
    #[error("invalid destination mode: {0}")]
    InvalidDestinationMode(String),
    #[error("unresolved symbol version: {0}")]
    UnresolvedSymver(String),
    #[error("overlapping patches: {0}")]
    OverlappingPatches(String),
    #[error("branch out of range: {0}")]
    BranchOutOfRange(String),
    #[error("unrelocatable instruction: {0}")]
    UnrelocatableInstruction(String),
    #[error("unsupported hook: {0}")]
    UnsupportedHook(String),
    #[error("missing interworking support: {0}")]
    MissingInterworking(String),
    #[error("overlay too large: {0}")]
    OverlayTooLarge(String),
    #[error("external tool failed: {0}")]
    ExternalToolFailure(String),
    #[error("rebuild cache corrupt: {0}")]
    RebuildCacheCorrupt(String),
}

/// A scoped stack of human readable "what is happening" descriptions.
///
/// Pushed on stage entry, popped on exit via `ContextGuard`'s `Drop`, so
/// an early return or a `?` never leaves stale context behind.
thread_local! {
    static CONTEXT_STACK: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

pub struct ContextGuard;

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Pushes a context frame and returns a guard that pops it when dropped.
pub fn push_context<S: Into<String>>(msg: S) -> ContextGuard {
    CONTEXT_STACK.with(|stack| stack.borrow_mut().push(msg.into()));
    ContextGuard
}

pub fn context_stack() -> Vec<String> {
    CONTEXT_STACK.with(|stack| stack.borrow().clone())
}

/// Renders an error together with the currently active context stack,
/// outermost frame first, matching the top-level CLI's print discipline.
pub fn render_with_context(err: &anyhow::Error) -> String {
    let mut out = String::new();
    for frame in context_stack() {
        out.push_str(&format!("while {frame}:\n"));
    }
    out.push_str(&format!("  {err}"));
    for cause in err.chain().skip(1) {
        out.push_str(&format!("\n  caused by: {cause}"));
    }
    out
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_guard_pops_on_drop() {
        assert!(context_stack().is_empty());
        {
            let _g = push_context("loading config");
            assert_eq!(context_stack(), vec!["loading config".to_string()]);
            {
                let _g2 = push_context("parsing target");
                assert_eq!(context_stack().len(), 2);
            }
            assert_eq!(context_stack().len(), 1);
        }
        assert!(context_stack().is_empty());
    }

    #[test]
    fn render_includes_context_frames() {
        let _g = push_context("building arm9");
        let err = anyhow::anyhow!(NcpError::BranchOutOfRange("too far".into()));
        let rendered = render_with_context(&err);
        assert!(rendered.contains("while building arm9"));
        assert!(rendered.contains("too far"));
    }
}

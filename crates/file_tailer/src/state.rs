//! Per-file state machine (`spec.md` §4.2):
//!
//! ```text
//! DISCOVERED → OPENED → READING → IDLE → READING
//! READING → ROTATED → (close, reopen, offset=0) → DISCOVERED
//! READING → TRUNCATED → (offset=0) → OPENED
//! READING → DRAINED → (closed)
//! * → ERRORED → backoff → DISCOVERED
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Discovered,
    Opened,
    Reading,
    Idle,
    Rotated,
    Truncated,
    Drained,
    Errored,
}

//! Output-side filter for the keyboard-enhancement CSI family.
//!
//! Hosted applications opt into enhanced key reporting by writing
//! `ESC [ > flags u` (push), `ESC [ < n u` (pop), and `ESC [ ? u` (query)
//! to their terminal. The embedding renderer misinterprets these, so the
//! filter strips them from the output stream, tracks the resulting
//! enhancement-level stack, and reports what it saw so the caller can
//! answer queries out of band.
//!
//! Everything that is not an exact match for this family passes through
//! byte for byte. Sequences split across read chunks are not reassembled:
//! a partial match at the end of a chunk is emitted verbatim. PTY reads
//! arrive in chunks large enough that a short escape sequence straddling a
//! boundary is rare, and favoring prompt delivery over reassembly keeps
//! the renderer honest.

use bytes::{Bytes, BytesMut};

/// A recognized sequence, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCommand {
    /// `ESC [ > flags u`: push an enhancement level (default 0).
    Push { level: u32 },
    /// `ESC [ < n u`: pop; `count` is the number of levels actually
    /// removed after clamping to the stack size (default request is 1).
    Pop { count: u32 },
    /// `ESC [ ? u`: the application asked for the current level. Carries
    /// the level observed at the point the query was decoded, so a reply
    /// is correct even when a push arrived earlier in the same chunk.
    Query { level: u32 },
}

/// Stateful filter for one session's output stream.
///
/// The level stack is the filter's only state. It belongs to exactly one
/// session and is never shared.
#[derive(Debug, Default)]
pub struct KeyProtocolFilter {
    stack: Vec<u32>,
}

const ESC: u8 = 0x1b;

impl KeyProtocolFilter {
    /// Create a filter with an empty stack (enhancement inactive).
    pub fn new() -> Self {
        Self::default()
    }

    /// Current enhancement level: top of the stack, or 0 when empty.
    pub fn level(&self) -> u32 {
        self.stack.last().copied().unwrap_or(0)
    }

    /// Number of pushed levels.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Process one output chunk.
    ///
    /// Returns the chunk with recognized sequences removed, plus the
    /// decoded commands in stream order. Push and pop are already applied
    /// to the stack when this returns; the caller only needs to act on
    /// [`FilterCommand::Query`].
    pub fn filter(&mut self, input: &[u8]) -> (Bytes, Vec<FilterCommand>) {
        let mut out = BytesMut::with_capacity(input.len());
        let mut commands = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            // Emit everything up to the next ESC untouched.
            let Some(rel) = input[pos..].iter().position(|&b| b == ESC) else {
                out.extend_from_slice(&input[pos..]);
                break;
            };
            let esc = pos + rel;
            out.extend_from_slice(&input[pos..esc]);

            match self.match_sequence(&input[esc..]) {
                SequenceMatch::Recognized { len, command } => {
                    self.apply(&mut commands, command);
                    pos = esc + len;
                }
                SequenceMatch::NotOurs { emit } => {
                    // The prefix cannot contain another ESC, so resuming at
                    // the byte that broke the match is exact.
                    out.extend_from_slice(&input[esc..esc + emit]);
                    pos = esc + emit;
                }
                SequenceMatch::Truncated => {
                    // Chunk ended mid-sequence: emit the partial bytes
                    // rather than buffering them across calls.
                    out.extend_from_slice(&input[esc..]);
                    pos = input.len();
                }
            }
        }

        (out.freeze(), commands)
    }

    /// Try to match one sequence at the start of `data` (which begins with
    /// ESC).
    fn match_sequence(&self, data: &[u8]) -> SequenceMatch {
        debug_assert_eq!(data[0], ESC);

        let Some(&bracket) = data.get(1) else {
            return SequenceMatch::Truncated;
        };
        if bracket != b'[' {
            // Lone ESC: the next byte may itself start a sequence, so emit
            // only the ESC and re-examine from there.
            return SequenceMatch::NotOurs { emit: 1 };
        }

        let Some(&marker) = data.get(2) else {
            return SequenceMatch::Truncated;
        };
        if !matches!(marker, b'>' | b'<' | b'?') {
            return SequenceMatch::NotOurs { emit: 2 };
        }

        // Parameter bytes: digits and semicolons only.
        let mut end = 3;
        while let Some(&b) = data.get(end) {
            if b.is_ascii_digit() || b == b';' {
                end += 1;
            } else {
                break;
            }
        }

        let Some(&fin) = data.get(end) else {
            return SequenceMatch::Truncated;
        };
        if fin != b'u' {
            return SequenceMatch::NotOurs { emit: end };
        }

        let param = first_param(&data[3..end]);
        let command = match marker {
            b'>' => RawCommand::Push(param.unwrap_or(0)),
            b'<' => RawCommand::Pop(param.unwrap_or(1)),
            _ => RawCommand::Query,
        };
        SequenceMatch::Recognized {
            len: end + 1,
            command,
        }
    }

    fn apply(&mut self, commands: &mut Vec<FilterCommand>, command: RawCommand) {
        match command {
            RawCommand::Push(level) => {
                self.stack.push(level);
                commands.push(FilterCommand::Push { level });
            }
            RawCommand::Pop(requested) => {
                let removed = (requested as usize).min(self.stack.len());
                self.stack.truncate(self.stack.len() - removed);
                commands.push(FilterCommand::Pop {
                    count: removed as u32,
                });
            }
            RawCommand::Query => {
                commands.push(FilterCommand::Query {
                    level: self.level(),
                });
            }
        }
    }
}

/// Outcome of a match attempt at an ESC byte.
enum SequenceMatch {
    /// A full family sequence of `len` bytes; nothing is emitted.
    Recognized { len: usize, command: RawCommand },
    /// Not this family: emit the first `emit` bytes verbatim and resume
    /// scanning at the byte that broke the match.
    NotOurs { emit: usize },
    /// Chunk ended before the sequence completed.
    Truncated,
}

/// A matched sequence before the stack is consulted.
enum RawCommand {
    Push(u32),
    Pop(u32),
    Query,
}

/// Decode the first numeric parameter: digits up to the first non-digit.
/// Returns `None` for an empty parameter. Saturates rather than overflowing
/// on absurdly long digit runs.
fn first_param(params: &[u8]) -> Option<u32> {
    let digits = params.iter().take_while(|b| b.is_ascii_digit());
    let mut value: u32 = 0;
    let mut seen = false;
    for &d in digits {
        seen = true;
        value = value
            .saturating_mul(10)
            .saturating_add(u32::from(d - b'0'));
    }
    seen.then_some(value)
}

// =============================================================================
// Tests
// =============================================================================

//! Property-based tests for the keyboard-enhancement filter and encoder.
//!
//! These tests use proptest to verify:
//! - The filter never panics on arbitrary input
//! - ESC-free and family-free input passes through byte-identically
//! - The level stack agrees with a reference model under arbitrary
//!   push/pop/query programs
//! - Encoded key events always have the exact wire shape

#![cfg(test)]

use proptest::prelude::*;

use crate::keyproto::{encode_key, FilterCommand, Key, KeyEvent, KeyProtocolFilter, Modifiers};

// =============================================================================
// Arbitrary Generators
// =============================================================================

/// One protocol operation, as a hosted application would emit it.
#[derive(Debug, Clone)]
enum Op {
    Push(u32),
    Pop(u32),
    Query,
}

impl Op {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Op::Push(level) => format!("\x1b[>{}u", level).into_bytes(),
            Op::Pop(count) => format!("\x1b[<{}u", count).into_bytes(),
            Op::Query => b"\x1b[?u".to_vec(),
        }
    }
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..=31).prop_map(Op::Push),
        (0u32..=4).prop_map(Op::Pop),
        Just(Op::Query),
    ]
}

/// Text that cannot interact with sequence matching.
fn arb_filler() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        any::<u8>().prop_filter("no ESC", |&b| b != 0x1b),
        0..64,
    )
}

/// A complete CSI sequence outside the filtered family: the byte after
/// `[` is a digit, so the private-marker check can never fire, whatever
/// surrounds it.
fn arb_foreign_csi() -> impl Strategy<Value = Vec<u8>> {
    ("[0-9]{1,4}", prop::sample::select(&b"mhlJKHABCD"[..])).prop_map(|(params, fin)| {
        let mut seq = b"\x1b[".to_vec();
        seq.extend_from_slice(params.as_bytes());
        seq.push(fin);
        seq
    })
}

fn arb_modifiers() -> impl Strategy<Value = Modifiers> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(shift, alt, ctrl, meta)| Modifiers {
            shift,
            alt,
            ctrl,
            meta,
        },
    )
}

fn arb_key() -> impl Strategy<Value = Key> {
    prop_oneof![
        any::<char>().prop_map(Key::Char),
        Just(Key::Return),
        Just(Key::Tab),
        Just(Key::Backspace),
        Just(Key::Escape),
    ]
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn filter_never_panics(data in prop::collection::vec(any::<u8>(), 0..10000), split in 0usize..10000) {
        let mut filter = KeyProtocolFilter::new();
        let cut = split.min(data.len());
        // Two calls so chunk-boundary state is exercised too
        let (a, _) = filter.filter(&data[..cut]);
        let (b, _) = filter.filter(&data[cut..]);
        // The filter only ever removes bytes
        prop_assert!(a.len() + b.len() <= data.len());
    }

    #[test]
    fn esc_free_input_is_identity(data in arb_filler()) {
        let mut filter = KeyProtocolFilter::new();
        let (out, commands) = filter.filter(&data);
        prop_assert_eq!(out.as_ref(), &data[..]);
        prop_assert!(commands.is_empty());
    }

    #[test]
    fn foreign_sequences_are_identity(
        parts in prop::collection::vec(
            prop_oneof![arb_filler(), arb_foreign_csi()],
            0..20,
        )
    ) {
        let input: Vec<u8> = parts.concat();
        let mut filter = KeyProtocolFilter::new();
        let (out, commands) = filter.filter(&input);
        prop_assert_eq!(out.as_ref(), &input[..]);
        prop_assert!(commands.is_empty());
    }

    #[test]
    fn stack_agrees_with_model(
        program in prop::collection::vec((arb_op(), arb_filler()), 0..40)
    ) {
        let mut input = Vec::new();
        let mut expected_text = Vec::new();
        let mut expected_commands = Vec::new();
        let mut model: Vec<u32> = Vec::new();

        for (op, filler) in &program {
            input.extend_from_slice(&op.to_bytes());
            input.extend_from_slice(filler);
            expected_text.extend_from_slice(filler);

            match op {
                Op::Push(level) => {
                    model.push(*level);
                    expected_commands.push(FilterCommand::Push { level: *level });
                }
                Op::Pop(count) => {
                    let removed = (*count as usize).min(model.len());
                    model.truncate(model.len() - removed);
                    expected_commands.push(FilterCommand::Pop { count: removed as u32 });
                }
                Op::Query => {
                    expected_commands.push(FilterCommand::Query {
                        level: model.last().copied().unwrap_or(0),
                    });
                }
            }
        }

        let mut filter = KeyProtocolFilter::new();
        let (out, commands) = filter.filter(&input);

        prop_assert_eq!(out.as_ref(), &expected_text[..]);
        prop_assert_eq!(commands, expected_commands);
        prop_assert_eq!(filter.depth(), model.len());
        prop_assert_eq!(filter.level(), model.last().copied().unwrap_or(0));
    }

    #[test]
    fn encoded_events_have_wire_shape(
        key in arb_key(),
        modifiers in arb_modifiers(),
        level in 1u32..=31,
    ) {
        let event = KeyEvent::new(key, modifiers);
        if let Some(bytes) = encode_key(event, level) {
            let text = String::from_utf8(bytes).unwrap();
            let body = text
                .strip_prefix("\x1b[")
                .and_then(|t| t.strip_suffix('u'))
                .expect("CSI ... u frame");
            let (cp, mods) = body.split_once(';').expect("two params");
            prop_assert_eq!(cp.parse::<u32>().unwrap(), event.key.code_point());
            prop_assert_eq!(mods.parse::<u32>().unwrap(), modifiers.encoded());
        } else {
            // Only the documented passthrough cases may decline
            let host_copy_paste = modifiers.meta
                && !modifiers.ctrl
                && !modifiers.alt
                && matches!(key, Key::Char(c) if matches!(c.to_ascii_lowercase(), 'c' | 'v'));
            prop_assert!(!modifiers.any() || host_copy_paste);
        }
    }
}

// Extended tests (run with --ignored)
proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    #[ignore = "extended property test - run with --ignored"]
    fn extended_filter_fuzz(data in prop::collection::vec(any::<u8>(), 0..100000)) {
        let mut filter = KeyProtocolFilter::new();
        let _ = filter.filter(&data);
    }
}

//! Wire-level laws: framing survives arbitrary chunking, messages
//! survive printing, and identifier generation stays ordered under
//! random edit histories.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tandem::crdt::buffer::{BufferReplica, TextOp};
use tandem::engine::Engine;
use tandem::host::NullHost;
use tandem::protocol::message::Message;
use tandem::protocol::sexp::FrameReader;

// =============================================================================
// Framing
// =============================================================================

#[test]
fn frames_survive_rechunking() {
    let messages = [
        Message::Hello {
            name: "alice".to_string(),
            response: None,
        },
        Message::Insert {
            buffer: "doc".to_string(),
            id: tandem::crdt::id::Id::from_bytes(vec![0, 9, 0, 1, 0, 0]).unwrap(),
            hint: 0,
            content: "héllo (world) \"quoted\"".to_string(),
        },
        Message::Cursor {
            buffer: "doc".to_string(),
            site: 1,
            point_hint: 3,
            point: Some(tandem::crdt::id::Id::empty()),
            mark_hint: 0,
            mark: None,
        },
    ];
    let stream: String = messages.iter().map(Message::encode).collect();
    let bytes = stream.as_bytes();

    for chunk in [1, 2, 3, 7, bytes.len()] {
        let mut reader = FrameReader::new();
        let mut decoded = Vec::new();
        for piece in bytes.chunks(chunk) {
            reader.feed(piece);
            while let Some(form) = reader.next_form().unwrap() {
                decoded.push(Message::from_sexp(&form).unwrap());
            }
        }
        assert_eq!(decoded.as_slice(), messages.as_slice(), "chunk size {}", chunk);
    }
}

#[test]
fn garbage_is_rejected_not_hung() {
    let mut reader = FrameReader::new();
    reader.feed(b")(insert \"doc\")");
    assert!(reader.next_form().is_err());

    // A stray close paren after a valid form surfaces on the next read.
    let mut reader = FrameReader::new();
    reader.feed(b"(insert \"doc\" 1 \"x\") )");
    assert!(reader.next_form().unwrap().is_some());
    assert!(reader.next_form().is_err());
}

// =============================================================================
// Property tests
// =============================================================================

/// One step of a random editing script.
#[derive(Clone, Debug)]
enum Step {
    Insert { pos_pct: f64, content: String },
    Delete { pos_pct: f64, len_pct: f64 },
}

fn arbitrary_step() -> impl Strategy<Value = Step> {
    return prop_oneof![
        (0.0..=1.0f64, "[a-z ]{1,8}")
            .prop_map(|(pos_pct, content)| Step::Insert { pos_pct, content }),
        (0.0..=1.0f64, 0.0..=0.6f64).prop_map(|(pos_pct, len_pct)| Step::Delete {
            pos_pct,
            len_pct
        }),
    ];
}

fn run_step(replica: &mut BufferReplica, site: u16, rng: &mut StdRng, step: &Step) -> Vec<TextOp> {
    let len = replica.len();
    match step {
        Step::Insert { pos_pct, content } => {
            let pos = ((*pos_pct * len as f64) as usize).min(len);
            return replica.local_insert(pos, content, site, rng);
        }
        Step::Delete { pos_pct, len_pct } => {
            if len == 0 {
                return Vec::new();
            }
            let pos = ((*pos_pct * len as f64) as usize).min(len - 1);
            let count = ((*len_pct * (len - pos) as f64) as usize).max(1);
            return replica.local_delete(pos, count).into_iter().collect();
        }
    }
}

fn replay(ops: &[TextOp], to: &mut BufferReplica) {
    for op in ops {
        match op {
            TextOp::Insert { id, hint, content } => {
                to.apply_insert(id, *hint, content);
            }
            TextOp::Delete { hint, pairs } => {
                to.apply_delete(*hint, pairs);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any local script keeps the store's invariants and replays to an
    /// identical replica.
    #[test]
    fn scripts_replay_identically(steps in prop::collection::vec(arbitrary_step(), 1..40)) {
        let mut rng = StdRng::seed_from_u64(1);
        let mut source = BufferReplica::new();
        let mut sink = BufferReplica::new();
        for step in &steps {
            let ops = run_step(&mut source, 1, &mut rng, step);
            replay(&ops, &mut sink);
        }
        source.store().validate().map_err(TestCaseError::fail)?;
        sink.store().validate().map_err(TestCaseError::fail)?;
        prop_assert_eq!(source.text(), sink.text());
        prop_assert_eq!(
            source.store().dump_runs(0, source.len()),
            sink.store().dump_runs(0, sink.len())
        );
    }

    /// Two sites editing concurrently converge once the op sets meet,
    /// in either application order.
    #[test]
    fn concurrent_scripts_converge(
        steps_a in prop::collection::vec(arbitrary_step(), 1..20),
        steps_b in prop::collection::vec(arbitrary_step(), 1..20),
    ) {
        let mut rng_a = StdRng::seed_from_u64(2);
        let mut rng_b = StdRng::seed_from_u64(3);
        let mut alice = BufferReplica::new();
        let seed = alice.local_insert(0, "the quick brown fox", 1, &mut rng_a);
        let mut bob = BufferReplica::new();
        replay(&seed, &mut bob);

        let mut from_a = Vec::new();
        for step in &steps_a {
            from_a.extend(run_step(&mut alice, 1, &mut rng_a, step));
        }
        let mut from_b = Vec::new();
        for step in &steps_b {
            from_b.extend(run_step(&mut bob, 2, &mut rng_b, step));
        }

        replay(&from_b, &mut alice);
        replay(&from_a, &mut bob);

        alice.store().validate().map_err(TestCaseError::fail)?;
        bob.store().validate().map_err(TestCaseError::fail)?;
        prop_assert_eq!(alice.text(), bob.text());
        prop_assert_eq!(
            alice.store().dump_runs(0, alice.len()),
            bob.store().dump_runs(0, bob.len())
        );
    }

    /// Printing and reparsing a message is the identity, whatever the
    /// strings contain.
    #[test]
    fn messages_survive_printing(
        buffer in "[\\PC]{1,12}",
        content in "[\\PC]{0,24}",
        hint in 0usize..10_000,
    ) {
        let message = Message::Insert {
            buffer,
            id: tandem::crdt::id::Id::from_bytes(vec![0, 42, 0, 1, 0, 7]).unwrap(),
            hint,
            content,
        };
        let mut reader = FrameReader::new();
        reader.feed(message.encode().as_bytes());
        let form = reader.next_form().unwrap().unwrap();
        prop_assert_eq!(Message::from_sexp(&form).unwrap(), message);
    }

    /// Snapshots round-trip through the wire.
    #[test]
    fn snapshots_survive_the_wire(steps in prop::collection::vec(arbitrary_step(), 1..30)) {
        let mut alice = Engine::with_rng(1, StdRng::seed_from_u64(5));
        alice.create_buffer("doc", None).unwrap();
        for step in &steps {
            let len = alice.text("doc").unwrap().chars().count();
            match step {
                Step::Insert { pos_pct, content } => {
                    let pos = ((*pos_pct * len as f64) as usize).min(len);
                    alice.local_insert("doc", pos, content).unwrap();
                }
                Step::Delete { pos_pct, len_pct } => {
                    if len == 0 { continue; }
                    let pos = ((*pos_pct * len as f64) as usize).min(len - 1);
                    let count = ((*len_pct * (len - pos) as f64) as usize).max(1);
                    let text = alice.text("doc").unwrap();
                    let preimage: String = text.chars().skip(pos).take(count).collect();
                    alice.local_delete("doc", pos, &preimage).unwrap();
                }
            }
        }

        // Encode the sync, push it through the frame reader, apply it
        // to a fresh engine.
        let sync = alice.make_sync("doc").unwrap();
        let mut reader = FrameReader::new();
        reader.feed(sync.encode().as_bytes());
        let decoded = Message::from_sexp(&reader.next_form().unwrap().unwrap()).unwrap();
        let mut bob = Engine::with_rng(2, StdRng::seed_from_u64(6));
        let mut host = NullHost;
        bob.apply_remote(&decoded, &mut host).unwrap();

        prop_assert_eq!(bob.text("doc"), alice.text("doc"));
        let a = alice.replica("doc").unwrap().store();
        let b = bob.replica("doc").unwrap().store();
        prop_assert_eq!(a.dump_runs(0, a.len()), b.dump_runs(0, b.len()));
    }
}

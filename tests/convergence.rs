//! Cross-replica convergence properties.
//!
//! Two replicas that apply the same set of events, in any causally valid
//! order, any number of times, hold the same text. These tests exercise
//! concurrent editing scripts, random batch interleavings, and duplicate
//! delivery.

use cowrite::{CrdtEvent, Replica};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed a document at site 1 and return (replica, seed events).
fn seeded(text: &str) -> (Replica, Vec<CrdtEvent>) {
    let mut replica = Replica::new();
    let events = replica.apply_local(0, 0, text, 1).unwrap();
    (replica, events)
}

/// Interleave two batch streams with a seeded rng, preserving the order
/// within each stream.
fn interleave(
    rng: &mut StdRng,
    a: &[Vec<CrdtEvent>],
    b: &[Vec<CrdtEvent>],
) -> Vec<Vec<CrdtEvent>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let take_a = if i == a.len() {
            false
        } else if j == b.len() {
            true
        } else {
            rng.random_bool(0.5)
        };
        if take_a {
            out.push(a[i].clone());
            i += 1;
        } else {
            out.push(b[j].clone());
            j += 1;
        }
    }
    out
}

#[test]
fn concurrent_inserts_at_the_same_anchor_tie_break() {
    let (_, seed) = seeded("a");

    let mut site2 = Replica::from_events(&seed).unwrap();
    let mut site3 = Replica::from_events(&seed).unwrap();

    let from2 = site2.apply_local(1, 1, "b", 2).unwrap();
    let from3 = site3.apply_local(1, 1, "c", 3).unwrap();

    site2.apply_remote(&from3).unwrap();
    site3.apply_remote(&from2).unwrap();

    // Both inserts anchor on 'a' with the same counter; the higher site id
    // sorts earlier.
    assert_eq!(site2.text(), "acb");
    assert_eq!(site3.text(), "acb");
}

#[test]
fn concurrent_edit_scripts_converge() {
    let (_, seed) = seeded("the quick fox");

    let mut site2 = Replica::from_events(&seed).unwrap();
    let mut site3 = Replica::from_events(&seed).unwrap();

    let mut from2 = Vec::new();
    from2.extend(site2.apply_local(4, 9, "slow", 2).unwrap());
    from2.extend(site2.apply_local(0, 0, "> ", 2).unwrap());

    let mut from3 = Vec::new();
    from3.extend(site3.apply_local(10, 13, "dog", 3).unwrap());
    from3.extend(site3.apply_local(3, 4, " lazy ", 3).unwrap());

    site2.apply_remote(&from3).unwrap();
    site3.apply_remote(&from2).unwrap();

    assert_eq!(site2.text(), site3.text());
    assert_eq!(site2.visible_len(), site3.visible_len());
}

#[test]
fn concurrent_deletes_of_the_same_character_converge() {
    let (_, seed) = seeded("abc");

    let mut site2 = Replica::from_events(&seed).unwrap();
    let mut site3 = Replica::from_events(&seed).unwrap();

    let from2 = site2.apply_local(1, 2, "", 2).unwrap();
    let from3 = site3.apply_local(1, 2, "x", 3).unwrap();

    site2.apply_remote(&from3).unwrap();
    site3.apply_remote(&from2).unwrap();

    assert_eq!(site2.text(), site3.text());
    assert_eq!(site2.text(), "axc");
}

#[test]
fn random_batch_interleavings_converge() {
    let (_, seed) = seeded("collaborative text");

    let mut site2 = Replica::from_events(&seed).unwrap();
    let batches2 = vec![
        site2.apply_local(0, 13, "shared", 2).unwrap(),
        site2.apply_local(6, 6, ",", 2).unwrap(),
        site2.apply_local(0, 0, "a ", 2).unwrap(),
    ];

    let mut site3 = Replica::from_events(&seed).unwrap();
    let batches3 = vec![
        site3.apply_local(14, 18, "document", 3).unwrap(),
        site3.apply_local(0, 1, "C", 3).unwrap(),
        site3.apply_local(14, 14, "plain ", 3).unwrap(),
    ];

    // Both sites see everything.
    for batch in &batches3 {
        site2.apply_remote(batch).unwrap();
    }
    for batch in &batches2 {
        site3.apply_remote(batch).unwrap();
    }
    assert_eq!(site2.text(), site3.text());
    let expected = site2.text();

    // An observer applying the same batches in any source-ordered
    // interleaving lands on the same text.
    for seed_value in 0..40u64 {
        let mut rng = StdRng::seed_from_u64(seed_value);
        let mut observer = Replica::from_events(&seed).unwrap();
        for batch in interleave(&mut rng, &batches2, &batches3) {
            observer.apply_remote(&batch).unwrap();
        }
        assert_eq!(observer.text(), expected, "diverged at seed {seed_value}");
    }
}

#[test]
fn duplicate_delivery_leaves_replicas_unchanged() {
    let (_, seed) = seeded("idempotent");

    let mut site2 = Replica::from_events(&seed).unwrap();
    let batch = site2.apply_local(0, 0, "fully ", 2).unwrap();

    let mut observer = Replica::from_events(&seed).unwrap();
    observer.apply_remote(&batch).unwrap();
    let once = observer.text();
    let entries = observer.entry_count();

    // Redelivery of the same batch, twice over.
    let updates = observer.apply_remote(&batch).unwrap();
    assert!(updates.is_empty());
    observer.apply_remote(&batch).unwrap();

    assert_eq!(observer.text(), once);
    assert_eq!(observer.entry_count(), entries);
}

#[test]
fn three_sites_full_mesh_converges() {
    let (_, seed) = seeded("mesh");

    let mut sites: Vec<Replica> = (0..3)
        .map(|_| Replica::from_events(&seed).unwrap())
        .collect();

    let batches: Vec<Vec<CrdtEvent>> = vec![
        sites[0].apply_local(0, 0, "a ", 2).unwrap(),
        sites[1].apply_local(4, 4, "ed", 3).unwrap(),
        sites[2].apply_local(0, 4, "net", 4).unwrap(),
    ];

    // Deliver every foreign batch to every site, in a different order per
    // site.
    sites[0].apply_remote(&batches[1]).unwrap();
    sites[0].apply_remote(&batches[2]).unwrap();
    sites[1].apply_remote(&batches[2]).unwrap();
    sites[1].apply_remote(&batches[0]).unwrap();
    sites[2].apply_remote(&batches[0]).unwrap();
    sites[2].apply_remote(&batches[1]).unwrap();

    assert_eq!(sites[0].text(), sites[1].text());
    assert_eq!(sites[1].text(), sites[2].text());
}

#[test]
fn compacted_log_replays_to_the_same_text() {
    let (mut replica, _) = seeded("start");
    replica.apply_local(5, 5, " middle end", 1).unwrap();
    replica.apply_local(0, 6, "", 1).unwrap();
    replica.apply_local(7, 10, "finish", 1).unwrap();

    let compacted = replica.compacted();
    let rebuilt = Replica::from_events(&compacted).unwrap();

    assert_eq!(rebuilt.text(), replica.text());
    assert_eq!(compacted.len(), replica.visible_len());
}

#[test]
fn long_random_editing_session_round_trips() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut source = Replica::new();
    let mut mirror = Replica::new();

    for _ in 0..300 {
        let len = source.visible_len();
        let from = if len == 0 { 0 } else { rng.random_range(0..=len) };
        let to = rng.random_range(from..=len);
        let value: String = if rng.random_bool(0.7) {
            let n = rng.random_range(1..=3);
            (0..n)
                .map(|_| (b'a' + rng.random_range(0..26u8)) as char)
                .collect()
        } else {
            String::new()
        };

        let batch = source.apply_local(from, to, &value, 9).unwrap();
        mirror.apply_remote(&batch).unwrap();
    }

    assert_eq!(mirror.text(), source.text());
    assert_eq!(mirror.visible_len(), source.visible_len());
}

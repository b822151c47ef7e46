use std::collections::HashSet;
use std::sync::Arc;

use buildmirror_core::compactor::MemCompactor;
use buildmirror_core::key::{CompositeKey, ServerMask};
use buildmirror_core::kv::MemTable;
use buildmirror_core::model::{BuildRef, BuildSnapshot, BuildState, FatBuildInput};
use buildmirror_core::store::{BuildReferenceStore, FatBuildStore};
use proptest::prelude::*;

fn arb_state() -> impl Strategy<Value = BuildState> {
    prop_oneof![
        Just(BuildState::Queued),
        Just(BuildState::Running),
        Just(BuildState::Finished),
    ]
}

fn arb_ref() -> impl Strategy<Value = BuildRef> {
    (0_u32..50, prop::sample::select(vec!["bt-a", "bt-b"]), arb_state()).prop_map(
        |(id, bt, state)| BuildRef {
            id,
            build_type_id: bt.to_string(),
            branch_name: Some("refs/heads/master".into()),
            status: None,
            state,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn save_chunk_reports_each_key_at_most_once(refs in prop::collection::vec(arb_ref(), 0..40)) {
        let store = BuildReferenceStore::new(
            Box::new(MemTable::new("build_refs")),
            Arc::new(MemCompactor::new()),
        );
        let server = ServerMask(0xfeed_beef);
        let changed = store.save_chunk(server, &refs).expect("save chunk");
        let distinct: HashSet<u32> = refs.iter().map(|r| r.id).collect();
        prop_assert_eq!(changed.len(), distinct.len());

        let again = store.save_chunk(server, &refs).expect("save chunk");
        // Only ids whose last occurrence differs from an earlier one can change again.
        for key in &again {
            let id = key.build_id();
            let states: HashSet<_> = refs.iter().filter(|r| r.id == id).map(|r| (r.state, r.build_type_id.clone())).collect();
            prop_assert!(states.len() > 1);
        }
    }

    #[test]
    fn keys_of_different_servers_never_collide(a in any::<u32>(), b in any::<u32>(), id in any::<u32>()) {
        prop_assume!(a != b);
        prop_assert_ne!(ServerMask(a).key(id), ServerMask(b).key(id));
        let key = ServerMask(a).key(id);
        prop_assert_eq!(CompositeKey::from_raw(key.raw()).unmask(), (ServerMask(a), id));
    }

    #[test]
    fn repeated_saves_never_bump_revision(id in 1_u32..10_000, running in any::<bool>()) {
        let store = FatBuildStore::new(
            Box::new(MemTable::new("fat_builds")),
            Arc::new(MemCompactor::new()),
        );
        let mut build = BuildSnapshot::fake_stub(id);
        build.fake_stub = false;
        build.build_type_id = "bt".into();
        if running {
            build.state = BuildState::Running;
        }
        let key = ServerMask(1).key(id);
        let input = FatBuildInput::from_snapshot(&build, &[]);
        let first = store.save_build(key, &input, None).expect("save").expect("stored");
        for _ in 0..3 {
            let existing = store.get_fat_build(key).expect("get");
            prop_assert!(store.save_build(key, &input, existing.as_ref()).expect("save").is_none());
        }
        prop_assert_eq!(store.get_fat_build(key).expect("get").map(|b| b.revision), Some(first.revision));
    }
}

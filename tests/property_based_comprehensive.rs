//! Property-based tests for the invocation tree and the timing report
//!
//! Core properties:
//! 1. Nested before/after events always produce a well-formed tree
//! 2. Child intervals lie within their parent's interval
//! 3. Wrapping never changes dispatch order or results
//! 4. Component classification and rounding are stable

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use hooktrace::callback::CallbackMeta;
use hooktrace::clock::ManualClock;
use hooktrace::host::HookRegistry;
use hooktrace::invocation::HookKind;
use hooktrace::locator::{FileLocator, RootTable};
use hooktrace::server_timing::{aggregate, round_to_precision};
use hooktrace::session::Session;
use hooktrace::watcher::InvocationWatcher;
use proptest::prelude::*;
use serde_json::json;

/// Drive a watcher from a random open/close script; every open is eventually closed
fn run_script(script: &[(bool, u16)]) -> InvocationWatcher {
    let clock = ManualClock::new();
    let locator = Arc::new(FileLocator::new(RootTable::default()));
    let watcher = InvocationWatcher::with_clock(locator, clock.clone());
    let meta = Rc::new(CallbackMeta::anonymous());
    let mut open = Vec::new();

    for &(opens, micros) in script {
        clock.advance(Duration::from_micros(u64::from(micros)));
        if opens || open.is_empty() {
            open.push(watcher.on_before("hook", 10, &json!(null), &meta));
        } else if let Some(id) = open.pop() {
            watcher.on_after(id, None, HookKind::Action).unwrap();
        }
    }
    while let Some(id) = open.pop() {
        clock.advance(Duration::from_micros(1));
        watcher.on_after(id, None, HookKind::Action).unwrap();
    }
    watcher
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_tree_is_well_formed(script in prop::collection::vec((any::<bool>(), 0u16..500), 1..60)) {
        let watcher = run_script(&script);
        let invocations = watcher.invocations();

        prop_assert_eq!(watcher.depth(), 0);
        prop_assert_eq!(watcher.integrity_errors(), 0);

        for inv in invocations.iter() {
            prop_assert!(inv.is_complete());
            match inv.parent() {
                None => {
                    prop_assert_eq!(inv.depth(), 0);
                }
                Some(parent_id) => {
                    let parent = watcher.get(parent_id).unwrap();
                    prop_assert!(parent.children().contains(&inv.id()));
                    prop_assert_eq!(inv.depth(), parent.depth() + 1);
                    prop_assert!(parent.id() < inv.id());
                }
            }
            for child in inv.children() {
                prop_assert_eq!(watcher.get(*child).unwrap().parent(), Some(inv.id()));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_children_nest_inside_parent(script in prop::collection::vec((any::<bool>(), 0u16..500), 1..60)) {
        let watcher = run_script(&script);

        for inv in watcher.invocations().iter() {
            let children: Vec<_> = inv
                .children()
                .iter()
                .map(|id| watcher.get(*id).unwrap().clone())
                .collect();
            let mut child_total = Duration::ZERO;
            for child in &children {
                prop_assert!(child.start_time() >= inv.start_time());
                prop_assert!(child.end_time().unwrap() <= inv.end_time().unwrap());
                child_total += child.duration().unwrap();
            }
            prop_assert!(child_total <= inv.duration().unwrap());

            // siblings never overlap and keep creation order
            for pair in children.windows(2) {
                prop_assert!(pair[0].end_time().unwrap() <= pair[1].start_time());
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_wrapping_preserves_dispatch(priorities in prop::collection::vec(-20i32..20, 1..12)) {
        let registry = HookRegistry::new();
        for (idx, priority) in priorities.iter().enumerate() {
            registry.add_filter("chain", *priority, move |_, args| {
                let mut trail = args[0].as_array().cloned().unwrap_or_default();
                trail.push(json!(idx));
                Ok(json!(trail))
            });
        }

        let plain = registry.apply_filters("chain", json!([]), &[]).unwrap();
        let locator = Arc::new(FileLocator::new(RootTable::default()));
        let session = Session::attach(InvocationWatcher::new(locator), &registry);
        let traced = registry.apply_filters("chain", json!([]), &[]).unwrap();

        prop_assert_eq!(&plain, &traced);
        prop_assert_eq!(session.watcher().len(), priorities.len());
        prop_assert!(session
            .watcher()
            .invocations()
            .iter()
            .all(|inv| inv.value_modified() == Some(true)));

        // stable order: by priority, then registration order
        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by_key(|idx| priorities[*idx]);
        let order: Vec<usize> = plain
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap() as usize)
            .collect();
        prop_assert_eq!(order, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_classification_uses_first_segment(
        plugin in "[a-z][a-z0-9-]{0,12}",
        rest in prop::collection::vec("[a-z]{1,8}", 0..4),
    ) {
        let table = RootTable::wordpress("/srv/www");
        let mut file = PathBuf::from("/srv/www/wp-content/plugins").join(&plugin);
        for segment in &rest {
            file.push(segment);
        }
        file.push("main.php");

        let location = table.classify(&file).unwrap();
        prop_assert_eq!(location.component_key(), format!("plugin:{}", plugin));
        prop_assert_eq!(location.file_path, file);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_rounding_is_idempotent_and_close(micros in 0u64..10_000_000) {
        let secs = micros as f64 / 1_000_000.0;
        let rounded = round_to_precision(secs);
        prop_assert!((rounded - secs).abs() <= 0.00005 + 1e-12);
        prop_assert_eq!(round_to_precision(rounded), rounded);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_unattributed_script_reports_nothing(script in prop::collection::vec((any::<bool>(), 0u16..500), 1..40)) {
        let watcher = run_script(&script);
        let timings = aggregate(&watcher.invocations());
        prop_assert!(timings.is_empty());
        prop_assert_eq!(timings.unattributed(), watcher.len());
    }
}

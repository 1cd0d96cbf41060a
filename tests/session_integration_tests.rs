//! Integration tests for live tracing sessions on a hook registry

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use hooktrace::callback::CallbackMeta;
use hooktrace::clock::ManualClock;
use hooktrace::config::Config;
use hooktrace::host::HookRegistry;
use hooktrace::invocation::HookKind;
use hooktrace::locator::{FileLocator, RootTable, SourceResolver};
use hooktrace::session::Session;
use hooktrace::value::HookValue;
use hooktrace::watcher::InvocationWatcher;
use serde_json::json;

/// Maps `component/function` callback names to files below `/srv/www`
struct NamedFiles;

impl SourceResolver for NamedFiles {
    fn resolve_file(&self, callback: &CallbackMeta) -> Option<PathBuf> {
        let name = callback.name.as_deref()?;
        let (component, _) = name.split_once('/')?;
        let path = match component {
            "core" => "/srv/www/wp-includes/plugin.php".to_string(),
            "theme" => "/srv/www/wp-content/themes/twentytwenty/functions.php".to_string(),
            plugin => format!("/srv/www/wp-content/plugins/{}/main.php", plugin),
        };
        Some(PathBuf::from(path))
    }
}

fn locator() -> Arc<FileLocator> {
    Arc::new(FileLocator::with_resolver(
        RootTable::wordpress("/srv/www"),
        NamedFiles,
    ))
}

fn traced(registry: &HookRegistry) -> (Session, ManualClock) {
    let clock = ManualClock::new();
    let watcher = InvocationWatcher::with_clock(locator(), clock.clone());
    (Session::attach(watcher, registry), clock)
}

#[test]
fn test_session_is_transparent_to_dispatch() {
    let registry = HookRegistry::new();
    registry.add_named("the_title", 10, "seo/upper", |_, args| {
        Ok(json!(args[0].as_str().unwrap_or_default().to_uppercase()))
    });
    registry.add_named("the_title", 20, "theme/suffix", |_, args| {
        Ok(json!(format!("{}!", args[0].as_str().unwrap_or_default())))
    });

    let untraced = registry.apply_filters("the_title", json!("hello"), &[]).unwrap();
    let (session, _) = traced(&registry);
    let traced_value = registry.apply_filters("the_title", json!("hello"), &[]).unwrap();

    assert_eq!(untraced, json!("HELLO!"));
    assert_eq!(traced_value, untraced);
    assert_eq!(session.watcher().len(), 2);
}

#[test]
fn test_session_start_respects_config_gate() {
    let registry = HookRegistry::new();
    let config = Config {
        debug: true,
        ..Config::default()
    };
    let shared = locator();
    assert!(Session::start(&config, &shared, &registry, "page=1").is_none());
    let session = Session::start(&config, &shared, &registry, "page=1&hooktrace").unwrap();
    registry.add_named("init", 10, "core/boot", |_, _| Ok(HookValue::Null));
    registry.do_action("init", &[]).unwrap();
    assert_eq!(session.watcher().len(), 1);
}

#[test]
fn test_late_registration_during_dispatch_is_traced() {
    let registry = HookRegistry::new();
    let (session, _) = traced(&registry);

    registry.add_named("plugins_loaded", 10, "akismet/setup", |host, _| {
        host.add_named("init", 10, "akismet/init", |_, _| Ok(HookValue::Null));
        Ok(HookValue::Null)
    });
    registry.do_action("plugins_loaded", &[]).unwrap();
    registry.do_action("init", &[]).unwrap();

    let watcher = session.watcher();
    let names: Vec<String> = watcher
        .invocations()
        .iter()
        .map(|inv| inv.name().to_string())
        .collect();
    assert_eq!(names, vec!["plugins_loaded", "init"]);
    assert!(watcher.invocations().iter().all(|inv| inv.is_root()));
}

#[test]
fn test_callback_removing_itself_mid_dispatch() {
    let registry = HookRegistry::new();
    let (session, _) = traced(&registry);
    let calls = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&calls);
    let once = Rc::new(RefCell::new(None));
    let own_id = Rc::clone(&once);
    let id = registry.add_named("wp_head", 5, "seo/once", move |host, _| {
        log.borrow_mut().push("once");
        if let Some(id) = *own_id.borrow() {
            host.remove("wp_head", id);
        }
        Ok(HookValue::Null)
    });
    *once.borrow_mut() = Some(id);
    let log = Rc::clone(&calls);
    registry.add_named("wp_head", 10, "theme/meta", move |_, _| {
        log.borrow_mut().push("meta");
        Ok(HookValue::Null)
    });

    registry.do_action("wp_head", &[]).unwrap();
    registry.do_action("wp_head", &[]).unwrap();

    assert_eq!(*calls.borrow(), vec!["once", "meta", "meta"]);
    assert_eq!(session.watcher().len(), 3);
    assert_eq!(session.watcher().depth(), 0);
}

#[test]
fn test_failing_callback_is_recorded_and_error_propagates() {
    let registry = HookRegistry::new();
    let (session, clock) = traced(&registry);
    let tick = clock.clone();
    registry.add_named("save_post", 10, "broken/save", move |_, _| {
        tick.advance(Duration::from_millis(3));
        anyhow::bail!("database gone")
    });

    let err = registry.apply_filters("save_post", json!(1), &[]).unwrap_err();
    assert!(err.to_string().contains("database gone"));

    let invocations = session.watcher().invocations();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].is_complete());
    assert_eq!(invocations[0].value_modified(), None);
    assert_eq!(invocations[0].duration().unwrap(), Duration::from_millis(3));
}

#[test]
fn test_deep_nesting_and_attribution() {
    let registry = HookRegistry::new();
    let (session, clock) = traced(&registry);

    let tick = clock.clone();
    registry.add_named("template_redirect", 10, "woo/redirect", move |host, _| {
        tick.advance(Duration::from_millis(1));
        host.do_action("woo_before_cart", &[])?;
        Ok(HookValue::Null)
    });
    let tick = clock.clone();
    registry.add_named("woo_before_cart", 10, "theme/cart_banner", move |host, _| {
        tick.advance(Duration::from_millis(2));
        let price = host.apply_filters("woo_price", json!(10), &[])?;
        assert_eq!(price, json!(10));
        Ok(HookValue::Null)
    });
    let tick = clock.clone();
    registry.add_named("woo_price", 10, "core/identity", move |_, args| {
        tick.advance(Duration::from_millis(4));
        Ok(args[0].clone())
    });

    registry.do_action("template_redirect", &[]).unwrap();

    let invocations = session.watcher().invocations().to_vec();
    assert_eq!(invocations.len(), 3);
    assert_eq!(invocations[2].depth(), 2);
    assert_eq!(invocations[2].value_modified(), Some(false));
    assert_eq!(invocations[2].kind(&registry), HookKind::Filter);
    assert_eq!(invocations[1].kind(&registry), HookKind::Action);

    let keys: Vec<String> = invocations
        .iter()
        .map(|inv| inv.source_location().unwrap().component_key())
        .collect();
    assert_eq!(keys, vec!["plugin:woo", "theme:twentytwenty", "core:wp-includes"]);

    let timings = session.timings();
    assert_eq!(timings.get("plugin:woo"), Some(0.007));
    assert_eq!(timings.get("theme:twentytwenty"), Some(0.006));
    assert_eq!(timings.get("core:wp-includes"), Some(0.004));
}

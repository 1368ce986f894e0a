//! The module system: distinct, expose, the oracle and the filename cache.

use pretty_assertions::assert_eq;
use vesper::{CollectIo, MapLoader, MapOracle, Orchestra, Settings, VesperError};

fn world(routes: &[(&str, &[&str])], sources: &[(&str, &str)]) -> Orchestra<MapOracle, MapLoader, CollectIo> {
    let mut oracle = MapOracle::new();
    for (distinct, files) in routes {
        oracle.route(*distinct, files.iter().map(|f| (*f).to_owned()));
    }
    let mut loader = MapLoader::new();
    for (file, source) in sources {
        loader.add(*file, *source);
    }
    Orchestra::new(oracle, loader, CollectIo::default(), Settings::default())
}

#[test]
fn exposed_units_share_their_definitions() {
    let mut orchestra = world(
        &[("a", &["a.vsp"])],
        &[("a.vsp", "distinct a;\nfun add(a, b) = a + b;")],
    );
    let result = orchestra.run("b.vsp", "expose a;\nadd(2, 3)").unwrap();
    assert_eq!(result.to_string(), "5");
}

#[test]
fn missing_distincts_raise_expose_errors() {
    let mut orchestra = world(&[], &[]);
    let error = orchestra.run("b.vsp", "expose a.missing;\n1").unwrap_err();
    let VesperError::Expose(e) = &error else {
        panic!("expected an expose error, got {error}");
    };
    assert_eq!(e.distinct.as_deref(), Some("a.missing"));
}

#[test]
fn dependencies_run_once_for_their_side_effects() {
    let mut orchestra = world(
        &[("noisy", &["noisy.vsp"])],
        &[("noisy.vsp", "distinct noisy;\nsay(\"loaded\");")],
    );
    orchestra
        .run("b.vsp", "expose noisy;\nexpose noisy;\n1")
        .unwrap();
    assert_eq!(orchestra.io_mut().lines, vec!["loaded"]);
}

#[test]
fn expose_cycles_are_cut_by_the_filename_cache() {
    let mut orchestra = world(
        &[("a", &["a.vsp"]), ("b", &["b.vsp"])],
        &[
            ("a.vsp", "distinct a;\nexpose b;\nfun from_a() = 1;"),
            ("b.vsp", "distinct b;\nexpose a;\nfun from_b() = 2;"),
        ],
    );
    let result = orchestra.run("main.vsp", "expose a;\nfrom_a() + from_b()").unwrap();
    assert_eq!(result.to_string(), "3");
}

#[test]
fn self_reference_through_the_oracle_terminates() {
    let mut orchestra = world(
        &[("me", &["me.vsp"])],
        &[("me.vsp", "distinct me;\nexpose me;\nfun f() = 1;")],
    );
    let result = orchestra.run("me.vsp", "distinct me;\nexpose me;\nfun f() = 1;\nf()").unwrap();
    assert_eq!(result.to_string(), "1");
}

#[test]
fn a_distinct_may_span_multiple_files_in_order() {
    let mut orchestra = world(
        &[("lib", &["lib1.vsp", "lib2.vsp"])],
        &[
            ("lib1.vsp", "distinct lib;\nbase := 40;"),
            ("lib2.vsp", "distinct lib;\nfun answer() = base + 2;"),
        ],
    );
    let result = orchestra.run("main.vsp", "expose lib;\nanswer()").unwrap();
    assert_eq!(result.to_string(), "42");
}

#[test]
fn transport_failures_surface_as_expose_errors() {
    // A TCP oracle pointed at a dead port fails as an ExposeError rather
    // than tearing the process down.
    let mut orchestra = Orchestra::new(
        vesper::TcpOracle::new("127.0.0.1:1").with_timeout(std::time::Duration::from_millis(200)),
        MapLoader::new(),
        CollectIo::default(),
        Settings::default(),
    );
    let error = orchestra.run("b.vsp", "expose a;\n1").unwrap_err();
    assert!(matches!(error, VesperError::Expose(_)));
}

#[test]
fn distinct_and_expose_are_rejected_mid_file() {
    let mut orchestra = world(&[], &[]);
    let error = orchestra.run("b.vsp", "1;\ndistinct a;").unwrap_err();
    assert!(matches!(error, VesperError::Read(_)));
}

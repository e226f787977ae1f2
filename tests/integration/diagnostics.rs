//! Diagnostic reports written on request.

use strand::DumpTarget;

use crate::common::{fib, runtime};

#[test]
fn test_write_diagnostics_to_a_file() {
    let runtime = runtime(2);
    runtime.run(|| fib(15));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.json");
    runtime
        .write_diagnostics(&DumpTarget::File(path.clone()))
        .unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["crate_name"], env!("CARGO_PKG_NAME"));
    assert_eq!(json["version"], strand::VERSION);
    assert_eq!(json["nworkers"], 2);
    assert_eq!(json["exception_bridge"], "unwind");
    assert!(json.get("violation").is_none());

    let stats = &json["stats"];
    let workers = stats["workers"].as_array().unwrap();
    assert_eq!(workers.len(), runtime.config().total_slots());
    assert_eq!(workers[0]["kind"], "system");
    assert_eq!(workers[0]["in_flight"], 0);
    assert!(workers[0]["sleeping"].is_boolean());
    assert!(stats["total"]["spawns"].as_u64().unwrap() > 0);
    assert_eq!(stats["pool"]["stack_size"], 256 * 1024);
}

#[test]
fn test_report_reflects_live_state() {
    let runtime = runtime(3);
    let report = runtime.diagnostics();
    assert_eq!(report.nworkers, 3);
    assert!(report.violation.is_none());
    assert_eq!(report.stats.workers.len(), runtime.config().total_slots());
    assert!(report.to_json().unwrap().contains("\"target_os\""));
}

#[test]
fn test_unwritable_target_reports_an_error() {
    let runtime = runtime(1);
    let dir = tempfile::tempdir().unwrap();
    let target = DumpTarget::File(dir.path().join("missing").join("dump.json"));
    let error = runtime.write_diagnostics(&target).unwrap_err();
    assert!(format!("{error:#}").contains("failed to write diagnostic report"));
}

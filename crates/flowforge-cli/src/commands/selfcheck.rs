//! The `selfcheck` command: run the storage-core invariant battery.

pub fn run() -> Result<(), String> {
    let results = flowforge_tests::run_all();
    let mut failed = 0;

    println!("{:<40} {:>6}  details", "check", "result");
    println!("{}", "-".repeat(72));
    for result in &results {
        let status = if result.passed { "ok" } else { "FAIL" };
        if !result.passed {
            failed += 1;
        }
        println!("{:<40} {:>6}  {}", result.name, status, result.details);
    }
    println!();
    println!("{}/{} checks passed", results.len() - failed, results.len());

    if failed > 0 {
        return Err(format!("{failed} invariant check(s) failed"));
    }
    Ok(())
}
